#![cfg(test)]

use std::sync::Arc;

use nebula_buffer::{BufferPool, FieldType, PoolConfig, Schema};

pub fn test_pool() -> Arc<BufferPool> {
    let schema = Schema::builder().field("v", FieldType::I64).build();
    BufferPool::new(
        PoolConfig {
            buffer_size: 256,
            pooled_buffer_count: 8,
            unpooled_budget: 0,
            leak_tracking: false,
        },
        schema,
    )
}
