use std::time::Duration;

/// The tuning knobs the Query Manager accepts at construction, built via
/// the fluent [`WorkerConfigBuilder`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_threads: usize,
    pub buffer_size: usize,
    pub total_buffer_budget: usize,
    pub per_query_buffer_quota: usize,
    pub sink_retry_delay: Duration,
    pub enable_leak_tracking: bool,
}

impl WorkerConfig {
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::default()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfigBuilder {
    worker_threads: Option<usize>,
    buffer_size: usize,
    total_buffer_budget: usize,
    per_query_buffer_quota: usize,
    sink_retry_delay: Duration,
    enable_leak_tracking: bool,
}

impl Default for WorkerConfigBuilder {
    fn default() -> Self {
        Self {
            worker_threads: None,
            buffer_size: 4096,
            total_buffer_budget: 64 * 1024 * 1024,
            per_query_buffer_quota: 1024,
            sink_retry_delay: Duration::from_millis(50),
            enable_leak_tracking: false,
        }
    }
}

impl WorkerConfigBuilder {
    pub fn worker_threads(mut self, value: usize) -> Self {
        self.worker_threads = Some(value);
        self
    }

    pub fn buffer_size(mut self, value: usize) -> Self {
        self.buffer_size = value;
        self
    }

    pub fn total_buffer_budget(mut self, value: usize) -> Self {
        self.total_buffer_budget = value;
        self
    }

    pub fn per_query_buffer_quota(mut self, value: usize) -> Self {
        self.per_query_buffer_quota = value;
        self
    }

    pub fn sink_retry_delay(mut self, value: Duration) -> Self {
        self.sink_retry_delay = value;
        self
    }

    pub fn enable_leak_tracking(mut self, value: bool) -> Self {
        self.enable_leak_tracking = value;
        self
    }

    pub fn build(self) -> WorkerConfig {
        WorkerConfig {
            worker_threads: self
                .worker_threads
                .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)),
            buffer_size: self.buffer_size,
            total_buffer_budget: self.total_buffer_budget,
            per_query_buffer_quota: self.per_query_buffer_quota,
            sink_retry_delay: self.sink_retry_delay,
            enable_leak_tracking: self.enable_leak_tracking,
        }
    }
}
