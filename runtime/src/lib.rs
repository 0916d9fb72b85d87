mod config;
mod iqp;
mod manager;
mod stage_chain;
mod status;

pub use config::{WorkerConfig, WorkerConfigBuilder};
pub use iqp::IqpSpec;
pub use manager::QueryManager;
pub use status::{QueryEvent, QueryStatus, RecordingListener, StatusListener};
