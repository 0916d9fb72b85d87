#![forbid(unsafe_code)]

mod control_plane;
mod factories;
mod signals;

pub use control_plane::{Ack, ComponentDescriptor, DecomposedQueryPlan, Worker, WorkerControlPlane, WorkerError};
pub use factories::{FileSinkFactory, FileSourceFactory, NetworkSinkFactory, NetworkSourceFactory, StdoutSinkFactory};
pub use signals::wait_for_shutdown_signal;
