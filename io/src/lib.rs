//! Sources and sinks: the worker's boundary with the outside world.

#![forbid(unsafe_code)]

mod registry;
mod sink;
mod source;
mod state;

pub use registry::{DescriptorRegistry, SinkFactory, SourceFactory};
pub use sink::{test_sink::TestSink, file::FileSink, network::NetworkSink, stdout::StdoutSink, EmitOutcome, Sink};
pub use source::{file::FileSource, network::NetworkSource, test_source::TestSource, Source};
pub use state::{SinkState, SourceState};
