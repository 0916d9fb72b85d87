use nebula_pipeline::TerminationType;

/// Lifecycle of one source instance. Transitions are driven by the
/// component itself (`Opening` → `Running`/`Closed`) and by the Query
/// Manager (`Running` → `Draining`/`Closed` on stop/fail/EoS).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Created,
    Opening,
    Running,
    Draining,
    Closed(TerminationType),
}

/// Lifecycle of one sink instance; mirrors [`SourceState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Created,
    Opening,
    Running,
    Draining,
    Closed(TerminationType),
}
