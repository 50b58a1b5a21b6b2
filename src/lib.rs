pub mod belief_propagation;
pub(crate) mod bp_compute;
pub mod factor_graph;
pub(crate) mod utils;
pub mod wiring;

pub use belief_propagation::{BPError, BPState};
pub use factor_graph::{
    EdgeId, FactorGraph, FactorId, GateKind, GraphBuildError, GroupId, StateVal, VarId, Variable,
};
pub use wiring::{GraphWiring, LogicalWiring, WiringError};

#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Computation time after which a progress bar is displayed.
    /// This avoids showing progress bars for negligible amounts of time.
    /// If None, never display the progress bar.
    progress_min_time: Option<std::time::Duration>,
}

impl Config {
    pub fn with_default_timing() -> Self {
        Self {
            progress_min_time: Some(std::time::Duration::from_millis(500)),
        }
    }
    pub fn no_progress() -> Self {
        Self {
            progress_min_time: None,
        }
    }
    pub(crate) fn progress_min_time(&self) -> Option<std::time::Duration> {
        self.progress_min_time
    }
}
