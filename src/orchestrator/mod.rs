pub mod runner;
pub mod state;

pub use runner::Orchestrator;
pub use state::{RunState, StuckDetector};
