//! Campaign queue processing.

mod control;
mod processor;
mod progress;
mod run_state;

pub use control::{ControlRequest, ControlResponse, QueueStatus};
pub use processor::QueueProcessor;
pub use progress::{Progress, ProgressFeed};
pub use run_state::RunState;
