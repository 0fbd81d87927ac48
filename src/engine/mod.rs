//! Engine module - dispatch, aggregation, and progress for one run.

mod aggregator;
mod dispatcher;
mod progress;
mod state;

pub use aggregator::{AlignedResults, aggregate};
pub use dispatcher::{Engine, EngineSettings, RunOutcome};
pub use progress::{BarProgress, LogProgress, NoProgress, ProgressEvent, ProgressSink};
