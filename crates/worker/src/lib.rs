//! In-process stand-in for the external job system.
//!
//! Submitted analyses run on a bounded [`WorkerPool`]; each job drives an
//! [`AnalysisPipeline`] whose progress is written to the [`StatusTracker`]
//! and published on the task's broker channel by a [`ProgressReporter`].

pub mod pipeline;
pub mod pool;
pub mod reporter;
pub mod tracker;

pub use pipeline::{AnalysisPipeline, PipelineError, ScriptedPipeline};
pub use pool::{WorkerConfig, WorkerPool};
pub use reporter::ProgressReporter;
pub use tracker::StatusTracker;
