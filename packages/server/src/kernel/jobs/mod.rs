// Durable work-item queue: model, repository, registry and dispatcher.

pub mod dlq;
pub mod job;
pub mod log;
pub mod registry;
pub mod repo;
pub mod runner;

pub use dlq::DeadLetterJob;
pub use job::{Job, JobStatus, JobType, QueueGauge};
pub use log::{JobLog, LogLevel};
pub use registry::{JobRegistry, SharedJobRegistry};
pub use repo::{EnqueueResult, FailOutcome, JobRepo};
pub use runner::{Dispatcher, DispatcherConfig, RunOutcome};
