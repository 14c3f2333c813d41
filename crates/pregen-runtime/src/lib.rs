//! Background generation scheduling: worker thread, throttling and host integration.
#![forbid(unsafe_code)]

mod health;
mod host;
mod leases;
mod partition;
mod resolve;
mod scheduler;
mod stats;
mod throttle;
mod viewers;
mod worker;


pub use health::HostHealthMonitor;
pub use host::{
    FastGeneration, GenerationBackend, GenerationError, GenerationResult, HostHandle,
    NoFastGeneration, NullSink, OutputSink,
};
pub use resolve::CellCompletion;
pub use scheduler::{GenerationScheduler, SchedulerError};
pub use stats::{GenerationStats, StatsSnapshot};
pub use throttle::Throttle;
pub use viewers::ViewerTracker;
