//! Batching, fan-out and session management.

pub mod fanout;
pub mod flush;
pub mod persistence;
pub mod retry;
pub mod scheduler;
pub mod session;

pub use fanout::{BatchWrite, FanoutWriter, WriteFailure};
pub use flush::{CycleReport, FlushCoordinator, FlushTrigger};
pub use persistence::{EngineBuilder, HealthReport, PersistenceEngine, SessionStart, ShutdownReport};
pub use retry::{RetryOutcome, RetryRequeuePolicy};
pub use scheduler::{BatchScheduler, SchedulerTimings};
pub use session::{FinalizeReport, SessionInfo, SessionLifecycle};
