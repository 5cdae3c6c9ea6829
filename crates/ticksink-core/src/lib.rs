//! Ticksink Core - batching multi-table persistence for periodic game-state snapshots
//!
//! This library accepts one composite record per game tick and persists it
//! across a root table and one table per populated component with:
//!
//! - Non-blocking submission into a bounded in-memory queue
//! - Size- and timer-triggered batch flushes on a single worker
//! - One transaction per batch across every table the batch touches
//! - Bounded retry with requeue-to-front and logged, counted data loss
//! - Session lifecycle with a store-verified final record count

pub mod circuit_breaker;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod record;
pub mod store;

// Re-export commonly used types
pub use config::Config;
pub use engine::{FinalizeReport, PersistenceEngine, SessionStart};
pub use error::{Error, Result};
pub use error::{FailureClass, PoolError, SessionError, StoreError};
pub use record::{ComponentSlot, CompositeRecord, CorrelationKey, RejectReason, SessionId};
