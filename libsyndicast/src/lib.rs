//! Syndicast - dispatch and recovery for multi-platform publishing
//!
//! The library schedules publication tasks against platform adapters,
//! retries transient failures with backoff, watches platform health with a
//! circuit breaker, samples post engagement after publishing and raises
//! alerts through pluggable notification channels. All state lives behind
//! the [`store::Store`] trait so the engine can pick up where it left off
//! after a restart.

pub mod alerting;
pub mod analytics;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod health;
pub mod logging;
pub mod platforms;
pub mod scheduler;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use engine::{DispatchEngine, SubmitOutcome, SubmitRequest, SystemHealth, TaskView};
pub use error::{ErrorKind, PlatformError, Result, SyndicastError};
pub use events::{Event, EventBus};
pub use platforms::{Platform, PlatformRegistry};
pub use store::{MemoryStore, Store};
pub use types::{Alert, PublicationTask, Severity, TaskPayload, TaskStatus};
