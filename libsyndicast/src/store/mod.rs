//! Persistence interface consumed by the engine
//!
//! Every state change is written through a [`Store`] before timers are
//! armed or alerts are routed, so the store is the source of truth when the
//! process restarts. [`crate::db::Database`] is the SQLite implementation;
//! [`memory::MemoryStore`] keeps everything in process.

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Alert, AnalyticsSample, PlatformHealthRecord, PublicationTask, TaskStatus};

pub use memory::MemoryStore;

#[async_trait]
pub trait Store: Send + Sync {
    // Tasks
    async fn insert_task(&self, task: &PublicationTask) -> Result<()>;
    /// Overwrite a stored task; `NotFound` when the id is unknown
    async fn update_task(&self, task: &PublicationTask) -> Result<()>;
    async fn get_task(&self, id: &str) -> Result<Option<PublicationTask>>;
    /// Tasks in any of `statuses`, oldest first
    async fn tasks_with_status(&self, statuses: &[TaskStatus]) -> Result<Vec<PublicationTask>>;
    /// Posted tasks with `posted_at >= since`
    async fn posted_since(&self, since: i64) -> Result<Vec<PublicationTask>>;

    // Platform health
    async fn upsert_health(&self, record: &PlatformHealthRecord) -> Result<()>;
    async fn get_health(&self, platform: &str) -> Result<Option<PlatformHealthRecord>>;
    async fn list_health(&self) -> Result<Vec<PlatformHealthRecord>>;

    // Alerts
    async fn insert_alert(&self, alert: &Alert) -> Result<()>;
    async fn update_alert(&self, alert: &Alert) -> Result<()>;
    async fn get_alert(&self, id: &str) -> Result<Option<Alert>>;
    /// Alerts newest first
    async fn list_alerts(&self, unresolved_only: bool) -> Result<Vec<Alert>>;

    // Analytics
    async fn insert_sample(&self, sample: &AnalyticsSample) -> Result<()>;
    /// Samples for one task ordered by offset
    async fn samples_for_task(&self, task_id: &str) -> Result<Vec<AnalyticsSample>>;
}
