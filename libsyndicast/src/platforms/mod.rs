//! Platform adapters
//!
//! A [`Platform`] is the only thing the engine knows about a publishing
//! service. Adapters translate every failure into a structured
//! [`PlatformError`](crate::error::PlatformError); the engine decides whether
//! to retry from [`PlatformError::kind`](crate::error::PlatformError::kind)
//! alone and never inspects message text.
//!
//! # Examples
//!
//! ```no_run
//! use libsyndicast::platforms::{mock::MockPlatform, Platform};
//! use libsyndicast::types::{PublicationTask, TaskPayload};
//!
//! # async fn example() -> libsyndicast::error::PlatformResult<()> {
//! let platform = MockPlatform::new("sandbox");
//! let task = PublicationTask::new("sandbox", TaskPayload::default());
//!
//! let receipt = platform.publish(&task).await?;
//! let metrics = platform.fetch_metrics(&receipt.platform_post_id).await?;
//! println!("{} views", metrics.views);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;

use crate::error::PlatformResult;
use crate::types::{AuthCheck, Metrics, PublicationTask, PublishReceipt};

pub mod http;
pub mod registry;

// Available in all builds: dry-run platforms use it outside of tests
pub mod mock;

pub use registry::PlatformRegistry;

#[async_trait]
pub trait Platform: Send + Sync {
    /// Platform id this adapter is registered under
    fn name(&self) -> &str;

    /// Deliver one task
    ///
    /// The engine bounds this call with its publish timeout, so an adapter
    /// may block for as long as its transport allows.
    ///
    /// # Errors
    ///
    /// - `Validation` / `Rejected` when the platform refuses the content
    /// - `Authentication` / `CredentialsExpired` for credential problems
    /// - `RateLimit` with the platform's requested delay, if it sent one
    /// - `Network` / `Timeout` / `Unavailable` for transient conditions
    async fn publish(&self, task: &PublicationTask) -> PlatformResult<PublishReceipt>;

    /// Read engagement counters for a previously published post
    async fn fetch_metrics(&self, platform_post_id: &str) -> PlatformResult<Metrics>;

    /// Probe the platform with the configured credentials
    ///
    /// A reachable platform that rejects the credentials returns
    /// `Ok` with an expired or invalid [`AuthCheck::status`]; `Err` means
    /// the probe itself failed.
    async fn check_auth(&self) -> PlatformResult<AuthCheck>;
}
