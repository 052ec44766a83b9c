//! Mock platform implementation
//!
//! A scriptable adapter for integration tests and `dry-run` platforms. Tests
//! keep an `Arc<MockPlatform>` next to the registry and change its behavior
//! while the engine is running; call counters record what the engine did.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{PlatformError, PlatformResult};
use crate::platforms::Platform;
use crate::types::{AuthCheck, AuthStatus, Metrics, PublicationTask, PublishReceipt, RateLimitInfo};

#[derive(Debug, Default)]
struct MockState {
    publish_delay: Duration,
    /// Consumed one per publish call before `publish_error` applies
    queued_publish_errors: VecDeque<PlatformError>,
    publish_error: Option<PlatformError>,
    auth_error: Option<PlatformError>,
    auth_status: Option<AuthStatus>,
    /// Front value is returned and popped while more than one remains
    metrics: VecDeque<Metrics>,
    metrics_errors: VecDeque<PlatformError>,
    metrics_delay: Duration,
    rate_limit: Option<RateLimitInfo>,
    publish_calls: usize,
    auth_calls: usize,
    metrics_calls: usize,
    published: Vec<String>,
}

pub struct MockPlatform {
    name: String,
    state: Mutex<MockState>,
}

impl MockPlatform {
    /// A platform that accepts everything immediately
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(MockState::default()),
        }
    }

    /// A platform whose publish always fails with `error`
    pub fn failing(name: impl Into<String>, error: PlatformError) -> Self {
        let platform = Self::new(name);
        platform.set_publish_error(Some(error));
        platform
    }

    /// A platform whose publish takes `delay` to complete
    pub fn with_delay(name: impl Into<String>, delay: Duration) -> Self {
        let platform = Self::new(name);
        platform.set_publish_delay(delay);
        platform
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_publish_delay(&self, delay: Duration) {
        self.state().publish_delay = delay;
    }

    pub fn set_publish_error(&self, error: Option<PlatformError>) {
        self.state().publish_error = error;
    }

    /// Fail the next `errors.len()` publish calls in order
    pub fn queue_publish_errors(&self, errors: impl IntoIterator<Item = PlatformError>) {
        self.state().queued_publish_errors.extend(errors);
    }

    pub fn set_auth_error(&self, error: Option<PlatformError>) {
        self.state().auth_error = error;
    }

    pub fn set_auth_status(&self, status: AuthStatus) {
        self.state().auth_status = Some(status);
    }

    /// Metrics returned by successive `fetch_metrics` calls; the last repeats
    pub fn push_metrics(&self, metrics: Metrics) {
        self.state().metrics.push_back(metrics);
    }

    pub fn queue_metrics_errors(&self, errors: impl IntoIterator<Item = PlatformError>) {
        self.state().metrics_errors.extend(errors);
    }

    pub fn set_metrics_delay(&self, delay: Duration) {
        self.state().metrics_delay = delay;
    }

    pub fn set_rate_limit(&self, info: Option<RateLimitInfo>) {
        self.state().rate_limit = info;
    }

    pub fn publish_calls(&self) -> usize {
        self.state().publish_calls
    }

    pub fn auth_calls(&self) -> usize {
        self.state().auth_calls
    }

    pub fn metrics_calls(&self) -> usize {
        self.state().metrics_calls
    }

    /// Ids of tasks that were accepted
    pub fn published(&self) -> Vec<String> {
        self.state().published.clone()
    }
}

#[async_trait]
impl Platform for MockPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, task: &PublicationTask) -> PlatformResult<PublishReceipt> {
        let delay = {
            let mut state = self.state();
            state.publish_calls += 1;
            state.publish_delay
        };

        if !delay.is_zero() {
            sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(error) = state.queued_publish_errors.pop_front() {
            return Err(error);
        }
        if let Some(error) = state.publish_error.clone() {
            return Err(error);
        }

        state.published.push(task.id.clone());
        let post_id = format!("{}-{}", self.name, uuid::Uuid::new_v4());
        Ok(PublishReceipt {
            url: Some(format!("https://{}.invalid/posts/{}", self.name, post_id)),
            platform_post_id: post_id,
            rate_limit: state.rate_limit,
        })
    }

    async fn fetch_metrics(&self, _platform_post_id: &str) -> PlatformResult<Metrics> {
        let (delay, result) = {
            let mut state = self.state();
            state.metrics_calls += 1;

            let result = match state.metrics_errors.pop_front() {
                Some(error) => Err(error),
                None => {
                    let metrics = if state.metrics.len() > 1 {
                        state.metrics.pop_front()
                    } else {
                        state.metrics.front().copied()
                    };
                    Ok(metrics.unwrap_or_default())
                }
            };
            (state.metrics_delay, result)
        };

        if !delay.is_zero() {
            sleep(delay).await;
        }
        result
    }

    async fn check_auth(&self) -> PlatformResult<AuthCheck> {
        let mut state = self.state();
        state.auth_calls += 1;

        if let Some(error) = state.auth_error.clone() {
            return Err(error);
        }

        Ok(AuthCheck {
            status: state.auth_status.unwrap_or(AuthStatus::Valid),
            rate_limit: state.rate_limit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskPayload;

    fn task() -> PublicationTask {
        PublicationTask::new("sandbox", TaskPayload::default())
    }

    #[tokio::test]
    async fn test_mock_success() {
        let platform = MockPlatform::new("sandbox");
        let task = task();

        let receipt = platform.publish(&task).await.unwrap();
        assert!(receipt.platform_post_id.starts_with("sandbox-"));
        assert!(receipt.url.is_some());
        assert_eq!(platform.publish_calls(), 1);
        assert_eq!(platform.published(), vec![task.id]);
    }

    #[tokio::test]
    async fn test_queued_errors_then_success() {
        let platform = MockPlatform::new("sandbox");
        platform.queue_publish_errors([
            PlatformError::Network("reset".into()),
            PlatformError::Unavailable("503".into()),
        ]);

        assert_eq!(
            platform.publish(&task()).await.unwrap_err(),
            PlatformError::Network("reset".into())
        );
        assert!(matches!(
            platform.publish(&task()).await,
            Err(PlatformError::Unavailable(_))
        ));
        assert!(platform.publish(&task()).await.is_ok());
        assert_eq!(platform.publish_calls(), 3);
    }

    #[tokio::test]
    async fn test_sticky_publish_error() {
        let platform = MockPlatform::failing("sandbox", PlatformError::Rejected("duplicate".into()));
        for _ in 0..2 {
            assert!(matches!(
                platform.publish(&task()).await,
                Err(PlatformError::Rejected(_))
            ));
        }
        assert!(platform.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_delay() {
        let platform = MockPlatform::with_delay("sandbox", Duration::from_secs(60));
        let start = tokio::time::Instant::now();
        platform.publish(&task()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_metrics_sequence_repeats_last() {
        let platform = MockPlatform::new("sandbox");
        assert_eq!(platform.fetch_metrics("p").await.unwrap(), Metrics::default());

        platform.push_metrics(Metrics {
            views: 100,
            ..Default::default()
        });
        platform.push_metrics(Metrics {
            views: 150,
            ..Default::default()
        });

        assert_eq!(platform.fetch_metrics("p").await.unwrap().views, 100);
        assert_eq!(platform.fetch_metrics("p").await.unwrap().views, 150);
        assert_eq!(platform.fetch_metrics("p").await.unwrap().views, 150);
        assert_eq!(platform.metrics_calls(), 4);
    }

    #[tokio::test]
    async fn test_check_auth_variants() {
        let platform = MockPlatform::new("sandbox");
        assert_eq!(platform.check_auth().await.unwrap().status, AuthStatus::Valid);

        platform.set_auth_status(AuthStatus::Expired);
        assert_eq!(platform.check_auth().await.unwrap().status, AuthStatus::Expired);

        platform.set_auth_error(Some(PlatformError::Network("refused".into())));
        assert!(platform.check_auth().await.is_err());
        assert_eq!(platform.auth_calls(), 3);
    }
}
