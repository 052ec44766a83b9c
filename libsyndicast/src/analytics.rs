//! Delayed engagement sampling for published tasks
//!
//! After a publish the sampler arms a timer for the first offset. When it
//! fires, metrics are fetched, scored and appended; only then is the next
//! offset armed, so a task never has more than one analytics timer.
//!
//! Sampling follows the engine lifecycle: once the engine stops, a fetch in
//! progress is dropped and no further offsets are armed.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::alerting::AlertService;
use crate::config::AnalyticsConfig;
use crate::error::{PlatformError, Result};
use crate::events::{Event, EventBus};
use crate::platforms::PlatformRegistry;
use crate::scheduler::{delay_until, TimerKey, TimerSet};
use crate::store::Store;
use crate::types::{
    AlertCategory, AnalyticsSample, Metrics, NewAlert, PublicationTask, Severity, TaskStatus,
    Trends,
};

const HOUR: i64 = 3600;
const DAY: i64 = 24 * HOUR;
const WEEK: i64 = 7 * DAY;

const HOURLY_BUCKETS: usize = 24;
const DAILY_BUCKETS: usize = 30;
const WEEKLY_BUCKETS: usize = 5;

/// Interactions per view; zero without views
pub fn engagement_score(metrics: &Metrics) -> f64 {
    if metrics.views == 0 {
        return 0.0;
    }
    metrics.interactions() as f64 / metrics.views as f64
}

/// View growth between the two most recent samples
///
/// Zero with fewer than two samples or when the older one had no views.
pub fn growth_rate(prior: &[AnalyticsSample]) -> f64 {
    match prior {
        [.., first, last] if first.metrics.views > 0 => {
            (last.metrics.views as f64 - first.metrics.views as f64) / first.metrics.views as f64
        }
        _ => 0.0,
    }
}

/// Latest view count per hour, day and week since `posted_at`
///
/// Buckets without a sample carry the previous bucket's value forward.
pub fn compute_trends(samples: &[AnalyticsSample], posted_at: i64) -> Trends {
    Trends {
        hourly: bucketize(samples, posted_at, HOUR, HOURLY_BUCKETS),
        daily: bucketize(samples, posted_at, DAY, DAILY_BUCKETS),
        weekly: bucketize(samples, posted_at, WEEK, WEEKLY_BUCKETS),
    }
}

fn bucketize(samples: &[AnalyticsSample], posted_at: i64, width: i64, max: usize) -> Vec<u64> {
    let mut latest: Vec<Option<(i64, u64)>> = vec![None; max];
    let mut used = 0;

    for sample in samples {
        let elapsed = sample.sampled_at.saturating_sub(posted_at).max(0);
        let index = match usize::try_from(elapsed / width) {
            Ok(index) if index < max => index,
            _ => continue,
        };
        used = used.max(index + 1);

        let replace = match latest[index] {
            Some((sampled_at, _)) => sample.sampled_at >= sampled_at,
            None => true,
        };
        if replace {
            latest[index] = Some((sample.sampled_at, sample.metrics.views));
        }
    }

    let mut carried = 0;
    latest
        .into_iter()
        .take(used)
        .map(|slot| {
            if let Some((_, views)) = slot {
                carried = views;
            }
            carried
        })
        .collect()
}

pub struct AnalyticsSampler {
    registry: PlatformRegistry,
    store: Arc<dyn Store>,
    alerts: Arc<AlertService>,
    events: EventBus,
    timers: Arc<TimerSet>,
    /// `true` while the owning engine runs
    active: watch::Receiver<bool>,
    settings: AnalyticsConfig,
}

impl AnalyticsSampler {
    pub fn new(
        registry: PlatformRegistry,
        store: Arc<dyn Store>,
        alerts: Arc<AlertService>,
        events: EventBus,
        timers: Arc<TimerSet>,
        active: watch::Receiver<bool>,
        settings: AnalyticsConfig,
    ) -> Self {
        Self {
            registry,
            store,
            alerts,
            events,
            timers,
            active,
            settings,
        }
    }

    fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    /// Resolves once the engine stops or goes away
    async fn stopped(&self) {
        let mut active = self.active.clone();
        let _ = active.wait_for(|active| !*active).await;
    }

    fn offsets(&self) -> impl Iterator<Item = i64> + '_ {
        self.settings
            .offsets
            .iter()
            .map(|offset| i64::try_from(offset.as_secs()).unwrap_or(i64::MAX))
    }

    /// Arm the first offset after `after` (or the first offset at all)
    ///
    /// Returns the offset armed, or `None` once every offset is sampled or
    /// the engine has stopped.
    pub fn schedule_next(
        self: &Arc<Self>,
        task: &PublicationTask,
        after: Option<i64>,
    ) -> Option<i64> {
        if !self.is_active() {
            tracing::debug!(task_id = %task.id, "Engine stopped, not arming analytics");
            return None;
        }
        let posted_at = task.posted_at?;
        let offset = self
            .offsets()
            .find(|offset| after.map_or(true, |done| *offset > done))?;

        let delay = delay_until(
            posted_at.saturating_add(offset),
            chrono::Utc::now().timestamp(),
        );

        let sampler = Arc::clone(self);
        let task_id = task.id.clone();
        self.timers.arm(
            TimerKey::analytics(task.id.clone(), offset),
            delay,
            async move { sampler.run_sample(task_id, offset).await },
        );

        tracing::debug!(task_id = %task.id, offset_secs = offset, ?delay, "Analytics sample armed");
        Some(offset)
    }

    async fn run_sample(self: Arc<Self>, task_id: String, offset: i64) {
        if !self.is_active() {
            return;
        }
        let task = match self.store.get_task(&task_id).await {
            Ok(Some(task)) if task.status == TaskStatus::Posted => task,
            Ok(_) => return,
            Err(e) => {
                tracing::error!(task_id = %task_id, "Failed to load task for sampling: {}", e);
                return;
            }
        };

        match self.sample(&task, offset).await {
            Ok(Some(sample)) => {
                tracing::info!(
                    task_id = %task.id,
                    platform = %task.platform,
                    offset_secs = offset,
                    views = sample.metrics.views,
                    engagement = sample.engagement_score,
                    "Analytics sample recorded"
                );
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(task_id = %task.id, offset_secs = offset, "Analytics sample failed: {}", e);
            }
        }

        self.schedule_next(&task, Some(offset));
    }

    /// Fetch, score and store one sample
    ///
    /// Returns `Ok(None)` when the platform kept failing and the sample was
    /// abandoned, or when the engine stopped mid-fetch.
    pub async fn sample(
        &self,
        task: &PublicationTask,
        offset: i64,
    ) -> Result<Option<AnalyticsSample>> {
        let Some(post_id) = task.platform_post_id.as_deref() else {
            return Ok(None);
        };
        let adapter = self.registry.get(&task.platform)?;

        let fetched = tokio::select! {
            fetched = self.fetch_with_retry(adapter.as_ref(), post_id) => fetched,
            _ = self.stopped() => {
                tracing::debug!(task_id = %task.id, offset_secs = offset, "Engine stopped, dropping analytics sample");
                return Ok(None);
            }
        };
        let metrics = match fetched {
            Ok(metrics) => metrics,
            Err(e) => {
                tracing::warn!(
                    task_id = %task.id,
                    offset_secs = offset,
                    kind = %e.kind(),
                    "Abandoning analytics sample: {}",
                    e
                );
                return Ok(None);
            }
        };

        let mut history = self.store.samples_for_task(&task.id).await?;
        let growth = growth_rate(&history);
        let now = chrono::Utc::now().timestamp();

        let mut sample = AnalyticsSample {
            task_id: task.id.clone(),
            platform: task.platform.clone(),
            offset_secs: offset,
            metrics,
            engagement_score: engagement_score(&metrics),
            growth_rate: growth,
            sampled_at: now,
            trends: Trends::default(),
        };
        history.push(sample.clone());
        sample.trends = compute_trends(&history, task.posted_at.unwrap_or(task.created_at));

        self.store.insert_sample(&sample).await?;
        self.events.emit(Event::SampleRecorded {
            sample: sample.clone(),
        });
        self.check_anomalies(task, &sample).await?;

        Ok(Some(sample))
    }

    async fn fetch_with_retry(
        &self,
        adapter: &dyn crate::platforms::Platform,
        post_id: &str,
    ) -> std::result::Result<Metrics, PlatformError> {
        let timeout = self.settings.fetch_timeout;
        let mut delay = self.settings.retry_delay;
        let mut retries = 0;

        loop {
            let fetched = match tokio::time::timeout(timeout, adapter.fetch_metrics(post_id)).await {
                Ok(result) => result,
                Err(_) => Err(PlatformError::Timeout(timeout)),
            };
            match fetched {
                Ok(metrics) => return Ok(metrics),
                Err(e) if retries < self.settings.max_retries => {
                    retries += 1;
                    tracing::debug!(post_id, retries, ?delay, "Metrics fetch failed, retrying: {}", e);
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2).min(Duration::from_secs(DAY as u64));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn check_anomalies(&self, task: &PublicationTask, sample: &AnalyticsSample) -> Result<()> {
        let score = sample.engagement_score;

        let alert = if score >= self.settings.viral_engagement {
            Some(NewAlert::new(
                AlertCategory::Success,
                Severity::Low,
                format!("Post on {} is going viral", task.platform),
            ))
        } else if score < self.settings.low_engagement
            && sample.metrics.views >= self.settings.low_engagement_min_views
        {
            Some(NewAlert::new(
                AlertCategory::Warning,
                Severity::Low,
                format!("Low engagement on {}", task.platform),
            ))
        } else {
            None
        };

        if let Some(alert) = alert {
            self.alerts
                .create_alert(
                    alert
                        .detail(format!(
                            "engagement {:.2}% over {} views at +{}s",
                            score * 100.0,
                            sample.metrics.views,
                            sample.offset_secs
                        ))
                        .platform(task.platform.clone())
                        .task(task.id.clone()),
                )
                .await?;
        }
        Ok(())
    }

    /// Re-arm sampling for posted tasks still inside the sampling window
    pub async fn recover(self: &Arc<Self>, now: i64) -> Result<usize> {
        let Some(last_offset) = self.offsets().last() else {
            return Ok(0);
        };

        let mut armed = 0;
        for task in self.store.posted_since(now.saturating_sub(last_offset)).await? {
            let sampled = self.store.samples_for_task(&task.id).await?;
            let done = sampled.iter().map(|sample| sample.offset_secs).max();
            if self.schedule_next(&task, done).is_some() {
                armed += 1;
            }
        }

        if armed > 0 {
            tracing::info!(armed, "Re-armed analytics sampling");
        }
        Ok(armed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlertsConfig;
    use crate::platforms::mock::MockPlatform;
    use crate::store::MemoryStore;
    use crate::types::TaskPayload;
    use tokio::sync::watch;

    fn sample_with(views: u64, sampled_at: i64) -> AnalyticsSample {
        AnalyticsSample {
            task_id: "t1".to_string(),
            platform: "blog".to_string(),
            offset_secs: 0,
            metrics: Metrics {
                views,
                ..Default::default()
            },
            engagement_score: 0.0,
            growth_rate: 0.0,
            sampled_at,
            trends: Trends::default(),
        }
    }

    #[test]
    fn test_engagement_score() {
        let metrics = Metrics {
            views: 200,
            clicks: 4,
            likes: 10,
            shares: 4,
            comments: 2,
        };
        assert!((engagement_score(&metrics) - 0.1).abs() < f64::EPSILON);
        assert_eq!(engagement_score(&Metrics::default()), 0.0);
    }

    #[test]
    fn test_growth_rate() {
        assert_eq!(growth_rate(&[]), 0.0);
        assert_eq!(growth_rate(&[sample_with(100, 0)]), 0.0);
        assert_eq!(growth_rate(&[sample_with(0, 0), sample_with(50, 1)]), 0.0);

        let rate = growth_rate(&[sample_with(100, 0), sample_with(150, 1)]);
        assert!((rate - 0.5).abs() < f64::EPSILON);

        // Only the two most recent samples count
        let rate = growth_rate(&[
            sample_with(10, 0),
            sample_with(200, 1),
            sample_with(100, 2),
        ]);
        assert!((rate + 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_trends_bucket_latest_views() {
        let posted_at = 1_000_000;
        let samples = vec![
            sample_with(100, posted_at + 3_600),
            sample_with(300, posted_at + 6 * 3_600),
            sample_with(900, posted_at + 24 * 3_600),
            sample_with(1_500, posted_at + 7 * 86_400),
        ];

        let trends = compute_trends(&samples, posted_at);
        assert_eq!(trends.hourly.len(), 7);
        assert_eq!(trends.hourly[0], 0);
        assert_eq!(trends.hourly[1], 100);
        assert_eq!(trends.hourly[5], 100);
        assert_eq!(trends.hourly[6], 300);

        assert_eq!(trends.daily.len(), 8);
        assert_eq!(trends.daily[0], 300);
        assert_eq!(trends.daily[1], 900);
        assert_eq!(trends.daily[7], 1_500);

        assert_eq!(trends.weekly, vec![900, 1_500]);
    }

    struct Fixture {
        sampler: Arc<AnalyticsSampler>,
        platform: Arc<MockPlatform>,
        store: Arc<MemoryStore>,
        alerts: Arc<AlertService>,
        timers: Arc<TimerSet>,
        active: watch::Sender<bool>,
        _gate: watch::Sender<bool>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let events = EventBus::new(64);
        let alerts = Arc::new(AlertService::new(
            store.clone(),
            events.clone(),
            AlertsConfig::default(),
        ));
        let platform = Arc::new(MockPlatform::new("blog"));
        let mut registry = PlatformRegistry::new();
        registry.register("blog", platform.clone());
        let (gate, gate_rx) = watch::channel(true);
        let timers = Arc::new(TimerSet::new(gate_rx));
        let (active, active_rx) = watch::channel(true);

        let sampler = Arc::new(AnalyticsSampler::new(
            registry,
            store.clone(),
            alerts.clone(),
            events,
            timers.clone(),
            active_rx,
            AnalyticsConfig::default(),
        ));

        Fixture {
            sampler,
            platform,
            store,
            alerts,
            timers,
            active,
            _gate: gate,
        }
    }

    async fn posted_task(store: &MemoryStore) -> PublicationTask {
        let mut task = PublicationTask::new("blog", TaskPayload::default());
        task.status = TaskStatus::Posted;
        task.platform_post_id = Some("post-1".to_string());
        task.posted_at = Some(chrono::Utc::now().timestamp());
        store.insert_task(&task).await.unwrap();
        task
    }

    #[tokio::test]
    async fn test_viral_sample_raises_success_alert() {
        let f = fixture();
        let task = posted_task(&f.store).await;
        f.platform.push_metrics(Metrics {
            views: 100,
            likes: 20,
            ..Default::default()
        });

        let sample = f.sampler.sample(&task, 3600).await.unwrap().unwrap();
        assert!((sample.engagement_score - 0.2).abs() < f64::EPSILON);
        assert_eq!(sample.growth_rate, 0.0);

        let alerts = f.alerts.open_alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].category, AlertCategory::Success);
        assert_eq!(alerts[0].severity, Severity::Low);
        assert_eq!(alerts[0].task_id.as_deref(), Some(task.id.as_str()));
    }

    #[tokio::test]
    async fn test_low_engagement_needs_enough_views() {
        let f = fixture();
        let task = posted_task(&f.store).await;

        f.platform.push_metrics(Metrics {
            views: 50,
            ..Default::default()
        });
        f.sampler.sample(&task, 3600).await.unwrap();
        assert!(f.alerts.open_alerts().await.is_empty());

        f.platform.push_metrics(Metrics {
            views: 500,
            likes: 1,
            ..Default::default()
        });
        let sample = f.sampler.sample(&task, 21_600).await.unwrap().unwrap();
        assert!((sample.growth_rate - 0.0).abs() < f64::EPSILON);

        let alerts = f.alerts.open_alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].category, AlertCategory::Warning);
    }

    #[tokio::test]
    async fn test_growth_uses_stored_history() {
        let f = fixture();
        let task = posted_task(&f.store).await;
        for views in [100, 150, 300] {
            f.platform.push_metrics(Metrics {
                views,
                ..Default::default()
            });
        }

        f.sampler.sample(&task, 3_600).await.unwrap();
        f.sampler.sample(&task, 21_600).await.unwrap();
        let third = f.sampler.sample(&task, 86_400).await.unwrap().unwrap();

        assert!((third.growth_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(f.store.samples_for_task(&task.id).await.unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_fetch_is_retried_then_abandoned() {
        let f = fixture();
        let task = posted_task(&f.store).await;
        f.platform.queue_metrics_errors(
            (0..4).map(|_| PlatformError::Network("reset".into())),
        );

        let start = tokio::time::Instant::now();
        let result = f.sampler.sample(&task, 3600).await.unwrap();
        assert!(result.is_none());
        assert_eq!(f.platform.metrics_calls(), 4);
        // 60s + 120s + 240s of backoff
        assert!(start.elapsed() >= Duration::from_secs(420));
        assert!(f.store.samples_for_task(&task.id).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_fetch_times_out_and_is_retried() {
        let f = fixture();
        let task = posted_task(&f.store).await;
        f.platform.set_metrics_delay(Duration::from_secs(86_400));

        let start = tokio::time::Instant::now();
        let result = f.sampler.sample(&task, 3600).await.unwrap();
        assert!(result.is_none());
        assert_eq!(f.platform.metrics_calls(), 4);
        // Four 30s timeouts plus 60s + 120s + 240s of backoff
        assert!(start.elapsed() >= Duration::from_secs(540));
        assert!(start.elapsed() < Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_drops_sample_in_retry() {
        let f = fixture();
        let task = posted_task(&f.store).await;
        f.platform
            .queue_metrics_errors([PlatformError::Network("reset".into())]);

        assert_eq!(f.sampler.schedule_next(&task, None), Some(3_600));
        // The +1h sample has failed once and is waiting to retry
        tokio::time::sleep(Duration::from_secs(3_610)).await;
        assert_eq!(f.platform.metrics_calls(), 1);

        f.active.send_replace(false);
        tokio::time::sleep(Duration::from_secs(6 * 3_600)).await;

        assert_eq!(f.platform.metrics_calls(), 1);
        assert!(f.store.samples_for_task(&task.id).await.unwrap().is_empty());
        assert_eq!(f.timers.depths().analytics, 0);
        assert_eq!(f.sampler.schedule_next(&task, None), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_next_walks_offsets() {
        let f = fixture();
        let task = posted_task(&f.store).await;

        assert_eq!(f.sampler.schedule_next(&task, None), Some(3_600));
        assert!(f.timers.is_armed(&TimerKey::analytics(task.id.clone(), 3_600)));
        assert_eq!(f.timers.depths().analytics, 1);

        assert_eq!(f.sampler.schedule_next(&task, Some(3_600)), Some(21_600));
        assert_eq!(f.sampler.schedule_next(&task, Some(30 * 86_400)), None);

        // The timer fires, samples, and arms the following offset
        f.timers.cancel_all();
        f.sampler.schedule_next(&task, None);
        tokio::time::sleep(Duration::from_secs(3_601)).await;
        assert_eq!(f.store.samples_for_task(&task.id).await.unwrap().len(), 1);
        assert!(f.timers.is_armed(&TimerKey::analytics(task.id.clone(), 21_600)));
        assert_eq!(f.timers.depths().analytics, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_resumes_after_last_sample() {
        let f = fixture();
        let task = posted_task(&f.store).await;
        let mut done = sample_with(10, task.posted_at.unwrap() + 3_600);
        done.task_id = task.id.clone();
        done.offset_secs = 3_600;
        f.store.insert_sample(&done).await.unwrap();

        let armed = f.sampler.recover(chrono::Utc::now().timestamp()).await.unwrap();
        assert_eq!(armed, 1);
        assert!(f.timers.is_armed(&TimerKey::analytics(task.id.clone(), 21_600)));
    }
}
