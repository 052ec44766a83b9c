//! Dispatch engine
//!
//! Owns the task lifecycle:
//!
//! ```text
//! Scheduled ──► Executing ──► Posted
//!     │             │
//!     │             ├──► Retrying ──► Executing ──► ... ──► Failed
//!     │             └──► Failed
//!     └──► Cancelled ◄── Retrying
//! ```
//!
//! Every transition is persisted through the [`Store`] before a timer is
//! armed or an alert is routed. Transitions of one task are serialized by a
//! per-task async lock; the publish call itself runs outside the lock.

pub mod request;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::alerting::{AlertService, ChannelConfig};
use crate::analytics::AnalyticsSampler;
use crate::config::{Config, EngineSettings};
use crate::db::Database;
use crate::error::{ErrorKind, PlatformError, Result, SyndicastError};
use crate::events::{Event, EventBus, EventReceiver};
use crate::health::HealthMonitor;
use crate::platforms::PlatformRegistry;
use crate::scheduler::{delay_until, BackoffSchedule, TimerKey, TimerSet};
use crate::store::Store;
use crate::types::{
    Alert, AlertCategory, NewAlert, PublicationTask, PublishReceipt, Severity, TaskStatus,
};

pub use request::{
    EngineState, PerfSnapshot, RecoveryReport, SubmitOutcome, SubmitRequest, SystemHealth,
    TaskView,
};

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

#[derive(Default)]
struct PerfCounters {
    submitted: AtomicU64,
    posted: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    publish_ms_total: AtomicU64,
    publish_count: AtomicU64,
}

impl PerfCounters {
    fn record_publish(&self, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.publish_ms_total.fetch_add(ms, Ordering::Relaxed);
        self.publish_count.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, in_flight: usize) -> PerfSnapshot {
        let count = self.publish_count.load(Ordering::Relaxed);
        let total = self.publish_ms_total.load(Ordering::Relaxed);
        PerfSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            posted: self.posted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            in_flight,
            avg_publish_ms: if count == 0 {
                0.0
            } else {
                total as f64 / count as f64
            },
        }
    }
}

/// Counts executions between claim and commit
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct FlightGuard<'a>(&'a InFlight);

impl InFlight {
    fn enter(&self) -> FlightGuard<'_> {
        self.count.fetch_add(1, Ordering::SeqCst);
        FlightGuard(self)
    }

    fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    async fn drained(&self) {
        loop {
            let notified = self.idle.notified();
            if self.current() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

struct Inner {
    store: Arc<dyn Store>,
    registry: PlatformRegistry,
    health: Arc<HealthMonitor>,
    alerts: Arc<AlertService>,
    analytics: Arc<AnalyticsSampler>,
    timers: Arc<TimerSet>,
    events: EventBus,
    settings: EngineSettings,
    backoff: BackoffSchedule,
    /// `true` while execution is allowed; closed in maintenance mode
    gate: watch::Sender<bool>,
    running: AtomicBool,
    /// Mirrors `running` for background work that must stop with the engine
    active: watch::Sender<bool>,
    task_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    loops: StdMutex<Vec<JoinHandle<()>>>,
    in_flight: InFlight,
    perf: PerfCounters,
}

/// Schedules, executes, retries and cancels publication tasks
///
/// Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct DispatchEngine {
    inner: Arc<Inner>,
}

impl DispatchEngine {
    pub fn new(
        store: Arc<dyn Store>,
        registry: PlatformRegistry,
        settings: EngineSettings,
        events: EventBus,
    ) -> Result<Self> {
        let backoff = BackoffSchedule::new(settings.engine.backoff_schedule.clone())?;
        let (gate, gate_rx) = watch::channel(true);
        let (active, active_rx) = watch::channel(false);
        let timers = Arc::new(TimerSet::new(gate_rx));

        let alerts = Arc::new(AlertService::new(
            Arc::clone(&store),
            events.clone(),
            settings.alerts.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            registry.clone(),
            Arc::clone(&store),
            Arc::clone(&alerts),
            events.clone(),
            settings.health.clone(),
        ));
        let analytics = Arc::new(AnalyticsSampler::new(
            registry.clone(),
            Arc::clone(&store),
            Arc::clone(&alerts),
            events.clone(),
            Arc::clone(&timers),
            active_rx,
            settings.analytics.clone(),
        ));

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                registry,
                health,
                alerts,
                analytics,
                timers,
                events,
                settings,
                backoff,
                gate,
                running: AtomicBool::new(false),
                active,
                task_locks: StdMutex::new(HashMap::new()),
                loops: StdMutex::new(Vec::new()),
                in_flight: InFlight::default(),
                perf: PerfCounters::default(),
            }),
        })
    }

    /// Build an engine backed by the configured SQLite database
    pub async fn from_config(config: &Config) -> Result<Self> {
        let registry = PlatformRegistry::from_config(config)?;
        let db = Database::new(&config.database.path).await?;

        let engine = Self::new(
            Arc::new(db),
            registry,
            config.engine_settings(),
            EventBus::default(),
        )?;
        engine.update_notification_config(&config.notifications)?;
        Ok(engine)
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    pub fn alerts(&self) -> &Arc<AlertService> {
        &self.inner.alerts
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.inner.health
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn is_maintenance(&self) -> bool {
        !*self.inner.gate.borrow()
    }

    pub fn state(&self) -> EngineState {
        if !self.is_running() {
            EngineState::Stopped
        } else if self.is_maintenance() {
            EngineState::Maintenance
        } else {
            EngineState::Running
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Restore persisted state, re-arm pending work and start the loops
    pub async fn start(&self) -> Result<RecoveryReport> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(SyndicastError::InvalidState(
                "engine is already running".to_string(),
            ));
        }
        self.inner.active.send_replace(true);

        let (alerts, report) = match self.restore().await {
            Ok(restored) => restored,
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                self.inner.active.send_replace(false);
                self.inner.timers.cancel_all();
                return Err(e);
            }
        };

        let probe_loop = Arc::clone(&self.inner.health).spawn_probe_loop();
        let sweep_loop = self.spawn_sweep_loop();
        self.loops().extend([probe_loop, sweep_loop]);

        tracing::info!(
            rearmed = report.rearmed,
            interrupted = report.interrupted,
            analytics = report.analytics,
            open_alerts = alerts,
            platforms = self.inner.registry.len(),
            "Dispatch engine started"
        );
        Ok(report)
    }

    async fn restore(&self) -> Result<(usize, RecoveryReport)> {
        self.inner.health.load().await?;
        let alerts = self.inner.alerts.load().await?;
        let report = self.recover().await?;
        Ok((alerts, report))
    }

    /// Stop the loops and timers, then wait for in-flight publishes
    ///
    /// The wait is bounded by the publish timeout.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.active.send_replace(false);

        for handle in self.loops().drain(..) {
            handle.abort();
        }
        let aborted = self.inner.timers.cancel_all();

        let in_flight = self.inner.in_flight.current();
        let timeout = self.inner.settings.engine.publish_timeout;
        if tokio::time::timeout(timeout, self.inner.in_flight.drained())
            .await
            .is_err()
        {
            tracing::warn!(
                in_flight = self.inner.in_flight.current(),
                "Stopped without draining in-flight publishes"
            );
        }

        tracing::info!(timers = aborted, in_flight, "Dispatch engine stopped");
    }

    /// Pause or resume execution; armed timers stay registered
    pub fn set_maintenance_mode(&self, enabled: bool) {
        let was_enabled = !self.inner.gate.send_replace(!enabled);
        if was_enabled != enabled {
            tracing::info!(enabled, "Maintenance mode changed");
        }
    }

    fn loops(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_sweep_loop(&self) -> JoinHandle<()> {
        let alerts = Arc::clone(&self.inner.alerts);
        let timers = Arc::clone(&self.inner.timers);
        let period = self.inner.settings.alerts.sweep_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                alerts.sweep(now()).await;
                if let Err(e) = alerts.check_queue_pressure(timers.depths().total()).await {
                    tracing::warn!("Queue pressure check failed: {}", e);
                }
            }
        })
    }

    async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let now = now();

        let pending = self
            .inner
            .store
            .tasks_with_status(&[
                TaskStatus::Scheduled,
                TaskStatus::Retrying,
                TaskStatus::Executing,
            ])
            .await?;

        for task in pending {
            match task.status {
                TaskStatus::Executing => {
                    report.interrupted += 1;
                    self.recover_interrupted(task).await?;
                }
                _ => {
                    let due = task.next_attempt_at.unwrap_or(now);
                    self.arm_publish(task.id.clone(), delay_until(due, now));
                    report.rearmed += 1;
                }
            }
        }

        report.analytics = self.inner.analytics.recover(now).await?;
        Ok(report)
    }

    /// A task left in Executing was cut off mid-publish
    async fn recover_interrupted(&self, task: PublicationTask) -> Result<()> {
        tracing::warn!(
            task_id = %task.id,
            platform = %task.platform,
            attempt = task.attempts,
            "Task was interrupted while publishing"
        );

        let warning = NewAlert::new(
            AlertCategory::Warning,
            Severity::Medium,
            format!("Publish to {} was interrupted by a restart", task.platform),
        )
        .detail("The post may have been delivered; a retry can produce a duplicate")
        .platform(task.platform.clone())
        .task(task.id.clone());

        let error = PlatformError::Network("publish interrupted by restart".to_string());
        self.retry_or_fail(task, TaskStatus::Executing, &error).await?;
        self.inner.alerts.create_alert(warning).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Ingest and control
    // ------------------------------------------------------------------

    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome> {
        if !self.is_running() {
            return Ok(SubmitOutcome::Rejected {
                task_id: None,
                reason: "engine is not running".to_string(),
            });
        }

        let max_attempts = request
            .max_attempts
            .unwrap_or(self.inner.settings.engine.default_max_attempts);
        if max_attempts == 0 {
            return Ok(SubmitOutcome::Rejected {
                task_id: None,
                reason: "max_attempts must be at least 1".to_string(),
            });
        }

        let now = now();
        let mut task = PublicationTask::new(request.platform, request.payload);
        task.scheduled_at = request.scheduled_at;
        task.max_attempts = max_attempts;
        task.priority = request.priority;
        task.next_attempt_at = Some(request.scheduled_at.map_or(now, |at| at.max(now)));
        self.inner.perf.submitted.fetch_add(1, Ordering::Relaxed);

        if !self.inner.registry.contains(&task.platform) {
            let error = PlatformError::Unsupported(task.platform.clone());
            task.status = TaskStatus::Failed;
            task.last_error = Some(error.to_string());
            task.next_attempt_at = None;
            self.inner.store.insert_task(&task).await?;
            self.inner.perf.failed.fetch_add(1, Ordering::Relaxed);

            tracing::warn!(task_id = %task.id, platform = %task.platform, "Rejected task for unknown platform");
            return Ok(SubmitOutcome::Rejected {
                task_id: Some(task.id),
                reason: error.to_string(),
            });
        }

        let lock = self.task_lock(&task.id);
        let _held = lock.lock().await;

        self.inner.store.insert_task(&task).await?;
        self.inner.events.emit(Event::TaskSubmitted {
            task_id: task.id.clone(),
            platform: task.platform.clone(),
        });
        tracing::info!(
            task_id = %task.id,
            platform = %task.platform,
            scheduled_at = task.scheduled_at,
            "Task submitted"
        );

        // In maintenance the gate holds the timer; the circuit is checked once it opens
        let due = task.next_attempt_at.unwrap_or(now);
        if due <= now
            && !self.is_maintenance()
            && self.inner.health.is_critical(&task.platform).await
        {
            let task_id = task.id.clone();
            self.defer_open_circuit(task, TaskStatus::Scheduled).await?;
            let status = self.stored_status(&task_id).await?;
            return Ok(SubmitOutcome::Accepted { task_id, status });
        }

        self.arm_publish(task.id.clone(), delay_until(due, now));
        Ok(SubmitOutcome::Accepted {
            task_id: task.id,
            status: TaskStatus::Scheduled,
        })
    }

    /// Cancel a task that has not started publishing
    pub async fn cancel(&self, task_id: &str) -> Result<PublicationTask> {
        let lock = self.task_lock(task_id);
        let _held = lock.lock().await;

        let Some(mut task) = self.inner.store.get_task(task_id).await? else {
            self.release_lock(task_id);
            return Err(SyndicastError::NotFound(format!("task {}", task_id)));
        };

        if !matches!(task.status, TaskStatus::Scheduled | TaskStatus::Retrying) {
            if task.status != TaskStatus::Executing {
                self.release_lock(task_id);
            }
            return Err(SyndicastError::InvalidState(format!(
                "task {} is {} and can no longer be cancelled",
                task_id, task.status
            )));
        }

        let from = task.status;
        task.status = TaskStatus::Cancelled;
        task.next_attempt_at = None;
        task.updated_at = now();
        self.inner.store.update_task(&task).await?;
        self.inner.timers.cancel(&TimerKey::publish(task_id));
        self.emit_transition(&task, from, None);
        self.release_lock(task_id);

        tracing::info!(task_id, platform = %task.platform, "Task cancelled");
        Ok(task)
    }

    pub async fn get_status(&self, task_id: &str) -> Result<TaskView> {
        let task = self
            .inner
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| SyndicastError::NotFound(format!("task {}", task_id)))?;

        Ok(TaskView {
            timer_armed: self.inner.timers.is_armed(&TimerKey::publish(task_id)),
            task,
        })
    }

    pub async fn system_health(&self) -> SystemHealth {
        SystemHealth {
            engine_state: self.state(),
            platforms: self.inner.health.snapshot().await,
            queue_depths: self.inner.timers.depths(),
            open_alerts: self.inner.alerts.open_alerts().await.len(),
            perf: self.inner.perf.snapshot(self.inner.in_flight.current()),
        }
    }

    pub async fn resolve_alert(&self, alert_id: &str, resolved_by: &str) -> Result<Alert> {
        self.inner.alerts.resolve_alert(alert_id, resolved_by).await
    }

    pub fn update_notification_config(&self, channels: &[ChannelConfig]) -> Result<()> {
        self.inner.alerts.update_notification_config(channels)
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    fn task_lock(&self, task_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .inner
            .task_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(task_id.to_string()).or_default())
    }

    /// Forget the lock of a task that reached a terminal state
    fn release_lock(&self, task_id: &str) {
        self.inner
            .task_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id);
    }

    fn arm_publish(&self, task_id: String, delay: Duration) {
        if !self.is_running() {
            tracing::debug!(task_id = %task_id, "Engine stopped, leaving task for recovery");
            return;
        }
        let engine = self.clone();
        let key = TimerKey::publish(task_id.clone());
        self.inner
            .timers
            .arm(key, delay, async move { engine.execute(task_id).await });
    }

    async fn execute(self, task_id: String) {
        let _flight = self.inner.in_flight.enter();
        if let Err(e) = self.run_attempt(&task_id).await {
            tracing::error!(task_id = %task_id, "Task execution failed: {}", e);
        }
    }

    async fn run_attempt(&self, task_id: &str) -> Result<()> {
        let lock = self.task_lock(task_id);

        let claimed = {
            let _held = lock.lock().await;
            let Some(mut task) = self.inner.store.get_task(task_id).await? else {
                self.release_lock(task_id);
                return Ok(());
            };
            if !matches!(task.status, TaskStatus::Scheduled | TaskStatus::Retrying) {
                tracing::debug!(task_id, status = %task.status, "Skipping stale timer");
                if task.is_terminal() {
                    self.release_lock(task_id);
                }
                return Ok(());
            }

            let from = task.status;
            if self.inner.health.is_critical(&task.platform).await {
                return self.defer_open_circuit(task, from).await;
            }

            task.status = TaskStatus::Executing;
            task.attempts += 1;
            task.next_attempt_at = None;
            task.updated_at = now();
            self.inner.store.update_task(&task).await?;
            self.emit_transition(&task, from, None);
            task
        };

        tracing::debug!(
            task_id,
            platform = %claimed.platform,
            attempt = claimed.attempts,
            "Publishing"
        );

        let started = Instant::now();
        let timeout = self.inner.settings.engine.publish_timeout;
        let outcome = match self.inner.registry.get(&claimed.platform) {
            Ok(adapter) => match tokio::time::timeout(timeout, adapter.publish(&claimed)).await {
                Ok(result) => result,
                Err(_) => Err(PlatformError::Timeout(timeout)),
            },
            Err(e) => Err(e),
        };
        self.inner.perf.record_publish(started.elapsed());

        let _held = lock.lock().await;
        let Some(task) = self.inner.store.get_task(task_id).await? else {
            self.release_lock(task_id);
            return Ok(());
        };
        if task.status != TaskStatus::Executing {
            tracing::warn!(task_id, status = %task.status, "Task changed while publishing, dropping result");
            if task.is_terminal() {
                self.release_lock(task_id);
            }
            return Ok(());
        }

        match outcome {
            Ok(receipt) => self.commit_success(task, receipt).await,
            Err(error) => {
                self.feed_health_failure(&task.platform, &error).await;
                if error.is_retryable() {
                    self.retry_or_fail(task, TaskStatus::Executing, &error).await
                } else {
                    self.fail(task, &error).await
                }
            }
        }
    }

    /// Circuit open: consume an attempt without calling the adapter
    async fn defer_open_circuit(&self, mut task: PublicationTask, from: TaskStatus) -> Result<()> {
        task.attempts += 1;
        let error = PlatformError::Unavailable("circuit open".to_string());
        tracing::info!(
            task_id = %task.id,
            platform = %task.platform,
            attempt = task.attempts,
            "Platform is critical, deferring"
        );
        self.retry_or_fail(task, from, &error).await
    }

    async fn commit_success(&self, mut task: PublicationTask, receipt: PublishReceipt) -> Result<()> {
        let now = now();
        task.status = TaskStatus::Posted;
        task.platform_post_id = Some(receipt.platform_post_id);
        task.platform_url = receipt.url;
        task.posted_at = Some(now);
        task.last_error = None;
        task.next_attempt_at = None;
        task.updated_at = now;
        self.inner.store.update_task(&task).await?;
        self.inner.perf.posted.fetch_add(1, Ordering::Relaxed);
        self.emit_transition(&task, TaskStatus::Executing, None);

        tracing::info!(
            task_id = %task.id,
            platform = %task.platform,
            attempt = task.attempts,
            post_id = task.platform_post_id.as_deref(),
            "Task posted"
        );

        if let Err(e) = self
            .inner
            .health
            .record_publish_success(&task.platform, receipt.rate_limit)
            .await
        {
            tracing::warn!(platform = %task.platform, "Failed to record publish success: {}", e);
        }
        if self.is_running() {
            self.inner.analytics.schedule_next(&task, None);
        }
        self.release_lock(&task.id);
        Ok(())
    }

    async fn feed_health_failure(&self, platform: &str, error: &PlatformError) {
        if !self.inner.registry.contains(platform) {
            return;
        }
        if let Err(e) = self.inner.health.record_publish_failure(platform, error).await {
            tracing::warn!(platform, "Failed to record publish failure: {}", e);
        }
    }

    /// Schedule the next attempt, or finalize once attempts are used up
    async fn retry_or_fail(
        &self,
        mut task: PublicationTask,
        from: TaskStatus,
        error: &PlatformError,
    ) -> Result<()> {
        let now = now();

        if task.attempts >= task.max_attempts {
            let message = format!(
                "max retries exceeded after {} attempts: {}",
                task.attempts, error
            );
            task.status = TaskStatus::Failed;
            task.last_error = Some(message.clone());
            task.next_attempt_at = None;
            task.updated_at = now;
            self.inner.store.update_task(&task).await?;
            self.inner.perf.failed.fetch_add(1, Ordering::Relaxed);
            self.emit_transition(&task, from, Some(message.clone()));

            tracing::error!(
                task_id = %task.id,
                platform = %task.platform,
                attempt = task.attempts,
                kind = %ErrorKind::MaxRetriesExceeded,
                "{}",
                message
            );

            self.inner
                .alerts
                .create_alert(
                    NewAlert::new(
                        AlertCategory::Error,
                        Severity::High,
                        format!("Publish to {} failed permanently", task.platform),
                    )
                    .detail(message)
                    .platform(task.platform.clone())
                    .task(task.id.clone()),
                )
                .await?;
            self.release_lock(&task.id);
            return Ok(());
        }

        let delay = error
            .retry_after()
            .unwrap_or_else(|| self.inner.backoff.delay_for_attempt(task.attempts));
        let message = error.to_string();

        task.status = TaskStatus::Retrying;
        task.last_error = Some(message.clone());
        task.next_attempt_at = Some(now.saturating_add(secs(delay)));
        task.updated_at = now;
        self.inner.store.update_task(&task).await?;
        self.inner.perf.retries.fetch_add(1, Ordering::Relaxed);
        self.emit_transition(&task, from, Some(message));

        tracing::warn!(
            task_id = %task.id,
            platform = %task.platform,
            attempt = task.attempts,
            max_attempts = task.max_attempts,
            kind = %error.kind(),
            ?delay,
            "Publish failed, retrying: {}",
            error
        );

        self.arm_publish(task.id.clone(), delay);
        Ok(())
    }

    async fn fail(&self, mut task: PublicationTask, error: &PlatformError) -> Result<()> {
        let message = error.to_string();
        task.status = TaskStatus::Failed;
        task.last_error = Some(message.clone());
        task.next_attempt_at = None;
        task.updated_at = now();
        self.inner.store.update_task(&task).await?;
        self.inner.perf.failed.fetch_add(1, Ordering::Relaxed);
        self.emit_transition(&task, TaskStatus::Executing, Some(message.clone()));

        tracing::error!(
            task_id = %task.id,
            platform = %task.platform,
            attempt = task.attempts,
            kind = %error.kind(),
            "Publish failed: {}",
            error
        );

        let alert = match error.kind() {
            ErrorKind::Auth => Some(NewAlert::new(
                AlertCategory::Error,
                Severity::High,
                format!("Credentials for {} were refused", task.platform),
            )),
            ErrorKind::Rejected => Some(NewAlert::new(
                AlertCategory::Error,
                Severity::Medium,
                format!("{} rejected a post", task.platform),
            )),
            _ => None,
        };
        if let Some(alert) = alert {
            self.inner
                .alerts
                .create_alert(
                    alert
                        .detail(message)
                        .platform(task.platform.clone())
                        .task(task.id.clone()),
                )
                .await?;
        }

        self.release_lock(&task.id);
        Ok(())
    }

    async fn stored_status(&self, task_id: &str) -> Result<TaskStatus> {
        self.inner
            .store
            .get_task(task_id)
            .await?
            .map(|task| task.status)
            .ok_or_else(|| SyndicastError::NotFound(format!("task {}", task_id)))
    }

    fn emit_transition(&self, task: &PublicationTask, from: TaskStatus, error: Option<String>) {
        self.inner.events.emit(Event::TaskStatusChanged {
            task_id: task.id.clone(),
            platform: task.platform.clone(),
            from,
            to: task.status,
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platforms::mock::MockPlatform;
    use crate::store::MemoryStore;
    use crate::types::TaskPayload;

    fn engine_with(platform: Arc<MockPlatform>) -> (DispatchEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let mut registry = PlatformRegistry::new();
        registry.register("blog", platform);
        let engine = DispatchEngine::new(
            store.clone(),
            registry,
            EngineSettings::default(),
            EventBus::default(),
        )
        .unwrap();
        (engine, store)
    }

    fn payload() -> TaskPayload {
        TaskPayload {
            title: "Launch".to_string(),
            body: "We shipped".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_submit_rejected_when_stopped() {
        let (engine, _store) = engine_with(Arc::new(MockPlatform::new("blog")));

        let outcome = engine
            .submit(SubmitRequest::new("blog", payload()))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::Rejected {
                task_id: None,
                reason: "engine is not running".to_string()
            }
        );
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_attempts_is_rejected() {
        let (engine, _store) = engine_with(Arc::new(MockPlatform::new("blog")));
        engine.start().await.unwrap();

        let outcome = engine
            .submit(SubmitRequest::new("blog", payload()).max_attempts(0))
            .await
            .unwrap();
        assert!(!outcome.is_accepted());
        assert_eq!(outcome.task_id(), None);

        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_platform_is_recorded_failed() {
        let (engine, store) = engine_with(Arc::new(MockPlatform::new("blog")));
        engine.start().await.unwrap();

        let outcome = engine
            .submit(SubmitRequest::new("gopher", payload()))
            .await
            .unwrap();

        let task_id = outcome.task_id().unwrap().to_string();
        assert!(!outcome.is_accepted());
        let task = store.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 0);
        assert!(engine.alerts().open_alerts().await.is_empty());

        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_future_task_waits_for_its_time() {
        let platform = Arc::new(MockPlatform::new("blog"));
        let (engine, _store) = engine_with(platform.clone());
        engine.start().await.unwrap();

        let at = chrono::Utc::now().timestamp() + 600;
        let outcome = engine
            .submit(SubmitRequest::new("blog", payload()).scheduled_at(at))
            .await
            .unwrap();
        let task_id = outcome.task_id().unwrap().to_string();

        tokio::time::sleep(Duration::from_secs(300)).await;
        let view = engine.get_status(&task_id).await.unwrap();
        assert_eq!(view.task.status, TaskStatus::Scheduled);
        assert!(view.timer_armed);
        assert_eq!(platform.publish_calls(), 0);

        tokio::time::sleep(Duration::from_secs(301)).await;
        let view = engine.get_status(&task_id).await.unwrap();
        assert_eq!(view.task.status, TaskStatus::Posted);
        assert!(!view.timer_armed);

        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_retry_after_wins_over_backoff() {
        let platform = Arc::new(MockPlatform::new("blog"));
        platform.queue_publish_errors([PlatformError::RateLimit {
            message: "slow down".to_string(),
            retry_after: Some(Duration::from_secs(5)),
        }]);
        let (engine, _store) = engine_with(platform.clone());
        engine.start().await.unwrap();

        let outcome = engine
            .submit(SubmitRequest::new("blog", payload()))
            .await
            .unwrap();
        let task_id = outcome.task_id().unwrap().to_string();

        tokio::time::sleep(Duration::from_secs(1)).await;
        let view = engine.get_status(&task_id).await.unwrap();
        assert_eq!(view.task.status, TaskStatus::Retrying);
        assert_eq!(view.task.attempts, 1);
        let remaining = engine
            .inner
            .timers
            .remaining(&TimerKey::publish(task_id.clone()))
            .unwrap();
        assert!(remaining <= Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(5)).await;
        let view = engine.get_status(&task_id).await.unwrap();
        assert_eq!(view.task.status, TaskStatus::Posted);
        assert_eq!(view.task.attempts, 2);
        assert_eq!(platform.publish_calls(), 2);

        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_is_terminal_with_high_alert() {
        let platform = Arc::new(MockPlatform::failing(
            "blog",
            PlatformError::Authentication("bad token".to_string()),
        ));
        let (engine, _store) = engine_with(platform.clone());
        engine.start().await.unwrap();

        let outcome = engine
            .submit(SubmitRequest::new("blog", payload()))
            .await
            .unwrap();
        let task_id = outcome.task_id().unwrap().to_string();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let view = engine.get_status(&task_id).await.unwrap();
        assert_eq!(view.task.status, TaskStatus::Failed);
        assert_eq!(platform.publish_calls(), 1);

        let alerts = engine.alerts().open_alerts().await;
        let task_alerts: Vec<_> = alerts
            .iter()
            .filter(|alert| alert.task_id.as_deref() == Some(task_id.as_str()))
            .collect();
        assert_eq!(task_alerts.len(), 1);
        assert_eq!(task_alerts[0].severity, Severity::High);

        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failure_raises_no_alert() {
        let platform = Arc::new(MockPlatform::failing(
            "blog",
            PlatformError::Validation("title too long".to_string()),
        ));
        let (engine, _store) = engine_with(platform);
        engine.start().await.unwrap();

        let outcome = engine
            .submit(SubmitRequest::new("blog", payload()))
            .await
            .unwrap();
        let task_id = outcome.task_id().unwrap().to_string();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let view = engine.get_status(&task_id).await.unwrap();
        assert_eq!(view.task.status, TaskStatus::Failed);
        assert!(engine.alerts().open_alerts().await.is_empty());

        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_rules() {
        let platform = Arc::new(MockPlatform::new("blog"));
        let (engine, _store) = engine_with(platform.clone());
        engine.start().await.unwrap();

        assert!(matches!(
            engine.cancel("missing").await,
            Err(SyndicastError::NotFound(_))
        ));

        let at = chrono::Utc::now().timestamp() + 60;
        let outcome = engine
            .submit(SubmitRequest::new("blog", payload()).scheduled_at(at))
            .await
            .unwrap();
        let task_id = outcome.task_id().unwrap().to_string();

        let cancelled = engine.cancel(&task_id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(matches!(
            engine.cancel(&task_id).await,
            Err(SyndicastError::InvalidState(_))
        ));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(platform.publish_calls(), 0);
        let view = engine.get_status(&task_id).await.unwrap();
        assert_eq!(view.task.status, TaskStatus::Cancelled);

        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_attempts_release_task_locks() {
        let (engine, store) = engine_with(Arc::new(MockPlatform::new("blog")));
        engine.start().await.unwrap();
        let lock_count = || engine.inner.task_locks.lock().unwrap().len();

        engine.run_attempt("missing").await.unwrap();
        assert_eq!(lock_count(), 0);

        let mut posted = PublicationTask::new("blog", payload());
        posted.status = TaskStatus::Posted;
        store.insert_task(&posted).await.unwrap();
        engine.run_attempt(&posted.id).await.unwrap();
        assert_eq!(lock_count(), 0);

        let mut executing = PublicationTask::new("blog", payload());
        executing.status = TaskStatus::Executing;
        store.insert_task(&executing).await.unwrap();
        engine.run_attempt(&executing.id).await.unwrap();
        assert_eq!(lock_count(), 1);

        engine.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_health_reports_state() {
        let (engine, _store) = engine_with(Arc::new(MockPlatform::new("blog")));
        engine.start().await.unwrap();
        assert!(engine.start().await.is_err());

        engine.set_maintenance_mode(true);
        let health = engine.system_health().await;
        assert_eq!(health.engine_state, EngineState::Maintenance);
        assert_eq!(health.platforms.len(), 1);
        assert_eq!(health.open_alerts, 0);

        engine.set_maintenance_mode(false);
        assert_eq!(engine.state(), EngineState::Running);

        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }
}
