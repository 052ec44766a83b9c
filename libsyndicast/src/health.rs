//! Per-platform health tracking and circuit breaking
//!
//! Each platform has one [`PlatformHealthRecord`] behind its own async mutex.
//! Probes (`check_auth`) and publish outcomes both feed the record; the
//! status is derived from the record after every observation:
//!
//! - `critical` once consecutive errors reach the configured threshold
//! - `degraded` while there are errors or the credentials are not valid
//! - `healthy` otherwise
//!
//! A critical platform has an open circuit: the engine stops calling its
//! adapter until a probe reports valid credentials again.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::alerting::AlertService;
use crate::config::HealthConfig;
use crate::error::{PlatformError, Result, SyndicastError};
use crate::events::{Event, EventBus};
use crate::platforms::PlatformRegistry;
use crate::store::Store;
use crate::types::{
    AlertCategory, AuthCheck, AuthStatus, HealthStatus, NewAlert, PlatformHealthRecord,
    RateLimitInfo, Severity,
};

/// Something learned about a platform
#[derive(Debug, Clone)]
pub enum Observation {
    ProbeSucceeded(AuthCheck),
    ProbeFailed(PlatformError),
    PublishSucceeded(Option<RateLimitInfo>),
    PublishFailed(PlatformError),
}

/// Status implied by a record's counters
pub fn derive_status(record: &PlatformHealthRecord, critical_threshold: u32) -> HealthStatus {
    if record.consecutive_errors >= critical_threshold {
        HealthStatus::Critical
    } else if record.consecutive_errors > 0 || record.auth_status != AuthStatus::Valid {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// Fold one observation into a record
fn apply(record: &mut PlatformHealthRecord, observation: &Observation, now: i64) {
    match observation {
        Observation::ProbeSucceeded(check) => {
            record.last_checked = Some(now);
            record.auth_status = check.status;
            if check.status == AuthStatus::Valid {
                record.consecutive_errors = 0;
            }
            if let Some(info) = &check.rate_limit {
                record.apply_rate_limit(info);
            }
        }
        Observation::ProbeFailed(_) => {
            record.last_checked = Some(now);
            record.consecutive_errors = record.consecutive_errors.saturating_add(1);
        }
        Observation::PublishSucceeded(rate_limit) => {
            record.last_success = Some(now);
            record.consecutive_errors = 0;
            record.auth_status = AuthStatus::Valid;
            if let Some(info) = rate_limit {
                record.apply_rate_limit(info);
            }
        }
        Observation::PublishFailed(error) => match error {
            PlatformError::CredentialsExpired(_) => record.auth_status = AuthStatus::Expired,
            PlatformError::Authentication(_) => record.auth_status = AuthStatus::Invalid,
            PlatformError::RateLimit { retry_after, .. } => {
                // Throttling is not a fault; remember the window instead
                record.rate_limit_remaining = Some(0);
                if let Some(delay) = retry_after {
                    let delay = i64::try_from(delay.as_secs()).unwrap_or(i64::MAX);
                    record.rate_limit_reset = Some(now.saturating_add(delay));
                }
            }
            PlatformError::Network(_) | PlatformError::Timeout(_) | PlatformError::Unavailable(_) => {
                record.consecutive_errors = record.consecutive_errors.saturating_add(1);
            }
            PlatformError::Unsupported(_)
            | PlatformError::Validation(_)
            | PlatformError::Rejected(_) => {}
        },
    }
}

fn transition_alert(platform: &str, record: &PlatformHealthRecord) -> NewAlert {
    let alert = match record.status {
        HealthStatus::Critical => NewAlert::new(
            AlertCategory::Error,
            Severity::High,
            format!("Platform {} is critical", platform),
        )
        .detail(format!(
            "{} consecutive errors; deliveries are paused until it recovers",
            record.consecutive_errors
        )),
        HealthStatus::Degraded => NewAlert::new(
            AlertCategory::Warning,
            Severity::Medium,
            format!("Platform {} is degraded", platform),
        )
        .detail(format!(
            "{} consecutive errors, credentials {}",
            record.consecutive_errors,
            record.auth_status.as_str()
        )),
        HealthStatus::Healthy => NewAlert::new(
            AlertCategory::Success,
            Severity::Low,
            format!("Platform {} is healthy again", platform),
        ),
    };
    alert.platform(platform)
}

pub struct HealthMonitor {
    registry: PlatformRegistry,
    store: Arc<dyn Store>,
    alerts: Arc<AlertService>,
    events: EventBus,
    settings: HealthConfig,
    records: BTreeMap<String, Arc<Mutex<PlatformHealthRecord>>>,
}

impl HealthMonitor {
    pub fn new(
        registry: PlatformRegistry,
        store: Arc<dyn Store>,
        alerts: Arc<AlertService>,
        events: EventBus,
        settings: HealthConfig,
    ) -> Self {
        let records = registry
            .ids()
            .map(|id| (id.to_string(), Arc::new(Mutex::new(PlatformHealthRecord::new(id)))))
            .collect();

        Self {
            registry,
            store,
            alerts,
            events,
            settings,
            records,
        }
    }

    /// Restore persisted records for registered platforms
    pub async fn load(&self) -> Result<()> {
        for (platform, cell) in &self.records {
            if let Some(mut stored) = self.store.get_health(platform).await? {
                stored.status = derive_status(&stored, self.settings.critical_threshold);
                *cell.lock().await = stored;
            }
        }
        Ok(())
    }

    fn cell(&self, platform: &str) -> Result<&Arc<Mutex<PlatformHealthRecord>>> {
        self.records
            .get(platform)
            .ok_or_else(|| SyndicastError::NotFound(format!("platform {}", platform)))
    }

    pub async fn record(&self, platform: &str) -> Option<PlatformHealthRecord> {
        match self.records.get(platform) {
            Some(cell) => Some(cell.lock().await.clone()),
            None => None,
        }
    }

    pub async fn status(&self, platform: &str) -> Option<HealthStatus> {
        self.record(platform).await.map(|record| record.status)
    }

    /// Whether the circuit for `platform` is open
    pub async fn is_critical(&self, platform: &str) -> bool {
        self.status(platform).await == Some(HealthStatus::Critical)
    }

    pub async fn snapshot(&self) -> Vec<PlatformHealthRecord> {
        let mut records = Vec::with_capacity(self.records.len());
        for cell in self.records.values() {
            records.push(cell.lock().await.clone());
        }
        records
    }

    /// Apply an observation, persist the record and alert on a transition
    pub async fn observe(
        &self,
        platform: &str,
        observation: Observation,
    ) -> Result<PlatformHealthRecord> {
        let cell = self.cell(platform)?;
        let mut record = cell.lock().await;

        let before = record.status;
        apply(&mut record, &observation, chrono::Utc::now().timestamp());
        record.status = derive_status(&record, self.settings.critical_threshold);
        let after = record.status;

        self.store.upsert_health(&record).await?;

        if before != after {
            tracing::info!(
                platform,
                from = before.as_str(),
                to = after.as_str(),
                consecutive_errors = record.consecutive_errors,
                "Platform health changed"
            );
            self.events.emit(Event::HealthChanged {
                platform: platform.to_string(),
                from: before,
                to: after,
            });
            self.alerts
                .create_alert(transition_alert(platform, &record))
                .await?;
        }

        Ok(record.clone())
    }

    pub async fn record_publish_success(
        &self,
        platform: &str,
        rate_limit: Option<RateLimitInfo>,
    ) -> Result<PlatformHealthRecord> {
        self.observe(platform, Observation::PublishSucceeded(rate_limit))
            .await
    }

    pub async fn record_publish_failure(
        &self,
        platform: &str,
        error: &PlatformError,
    ) -> Result<PlatformHealthRecord> {
        self.observe(platform, Observation::PublishFailed(error.clone()))
            .await
    }

    /// Probe one platform under the probe timeout
    pub async fn probe(&self, platform: &str) -> Result<PlatformHealthRecord> {
        let adapter = self.registry.get(platform)?;

        let observation =
            match tokio::time::timeout(self.settings.probe_timeout, adapter.check_auth()).await {
                Ok(Ok(check)) => Observation::ProbeSucceeded(check),
                Ok(Err(error)) => Observation::ProbeFailed(error),
                Err(_) => Observation::ProbeFailed(PlatformError::Timeout(self.settings.probe_timeout)),
            };

        if let Observation::ProbeFailed(error) = &observation {
            tracing::debug!(platform, kind = %error.kind(), "Health probe failed: {}", error);
        }

        self.observe(platform, observation).await
    }

    /// Probe every platform concurrently
    pub async fn probe_all(&self) {
        let probes = self.records.keys().map(|platform| async move {
            if let Err(e) = self.probe(platform).await {
                tracing::warn!(platform = %platform, "Health probe bookkeeping failed: {}", e);
            }
        });
        join_all(probes).await;
    }

    /// Probe all platforms now and then on every interval tick
    pub fn spawn_probe_loop(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.settings.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.probe_all().await;
            }
        })
    }
}
