//! Alert creation, routing and resolution
//!
//! Every alert is persisted first, then kept in live memory for dashboards,
//! published on the event bus and handed to each notification channel whose
//! minimum severity it meets. Channel sends run as detached tasks: a slow or
//! failing webhook never holds up the component that raised the alert.

pub mod channels;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::AlertsConfig;
use crate::error::{Result, SyndicastError};
use crate::events::{Event, EventBus};
use crate::store::Store;
use crate::types::{Alert, AlertCategory, NewAlert, Severity};
pub use channels::{ChannelConfig, NotificationChannel};

pub struct AlertService {
    store: Arc<dyn Store>,
    events: EventBus,
    settings: AlertsConfig,
    live: Mutex<HashMap<String, Alert>>,
    channels: RwLock<Vec<Arc<dyn NotificationChannel>>>,
    pressure_raised: AtomicBool,
}

impl AlertService {
    pub fn new(store: Arc<dyn Store>, events: EventBus, settings: AlertsConfig) -> Self {
        Self {
            store,
            events,
            settings,
            live: Mutex::new(HashMap::new()),
            channels: RwLock::new(Vec::new()),
            pressure_raised: AtomicBool::new(false),
        }
    }

    /// Reload unresolved alerts from the store after a restart
    pub async fn load(&self) -> Result<usize> {
        let open = self.store.list_alerts(true).await?;
        let mut live = self.live.lock().await;
        let count = open.len();
        for alert in open {
            live.insert(alert.id.clone(), alert);
        }
        Ok(count)
    }

    pub async fn create_alert(&self, new: NewAlert) -> Result<Alert> {
        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            category: new.category,
            severity: new.severity,
            message: new.message,
            detail: new.detail,
            created_at: chrono::Utc::now().timestamp(),
            platform: new.platform,
            task_id: new.task_id,
            resolved: false,
            resolved_by: None,
            resolved_at: None,
        };

        self.store.insert_alert(&alert).await?;
        self.live
            .lock()
            .await
            .insert(alert.id.clone(), alert.clone());

        tracing::debug!(
            alert_id = %alert.id,
            category = alert.category.as_str(),
            severity = %alert.severity,
            "Alert raised: {}",
            alert.message
        );

        self.events.emit(Event::AlertRaised {
            alert: alert.clone(),
        });
        self.route(&alert);

        Ok(alert)
    }

    /// Fan out to matching channels without waiting for delivery
    fn route(&self, alert: &Alert) {
        let channels: Vec<Arc<dyn NotificationChannel>> = self
            .channels
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|channel| channel.accepts(alert))
            .cloned()
            .collect();

        for channel in channels {
            let alert = alert.clone();
            tokio::spawn(async move {
                if let Err(e) = channel.send(&alert).await {
                    tracing::warn!(
                        alert_id = %alert.id,
                        channel = channel.channel_type(),
                        "Notification failed: {}",
                        e
                    );
                }
            });
        }
    }

    /// Mark an alert resolved; resolving twice keeps the first resolver
    pub async fn resolve_alert(&self, id: &str, resolved_by: &str) -> Result<Alert> {
        let mut live = self.live.lock().await;

        let mut alert = match live.get(id) {
            Some(alert) => alert.clone(),
            None => self
                .store
                .get_alert(id)
                .await?
                .ok_or_else(|| SyndicastError::NotFound(format!("alert {}", id)))?,
        };

        if alert.resolved {
            return Ok(alert);
        }

        alert.resolved = true;
        alert.resolved_by = Some(resolved_by.to_string());
        alert.resolved_at = Some(chrono::Utc::now().timestamp());

        self.store.update_alert(&alert).await?;
        live.insert(alert.id.clone(), alert.clone());

        self.events.emit(Event::AlertResolved {
            alert_id: alert.id.clone(),
            resolved_by: resolved_by.to_string(),
        });

        Ok(alert)
    }

    /// Unresolved alerts, newest first
    pub async fn open_alerts(&self) -> Vec<Alert> {
        let live = self.live.lock().await;
        let mut open: Vec<Alert> = live.values().filter(|a| !a.resolved).cloned().collect();
        open.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        open
    }

    pub async fn live_count(&self) -> usize {
        self.live.lock().await.len()
    }

    /// Drop resolved alerts older than the retention window from memory
    pub async fn sweep(&self, now: i64) -> usize {
        let retention = i64::try_from(self.settings.retention.as_secs()).unwrap_or(i64::MAX);
        let mut live = self.live.lock().await;
        let before = live.len();
        live.retain(|_, alert| !(alert.resolved && now.saturating_sub(alert.created_at) >= retention));
        let removed = before - live.len();

        if removed > 0 {
            tracing::debug!(removed, "Swept resolved alerts");
        }
        removed
    }

    /// Raise one warning when pending work crosses the configured threshold
    ///
    /// Edge-triggered: no further alert until the depth has dropped below
    /// the threshold again.
    pub async fn check_queue_pressure(&self, pending: usize) -> Result<Option<Alert>> {
        let threshold = self.settings.queue_depth_warning;
        if threshold == 0 {
            return Ok(None);
        }

        if pending < threshold {
            self.pressure_raised.store(false, Ordering::SeqCst);
            return Ok(None);
        }

        if self.pressure_raised.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }

        let alert = self
            .create_alert(
                NewAlert::new(
                    AlertCategory::Warning,
                    Severity::Medium,
                    format!("{} timers pending, threshold is {}", pending, threshold),
                )
                .detail("Scheduled work is accumulating faster than it completes"),
            )
            .await?;
        Ok(Some(alert))
    }

    /// Replace all channels from configuration
    ///
    /// Nothing changes when any entry fails to build.
    pub fn update_notification_config(&self, configs: &[ChannelConfig]) -> Result<()> {
        let built = configs
            .iter()
            .map(ChannelConfig::build)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        tracing::info!(channels = built.len(), "Notification channels updated");
        self.set_channels(built);
        Ok(())
    }

    /// Replace all channels with custom implementations
    pub fn set_channels(&self, channels: Vec<Arc<dyn NotificationChannel>>) {
        *self
            .channels
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = channels;
    }

    pub fn channel_count(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}
