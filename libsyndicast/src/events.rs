//! In-process event bus for engine observers
//!
//! The bus wraps `tokio::sync::broadcast`. Emitting never blocks: with no
//! subscribers the event is dropped, and a lagging subscriber loses the
//! oldest events instead of slowing the engine down.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::{Alert, AnalyticsSample, HealthStatus, TaskStatus};

pub type EventReceiver = broadcast::Receiver<Event>;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    TaskSubmitted {
        task_id: String,
        platform: String,
    },

    TaskStatusChanged {
        task_id: String,
        platform: String,
        from: TaskStatus,
        to: TaskStatus,
        /// Present on Retrying and Failed transitions
        error: Option<String>,
    },

    AlertRaised {
        alert: Alert,
    },

    AlertResolved {
        alert_id: String,
        resolved_by: String,
    },

    HealthChanged {
        platform: String,
        from: HealthStatus,
        to: HealthStatus,
    },

    SampleRecorded {
        sample: AnalyticsSample,
    },
}

impl Event {
    /// Task id carried by task-scoped events
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Event::TaskSubmitted { task_id, .. } | Event::TaskStatusChanged { task_id, .. } => {
                Some(task_id)
            }
            Event::SampleRecorded { sample } => Some(&sample.task_id),
            Event::AlertRaised { alert } => alert.task_id.as_deref(),
            Event::AlertResolved { .. } | Event::HealthChanged { .. } => None,
        }
    }
}
