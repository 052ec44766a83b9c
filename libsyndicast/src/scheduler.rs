//! Deferred work: retry backoff and the keyed timer set
//!
//! Timers are plain tokio tasks sleeping until their due time. Nothing here
//! is durable; callers persist the intended due time (`next_attempt_at`)
//! before arming so that recovery can re-arm after a restart.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{ConfigError, Result};

/// Retry delays indexed by attempt number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffSchedule {
    delays: Vec<Duration>,
}

impl BackoffSchedule {
    pub fn new(delays: Vec<Duration>) -> Result<Self> {
        if delays.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "engine.backoff_schedule".to_string(),
                reason: "must not be empty".to_string(),
            }
            .into());
        }
        Ok(Self { delays })
    }

    /// Delay after the `attempt`-th failed attempt (1-based)
    ///
    /// Attempts past the end of the table reuse the last entry.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.delays[index.min(self.delays.len() - 1)]
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            delays: crate::config::EngineConfig::default().backoff_schedule,
        }
    }
}

/// Time left until `due` (unix seconds), zero when already overdue
pub fn delay_until(due: i64, now: i64) -> Duration {
    Duration::from_secs(u64::try_from(due.saturating_sub(now)).unwrap_or(0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerKind {
    Publish,
    Analytics,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Next execution of a task
    Publish(String),
    /// One analytics sample of a posted task
    Analytics { task_id: String, offset_secs: i64 },
}

impl TimerKey {
    pub fn publish(task_id: impl Into<String>) -> Self {
        TimerKey::Publish(task_id.into())
    }

    pub fn analytics(task_id: impl Into<String>, offset_secs: i64) -> Self {
        TimerKey::Analytics {
            task_id: task_id.into(),
            offset_secs,
        }
    }

    pub fn kind(&self) -> TimerKind {
        match self {
            TimerKey::Publish(_) => TimerKind::Publish,
            TimerKey::Analytics { .. } => TimerKind::Analytics,
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            TimerKey::Publish(task_id) | TimerKey::Analytics { task_id, .. } => task_id,
        }
    }
}

/// Pending timer counts by kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    pub publish: usize,
    pub analytics: usize,
}

impl QueueDepths {
    pub fn total(&self) -> usize {
        self.publish + self.analytics
    }
}

struct TimerEntry {
    handle: JoinHandle<()>,
    generation: u64,
    due: Instant,
}

type TimerMap = HashMap<TimerKey, TimerEntry>;

fn lock(timers: &Mutex<TimerMap>) -> MutexGuard<'_, TimerMap> {
    timers.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keyed set of armed timers
///
/// A timer stays in the set while it sleeps and while the gate is closed;
/// it leaves the set the moment its work starts. At most one timer exists
/// per key: arming an existing key replaces the earlier timer.
pub struct TimerSet {
    timers: Arc<Mutex<TimerMap>>,
    generation: AtomicU64,
    gate: watch::Receiver<bool>,
}

impl TimerSet {
    /// `gate` holds fired timers back while it is `false`
    pub fn new(gate: watch::Receiver<bool>) -> Self {
        Self {
            timers: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            gate,
        }
    }

    /// Run `work` after `delay`, replacing any timer already under `key`
    pub fn arm<F>(&self, key: TimerKey, delay: Duration, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(&self.timers);
        let mut gate = self.gate.clone();
        let own_key = key.clone();

        // Held across spawn so the timer cannot fire before it is registered
        let mut map = lock(&self.timers);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let open = gate.wait_for(|open| *open).await.is_ok();
            if !open {
                return;
            }

            {
                let mut map = lock(&timers);
                match map.get(&own_key) {
                    Some(entry) if entry.generation == generation => {
                        map.remove(&own_key);
                    }
                    // Replaced or cancelled while waiting
                    _ => return,
                }
            }

            work.await;
        });

        let entry = TimerEntry {
            handle,
            generation,
            due: Instant::now() + delay,
        };
        if let Some(previous) = map.insert(key, entry) {
            previous.handle.abort();
        }
    }

    /// Drop the timer under `key`; returns whether one was armed
    pub fn cancel(&self, key: &TimerKey) -> bool {
        match lock(&self.timers).remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Drop every timer belonging to `task_id`
    pub fn cancel_task(&self, task_id: &str) -> usize {
        let mut map = lock(&self.timers);
        let keys: Vec<TimerKey> = map
            .keys()
            .filter(|key| key.task_id() == task_id)
            .cloned()
            .collect();

        for key in &keys {
            if let Some(entry) = map.remove(key) {
                entry.handle.abort();
            }
        }
        keys.len()
    }

    pub fn cancel_all(&self) -> usize {
        let mut map = lock(&self.timers);
        let count = map.len();
        for (_, entry) in map.drain() {
            entry.handle.abort();
        }
        count
    }

    pub fn is_armed(&self, key: &TimerKey) -> bool {
        lock(&self.timers).contains_key(key)
    }

    /// Time left until the timer under `key` fires
    pub fn remaining(&self, key: &TimerKey) -> Option<Duration> {
        lock(&self.timers)
            .get(key)
            .map(|entry| entry.due.saturating_duration_since(Instant::now()))
    }

    pub fn depths(&self) -> QueueDepths {
        let map = lock(&self.timers);
        let mut depths = QueueDepths::default();
        for key in map.keys() {
            match key.kind() {
                TimerKind::Publish => depths.publish += 1,
                TimerKind::Analytics => depths.analytics += 1,
            }
        }
        depths
    }

    pub fn len(&self) -> usize {
        lock(&self.timers).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.timers).is_empty()
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_secs).collect()
    }

    #[test]
    fn test_delay_for_attempt_follows_table() {
        let schedule = BackoffSchedule::default();
        let expected = [60, 300, 900, 3600, 14400, 14400, 14400];
        for (index, secs) in expected.iter().enumerate() {
            let attempt = index as u32 + 1;
            assert_eq!(
                schedule.delay_for_attempt(attempt),
                Duration::from_secs(*secs),
                "attempt {}",
                attempt
            );
        }
        // Attempt 0 is treated like the first attempt
        assert_eq!(schedule.delay_for_attempt(0), Duration::from_secs(60));
    }

    #[test]
    fn test_single_entry_schedule() {
        let schedule = BackoffSchedule::new(secs(&[30])).unwrap();
        assert_eq!(schedule.delay_for_attempt(1), Duration::from_secs(30));
        assert_eq!(schedule.delay_for_attempt(9), Duration::from_secs(30));
        assert!(BackoffSchedule::new(vec![]).is_err());
    }

    #[test]
    fn test_delay_until() {
        assert_eq!(delay_until(1_100, 1_000), Duration::from_secs(100));
        assert_eq!(delay_until(900, 1_000), Duration::ZERO);
    }

    fn counter_work(counter: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let counter = Arc::clone(counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay_and_leaves_set() {
        let (_gate_tx, gate) = watch::channel(true);
        let timers = TimerSet::new(gate);
        let fired = Arc::new(AtomicUsize::new(0));

        let key = TimerKey::publish("t1");
        timers.arm(key.clone(), Duration::from_secs(60), counter_work(&fired));
        assert!(timers.is_armed(&key));
        assert_eq!(timers.remaining(&key), Some(Duration::from_secs(60)));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.is_armed(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_previous_timer() {
        let (_gate_tx, gate) = watch::channel(true);
        let timers = TimerSet::new(gate);
        let fired = Arc::new(AtomicUsize::new(0));

        let key = TimerKey::publish("t1");
        timers.arm(key.clone(), Duration::from_secs(10), counter_work(&fired));
        timers.arm(key.clone(), Duration::from_secs(20), counter_work(&fired));
        assert_eq!(timers.len(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_work() {
        let (_gate_tx, gate) = watch::channel(true);
        let timers = TimerSet::new(gate);
        let fired = Arc::new(AtomicUsize::new(0));

        let key = TimerKey::publish("t1");
        timers.arm(key.clone(), Duration::from_secs(10), counter_work(&fired));
        assert!(timers.cancel(&key));
        assert!(!timers.cancel(&key));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_gate_holds_fired_timers() {
        let (gate_tx, gate) = watch::channel(false);
        let timers = TimerSet::new(gate);
        let fired = Arc::new(AtomicUsize::new(0));

        let key = TimerKey::publish("t1");
        timers.arm(key.clone(), Duration::ZERO, counter_work(&fired));

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(timers.is_armed(&key));

        gate_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(timers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_depths_and_cancel_task() {
        let (_gate_tx, gate) = watch::channel(true);
        let timers = TimerSet::new(gate);

        timers.arm(TimerKey::publish("t1"), Duration::from_secs(60), async {});
        timers.arm(TimerKey::publish("t2"), Duration::from_secs(60), async {});
        timers.arm(TimerKey::analytics("t1", 3600), Duration::from_secs(3600), async {});

        assert_eq!(
            timers.depths(),
            QueueDepths {
                publish: 2,
                analytics: 1
            }
        );

        assert_eq!(timers.cancel_task("t1"), 2);
        assert_eq!(timers.depths().total(), 1);
        assert_eq!(timers.cancel_all(), 1);
        assert!(timers.is_empty());
    }
}
