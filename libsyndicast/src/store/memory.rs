//! In-process [`Store`] backed by hash maps

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::Store;
use crate::error::{Result, SyndicastError};
use crate::types::{Alert, AnalyticsSample, PlatformHealthRecord, PublicationTask, TaskStatus};

#[derive(Default)]
struct Tables {
    tasks: HashMap<String, PublicationTask>,
    health: HashMap<String, PlatformHealthRecord>,
    alerts: HashMap<String, Alert>,
    samples: Vec<AnalyticsSample>,
}

/// Store used by tests and dry runs; contents vanish with the process
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_task(&self, task: &PublicationTask) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.tasks.contains_key(&task.id) {
            return Err(SyndicastError::InvalidInput(format!(
                "task {} already exists",
                task.id
            )));
        }
        tables.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn update_task(&self, task: &PublicationTask) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.tasks.get_mut(&task.id) {
            Some(stored) => {
                *stored = task.clone();
                Ok(())
            }
            None => Err(SyndicastError::NotFound(format!("task {}", task.id))),
        }
    }

    async fn get_task(&self, id: &str) -> Result<Option<PublicationTask>> {
        Ok(self.tables.read().await.tasks.get(id).cloned())
    }

    async fn tasks_with_status(&self, statuses: &[TaskStatus]) -> Result<Vec<PublicationTask>> {
        let tables = self.tables.read().await;
        let mut tasks: Vec<PublicationTask> = tables
            .tasks
            .values()
            .filter(|task| statuses.contains(&task.status))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn posted_since(&self, since: i64) -> Result<Vec<PublicationTask>> {
        let tables = self.tables.read().await;
        let mut tasks: Vec<PublicationTask> = tables
            .tasks
            .values()
            .filter(|task| {
                task.status == TaskStatus::Posted && task.posted_at.is_some_and(|at| at >= since)
            })
            .cloned()
            .collect();
        tasks.sort_by_key(|task| task.posted_at);
        Ok(tasks)
    }

    async fn upsert_health(&self, record: &PlatformHealthRecord) -> Result<()> {
        self.tables
            .write()
            .await
            .health
            .insert(record.platform.clone(), record.clone());
        Ok(())
    }

    async fn get_health(&self, platform: &str) -> Result<Option<PlatformHealthRecord>> {
        Ok(self.tables.read().await.health.get(platform).cloned())
    }

    async fn list_health(&self) -> Result<Vec<PlatformHealthRecord>> {
        let tables = self.tables.read().await;
        let mut records: Vec<PlatformHealthRecord> = tables.health.values().cloned().collect();
        records.sort_by(|a, b| a.platform.cmp(&b.platform));
        Ok(records)
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<()> {
        self.tables
            .write()
            .await
            .alerts
            .insert(alert.id.clone(), alert.clone());
        Ok(())
    }

    async fn update_alert(&self, alert: &Alert) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.alerts.get_mut(&alert.id) {
            Some(stored) => {
                *stored = alert.clone();
                Ok(())
            }
            None => Err(SyndicastError::NotFound(format!("alert {}", alert.id))),
        }
    }

    async fn get_alert(&self, id: &str) -> Result<Option<Alert>> {
        Ok(self.tables.read().await.alerts.get(id).cloned())
    }

    async fn list_alerts(&self, unresolved_only: bool) -> Result<Vec<Alert>> {
        let tables = self.tables.read().await;
        let mut alerts: Vec<Alert> = tables
            .alerts
            .values()
            .filter(|alert| !unresolved_only || !alert.resolved)
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(alerts)
    }

    async fn insert_sample(&self, sample: &AnalyticsSample) -> Result<()> {
        self.tables.write().await.samples.push(sample.clone());
        Ok(())
    }

    async fn samples_for_task(&self, task_id: &str) -> Result<Vec<AnalyticsSample>> {
        let tables = self.tables.read().await;
        let mut samples: Vec<AnalyticsSample> = tables
            .samples
            .iter()
            .filter(|sample| sample.task_id == task_id)
            .cloned()
            .collect();
        samples.sort_by_key(|sample| (sample.offset_secs, sample.sampled_at));
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertCategory, Metrics, Severity, TaskPayload, Trends};

    fn task(platform: &str) -> PublicationTask {
        PublicationTask::new(
            platform,
            TaskPayload {
                title: "Hello".to_string(),
                body: "World".to_string(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_task_insert_update_get() {
        let store = MemoryStore::new();
        let mut task = task("blog");
        store.insert_task(&task).await.unwrap();
        assert!(store.insert_task(&task).await.is_err());

        task.status = TaskStatus::Retrying;
        task.attempts = 1;
        store.update_task(&task).await.unwrap();

        let loaded = store.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Retrying);
        assert_eq!(loaded.attempts, 1);
        assert!(store.get_task("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_unknown_task_is_not_found() {
        let store = MemoryStore::new();
        let result = store.update_task(&task("blog")).await;
        assert!(matches!(result, Err(SyndicastError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_tasks_with_status_filters() {
        let store = MemoryStore::new();
        let scheduled = task("blog");
        let mut retrying = task("blog");
        retrying.status = TaskStatus::Retrying;
        let mut posted = task("blog");
        posted.status = TaskStatus::Posted;
        posted.posted_at = Some(1_000);

        for t in [&scheduled, &retrying, &posted] {
            store.insert_task(t).await.unwrap();
        }

        let pending = store
            .tasks_with_status(&[TaskStatus::Scheduled, TaskStatus::Retrying])
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|t| t.status.is_pending()));

        assert_eq!(store.posted_since(999).await.unwrap().len(), 1);
        assert!(store.posted_since(1_001).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_alerts_listing() {
        let store = MemoryStore::new();
        let mut alert = Alert {
            id: "a1".to_string(),
            category: AlertCategory::Error,
            severity: Severity::High,
            message: "down".to_string(),
            detail: None,
            created_at: 10,
            platform: Some("blog".to_string()),
            task_id: None,
            resolved: false,
            resolved_by: None,
            resolved_at: None,
        };
        store.insert_alert(&alert).await.unwrap();
        assert_eq!(store.list_alerts(true).await.unwrap().len(), 1);

        alert.resolved = true;
        store.update_alert(&alert).await.unwrap();
        assert!(store.list_alerts(true).await.unwrap().is_empty());
        assert_eq!(store.list_alerts(false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_samples_ordered_by_offset() {
        let store = MemoryStore::new();
        for offset in [21_600, 3_600] {
            store
                .insert_sample(&AnalyticsSample {
                    task_id: "t1".to_string(),
                    platform: "blog".to_string(),
                    offset_secs: offset,
                    metrics: Metrics::default(),
                    engagement_score: 0.0,
                    growth_rate: 0.0,
                    sampled_at: offset,
                    trends: Trends::default(),
                })
                .await
                .unwrap();
        }

        let samples = store.samples_for_task("t1").await.unwrap();
        assert_eq!(
            samples.iter().map(|s| s.offset_secs).collect::<Vec<_>>(),
            vec![3_600, 21_600]
        );
        assert!(store.samples_for_task("t2").await.unwrap().is_empty());
    }
}
