//! SQLite persistence for Syndicast

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

use crate::error::{DbError, Result, SyndicastError};
use crate::store::Store;
use crate::types::{
    Alert, AnalyticsSample, Metrics, PlatformHealthRecord, PublicationTask, TaskPayload,
    TaskStatus, Trends,
};

const TASK_COLUMNS: &str = "id, platform, title, body, media, tags, scheduled_at, status, \
    attempts, max_attempts, last_error, platform_post_id, platform_url, priority, \
    next_attempt_at, posted_at, created_at, updated_at";

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database file and run pending migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // mode=rwc creates the file on first use
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));
        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, running migrations on it
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn corrupt(table: &'static str, reason: impl std::fmt::Display) -> SyndicastError {
    DbError::Corrupt {
        table,
        reason: reason.to_string(),
    }
    .into()
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(name).map_err(|e| DbError::SqlxError(e).into())
}

fn parse_enum<T: FromStr<Err = String>>(table: &'static str, raw: &str) -> Result<T> {
    raw.parse::<T>().map_err(|e| corrupt(table, e))
}

fn to_json<T: serde::Serialize>(table: &'static str, value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| corrupt(table, e))
}

fn from_json<T: serde::de::DeserializeOwned>(table: &'static str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| corrupt(table, e))
}

fn u32_column(row: &SqliteRow, name: &str) -> Result<u32> {
    let value: i64 = column(row, name)?;
    u32::try_from(value).map_err(|_| corrupt("tasks", format!("{} out of range: {}", name, value)))
}

fn u64_column(row: &SqliteRow, name: &str) -> Result<u64> {
    let value: i64 = column(row, name)?;
    u64::try_from(value)
        .map_err(|_| corrupt("analytics_samples", format!("{} is negative: {}", name, value)))
}

fn decode_task(row: &SqliteRow) -> Result<PublicationTask> {
    let media: String = column(row, "media")?;
    let tags: String = column(row, "tags")?;
    let status: String = column(row, "status")?;
    let priority: String = column(row, "priority")?;

    Ok(PublicationTask {
        id: column(row, "id")?,
        payload: TaskPayload {
            title: column(row, "title")?,
            body: column(row, "body")?,
            media: from_json("tasks", &media)?,
            tags: from_json("tasks", &tags)?,
        },
        platform: column(row, "platform")?,
        scheduled_at: column(row, "scheduled_at")?,
        status: parse_enum("tasks", &status)?,
        attempts: u32_column(row, "attempts")?,
        max_attempts: u32_column(row, "max_attempts")?,
        last_error: column(row, "last_error")?,
        platform_post_id: column(row, "platform_post_id")?,
        platform_url: column(row, "platform_url")?,
        priority: parse_enum("tasks", &priority)?,
        next_attempt_at: column(row, "next_attempt_at")?,
        posted_at: column(row, "posted_at")?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}

fn decode_health(row: &SqliteRow) -> Result<PlatformHealthRecord> {
    let status: String = column(row, "status")?;
    let auth_status: String = column(row, "auth_status")?;
    let remaining: Option<i64> = column(row, "rate_limit_remaining")?;

    Ok(PlatformHealthRecord {
        platform: column(row, "platform")?,
        status: parse_enum("platform_health", &status)?,
        last_checked: column(row, "last_checked")?,
        last_success: column(row, "last_success")?,
        consecutive_errors: u32_column(row, "consecutive_errors")?,
        auth_status: parse_enum("platform_health", &auth_status)?,
        rate_limit_remaining: remaining.and_then(|v| u32::try_from(v).ok()),
        rate_limit_reset: column(row, "rate_limit_reset")?,
    })
}

fn decode_alert(row: &SqliteRow) -> Result<Alert> {
    let category: String = column(row, "category")?;
    let severity: String = column(row, "severity")?;

    Ok(Alert {
        id: column(row, "id")?,
        category: parse_enum("alerts", &category)?,
        severity: parse_enum("alerts", &severity)?,
        message: column(row, "message")?,
        detail: column(row, "detail")?,
        created_at: column(row, "created_at")?,
        platform: column(row, "platform")?,
        task_id: column(row, "task_id")?,
        resolved: column(row, "resolved")?,
        resolved_by: column(row, "resolved_by")?,
        resolved_at: column(row, "resolved_at")?,
    })
}

fn decode_sample(row: &SqliteRow) -> Result<AnalyticsSample> {
    let trends: String = column(row, "trends")?;

    Ok(AnalyticsSample {
        task_id: column(row, "task_id")?,
        platform: column(row, "platform")?,
        offset_secs: column(row, "offset_secs")?,
        metrics: Metrics {
            views: u64_column(row, "views")?,
            clicks: u64_column(row, "clicks")?,
            likes: u64_column(row, "likes")?,
            shares: u64_column(row, "shares")?,
            comments: u64_column(row, "comments")?,
        },
        engagement_score: column(row, "engagement_score")?,
        growth_rate: column(row, "growth_rate")?,
        sampled_at: column(row, "sampled_at")?,
        trends: from_json::<Trends>("analytics_samples", &trends)?,
    })
}

#[async_trait]
impl Store for Database {
    async fn insert_task(&self, task: &PublicationTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, platform, title, body, media, tags, scheduled_at, status,
                attempts, max_attempts, last_error, platform_post_id, platform_url, priority,
                next_attempt_at, posted_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.platform)
        .bind(&task.payload.title)
        .bind(&task.payload.body)
        .bind(to_json("tasks", &task.payload.media)?)
        .bind(to_json("tasks", &task.payload.tags)?)
        .bind(task.scheduled_at)
        .bind(task.status.as_str())
        .bind(i64::from(task.attempts))
        .bind(i64::from(task.max_attempts))
        .bind(&task.last_error)
        .bind(&task.platform_post_id)
        .bind(&task.platform_url)
        .bind(task.priority.as_str())
        .bind(task.next_attempt_at)
        .bind(task.posted_at)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn update_task(&self, task: &PublicationTask) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET status = ?, attempts = ?, max_attempts = ?, last_error = ?,
                platform_post_id = ?, platform_url = ?, priority = ?, scheduled_at = ?,
                next_attempt_at = ?, posted_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(task.status.as_str())
        .bind(i64::from(task.attempts))
        .bind(i64::from(task.max_attempts))
        .bind(&task.last_error)
        .bind(&task.platform_post_id)
        .bind(&task.platform_url)
        .bind(task.priority.as_str())
        .bind(task.scheduled_at)
        .bind(task.next_attempt_at)
        .bind(task.posted_at)
        .bind(task.updated_at)
        .bind(&task.id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Err(SyndicastError::NotFound(format!("task {}", task.id)));
        }
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<PublicationTask>> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(decode_task).transpose()
    }

    async fn tasks_with_status(&self, statuses: &[TaskStatus]) -> Result<Vec<PublicationTask>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM tasks WHERE status IN ({}) ORDER BY created_at ASC, id ASC",
            TASK_COLUMNS, placeholders
        );

        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(decode_task).collect()
    }

    async fn posted_since(&self, since: i64) -> Result<Vec<PublicationTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks WHERE status = 'posted' AND posted_at >= ? ORDER BY posted_at ASC",
            TASK_COLUMNS
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(decode_task).collect()
    }

    async fn upsert_health(&self, record: &PlatformHealthRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO platform_health (platform, status, last_checked, last_success,
                consecutive_errors, auth_status, rate_limit_remaining, rate_limit_reset)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(platform) DO UPDATE SET
                status = excluded.status,
                last_checked = excluded.last_checked,
                last_success = excluded.last_success,
                consecutive_errors = excluded.consecutive_errors,
                auth_status = excluded.auth_status,
                rate_limit_remaining = excluded.rate_limit_remaining,
                rate_limit_reset = excluded.rate_limit_reset
            "#,
        )
        .bind(&record.platform)
        .bind(record.status.as_str())
        .bind(record.last_checked)
        .bind(record.last_success)
        .bind(i64::from(record.consecutive_errors))
        .bind(record.auth_status.as_str())
        .bind(record.rate_limit_remaining.map(i64::from))
        .bind(record.rate_limit_reset)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn get_health(&self, platform: &str) -> Result<Option<PlatformHealthRecord>> {
        let row = sqlx::query("SELECT * FROM platform_health WHERE platform = ?")
            .bind(platform)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(decode_health).transpose()
    }

    async fn list_health(&self) -> Result<Vec<PlatformHealthRecord>> {
        let rows = sqlx::query("SELECT * FROM platform_health ORDER BY platform")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(decode_health).collect()
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alerts (id, category, severity, message, detail, created_at, platform,
                task_id, resolved, resolved_by, resolved_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&alert.id)
        .bind(alert.category.as_str())
        .bind(alert.severity.as_str())
        .bind(&alert.message)
        .bind(&alert.detail)
        .bind(alert.created_at)
        .bind(&alert.platform)
        .bind(&alert.task_id)
        .bind(alert.resolved)
        .bind(&alert.resolved_by)
        .bind(alert.resolved_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn update_alert(&self, alert: &Alert) -> Result<()> {
        let result = sqlx::query(
            "UPDATE alerts SET resolved = ?, resolved_by = ?, resolved_at = ? WHERE id = ?",
        )
        .bind(alert.resolved)
        .bind(&alert.resolved_by)
        .bind(alert.resolved_at)
        .bind(&alert.id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Err(SyndicastError::NotFound(format!("alert {}", alert.id)));
        }
        Ok(())
    }

    async fn get_alert(&self, id: &str) -> Result<Option<Alert>> {
        let row = sqlx::query("SELECT * FROM alerts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(decode_alert).transpose()
    }

    async fn list_alerts(&self, unresolved_only: bool) -> Result<Vec<Alert>> {
        let sql = if unresolved_only {
            "SELECT * FROM alerts WHERE resolved = 0 ORDER BY created_at DESC, id ASC"
        } else {
            "SELECT * FROM alerts ORDER BY created_at DESC, id ASC"
        };

        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        rows.iter().map(decode_alert).collect()
    }

    async fn insert_sample(&self, sample: &AnalyticsSample) -> Result<()> {
        let metrics = &sample.metrics;
        let as_i64 = |value: u64| i64::try_from(value).unwrap_or(i64::MAX);

        sqlx::query(
            r#"
            INSERT INTO analytics_samples (task_id, platform, offset_secs, views, clicks, likes,
                shares, comments, engagement_score, growth_rate, sampled_at, trends)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&sample.task_id)
        .bind(&sample.platform)
        .bind(sample.offset_secs)
        .bind(as_i64(metrics.views))
        .bind(as_i64(metrics.clicks))
        .bind(as_i64(metrics.likes))
        .bind(as_i64(metrics.shares))
        .bind(as_i64(metrics.comments))
        .bind(sample.engagement_score)
        .bind(sample.growth_rate)
        .bind(sample.sampled_at)
        .bind(to_json("analytics_samples", &sample.trends)?)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    async fn samples_for_task(&self, task_id: &str) -> Result<Vec<AnalyticsSample>> {
        let rows = sqlx::query(
            "SELECT * FROM analytics_samples WHERE task_id = ? ORDER BY offset_secs ASC, sampled_at ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(decode_sample).collect()
    }
}
