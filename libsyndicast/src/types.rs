//! Core types for Syndicast

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Default number of publish attempts per task
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Content handed to a platform adapter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub media: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A unit of delivery work: one payload for one platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicationTask {
    pub id: String,
    pub payload: TaskPayload,
    pub platform: String,
    pub scheduled_at: Option<i64>,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub platform_post_id: Option<String>,
    pub platform_url: Option<String>,
    pub priority: Priority,
    /// When the next deferred execution is due (persisted for recovery)
    pub next_attempt_at: Option<i64>,
    pub posted_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PublicationTask {
    pub fn new(platform: impl Into<String>, payload: TaskPayload) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
            platform: platform.into(),
            scheduled_at: None,
            status: TaskStatus::Scheduled,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            last_error: None,
            platform_post_id: None,
            platform_url: None,
            priority: Priority::Normal,
            next_attempt_at: None,
            posted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Task lifecycle state
///
/// `Scheduled` is initial; `Posted`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Scheduled,
    Executing,
    Retrying,
    Posted,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Posted | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// States from which a task may be cancelled or executed
    pub fn is_pending(self) -> bool {
        matches!(self, TaskStatus::Scheduled | TaskStatus::Retrying)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Executing => "executing",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Posted => "posted",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(TaskStatus::Scheduled),
            "executing" => Ok(TaskStatus::Executing),
            "retrying" => Ok(TaskStatus::Retrying),
            "posted" => Ok(TaskStatus::Posted),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Advisory priority; it does not reorder execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "urgent" => Ok(Priority::Urgent),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

// ============================================================================
// Platform health
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
        }
    }
}

impl FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(HealthStatus::Healthy),
            "degraded" => Ok(HealthStatus::Degraded),
            "critical" => Ok(HealthStatus::Critical),
            other => Err(format!("unknown health status '{}'", other)),
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    Valid,
    Expired,
    Invalid,
}

impl AuthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthStatus::Valid => "valid",
            AuthStatus::Expired => "expired",
            AuthStatus::Invalid => "invalid",
        }
    }
}

impl FromStr for AuthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "valid" => Ok(AuthStatus::Valid),
            "expired" => Ok(AuthStatus::Expired),
            "invalid" => Ok(AuthStatus::Invalid),
            other => Err(format!("unknown auth status '{}'", other)),
        }
    }
}

/// Rate-limit window reported by a platform
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub remaining: Option<u32>,
    /// Unix timestamp at which the window resets
    pub reset_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformHealthRecord {
    pub platform: String,
    pub status: HealthStatus,
    pub last_checked: Option<i64>,
    pub last_success: Option<i64>,
    pub consecutive_errors: u32,
    pub auth_status: AuthStatus,
    pub rate_limit_remaining: Option<u32>,
    pub rate_limit_reset: Option<i64>,
}

impl PlatformHealthRecord {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            status: HealthStatus::Healthy,
            last_checked: None,
            last_success: None,
            consecutive_errors: 0,
            auth_status: AuthStatus::Valid,
            rate_limit_remaining: None,
            rate_limit_reset: None,
        }
    }

    pub fn apply_rate_limit(&mut self, info: &RateLimitInfo) {
        if info.remaining.is_some() {
            self.rate_limit_remaining = info.remaining;
        }
        if info.reset_at.is_some() {
            self.rate_limit_reset = info.reset_at;
        }
    }
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertCategory {
    Error,
    Warning,
    Info,
    Success,
}

impl AlertCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertCategory::Error => "error",
            AlertCategory::Warning => "warning",
            AlertCategory::Info => "info",
            AlertCategory::Success => "success",
        }
    }
}

impl FromStr for AlertCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "error" => Ok(AlertCategory::Error),
            "warning" => Ok(AlertCategory::Warning),
            "info" => Ok(AlertCategory::Info),
            "success" => Ok(AlertCategory::Success),
            other => Err(format!("unknown alert category '{}'", other)),
        }
    }
}

/// Alert severity, ordered from `Low` to `Critical`
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub category: AlertCategory,
    pub severity: Severity,
    pub message: String,
    pub detail: Option<String>,
    pub created_at: i64,
    pub platform: Option<String>,
    pub task_id: Option<String>,
    pub resolved: bool,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<i64>,
}

/// Fields a component supplies when raising an alert
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub category: AlertCategory,
    pub severity: Severity,
    pub message: String,
    pub detail: Option<String>,
    pub platform: Option<String>,
    pub task_id: Option<String>,
}

impl NewAlert {
    pub fn new(category: AlertCategory, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            category,
            severity,
            message: message.into(),
            detail: None,
            platform: None,
            task_id: None,
        }
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

// ============================================================================
// Adapter results and analytics
// ============================================================================

/// What a platform hands back after accepting a publication
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub platform_post_id: String,
    pub url: Option<String>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitInfo>,
}

/// Result of a credential probe
#[derive(Debug, Clone, PartialEq)]
pub struct AuthCheck {
    pub status: AuthStatus,
    pub rate_limit: Option<RateLimitInfo>,
}

impl AuthCheck {
    pub fn valid() -> Self {
        Self {
            status: AuthStatus::Valid,
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default)]
    pub views: u64,
    #[serde(default)]
    pub clicks: u64,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub shares: u64,
    #[serde(default)]
    pub comments: u64,
}

impl Metrics {
    pub fn interactions(&self) -> u64 {
        self.likes + self.shares + self.comments + self.clicks
    }
}

/// View counts bucketed by elapsed time since publish
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trends {
    pub hourly: Vec<u64>,
    pub daily: Vec<u64>,
    pub weekly: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSample {
    pub task_id: String,
    pub platform: String,
    /// Offset after publish that produced this sample
    pub offset_secs: i64,
    pub metrics: Metrics,
    pub engagement_score: f64,
    pub growth_rate: f64,
    pub sampled_at: i64,
    pub trends: Trends,
}
