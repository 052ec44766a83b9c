//! Configuration management for Syndicast
//!
//! Configuration is read from a TOML file resolved via `SYNDICAST_CONFIG` or
//! the XDG config directory. Durations are written as human-readable strings
//! (`"30s"`, `"5m"`, `"7d"`). Platform credentials are part of the validated
//! configuration; nothing is looked up from the environment at publish time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::alerting::channels::ChannelConfig;
use crate::error::{ConfigError, Result};
use crate::logging::LogFormat;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformConfig>,
    #[serde(default)]
    pub notifications: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/syndicast/syndicast.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(with = "humantime_serde")]
    pub publish_timeout: Duration,
    pub default_max_attempts: u32,
    #[serde(with = "humantime_serde::vec")]
    pub backoff_schedule: Vec<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(30),
            default_max_attempts: crate::types::DEFAULT_MAX_ATTEMPTS,
            backoff_schedule: [60, 300, 900, 3600, 14400]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Consecutive errors at which a platform turns critical
    pub critical_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            probe_timeout: Duration::from_secs(10),
            critical_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    #[serde(with = "humantime_serde::vec")]
    pub offsets: Vec<Duration>,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Bound on a single metrics fetch
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    pub viral_engagement: f64,
    pub low_engagement: f64,
    pub low_engagement_min_views: u64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            offsets: [3600, 6 * 3600, 24 * 3600, 7 * 86400, 30 * 86400]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
            max_retries: 3,
            retry_delay: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(30),
            viral_engagement: 0.10,
            low_engagement: 0.01,
            low_engagement_min_views: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// How long resolved alerts stay in live memory
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Pending timer count that raises a resource-pressure alert
    pub queue_depth_warning: usize,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 3600),
            sweep_interval: Duration::from_secs(3600),
            queue_depth_warning: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub format: LogFormat,
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformKind {
    /// Generic JSON-over-HTTP publishing API
    Http,
    /// Accepts everything without network access
    DryRun,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub kind: PlatformKind,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_file: Option<String>,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
}

fn default_enabled() -> bool {
    true
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl std::fmt::Debug for PlatformConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformConfig")
            .field("enabled", &self.enabled)
            .field("kind", &self.kind)
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("token_file", &self.token_file)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl PlatformConfig {
    pub fn dry_run() -> Self {
        Self {
            enabled: true,
            kind: PlatformKind::DryRun,
            endpoint: None,
            token: None,
            token_file: None,
            request_timeout: default_request_timeout(),
        }
    }

    /// Resolve the access token from the inline value or the token file
    pub fn resolve_token(&self, platform: &str) -> Result<String> {
        if let Some(token) = &self.token {
            if token.trim().is_empty() {
                return Err(invalid(
                    format!("platforms.{}.token", platform),
                    "token is empty",
                ));
            }
            return Ok(token.trim().to_string());
        }

        let token_file = self
            .token_file
            .as_ref()
            .ok_or_else(|| ConfigError::MissingField(format!("platforms.{}.token", platform)))?;
        let path = shellexpand::tilde(token_file).to_string();
        let token = std::fs::read_to_string(&path)
            .map_err(ConfigError::ReadError)?
            .trim()
            .to_string();

        if token.is_empty() {
            return Err(invalid(
                format!("platforms.{}.token_file", platform),
                format!("token file {} is empty", path),
            ));
        }
        Ok(token)
    }

    fn validate(&self, platform: &str) -> Result<()> {
        if self.kind == PlatformKind::DryRun {
            return Ok(());
        }

        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| ConfigError::MissingField(format!("platforms.{}.endpoint", platform)))?;
        validate_url(&format!("platforms.{}.endpoint", platform), endpoint)?;

        if self.token.is_none() && self.token_file.is_none() {
            return Err(ConfigError::MissingField(format!(
                "platforms.{}.token or platforms.{}.token_file",
                platform, platform
            ))
            .into());
        }
        if self.request_timeout.is_zero() {
            return Err(invalid(
                format!("platforms.{}.request_timeout", platform),
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load and validate configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.database.path.trim().is_empty() {
            return Err(ConfigError::MissingField("database.path".to_string()).into());
        }

        let engine = &self.engine;
        if engine.publish_timeout.is_zero() {
            return Err(invalid("engine.publish_timeout", "must be greater than zero"));
        }
        if engine.default_max_attempts == 0 {
            return Err(invalid("engine.default_max_attempts", "must be at least 1"));
        }
        if engine.backoff_schedule.is_empty() {
            return Err(invalid("engine.backoff_schedule", "must not be empty"));
        }
        if engine.backoff_schedule.iter().any(Duration::is_zero) {
            return Err(invalid("engine.backoff_schedule", "delays must be positive"));
        }

        if self.health.interval.is_zero() || self.health.probe_timeout.is_zero() {
            return Err(invalid("health", "interval and probe_timeout must be positive"));
        }
        if self.health.critical_threshold == 0 {
            return Err(invalid("health.critical_threshold", "must be at least 1"));
        }

        let analytics = &self.analytics;
        if analytics.offsets.is_empty() {
            return Err(invalid("analytics.offsets", "must not be empty"));
        }
        if analytics.offsets.windows(2).any(|pair| pair[0] >= pair[1]) {
            return Err(invalid("analytics.offsets", "must be strictly increasing"));
        }
        if analytics.fetch_timeout.is_zero() {
            return Err(invalid("analytics.fetch_timeout", "must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&analytics.low_engagement)
            || analytics.low_engagement >= analytics.viral_engagement
        {
            return Err(invalid(
                "analytics.low_engagement",
                "must be within 0..1 and below analytics.viral_engagement",
            ));
        }

        if self.alerts.sweep_interval.is_zero() {
            return Err(invalid("alerts.sweep_interval", "must be greater than zero"));
        }

        for (name, platform) in &self.platforms {
            if name.trim().is_empty() {
                return Err(invalid("platforms", "platform ids must not be empty"));
            }
            platform.validate(name)?;
        }

        for (index, channel) in self.notifications.iter().enumerate() {
            if let ChannelConfig::Webhook(webhook) = channel {
                validate_url(&format!("notifications[{}].url", index), &webhook.url)?;
            }
        }

        Ok(())
    }

    /// Settings consumed by the dispatch engine and its components
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            engine: self.engine.clone(),
            health: self.health.clone(),
            analytics: self.analytics.clone(),
            alerts: self.alerts.clone(),
        }
    }
}

/// Runtime tunables for the dispatch engine
#[derive(Debug, Clone, Default)]
pub struct EngineSettings {
    pub engine: EngineConfig,
    pub health: HealthConfig,
    pub analytics: AnalyticsConfig,
    pub alerts: AlertsConfig,
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> crate::error::SyndicastError {
    ConfigError::InvalidValue {
        field: field.into(),
        reason: reason.into(),
    }
    .into()
}

fn validate_url(field: &str, value: &str) -> Result<()> {
    let url = reqwest::Url::parse(value).map_err(|e| invalid(field, e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(invalid(field, format!("unsupported scheme '{}'", other))),
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("SYNDICAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("syndicast").join("config.toml"))
}

/// Serde adapter for humantime duration strings
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }

    pub mod vec {
        use serde::ser::SerializeSeq;
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            values: &[Duration],
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            let mut seq = serializer.serialize_seq(Some(values.len()))?;
            for value in values {
                seq.serialize_element(&humantime::format_duration(*value).to_string())?;
            }
            seq.end()
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Vec<Duration>, D::Error> {
            Vec::<String>::deserialize(deserializer)?
                .iter()
                .map(|raw| humantime::parse_duration(raw).map_err(serde::de::Error::custom))
                .collect()
        }
    }
}
