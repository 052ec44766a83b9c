//! Generic JSON-over-HTTP publishing adapter
//!
//! Talks to any service exposing three endpoints under a base URL:
//!
//! - `POST {endpoint}/posts` with the task payload, answering `{"id", "url"}`
//! - `GET {endpoint}/posts/{id}/metrics` answering a [`Metrics`] object
//! - `GET {endpoint}/auth/verify` answering 2xx while the token is valid
//!
//! Requests carry `Authorization: Bearer <token>`; publish requests also carry
//! `Idempotency-Key: <task id>` so that a platform that supports it can drop
//! a duplicate after an interrupted attempt. Rate-limit state is read from
//! `X-RateLimit-Remaining`, `X-RateLimit-Reset` and `Retry-After`.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::PlatformConfig;
use crate::error::{ConfigError, PlatformError, PlatformResult, Result};
use crate::platforms::Platform;
use crate::types::{
    AuthCheck, AuthStatus, Metrics, PublicationTask, PublishReceipt, RateLimitInfo,
};

const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";
const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";
const IDEMPOTENCY_KEY: &str = "idempotency-key";

/// Error code a platform returns with 401 when the token has expired
const TOKEN_EXPIRED: &str = "token_expired";

pub struct HttpPlatform {
    name: String,
    endpoint: String,
    token: SecretString,
    client: Client,
    request_timeout: Duration,
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    task_id: &'a str,
    title: &'a str,
    body: &'a str,
    media: &'a [String],
    tags: &'a [String],
}

#[derive(Deserialize)]
struct PublishResponse {
    id: String,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl HttpPlatform {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        token: SecretString,
        request_timeout: Duration,
    ) -> Result<Self> {
        let name = name.into();
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("syndicast/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: format!("platforms.{}", name),
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            name,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
            client,
            request_timeout,
        })
    }

    /// Build from a validated `[platforms.<id>]` section
    pub fn from_config(name: &str, config: &PlatformConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| ConfigError::MissingField(format!("platforms.{}.endpoint", name)))?;
        let token = SecretString::from(config.resolve_token(name)?);

        Self::new(name, endpoint, token, config.request_timeout)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    fn transport_error(&self, error: reqwest::Error) -> PlatformError {
        classify_transport(&error, self.request_timeout)
    }

    /// Turn a non-success response into a structured error
    async fn error_from_response(&self, response: reqwest::Response) -> PlatformError {
        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        let error = classify_status(status, &body, retry_after);

        tracing::debug!(
            platform = %self.name,
            status = status.as_u16(),
            kind = %error.kind(),
            "Platform returned an error response"
        );
        error
    }
}

/// Map an HTTP error status to a platform error
///
/// 401/403 are credential problems, 400/422 content problems, 429 a rate
/// limit, 408 and 5xx transient. Any other 4xx is a refusal that retrying
/// will not change.
pub fn classify_status(
    status: StatusCode,
    body: &str,
    retry_after: Option<Duration>,
) -> PlatformError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .message
        .clone()
        .or_else(|| parsed.error.clone())
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

    match status {
        StatusCode::UNAUTHORIZED if parsed.error.as_deref() == Some(TOKEN_EXPIRED) => {
            PlatformError::CredentialsExpired(message)
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PlatformError::Authentication(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            PlatformError::Validation(message)
        }
        StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimit {
            message,
            retry_after,
        },
        StatusCode::REQUEST_TIMEOUT => PlatformError::Network(message),
        s if s.is_server_error() => PlatformError::Network(message),
        _ => PlatformError::Rejected(message),
    }
}

/// Map a transport failure to a platform error
pub fn classify_transport(error: &reqwest::Error, timeout: Duration) -> PlatformError {
    if error.is_timeout() {
        PlatformError::Timeout(timeout)
    } else {
        PlatformError::Network(error.to_string())
    }
}

fn header_value<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

/// `Retry-After` in delta-seconds form
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    header_value::<u64>(headers, RETRY_AFTER.as_str()).map(Duration::from_secs)
}

fn parse_rate_limit(headers: &HeaderMap) -> Option<RateLimitInfo> {
    let info = RateLimitInfo {
        remaining: header_value(headers, RATE_LIMIT_REMAINING),
        reset_at: header_value(headers, RATE_LIMIT_RESET),
    };

    if info.remaining.is_none() && info.reset_at.is_none() {
        None
    } else {
        Some(info)
    }
}

#[async_trait]
impl Platform for HttpPlatform {
    fn name(&self) -> &str {
        &self.name
    }

    async fn publish(&self, task: &PublicationTask) -> PlatformResult<PublishReceipt> {
        let request = PublishRequest {
            task_id: &task.id,
            title: &task.payload.title,
            body: &task.payload.body,
            media: &task.payload.media,
            tags: &task.payload.tags,
        };

        let response = self
            .client
            .post(self.url("/posts"))
            .bearer_auth(self.token.expose_secret())
            .header(IDEMPOTENCY_KEY, task.id.as_str())
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            return Err(self.error_from_response(response).await);
        }

        let rate_limit = parse_rate_limit(response.headers());
        let body: PublishResponse = response.json().await.map_err(|e| {
            // The post may already be live; retrying could duplicate it
            PlatformError::Rejected(format!("unreadable publish response: {}", e))
        })?;

        Ok(PublishReceipt {
            platform_post_id: body.id,
            url: body.url,
            rate_limit,
        })
    }

    async fn fetch_metrics(&self, platform_post_id: &str) -> PlatformResult<Metrics> {
        let response = self
            .client
            .get(self.url(&format!("/posts/{}/metrics", platform_post_id)))
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            return Err(self.error_from_response(response).await);
        }

        response
            .json::<Metrics>()
            .await
            .map_err(|e| PlatformError::Network(format!("unreadable metrics response: {}", e)))
    }

    async fn check_auth(&self) -> PlatformResult<AuthCheck> {
        let response = self
            .client
            .get(self.url("/auth/verify"))
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let rate_limit = parse_rate_limit(response.headers());
        if response.status().is_success() {
            return Ok(AuthCheck {
                status: AuthStatus::Valid,
                rate_limit,
            });
        }

        // The platform answered; only credential refusals are a verdict
        match self.error_from_response(response).await {
            PlatformError::CredentialsExpired(_) => Ok(AuthCheck {
                status: AuthStatus::Expired,
                rate_limit,
            }),
            PlatformError::Authentication(_) => Ok(AuthCheck {
                status: AuthStatus::Invalid,
                rate_limit,
            }),
            other => Err(other),
        }
    }
}
