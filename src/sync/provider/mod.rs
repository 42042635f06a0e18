//! Storage Provider Adapters
//!
//! Every backend stores exactly one object (the encrypted bundle) in an
//! app-private folder. Adapters expose the same small surface:
//! - authenticate / sign_out: obtain or forget the access token
//! - fetch_metadata: existence, last modified time and concurrency token
//! - fetch_content / write / delete: the object itself
//!
//! Writes are conditional when a concurrency token is supplied: a backend that
//! changed since the token was read rejects the write with `ConcurrencyConflict`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Response, StatusCode};
use std::time::Duration;

pub mod google;
pub mod memory;
pub mod onedrive;

pub use google::GoogleDriveAdapter;
pub use memory::{MemoryBackend, MemoryProvider};
pub use onedrive::OneDriveAdapter;

/// Timeout applied to every backend request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Content type of the stored bundle
pub const BUNDLE_MIME: &str = "application/json";

// ============================================================================
// Data Types
// ============================================================================

/// What a backend knows about the stored bundle without downloading it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub exists: bool,
    pub last_modified: Option<DateTime<Utc>>,
    pub concurrency_token: Option<String>,
}

impl RemoteMetadata {
    /// Last modified time in ms since epoch (0 when unknown)
    pub fn last_modified_ms(&self) -> i64 {
        self.last_modified.map(|t| t.timestamp_millis()).unwrap_or(0)
    }
}

/// Result of a successful write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub concurrency_token: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("Authorization expired - sign in again")]
    AuthExpired,

    #[error("Rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Remote bundle changed since it was last read")]
    ConcurrencyConflict,

    #[error("Network failure: {0}")]
    NetworkFailure(String),

    #[error("Invalid response from provider: {0}")]
    InvalidResponse(String),

    #[error("Not authenticated")]
    NotAuthenticated,
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::NetworkFailure(e.to_string())
    }
}

// ============================================================================
// Adapter & Token Traits
// ============================================================================

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable provider id, e.g. `google` or `onedrive`
    fn id(&self) -> &str;

    /// Obtain (and cache) an access token
    async fn authenticate(&self) -> Result<String, ProviderError>;

    /// Forget the cached token
    async fn sign_out(&self);

    async fn fetch_metadata(&self) -> Result<Option<RemoteMetadata>, ProviderError>;

    async fn fetch_content(&self) -> Result<Option<String>, ProviderError>;

    /// Store `content`, conditioned on `expected_token` when given
    async fn write(
        &self,
        content: &str,
        expected_token: Option<&str>,
    ) -> Result<WriteReceipt, ProviderError>;

    async fn delete(&self) -> Result<(), ProviderError>;
}

/// Source of access tokens; interactive login lives outside the engine
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, ProviderError>;
}

/// Token known ahead of time (environment, tests)
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticToken(<redacted>)")
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String, ProviderError> {
        if self.0.trim().is_empty() {
            return Err(ProviderError::NotAuthenticated);
        }
        Ok(self.0.clone())
    }
}

// ============================================================================
// HTTP Helpers
// ============================================================================

pub(crate) fn http_client() -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| ProviderError::NetworkFailure(format!("Failed to create HTTP client: {}", e)))
}

/// Validate an API base URL; the result has no trailing slash
pub(crate) fn base_url(raw: &str) -> Result<String, ProviderError> {
    let parsed = url::Url::parse(raw.trim())
        .map_err(|e| ProviderError::NetworkFailure(format!("Invalid base URL {:?}: {}", raw, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ProviderError::NetworkFailure(format!(
            "Unsupported URL scheme: {}",
            parsed.scheme()
        )));
    }
    Ok(raw.trim().trim_end_matches('/').to_string())
}

/// Map a status code to the provider error taxonomy
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::AuthExpired,
        StatusCode::PRECONDITION_FAILED => ProviderError::ConcurrencyConflict,
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited { retry_after },
        other => ProviderError::NetworkFailure(format!("HTTP {}", other)),
    }
}

/// `Retry-After` in delta-seconds form
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Convert a non-success response into a `ProviderError`
pub(crate) async fn error_for(response: Response) -> ProviderError {
    let status = response.status();
    let retry_after = parse_retry_after(
        response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok()),
    );

    match classify_status(status, retry_after) {
        ProviderError::NetworkFailure(_) => {
            let msg = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            ProviderError::NetworkFailure(format!("{}: {}", status, msg))
        }
        err => err,
    }
}

/// Deserialize a JSON success body
pub(crate) async fn json_body<T: serde::de::DeserializeOwned>(
    response: Response,
) -> Result<T, ProviderError> {
    response
        .json::<T>()
        .await
        .map_err(|e| ProviderError::InvalidResponse(e.to_string()))
}

// ============================================================================
// Tests
// ============================================================================
