//! Sync Data Models - Client-Side Structures
//!
//! Defines the data structures shared by the codec, the provider adapters and
//! the orchestrator.
//!
//! Data Categories:
//! - SyncConfig: timings and limits of the engine
//! - Snapshot / ProjectMeta: the unit of replication (the whole local dataset)
//! - EncryptedBundle: the only representation that ever leaves the device
//! - SyncMode / SyncStatus / ProviderConnectionState: engine health

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

/// Snapshot/bundle format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Hard cap for a serialized bundle (5 MiB)
pub const MAX_BUNDLE_BYTES: usize = 5 * 1024 * 1024;

pub const DEFAULT_KDF_ITERATIONS: u32 = 200_000;
pub const MIN_PASSPHRASE_LEN: usize = 8;

/// Name of the remote object in every backend's app folder
pub const DEFAULT_FILE_NAME: &str = "ac-backup.json.enc";

/// Name of the cross-view status channel
pub const DEFAULT_STATUS_CHANNEL: &str = "ac-sync";

// ============================================================================
// Sync Configuration
// ============================================================================

/// Engine configuration
///
/// Defaults match the production timings; every field can be overridden with an
/// `AC_SYNC_*` environment variable (see [`SyncConfig::from_env`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Quiet period after the last local change before a push starts
    pub debounce_ms: u64,

    /// Minimum spacing between two successful pushes
    pub throttle_ms: u64,

    /// Poll cadence while the view is foregrounded
    pub poll_visible_ms: u64,

    /// Poll cadence while the view is hidden
    pub poll_hidden_ms: u64,

    /// Inactivity (view hidden, no interaction) before entering Standby
    pub standby_idle_minutes: u64,

    /// PBKDF2 iterations used for new credential material
    pub kdf_iterations: u32,

    pub min_passphrase_len: usize,

    /// Serialized bundle size limit in bytes
    pub max_bundle_bytes: usize,

    /// Remote object name
    pub file_name: String,

    /// Status broadcast channel name
    pub status_channel: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1_500,
            throttle_ms: 5_000,
            poll_visible_ms: 7_000,
            poll_hidden_ms: 15_000,
            standby_idle_minutes: 3,
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            min_passphrase_len: MIN_PASSPHRASE_LEN,
            max_bundle_bytes: MAX_BUNDLE_BYTES,
            file_name: DEFAULT_FILE_NAME.to_string(),
            status_channel: DEFAULT_STATUS_CHANNEL.to_string(),
        }
    }
}

impl SyncConfig {
    /// Default configuration overlaid with `AC_SYNC_*` environment variables
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    ///
    /// Unparseable values are logged and ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>, target: &mut T) {
            if let Some(raw) = raw {
                match raw.trim().parse::<T>() {
                    Ok(value) => *target = value,
                    Err(_) => log::warn!("Ignoring invalid value for {}: {:?}", key, raw),
                }
            }
        }

        parse("AC_SYNC_DEBOUNCE_MS", lookup("AC_SYNC_DEBOUNCE_MS"), &mut self.debounce_ms);
        parse("AC_SYNC_THROTTLE_MS", lookup("AC_SYNC_THROTTLE_MS"), &mut self.throttle_ms);
        parse("AC_SYNC_POLL_VISIBLE_MS", lookup("AC_SYNC_POLL_VISIBLE_MS"), &mut self.poll_visible_ms);
        parse("AC_SYNC_POLL_HIDDEN_MS", lookup("AC_SYNC_POLL_HIDDEN_MS"), &mut self.poll_hidden_ms);
        parse(
            "AC_SYNC_STANDBY_IDLE_MINUTES",
            lookup("AC_SYNC_STANDBY_IDLE_MINUTES"),
            &mut self.standby_idle_minutes,
        );
        parse("AC_SYNC_KDF_ITERATIONS", lookup("AC_SYNC_KDF_ITERATIONS"), &mut self.kdf_iterations);

        if let Some(name) = lookup("AC_SYNC_FILE_NAME").filter(|n| !n.trim().is_empty()) {
            self.file_name = name.trim().to_string();
        }
        if let Some(channel) = lookup("AC_SYNC_STATUS_CHANNEL").filter(|c| !c.trim().is_empty()) {
            self.status_channel = channel.trim().to_string();
        }

        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    /// Poll cadence for the given view visibility
    pub fn poll_interval(&self, visible: bool) -> Duration {
        if visible {
            Duration::from_millis(self.poll_visible_ms)
        } else {
            Duration::from_millis(self.poll_hidden_ms)
        }
    }

    pub fn standby_idle(&self) -> Duration {
        Duration::from_secs(self.standby_idle_minutes * 60)
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Opaque project record owned by the host application
pub type ProjectPayload = serde_json::Value;

/// Project listing entry; only `id` is interpreted by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMeta {
    pub id: String,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ProjectMeta {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            extra: serde_json::Map::new(),
        }
    }

    /// `updatedAt` (ms since epoch) when the host records one
    pub fn updated_at(&self) -> Option<i64> {
        self.extra.get("updatedAt").and_then(|v| v.as_i64())
    }
}

/// Point-in-time copy of the entire local dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: u32,
    pub owner_device_id: String,

    /// Milliseconds since the Unix epoch
    pub updated_at: i64,

    pub metas: Vec<ProjectMeta>,
    pub map: BTreeMap<String, ProjectPayload>,
}

impl Snapshot {
    /// Every meta id has a payload in `map` and vice versa (no duplicates)
    pub fn is_consistent(&self) -> bool {
        let meta_ids: BTreeSet<&str> = self.metas.iter().map(|m| m.id.as_str()).collect();
        meta_ids.len() == self.metas.len()
            && meta_ids.len() == self.map.len()
            && self.map.keys().all(|id| meta_ids.contains(id.as_str()))
    }

    pub fn updated_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.updated_at)
    }
}

// ============================================================================
// Wire Format
// ============================================================================

/// Key-derivation parameters carried alongside every ciphertext
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub iterations: u32,

    /// base64url salt
    pub salt: String,
}

/// Encrypted snapshot as stored on a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedBundle {
    pub version: u32,
    pub kdf: KdfParams,

    /// base64url 96-bit nonce
    pub iv: String,

    /// base64url AES-256-GCM output (ciphertext || tag)
    pub ciphertext: String,

    /// Non-sensitive identifier hint, e.g. `11•••••4321`
    pub phone_hint: String,

    pub updated_at: i64,
    pub owner_device_id: String,
}

// ============================================================================
// Sync Status & Metadata
// ============================================================================

/// Externally visible engine mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Disabled,
    Mirroring,
    Active,
    Updating,
    Attention,
    Degraded,
    Standby,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Disabled => "disabled",
            SyncMode::Mirroring => "mirroring",
            SyncMode::Active => "active",
            SyncMode::Updating => "updating",
            SyncMode::Attention => "attention",
            SyncMode::Degraded => "degraded",
            SyncMode::Standby => "standby",
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current mode plus a human-readable detail line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub mode: SyncMode,
    pub detail: String,
}

impl SyncStatus {
    pub fn new(mode: SyncMode, detail: impl Into<String>) -> Self {
        Self {
            mode,
            detail: detail.into(),
        }
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::new(SyncMode::Disabled, "Choose a provider to start")
    }
}

/// Per-backend connection health, mutated only by the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConnectionState {
    pub connected: bool,
    pub degraded: bool,

    /// Last call failed with an authorization error
    pub needs_reauth: bool,

    pub concurrency_token: Option<String>,
    pub last_known_modified: Option<DateTime<Utc>>,

    /// Calls to this provider are skipped until this instant
    #[serde(skip)]
    pub retry_after: Option<tokio::time::Instant>,
}

impl ProviderConnectionState {
    pub fn connected() -> Self {
        Self {
            connected: true,
            ..Self::default()
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
