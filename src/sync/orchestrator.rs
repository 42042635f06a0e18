//! Sync Orchestrator - Roles, Push/Pull Protocol & Provider Health
//!
//! Coordinates the dataset, the snapshot codec and every provider adapter.
//!
//! Roles:
//! - Disabled: no provider enabled
//! - Mirroring: another device owns the data; remote changes are polled and applied
//! - Active: this device owns the data; local changes are pushed
//! - Standby: polling paused after a long idle period
//!
//! The displayed mode is either the role's own mode or an overlay (Updating,
//! Attention, Degraded). Overlays never change the role, so a Degraded Active
//! engine keeps pushing to the providers that still work.
//!
//! Every provider is handled independently: one failing backend marks only its
//! own connection state.

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use super::crypto::{
    CredentialManager, CredentialMaterial, CryptoError, KeyLookup, PendingKey, Secret,
    MAX_KDF_ITERATIONS,
};
use super::dataset::{DatasetError, KeyValueStore, ProjectStore};
use super::device::get_or_create_device_id;
use super::models::{KdfParams, ProviderConnectionState, Snapshot, SyncConfig, SyncMode, SyncStatus};
use super::provider::{ProviderAdapter, ProviderError, RemoteMetadata, WriteReceipt};
use super::snapshot::{
    apply_snapshot, enforce_bundle_limit, local_watermark, parse_bundle, ApplyReport,
    SealedSnapshot, SnapshotCodec,
};
use super::status::StatusChannel;

/// Settings key holding the persisted KDF parameters (never the key)
pub const KDF_PARAMS_KEY: &str = "ac:kdf";

/// Back-off applied when a 429 carries no usable Retry-After
const RATE_LIMIT_FALLBACK: Duration = Duration::from_secs(30);

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Identifier and passphrase required")]
    MissingCredentials,

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("No provider enabled")]
    NoProviders,

    #[error("Remote backup changed on another device")]
    ConcurrencyConflict,

    #[error("{provider}: {source}")]
    Provider {
        provider: String,
        #[source]
        source: ProviderError,
    },

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    fn provider(id: &str, source: ProviderError) -> Self {
        SyncError::Provider {
            provider: id.to_string(),
            source,
        }
    }
}

// ============================================================================
// Data Types
// ============================================================================

/// Base role deciding whether the engine pushes or polls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncRole {
    Disabled,
    Mirroring,
    Active,
    Standby,
}

impl SyncRole {
    pub fn mode(&self) -> SyncMode {
        match self {
            SyncRole::Disabled => SyncMode::Disabled,
            SyncRole::Mirroring => SyncMode::Mirroring,
            SyncRole::Active => SyncMode::Active,
            SyncRole::Standby => SyncMode::Standby,
        }
    }

    fn default_detail(&self) -> &'static str {
        match self {
            SyncRole::Disabled => "Choose a provider to start",
            SyncRole::Mirroring => "Watching for remote changes",
            SyncRole::Active => "Synced",
            SyncRole::Standby => "Paused to save network",
        }
    }
}

/// Per-provider outcome of a push or take-control
#[derive(Debug, Clone, Default)]
pub struct PushReport {
    /// `updatedAt` of the snapshot that was sent
    pub updated_at: i64,

    pub written: Vec<String>,
    pub failed: Vec<(String, ProviderError)>,

    /// Providers that rejected the write because the remote changed
    pub conflicted: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// No enabled provider holds a bundle
    NoRemote,

    /// Newest remote is not newer than what was last applied
    UpToDate,

    Applied { provider: String, report: ApplyReport },

    /// Nothing attempted (wrong role, or the bundle already failed to decrypt)
    Skipped,
}

struct ProviderSlot {
    adapter: Arc<dyn ProviderAdapter>,
    state: ProviderConnectionState,
}

/// Provider selected for one operation, captured outside the lock
struct Target {
    id: String,
    adapter: Arc<dyn ProviderAdapter>,
    token: Option<String>,
}

struct EngineState {
    role: SyncRole,
    status: SyncStatus,

    /// Newest snapshot time (ms) applied locally or written by this device
    last_applied: i64,

    /// `provider:token` of a bundle that could not be decrypted
    undecryptable: Option<String>,
}

struct Inner {
    config: SyncConfig,
    device_id: String,
    store: Arc<dyn ProjectStore>,
    settings: Arc<dyn KeyValueStore>,
    codec: SnapshotCodec,
    channel: StatusChannel,
    providers: RwLock<Vec<ProviderSlot>>,
    credentials: Mutex<CredentialManager>,
    state: RwLock<EngineState>,

    /// Serializes pushes, pulls and take-control
    operation: Mutex<()>,

    push_in_flight: AtomicBool,
    push_pending: AtomicBool,
    last_push: RwLock<Option<Instant>>,
}

/// Resets the in-flight flag when a push ends, however it ends
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Encrypted multi-provider sync engine
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    /// Create an engine over the host's stores and the known adapters
    ///
    /// Adapters are kept in the given order, which breaks ties between providers
    /// reporting the same modification time. None is enabled yet.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn ProjectStore>,
        settings: Arc<dyn KeyValueStore>,
        adapters: Vec<Arc<dyn ProviderAdapter>>,
    ) -> Self {
        let device_id = get_or_create_device_id(settings.as_ref());
        let last_applied = local_watermark(store.as_ref()).unwrap_or_else(|e| {
            log::warn!("Could not read local watermark: {}", e);
            0
        });

        let mut providers: Vec<ProviderSlot> = Vec::with_capacity(adapters.len());
        for adapter in adapters {
            if providers.iter().any(|s| s.adapter.id() == adapter.id()) {
                log::warn!("Ignoring duplicate provider {}", adapter.id());
                continue;
            }
            providers.push(ProviderSlot {
                adapter,
                state: ProviderConnectionState::default(),
            });
        }

        log::info!(
            "Sync engine ready (device {}, {} providers)",
            device_id,
            providers.len()
        );

        Self {
            inner: Arc::new(Inner {
                channel: StatusChannel::join(&config.status_channel, &device_id),
                codec: SnapshotCodec::new(config.max_bundle_bytes),
                credentials: Mutex::new(CredentialManager::new(&config)),
                config,
                device_id,
                store,
                settings,
                providers: RwLock::new(providers),
                state: RwLock::new(EngineState {
                    role: SyncRole::Disabled,
                    status: SyncStatus::default(),
                    last_applied,
                    undecryptable: None,
                }),
                operation: Mutex::new(()),
                push_in_flight: AtomicBool::new(false),
                push_pending: AtomicBool::new(false),
                last_push: RwLock::new(None),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn status_channel(&self) -> &StatusChannel {
        &self.inner.channel
    }

    pub async fn status(&self) -> SyncStatus {
        self.inner.state.read().await.status.clone()
    }

    pub async fn role(&self) -> SyncRole {
        self.inner.state.read().await.role
    }

    /// Newest snapshot time (ms) known to be reflected locally
    pub async fn last_applied(&self) -> i64 {
        self.inner.state.read().await.last_applied
    }

    pub async fn has_credentials(&self) -> bool {
        self.inner.credentials.lock().await.has_secret()
    }

    /// Connection state of every known provider, in configured order
    pub async fn provider_states(&self) -> Vec<(String, ProviderConnectionState)> {
        self.inner
            .providers
            .read()
            .await
            .iter()
            .map(|slot| (slot.adapter.id().to_string(), slot.state.clone()))
            .collect()
    }

    pub async fn provider_state(&self, id: &str) -> Option<ProviderConnectionState> {
        self.inner
            .providers
            .read()
            .await
            .iter()
            .find(|slot| slot.adapter.id() == id)
            .map(|slot| slot.state.clone())
    }

    // ------------------------------------------------------------------------
    // Provider lifecycle
    // ------------------------------------------------------------------------

    /// Authenticate a provider, start using it and look for an existing bundle
    pub async fn enable_provider(&self, id: &str) -> Result<SyncStatus, SyncError> {
        let adapter = self.adapter(id).await?;
        log::info!("Enabling provider {}", id);

        if let Err(e) = adapter.authenticate().await {
            self.update_provider(id, |state| {
                state.connected = false;
                apply_failure(state, &e);
            })
            .await;
            if is_auth_error(&e) {
                self.set_status(SyncStatus::new(
                    SyncMode::Attention,
                    format!("{}: sign in again", id),
                ))
                .await;
            }
            return Err(SyncError::provider(id, e));
        }
        self.update_provider(id, |state| *state = ProviderConnectionState::connected())
            .await;

        // Disabled -> Active (local data) | Mirroring (nothing local)
        if self.role().await == SyncRole::Disabled {
            let has_local = !self.inner.store.list_projects()?.is_empty();
            let role = if has_local {
                SyncRole::Active
            } else {
                SyncRole::Mirroring
            };
            self.inner.state.write().await.role = role;
            log::info!("First provider enabled, role is now {:?}", role);
        }

        match adapter.fetch_metadata().await {
            Ok(Some(meta)) => {
                self.record_metadata(id, Some(&meta)).await;
                if !self.has_credentials().await {
                    return Ok(self
                        .set_status(SyncStatus::new(
                            SyncMode::Attention,
                            format!("Enter identifier and passphrase to open the {} backup", id),
                        ))
                        .await);
                }
            }
            Ok(None) => self.record_metadata(id, None).await,
            Err(e) => {
                log::warn!("Metadata check on {} failed: {}", id, e);
                self.update_provider(id, |state| apply_failure(state, &e)).await;
            }
        }

        Ok(self.settle(&format!("{} connected", id)).await)
    }

    /// Stop using a provider and forget its token; the last one resets the engine
    pub async fn disable_provider(&self, id: &str) -> Result<SyncStatus, SyncError> {
        let adapter = self.adapter(id).await?;
        adapter.sign_out().await;

        let any_left = {
            let mut providers = self.inner.providers.write().await;
            if let Some(slot) = providers.iter_mut().find(|s| s.adapter.id() == id) {
                slot.state = ProviderConnectionState::default();
            }
            providers.iter().any(|s| s.state.connected)
        };
        log::info!("Provider {} disabled", id);

        if !any_left {
            {
                let mut state = self.inner.state.write().await;
                state.role = SyncRole::Disabled;
                state.undecryptable = None;
            }
            return Ok(self.set_status(SyncStatus::default()).await);
        }

        Ok(self.settle(&format!("{} disconnected", id)).await)
    }

    /// Obtain a fresh token for a provider that reported an authorization error
    pub async fn reauthenticate(&self, id: &str) -> Result<SyncStatus, SyncError> {
        let adapter = self.adapter(id).await?;
        let was_connected = self
            .provider_state(id)
            .await
            .map(|s| s.connected)
            .unwrap_or(false);
        if !was_connected {
            return self.enable_provider(id).await;
        }

        match adapter.authenticate().await {
            Ok(_) => {
                self.update_provider(id, |state| {
                    state.needs_reauth = false;
                    state.degraded = false;
                    state.retry_after = None;
                })
                .await;
                log::info!("Provider {} re-authenticated", id);
                Ok(self.settle(&format!("{} reconnected", id)).await)
            }
            Err(e) => {
                self.update_provider(id, |state| apply_failure(state, &e)).await;
                self.settle(&format!("{} sign-in failed", id)).await;
                Err(SyncError::provider(id, e))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Credentials
    // ------------------------------------------------------------------------

    /// Install the identifier + passphrase for this session
    ///
    /// Persisted KDF parameters are reused so the same secret yields the same key
    /// as in earlier sessions; only the parameters are written back.
    pub async fn set_credentials(&self, secret: Secret) -> Result<SyncStatus, SyncError> {
        let persisted = self.load_kdf_params();

        let pending = self
            .inner
            .credentials
            .lock()
            .await
            .prepare_secret(secret, persisted.as_ref())?;
        let (pending, material) = derive_off_runtime(pending).await?;

        let (params, hint) = {
            let mut credentials = self.inner.credentials.lock().await;
            let params = credentials.install(pending, material).kdf_params();
            (params, credentials.phone_hint())
        };
        self.persist_kdf_params(&params);
        self.inner.state.write().await.undecryptable = None;

        log::info!("Credentials set for {}", hint);
        Ok(self.settle("Credentials set").await)
    }

    // ------------------------------------------------------------------------
    // Push
    // ------------------------------------------------------------------------

    /// Publish the local dataset to every enabled provider (Active role only)
    ///
    /// Returns `Ok(None)` when nothing was attempted: the engine is not Active, or
    /// another push is running (that push runs once more when it finishes).
    pub async fn push_now(&self) -> Result<Option<PushReport>, SyncError> {
        if self.inner.push_in_flight.swap(true, Ordering::AcqRel) {
            self.inner.push_pending.store(true, Ordering::Release);
            log::debug!("Push already in flight, deferring");
            return Ok(None);
        }
        let _guard = InFlightGuard(&self.inner.push_in_flight);

        loop {
            let result = self.push_once().await;
            if !self.inner.push_pending.swap(false, Ordering::AcqRel) {
                return result;
            }
            match &result {
                Ok(_) => log::debug!("Running deferred push"),
                Err(e) => log::warn!("Push failed ({}), running deferred push", e),
            }
        }
    }

    async fn push_once(&self) -> Result<Option<PushReport>, SyncError> {
        if self.role().await != SyncRole::Active {
            log::debug!("Not the active device, skipping push");
            return Ok(None);
        }

        self.wait_for_throttle().await;
        let _op = self.inner.operation.lock().await;

        // Role may have changed while throttled
        if self.role().await != SyncRole::Active {
            return Ok(None);
        }

        let targets = self.targets().await;
        if targets.is_empty() {
            self.settle("No provider available").await;
            return Ok(Some(PushReport::default()));
        }

        self.set_status(SyncStatus::new(SyncMode::Updating, "Publishing changes"))
            .await;

        // 1. Build + encrypt; nothing touches the network on failure
        let (updated_at, sealed) = self.seal_local_snapshot().await?;

        // 2. Write every provider independently
        let content = sealed.content.as_str();
        let results = join_all(targets.iter().map(|target| async move {
            match write_with_known_token(target, content).await {
                Err(ProviderError::ConcurrencyConflict) => self.reclaim(target, content).await,
                other => other,
            }
        }))
        .await;

        // 3. Record outcomes
        let mut report = PushReport {
            updated_at,
            ..PushReport::default()
        };
        let mut newest = updated_at;
        {
            let mut providers = self.inner.providers.write().await;
            for (target, result) in targets.iter().zip(results) {
                let Some(slot) = providers.iter_mut().find(|s| s.adapter.id() == target.id) else {
                    continue;
                };
                match result {
                    Ok(receipt) => {
                        newest = newest.max(receipt_ms(&receipt));
                        apply_receipt(&mut slot.state, receipt);
                        log::info!("Pushed snapshot {} to {}", updated_at, target.id);
                        report.written.push(target.id.clone());
                    }
                    Err(ProviderError::ConcurrencyConflict) => {
                        log::warn!("Push to {} rejected: remote changed", target.id);
                        report.conflicted.push(target.id.clone());
                    }
                    Err(e) => {
                        log::warn!("Push to {} failed: {}", target.id, e);
                        apply_failure(&mut slot.state, &e);
                        report.failed.push((target.id.clone(), e));
                    }
                }
            }
        }

        if !report.written.is_empty() {
            *self.inner.last_push.write().await = Some(Instant::now());
            let mut state = self.inner.state.write().await;
            state.last_applied = state.last_applied.max(newest);
        }

        // 4. Outcome mode
        if !report.conflicted.is_empty() {
            self.inner.state.write().await.role = SyncRole::Mirroring;
            self.set_status(SyncStatus::new(
                SyncMode::Mirroring,
                "Changed on another device",
            ))
            .await;
        } else if report.written.is_empty() {
            self.settle("Backup failed").await;
        } else {
            self.settle("Synced").await;
        }

        Ok(Some(report))
    }

    /// Retry a rejected push when the provider still holds a snapshot owned by
    /// this device, e.g. one put back after another device's aborted take-over
    async fn reclaim(&self, target: &Target, content: &str) -> Result<WriteReceipt, ProviderError> {
        let token = match target.adapter.fetch_metadata().await? {
            Some(meta) => meta.concurrency_token,
            None => None,
        };
        let Some(remote) = target.adapter.fetch_content().await? else {
            return Err(ProviderError::ConcurrencyConflict);
        };

        match self.open_bundle(&remote).await {
            Ok(snapshot) if snapshot.owner_device_id == self.inner.device_id => {
                log::info!("{} still holds this device's snapshot, rewriting", target.id);
                target.adapter.write(content, token.as_deref()).await
            }
            Ok(snapshot) => {
                log::debug!("{} now owned by {}", target.id, snapshot.owner_device_id);
                Err(ProviderError::ConcurrencyConflict)
            }
            Err(e) => {
                log::debug!("Could not inspect {} after a conflict: {}", target.id, e);
                Err(ProviderError::ConcurrencyConflict)
            }
        }
    }

    async fn wait_for_throttle(&self) {
        let last = *self.inner.last_push.read().await;
        if let Some(last) = last {
            let elapsed = last.elapsed();
            let throttle = self.inner.config.throttle();
            if elapsed < throttle {
                log::debug!("Throttling push for {:?}", throttle - elapsed);
                tokio::time::sleep(throttle - elapsed).await;
            }
        }
    }

    /// Snapshot the dataset as this device and encrypt it
    async fn seal_local_snapshot(&self) -> Result<(i64, SealedSnapshot), SyncError> {
        let (credential, hint) = {
            let credentials = self.inner.credentials.lock().await;
            (credentials.current().cloned(), credentials.phone_hint())
        };
        let Some(credential) = credential else {
            self.set_status(SyncStatus::new(
                SyncMode::Attention,
                "Set identifier and passphrase to encrypt",
            ))
            .await;
            return Err(SyncError::MissingCredentials);
        };

        let updated_at = self.next_timestamp().await;
        let snapshot = match self.inner.codec.build_snapshot(
            self.inner.store.as_ref(),
            &self.inner.device_id,
            updated_at,
        ) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.set_status(SyncStatus::new(SyncMode::Degraded, "Could not read local data"))
                    .await;
                return Err(e.into());
            }
        };

        match self.inner.codec.encrypt(&snapshot, &credential, &hint) {
            Ok(sealed) => Ok((updated_at, sealed)),
            Err(CryptoError::PayloadTooLarge { size, limit }) => {
                log::warn!("Snapshot too large: {} bytes (limit {})", size, limit);
                self.set_status(SyncStatus::new(
                    SyncMode::Attention,
                    format!("Backup exceeds the {} MB limit", limit / (1024 * 1024)),
                ))
                .await;
                Err(CryptoError::PayloadTooLarge { size, limit }.into())
            }
            Err(e) => {
                self.set_status(SyncStatus::new(SyncMode::Attention, "Encryption failed"))
                    .await;
                Err(e.into())
            }
        }
    }

    /// Current time in ms, strictly after anything already applied
    async fn next_timestamp(&self) -> i64 {
        let last_applied = self.last_applied().await;
        Utc::now().timestamp_millis().max(last_applied + 1)
    }

    // ------------------------------------------------------------------------
    // Pull
    // ------------------------------------------------------------------------

    /// Poll step: pull only while mirroring another device
    pub async fn poll_tick(&self) -> Result<PullOutcome, SyncError> {
        if self.role().await != SyncRole::Mirroring {
            return Ok(PullOutcome::Skipped);
        }
        self.pull_now().await
    }

    /// Fetch the newest remote bundle and apply it if it is newer than local data
    pub async fn pull_now(&self) -> Result<PullOutcome, SyncError> {
        let _op = self.inner.operation.lock().await;
        self.pull_locked().await
    }

    async fn pull_locked(&self) -> Result<PullOutcome, SyncError> {
        let targets = self.targets().await;
        if targets.is_empty() {
            let any_connected = self
                .inner
                .providers
                .read()
                .await
                .iter()
                .any(|s| s.state.connected);
            if !any_connected {
                return Err(SyncError::NoProviders);
            }
            self.refresh_status().await;
            return Ok(PullOutcome::NoRemote);
        }

        // 1. Metadata fan-out
        let results = join_all(targets.iter().map(|t| t.adapter.fetch_metadata())).await;
        let mut candidates: Vec<(&Target, RemoteMetadata)> = Vec::new();
        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(meta) => {
                    self.record_metadata(&target.id, meta.as_ref()).await;
                    if let Some(meta) = meta.filter(|m| m.exists) {
                        candidates.push((target, meta));
                    }
                }
                Err(e) => {
                    log::warn!("Metadata check on {} failed: {}", target.id, e);
                    self.update_provider(&target.id, |state| apply_failure(state, &e))
                        .await;
                }
            }
        }

        if candidates.is_empty() {
            self.refresh_status().await;
            return Ok(PullOutcome::NoRemote);
        }

        // 2. Newest wins; the sort is stable so ties keep configured order
        candidates.sort_by(|a, b| b.1.last_modified_ms().cmp(&a.1.last_modified_ms()));
        let (target, meta) = &candidates[0];
        let remote_ms = meta.last_modified_ms();

        if remote_ms <= self.last_applied().await {
            self.refresh_status().await;
            return Ok(PullOutcome::UpToDate);
        }

        let marker = format!(
            "{}:{}",
            target.id,
            meta.concurrency_token
                .clone()
                .unwrap_or_else(|| remote_ms.to_string())
        );
        if self.inner.state.read().await.undecryptable.as_deref() == Some(marker.as_str()) {
            log::debug!("Skipping bundle on {} that failed to decrypt", target.id);
            return Ok(PullOutcome::Skipped);
        }

        // 3. Credentials are needed before anything is downloaded
        if !self.has_credentials().await {
            self.set_status(SyncStatus::new(
                SyncMode::Attention,
                "Enter identifier and passphrase to open the remote backup",
            ))
            .await;
            return Err(SyncError::MissingCredentials);
        }

        self.set_status(SyncStatus::new(
            SyncMode::Updating,
            format!("Downloading from {}", target.id),
        ))
        .await;

        // 4. Download
        let content = match target.adapter.fetch_content().await {
            Ok(Some(content)) => content,
            Ok(None) => {
                self.refresh_status().await;
                return Ok(PullOutcome::NoRemote);
            }
            Err(e) => {
                log::warn!("Download from {} failed: {}", target.id, e);
                self.update_provider(&target.id, |state| apply_failure(state, &e))
                    .await;
                self.settle("Download failed").await;
                return Err(SyncError::provider(&target.id, e));
            }
        };

        // 5. Decrypt
        let snapshot = match self.open_bundle(&content).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Could not open bundle from {}: {}", target.id, e);
                let detail = match &e {
                    SyncError::MissingCredentials => {
                        "Enter identifier and passphrase to open the remote backup".to_string()
                    }
                    SyncError::Crypto(CryptoError::DecryptionFailed) => {
                        "Could not decrypt the remote backup - check identifier and passphrase"
                            .to_string()
                    }
                    other => format!("Remote backup unreadable: {}", other),
                };
                if !matches!(e, SyncError::MissingCredentials) {
                    self.inner.state.write().await.undecryptable = Some(marker);
                }
                self.set_status(SyncStatus::new(SyncMode::Attention, detail))
                    .await;
                return Err(e);
            }
        };

        // 6. Full replace
        let report = match apply_snapshot(&snapshot, self.inner.store.as_ref()) {
            Ok(report) => report,
            Err(e) => {
                log::error!("Failed to apply snapshot from {}: {}", target.id, e);
                self.set_status(SyncStatus::new(
                    SyncMode::Degraded,
                    "Failed to apply remote backup",
                ))
                .await;
                return Err(e.into());
            }
        };

        {
            let mut state = self.inner.state.write().await;
            state.last_applied = state.last_applied.max(snapshot.updated_at).max(remote_ms);
        }
        log::info!(
            "Applied snapshot {} from {} (device {}): {} created, {} updated, {} deleted",
            snapshot.updated_at,
            target.id,
            snapshot.owner_device_id,
            report.created,
            report.updated,
            report.deleted
        );
        self.settle(&format!("Replicated from {}", target.id)).await;

        Ok(PullOutcome::Applied {
            provider: target.id.clone(),
            report,
        })
    }

    /// Parse and decrypt a bundle, adopting its KDF parameters on success
    async fn open_bundle(&self, content: &str) -> Result<Snapshot, SyncError> {
        enforce_bundle_limit(content.len(), self.inner.config.max_bundle_bytes)?;
        let bundle = parse_bundle(content)?;

        let lookup = self.inner.credentials.lock().await.lookup(&bundle.kdf)?;
        let (material, derived) = match lookup {
            KeyLookup::NoSecret => return Err(SyncError::MissingCredentials),
            KeyLookup::Ready(material) => (material, None),
            KeyLookup::Derive(pending) => {
                let (pending, material) = derive_off_runtime(pending).await?;
                (material, Some(pending))
            }
        };
        let snapshot = self.inner.codec.decrypt(&bundle, &material)?;

        let mut credentials = self.inner.credentials.lock().await;
        if let Some(pending) = &derived {
            if !credentials.remember(pending, material.clone()) {
                log::debug!("Credentials replaced while deriving, not caching key");
                return Ok(snapshot);
            }
        }

        let is_current = credentials
            .current()
            .is_some_and(|current| current.matches(&bundle.kdf));
        if !is_current {
            log::info!("Adopting KDF parameters from remote bundle");
            credentials.adopt(material);
            drop(credentials);
            self.persist_kdf_params(&bundle.kdf);
        }

        Ok(snapshot)
    }

    // ------------------------------------------------------------------------
    // Take control
    // ------------------------------------------------------------------------

    /// Make this device the owner of the data
    ///
    /// 1. Pull, so nothing newer than local data is overwritten
    /// 2. Verify every provider still carries the token seen by that pull, and
    ///    keep what it holds
    /// 3. Write a snapshot owned by this device with those tokens as conditions
    ///
    /// A conflict aborts with `ConcurrencyConflict`: providers already written
    /// get their previous content back and the role stays unchanged. Success
    /// makes the role Active.
    pub async fn take_control(&self) -> Result<PushReport, SyncError> {
        let _op = self.inner.operation.lock().await;

        if !self.has_credentials().await {
            self.set_status(SyncStatus::new(
                SyncMode::Attention,
                "Set identifier and passphrase before taking control",
            ))
            .await;
            return Err(SyncError::MissingCredentials);
        }

        // 1. Pull
        self.pull_locked().await?;

        let targets = self.targets().await;
        if targets.is_empty() {
            return Err(SyncError::NoProviders);
        }

        // 2. Metadata pre-check
        let checks = join_all(targets.iter().map(|t| t.adapter.fetch_metadata())).await;
        let mut verified = Vec::with_capacity(targets.len());
        let mut report = PushReport::default();
        for (target, check) in targets.into_iter().zip(checks) {
            match check {
                Ok(meta) => {
                    let current = meta.and_then(|m| m.concurrency_token);
                    if current != target.token {
                        log::warn!(
                            "Take control aborted: {} changed (expected {:?}, found {:?})",
                            target.id,
                            target.token,
                            current
                        );
                        self.report_take_control_conflict().await;
                        return Err(SyncError::ConcurrencyConflict);
                    }
                    verified.push(target);
                }
                Err(e) => {
                    log::warn!("Metadata check on {} failed: {}", target.id, e);
                    self.update_provider(&target.id, |state| apply_failure(state, &e))
                        .await;
                    report.failed.push((target.id.clone(), e));
                }
            }
        }

        // Previous content, put back if a later provider rejects the take-over
        let priors = join_all(verified.iter().map(|t| async move {
            match t.token {
                Some(_) => t.adapter.fetch_content().await,
                None => Ok(None),
            }
        }))
        .await;
        let mut writable = Vec::with_capacity(verified.len());
        for (target, prior) in verified.into_iter().zip(priors) {
            match prior {
                Ok(prior) => writable.push((target, prior)),
                Err(e) => {
                    log::warn!("Could not read {} before taking control: {}", target.id, e);
                    self.update_provider(&target.id, |state| apply_failure(state, &e))
                        .await;
                    report.failed.push((target.id.clone(), e));
                }
            }
        }

        // 3. Snapshot owned by this device
        self.set_status(SyncStatus::new(SyncMode::Updating, "Taking control"))
            .await;
        let (updated_at, sealed) = self.seal_local_snapshot().await?;
        report.updated_at = updated_at;

        // 4. Conditional writes in configured order
        let mut written: Vec<(&Target, Option<&str>, WriteReceipt)> = Vec::new();
        for (target, prior) in &writable {
            match target.adapter.write(&sealed.content, target.token.as_deref()).await {
                Ok(receipt) => written.push((target, prior.as_deref(), receipt)),
                Err(ProviderError::ConcurrencyConflict) => {
                    log::warn!("Take control aborted: {} rejected the write", target.id);
                    self.restore_previous(written).await;
                    self.report_take_control_conflict().await;
                    return Err(SyncError::ConcurrencyConflict);
                }
                Err(e) => {
                    log::warn!("Take control write to {} failed: {}", target.id, e);
                    self.update_provider(&target.id, |state| apply_failure(state, &e))
                        .await;
                    report.failed.push((target.id.clone(), e));
                }
            }
        }

        if written.is_empty() {
            self.settle("Could not take control").await;
            return Err(match report.failed.into_iter().next() {
                Some((id, e)) => SyncError::provider(&id, e),
                None => SyncError::NoProviders,
            });
        }

        let mut newest = updated_at;
        for (target, _, receipt) in written {
            newest = newest.max(receipt_ms(&receipt));
            self.update_provider(&target.id, |state| apply_receipt(state, receipt))
                .await;
            report.written.push(target.id.clone());
        }

        *self.inner.last_push.write().await = Some(Instant::now());
        {
            let mut state = self.inner.state.write().await;
            state.role = SyncRole::Active;
            state.last_applied = state.last_applied.max(newest);
        }
        log::info!("Device {} took control", self.inner.device_id);
        self.settle("This device took control").await;

        Ok(report)
    }

    /// Undo the writes of an aborted take-over, newest first
    ///
    /// Each rewrite is conditioned on the token of this device's own write, so
    /// a provider that changed again in the meantime is left alone.
    async fn restore_previous(&self, written: Vec<(&Target, Option<&str>, WriteReceipt)>) {
        for (target, prior, receipt) in written.into_iter().rev() {
            let restored = match prior {
                Some(content) => target
                    .adapter
                    .write(content, receipt.concurrency_token.as_deref())
                    .await
                    .map(Some),
                None => target.adapter.delete().await.map(|_| None),
            };
            match restored {
                Ok(Some(receipt)) => {
                    log::info!("Restored previous backup on {}", target.id);
                    self.update_provider(&target.id, |state| apply_receipt(state, receipt))
                        .await;
                }
                Ok(None) => {
                    log::info!("Removed take-over snapshot from {}", target.id);
                    self.record_metadata(&target.id, None).await;
                }
                Err(e) => {
                    log::error!("Could not restore previous backup on {}: {}", target.id, e);
                    self.update_provider(&target.id, |state| apply_failure(state, &e))
                        .await;
                }
            }
        }
    }

    async fn report_take_control_conflict(&self) {
        let role = self.role().await;
        self.set_status(SyncStatus::new(
            role.mode(),
            "Changed on another device, try again",
        ))
        .await;
    }

    // ------------------------------------------------------------------------
    // Standby
    // ------------------------------------------------------------------------

    /// Pause polling after a long idle period; returns true when the role changed
    pub async fn enter_standby(&self) -> bool {
        {
            let mut state = self.inner.state.write().await;
            if !matches!(state.role, SyncRole::Mirroring | SyncRole::Active) {
                return false;
            }
            state.role = SyncRole::Standby;
        }
        log::info!("Entering standby");
        self.set_status(SyncStatus::new(SyncMode::Standby, SyncRole::Standby.default_detail()))
            .await;
        true
    }

    /// Leave Standby for Mirroring; returns true when the role changed
    pub async fn resume(&self) -> bool {
        {
            let mut state = self.inner.state.write().await;
            if state.role != SyncRole::Standby {
                return false;
            }
            state.role = SyncRole::Mirroring;
        }
        log::info!("Resuming from standby");
        self.set_status(SyncStatus::new(SyncMode::Mirroring, "Resuming")).await;
        true
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    async fn adapter(&self, id: &str) -> Result<Arc<dyn ProviderAdapter>, SyncError> {
        self.inner
            .providers
            .read()
            .await
            .iter()
            .find(|slot| slot.adapter.id() == id)
            .map(|slot| slot.adapter.clone())
            .ok_or_else(|| SyncError::UnknownProvider(id.to_string()))
    }

    /// Enabled providers that can be called now, in configured order
    async fn targets(&self) -> Vec<Target> {
        let now = Instant::now();
        let mut providers = self.inner.providers.write().await;
        providers
            .iter_mut()
            .filter_map(|slot| {
                if !slot.state.connected || slot.state.needs_reauth {
                    return None;
                }
                if let Some(until) = slot.state.retry_after {
                    if until > now {
                        log::debug!("Skipping rate-limited provider {}", slot.adapter.id());
                        return None;
                    }
                    slot.state.retry_after = None;
                }
                Some(Target {
                    id: slot.adapter.id().to_string(),
                    adapter: slot.adapter.clone(),
                    token: slot.state.concurrency_token.clone(),
                })
            })
            .collect()
    }

    async fn update_provider<F>(&self, id: &str, update: F)
    where
        F: FnOnce(&mut ProviderConnectionState),
    {
        let mut providers = self.inner.providers.write().await;
        if let Some(slot) = providers.iter_mut().find(|s| s.adapter.id() == id) {
            update(&mut slot.state);
        }
    }

    async fn record_metadata(&self, id: &str, meta: Option<&RemoteMetadata>) {
        self.update_provider(id, |state| {
            state.degraded = false;
            state.needs_reauth = false;
            match meta {
                Some(meta) => {
                    state.concurrency_token = meta.concurrency_token.clone();
                    state.last_known_modified = meta.last_modified;
                }
                None => {
                    state.concurrency_token = None;
                    state.last_known_modified = None;
                }
            }
        })
        .await;
    }

    /// Role mode with `detail`, unless a provider overlay applies
    async fn settle(&self, detail: &str) -> SyncStatus {
        let overlay = {
            let providers = self.inner.providers.read().await;
            let connected = providers.iter().filter(|s| s.state.connected);
            let reauth: Vec<&str> = connected
                .clone()
                .filter(|s| s.state.needs_reauth)
                .map(|s| s.adapter.id())
                .collect();
            let degraded: Vec<&str> = connected
                .filter(|s| s.state.degraded && !s.state.needs_reauth)
                .map(|s| s.adapter.id())
                .collect();

            if !reauth.is_empty() {
                Some(SyncStatus::new(
                    SyncMode::Attention,
                    format!("{}: sign in again", reauth.join(", ")),
                ))
            } else if !degraded.is_empty() {
                Some(SyncStatus::new(
                    SyncMode::Degraded,
                    format!("{} unavailable", degraded.join(", ")),
                ))
            } else {
                None
            }
        };

        let status = match overlay {
            Some(status) => status,
            None => SyncStatus::new(self.role().await.mode(), detail),
        };
        self.set_status(status).await
    }

    /// Re-settle, keeping the current detail when no overlay is showing
    async fn refresh_status(&self) -> SyncStatus {
        let (role, status) = {
            let state = self.inner.state.read().await;
            (state.role, state.status.clone())
        };
        if status.mode == role.mode() {
            self.settle(&status.detail).await
        } else {
            self.settle(role.default_detail()).await
        }
    }

    async fn set_status(&self, status: SyncStatus) -> SyncStatus {
        {
            let mut state = self.inner.state.write().await;
            if state.status == status {
                return status;
            }
            state.status = status.clone();
        }
        log::info!("Sync status: {} - {}", status.mode, status.detail);
        self.inner.channel.publish(&status);
        status
    }

    fn load_kdf_params(&self) -> Option<KdfParams> {
        match self.inner.settings.get(KDF_PARAMS_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<KdfParams>(&raw) {
                Ok(params) if params.iterations > MAX_KDF_ITERATIONS => {
                    log::warn!(
                        "Ignoring persisted KDF parameters with {} iterations",
                        params.iterations
                    );
                    None
                }
                Ok(params) => Some(params),
                Err(e) => {
                    log::warn!("Ignoring unreadable KDF parameters: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                log::warn!("Could not load KDF parameters: {}", e);
                None
            }
        }
    }

    fn persist_kdf_params(&self, params: &KdfParams) {
        let result = serde_json::to_string(params)
            .map_err(DatasetError::from)
            .and_then(|raw| self.inner.settings.set(KDF_PARAMS_KEY, &raw));
        if let Err(e) = result {
            log::warn!("Could not persist KDF parameters: {}", e);
        }
    }
}

// ============================================================================
// Provider State Helpers
// ============================================================================

fn is_auth_error(err: &ProviderError) -> bool {
    matches!(err, ProviderError::AuthExpired | ProviderError::NotAuthenticated)
}

fn apply_failure(state: &mut ProviderConnectionState, err: &ProviderError) {
    match err {
        ProviderError::AuthExpired | ProviderError::NotAuthenticated => {
            state.needs_reauth = true;
            state.degraded = true;
        }
        ProviderError::RateLimited { retry_after } => {
            state.degraded = true;
            state.retry_after = Some(Instant::now() + retry_after.unwrap_or(RATE_LIMIT_FALLBACK));
        }
        ProviderError::ConcurrencyConflict => {}
        ProviderError::NetworkFailure(_) | ProviderError::InvalidResponse(_) => {
            state.degraded = true;
        }
    }
}

fn apply_receipt(state: &mut ProviderConnectionState, receipt: WriteReceipt) {
    state.concurrency_token = receipt.concurrency_token;
    state.last_known_modified = receipt.last_modified;
    state.degraded = false;
    state.needs_reauth = false;
}

fn receipt_ms(receipt: &WriteReceipt) -> i64 {
    receipt
        .last_modified
        .map(|t| t.timestamp_millis())
        .unwrap_or(0)
}

/// Write with the last known token, reading metadata first when there is none
async fn write_with_known_token(
    target: &Target,
    content: &str,
) -> Result<WriteReceipt, ProviderError> {
    let token = match &target.token {
        Some(token) => Some(token.clone()),
        None => target
            .adapter
            .fetch_metadata()
            .await?
            .and_then(|meta| meta.concurrency_token),
    };
    target.adapter.write(content, token.as_deref()).await
}

/// Run a key derivation on the blocking pool
async fn derive_off_runtime(
    pending: PendingKey,
) -> Result<(PendingKey, CredentialMaterial), SyncError> {
    let (pending, result) = tokio::task::spawn_blocking(move || {
        let result = pending.derive();
        (pending, result)
    })
    .await
    .map_err(|e| SyncError::Internal(format!("key derivation task failed: {}", e)))?;
    Ok((pending, result?))
}

// ============================================================================
// Tests
// ============================================================================
