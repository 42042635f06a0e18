//! Sync Module - Encrypted Multi-Provider Snapshot Replication
//!
//! Mirrors the local project dataset to zero or more storage providers
//! (Google Drive, OneDrive) without a coordinating server.
//!
//! Architecture:
//! - Zero-Knowledge: providers only ever store an encrypted bundle
//! - E2E Encryption: PBKDF2-HMAC-SHA256 key from identifier + passphrase, AES-256-GCM
//! - Whole-snapshot replication: last writer wins, with a manual take-control
//! - Optimistic concurrency: conditional writes against each provider's token
//! - Per-provider health: one failing backend never blocks the others

pub mod crypto;
pub mod dataset;
pub mod device;
pub mod models;
pub mod orchestrator;
pub mod provider;
pub mod scheduler;
pub mod snapshot;
pub mod status;


// Re-export commonly used types
pub use crypto::{
    derive_key, normalize_phone_br, phone_hint, CredentialManager, CredentialMaterial,
    CryptoError, KeyLookup, PendingKey, Secret, MAX_KDF_ITERATIONS,
};

pub use models::{
    EncryptedBundle, KdfParams, ProjectMeta, ProjectPayload, ProviderConnectionState, Snapshot,
    SyncConfig, SyncMode, SyncStatus,
};

pub use dataset::{
    DatasetError, KeyValueStore, MemoryKeyValueStore, MemoryProjectStore, ProjectStore,
};
pub use device::get_or_create_device_id;
pub use orchestrator::{PullOutcome, PushReport, SyncError, SyncOrchestrator, SyncRole};
pub use provider::{
    GoogleDriveAdapter, MemoryBackend, MemoryProvider, OneDriveAdapter, ProviderAdapter,
    ProviderError, RemoteMetadata, StaticToken, TokenProvider, WriteReceipt,
};
pub use scheduler::{SchedulerError, SchedulerHandle, SchedulerSignal, SyncScheduler};
pub use snapshot::{apply_snapshot, ApplyReport, SnapshotCodec};
pub use status::{StatusChannel, StatusMessage};
