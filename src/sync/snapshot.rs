//! Snapshot Codec - Build, Seal, Open & Apply
//!
//! Follows the encryption process of the sync design:
//! 1. Collect every project from the host store into a versioned Snapshot
//! 2. Serialize to JSON and seal with AES-256-GCM (fresh nonce per call)
//! 3. Wrap with the KDF parameters and a phone hint into an EncryptedBundle
//! 4. Reject bundles above the hard size cap before anything touches the network
//!
//! Applying a snapshot is a full replace of the local dataset, never a merge.

use std::collections::{BTreeMap, BTreeSet};

use super::crypto::{
    decode_base64url, encode_base64url, generate_nonce, AeadCipher, Aes256Gcm, CredentialMaterial,
    CryptoError,
};
use super::dataset::{DatasetError, ProjectStore};
use super::models::{
    EncryptedBundle, ProjectPayload, Snapshot, MAX_BUNDLE_BYTES, SNAPSHOT_VERSION,
};

/// Encrypted bundle together with its serialized wire form
#[derive(Debug, Clone)]
pub struct SealedSnapshot {
    pub bundle: EncryptedBundle,

    /// JSON text written to the backends
    pub content: String,
}

/// Counts of what a full-replace apply did to the local store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

pub struct SnapshotCodec {
    cipher: Box<dyn AeadCipher>,
    max_bundle_bytes: usize,
}

impl Default for SnapshotCodec {
    fn default() -> Self {
        Self::new(MAX_BUNDLE_BYTES)
    }
}

impl SnapshotCodec {
    pub fn new(max_bundle_bytes: usize) -> Self {
        Self::with_cipher(Box::new(Aes256Gcm), max_bundle_bytes)
    }

    pub fn with_cipher(cipher: Box<dyn AeadCipher>, max_bundle_bytes: usize) -> Self {
        Self {
            cipher,
            max_bundle_bytes,
        }
    }

    pub fn max_bundle_bytes(&self) -> usize {
        self.max_bundle_bytes
    }

    /// Read every record from the host store into a snapshot
    ///
    /// Records that disappear between listing and reading are left out so the
    /// metas/map invariant holds.
    pub fn build_snapshot(
        &self,
        store: &dyn ProjectStore,
        owner_device_id: &str,
        updated_at: i64,
    ) -> Result<Snapshot, DatasetError> {
        let mut metas = Vec::new();
        let mut map = BTreeMap::new();

        for meta in store.list_projects()? {
            if map.contains_key(&meta.id) {
                continue;
            }
            match store.get_project(&meta.id)? {
                Some(payload) => {
                    map.insert(meta.id.clone(), payload);
                    metas.push(meta);
                }
                None => log::debug!("Project {} vanished while building snapshot", meta.id),
            }
        }

        Ok(Snapshot {
            version: SNAPSHOT_VERSION,
            owner_device_id: owner_device_id.to_string(),
            updated_at,
            metas,
            map,
        })
    }

    /// Seal a snapshot into a bundle
    ///
    /// # Errors
    /// `PayloadTooLarge` when the serialized bundle exceeds the configured cap.
    pub fn encrypt(
        &self,
        snapshot: &Snapshot,
        credential: &CredentialMaterial,
        phone_hint: &str,
    ) -> Result<SealedSnapshot, CryptoError> {
        // 1. Serialize
        let plaintext = zeroize::Zeroizing::new(serde_json::to_vec(snapshot)?);

        // 2. Seal with a fresh nonce
        let nonce = generate_nonce()?;
        let ciphertext = self.cipher.seal(&credential.key, &nonce, &plaintext)?;

        // 3. Wrap
        let bundle = EncryptedBundle {
            version: snapshot.version,
            kdf: credential.kdf_params(),
            iv: encode_base64url(&nonce),
            ciphertext: encode_base64url(&ciphertext),
            phone_hint: phone_hint.to_string(),
            updated_at: snapshot.updated_at,
            owner_device_id: snapshot.owner_device_id.clone(),
        };

        // 4. Size gate
        let content = serde_json::to_string(&bundle)?;
        enforce_bundle_limit(content.len(), self.max_bundle_bytes)?;

        Ok(SealedSnapshot { bundle, content })
    }

    /// Open a bundle
    ///
    /// # Errors
    /// `DecryptionFailed` for any tag mismatch or malformed nonce/ciphertext;
    /// `InvalidSnapshot` when the decrypted metas and map disagree.
    pub fn decrypt(
        &self,
        bundle: &EncryptedBundle,
        credential: &CredentialMaterial,
    ) -> Result<Snapshot, CryptoError> {
        if bundle.version > SNAPSHOT_VERSION {
            return Err(CryptoError::InvalidBundle(format!(
                "unsupported bundle version {}",
                bundle.version
            )));
        }

        let nonce = decode_base64url(&bundle.iv).map_err(|_| CryptoError::DecryptionFailed)?;
        let ciphertext =
            decode_base64url(&bundle.ciphertext).map_err(|_| CryptoError::DecryptionFailed)?;

        let plaintext = zeroize::Zeroizing::new(self.cipher.open(&credential.key, &nonce, &ciphertext)?);

        let snapshot: Snapshot = serde_json::from_slice(&plaintext)
            .map_err(|e| CryptoError::InvalidBundle(format!("snapshot payload: {}", e)))?;

        if !snapshot.is_consistent() {
            return Err(CryptoError::InvalidSnapshot);
        }

        Ok(snapshot)
    }
}

/// Parse the text stored on a backend into a bundle
pub fn parse_bundle(text: &str) -> Result<EncryptedBundle, CryptoError> {
    serde_json::from_str(text).map_err(|e| CryptoError::InvalidBundle(e.to_string()))
}

/// Fail with `PayloadTooLarge` when `size` exceeds `limit`
pub fn enforce_bundle_limit(size: usize, limit: usize) -> Result<(), CryptoError> {
    if size > limit {
        return Err(CryptoError::PayloadTooLarge { size, limit });
    }
    Ok(())
}

/// Replace the local dataset with the snapshot's contents
///
/// Stores with an atomic `replace_all` get the whole snapshot at once.
/// Otherwise, record by record:
/// 1. Delete local records whose id is not in the snapshot
/// 2. Create records missing locally, overwrite the rest
pub fn apply_snapshot(
    snapshot: &Snapshot,
    store: &dyn ProjectStore,
) -> Result<ApplyReport, DatasetError> {
    let records: Vec<(&str, &ProjectPayload)> = snapshot
        .metas
        .iter()
        .filter_map(|meta| snapshot.map.get(&meta.id).map(|p| (meta.id.as_str(), p)))
        .collect();
    if let Some(report) = store.replace_all(&records)? {
        return Ok(report);
    }

    let mut report = ApplyReport::default();

    let local_ids: BTreeSet<String> = store.list_projects()?.into_iter().map(|m| m.id).collect();

    for id in local_ids.iter().filter(|id| !snapshot.map.contains_key(*id)) {
        store.delete_project(id)?;
        report.deleted += 1;
    }

    for meta in &snapshot.metas {
        let Some(payload) = snapshot.map.get(&meta.id) else {
            continue;
        };
        if local_ids.contains(&meta.id) {
            store.update_project(&meta.id, payload)?;
            report.updated += 1;
        } else {
            store.create_project(&meta.id, payload)?;
            report.created += 1;
        }
    }

    Ok(report)
}

/// Newest `updatedAt` among local records (0 when none carry one)
pub fn local_watermark(store: &dyn ProjectStore) -> Result<i64, DatasetError> {
    let mut newest = 0;
    for meta in store.list_projects()? {
        let from_meta = meta.updated_at();
        let stamp = match from_meta {
            Some(stamp) => Some(stamp),
            None => store
                .get_project(&meta.id)?
                .and_then(|p| p.get("updatedAt").and_then(|v| v.as_i64())),
        };
        newest = newest.max(stamp.unwrap_or(0));
    }
    Ok(newest)
}

// ============================================================================
// Tests
// ============================================================================
