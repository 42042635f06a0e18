//! Sync Crypto Module - Key Derivation & Authenticated Encryption
//!
//! Implements the client-side half of the zero-knowledge design:
//! - identifier + passphrase → PBKDF2-HMAC-SHA256 → 256-bit snapshot key
//! - AES-256-GCM with a random 96-bit nonce per encryption
//! - Zeroize for every buffer that holds key material
//!
//! Security Properties:
//! - Backends only ever see ciphertext plus the (public) KDF parameters
//! - The same secret + salt + iterations always yields the same key, so a second
//!   device can open a bundle produced elsewhere
//! - The key is never logged, serialized or persisted

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::models::{KdfParams, SyncConfig, DEFAULT_KDF_ITERATIONS, MIN_PASSPHRASE_LEN};

pub const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;
pub const SALT_LEN: usize = 16;

/// Algorithm label written into `kdf.algorithm`
pub const KDF_ALGORITHM: &str = "PBKDF2";

/// Upper bound on PBKDF2 iterations, for local settings and remote bundles alike
pub const MAX_KDF_ITERATIONS: u32 = 10 * DEFAULT_KDF_ITERATIONS;

/// URL-safe base64; encodes without padding, accepts padded and unpadded input
const BASE64URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Passphrase must be at least {min} characters")]
    WeakSecret { min: usize },

    #[error("Identifier cannot be empty")]
    InvalidIdentifier,

    #[error("Invalid phone number: expected 11 digits (area code + 9 digits)")]
    InvalidPhone,

    #[error("Iteration count must be between 1 and {}", MAX_KDF_ITERATIONS)]
    InvalidIterations,

    #[error("Unsupported key derivation algorithm: {0}")]
    UnsupportedKdf(String),

    #[error("Encrypted payload is {size} bytes, limit is {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Decryption failed - wrong passphrase or corrupted bundle")]
    DecryptionFailed,

    #[error("Invalid bundle: {0}")]
    InvalidBundle(String),

    #[error("Snapshot metas and map are inconsistent")]
    InvalidSnapshot,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Random number generator failure")]
    Rng,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ============================================================================
// Capability Traits
// ============================================================================

/// Password-based key derivation primitive
pub trait Kdf: Send + Sync {
    fn algorithm(&self) -> &'static str;

    fn derive(
        &self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        out: &mut [u8],
    ) -> Result<(), CryptoError>;
}

/// Authenticated encryption primitive (ciphertext carries its tag)
pub trait AeadCipher: Send + Sync {
    fn seal(
        &self,
        key: &SymmetricKey,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    fn open(
        &self,
        key: &SymmetricKey,
        nonce: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}

/// PBKDF2-HMAC-SHA256 backed by ring
#[derive(Debug, Default, Clone, Copy)]
pub struct Pbkdf2Sha256;

impl Kdf for Pbkdf2Sha256 {
    fn algorithm(&self) -> &'static str {
        KDF_ALGORITHM
    }

    fn derive(
        &self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        out: &mut [u8],
    ) -> Result<(), CryptoError> {
        let iterations = NonZeroU32::new(iterations).ok_or(CryptoError::InvalidIterations)?;
        pbkdf2::derive(pbkdf2::PBKDF2_HMAC_SHA256, iterations, salt, password, out);
        Ok(())
    }
}

/// AES-256-GCM backed by ring
#[derive(Debug, Default, Clone, Copy)]
pub struct Aes256Gcm;

impl Aes256Gcm {
    fn key(key: &SymmetricKey) -> Result<LessSafeKey, CryptoError> {
        let unbound = UnboundKey::new(&AES_256_GCM, key.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed)?;
        Ok(LessSafeKey::new(unbound))
    }
}

impl AeadCipher for Aes256Gcm {
    fn seal(
        &self,
        key: &SymmetricKey,
        nonce: &[u8; NONCE_LEN],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let key = Self::key(key)?;
        let mut in_out = plaintext.to_vec();
        key.seal_in_place_append_tag(Nonce::assume_unique_for_key(*nonce), Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        Ok(in_out)
    }

    fn open(
        &self,
        key: &SymmetricKey,
        nonce: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let key = Self::key(key)?;
        let nonce =
            Nonce::try_assume_unique_for_key(nonce).map_err(|_| CryptoError::DecryptionFailed)?;

        let mut in_out = ciphertext.to_vec();
        let plaintext_len = key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::DecryptionFailed)?
            .len();
        in_out.truncate(plaintext_len);
        Ok(in_out)
    }
}

// ============================================================================
// Key Material
// ============================================================================

/// 256-bit key that wipes itself on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(<redacted>)")
    }
}

/// Human-supplied secret: identifier (phone number) + passphrase
#[derive(Clone)]
pub struct Secret {
    identifier: String,
    passphrase: Zeroizing<String>,
}

impl Secret {
    pub fn new(identifier: impl Into<String>, passphrase: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into().trim().to_string(),
            passphrase: Zeroizing::new(passphrase.into()),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Identifier as fed to the KDF: its 11 national digits
    pub fn normalized_identifier(&self) -> Result<String, CryptoError> {
        if self.identifier.is_empty() {
            return Err(CryptoError::InvalidIdentifier);
        }
        normalize_phone_br(&self.identifier)
    }

    /// Bytes fed to the KDF: `digits:passphrase`
    fn kdf_input(&self, min_passphrase_len: usize) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let identifier = Zeroizing::new(self.normalized_identifier()?);
        if self.passphrase.chars().count() < min_passphrase_len {
            return Err(CryptoError::WeakSecret {
                min: min_passphrase_len,
            });
        }

        let mut input = Vec::with_capacity(identifier.len() + 1 + self.passphrase.len());
        input.extend_from_slice(identifier.as_bytes());
        input.push(b':');
        input.extend_from_slice(self.passphrase.as_bytes());
        Ok(Zeroizing::new(input))
    }

    fn validate(&self, min_passphrase_len: usize) -> Result<(), CryptoError> {
        self.kdf_input(min_passphrase_len).map(|_| ())
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("identifier", &phone_hint(&self.identifier))
            .finish_non_exhaustive()
    }
}

/// Derived key plus the public parameters needed to re-derive it elsewhere
#[derive(Clone)]
pub struct CredentialMaterial {
    pub key: SymmetricKey,
    pub salt: Vec<u8>,
    pub iterations: u32,
}

impl CredentialMaterial {
    /// Parameters written into every bundle's `kdf` field
    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            algorithm: KDF_ALGORITHM.to_string(),
            iterations: self.iterations,
            salt: encode_base64url(&self.salt),
        }
    }

    /// True when `params` would derive this same key from the same secret
    pub fn matches(&self, params: &KdfParams) -> bool {
        params.iterations == self.iterations
            && decode_base64url(&params.salt).is_ok_and(|salt| salt == self.salt)
    }
}

impl std::fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialMaterial")
            .field("key", &self.key)
            .field("salt", &encode_base64url(&self.salt))
            .field("iterations", &self.iterations)
            .finish()
    }
}

// ============================================================================
// Key Derivation
// ============================================================================

/// Derive the snapshot key from a human secret using PBKDF2-HMAC-SHA256
///
/// # Arguments
/// * `secret` - identifier + passphrase
/// * `salt` - persisted salt, or `None` for first-time setup (fresh random salt)
/// * `iterations` - PBKDF2 iteration count
///
/// # Security
/// - Rejects passphrases shorter than `MIN_PASSPHRASE_LEN` before deriving anything
/// - The identifier is reduced to its digits, so "(11) 98765-4321" and
///   "11987654321" derive the same key
/// - Iterations above `MAX_KDF_ITERATIONS` are refused
/// - Intermediate buffers are zeroized
pub fn derive_key(
    secret: &Secret,
    salt: Option<&[u8]>,
    iterations: u32,
) -> Result<CredentialMaterial, CryptoError> {
    derive_key_with(&Pbkdf2Sha256, secret, salt, iterations, MIN_PASSPHRASE_LEN)
}

/// [`derive_key`] with an explicit KDF and minimum passphrase length
pub fn derive_key_with(
    kdf: &dyn Kdf,
    secret: &Secret,
    salt: Option<&[u8]>,
    iterations: u32,
    min_passphrase_len: usize,
) -> Result<CredentialMaterial, CryptoError> {
    let input = secret.kdf_input(min_passphrase_len)?;
    if iterations == 0 || iterations > MAX_KDF_ITERATIONS {
        return Err(CryptoError::InvalidIterations);
    }

    let salt = match salt {
        Some(salt) => salt.to_vec(),
        None => generate_random_salt()?.to_vec(),
    };

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    kdf.derive(&input, &salt, iterations, &mut key[..])?;

    Ok(CredentialMaterial {
        key: SymmetricKey::from_bytes(*key),
        salt,
        iterations,
    })
}

/// Session credential holder
///
/// Keeps the secret entered by the user for the lifetime of the session so that
/// bundles carrying other KDF parameters can still be opened. Derived keys are
/// cached per (salt, iterations).
///
/// PBKDF2 is slow on purpose, so the manager never derives while borrowed:
/// it hands out a [`PendingKey`], the caller runs it off the async runtime and
/// brings the result back with [`install`](Self::install) or
/// [`remember`](Self::remember).
pub struct CredentialManager {
    kdf: Arc<dyn Kdf>,
    min_passphrase_len: usize,
    default_iterations: u32,
    secret: Option<Secret>,
    current: Option<CredentialMaterial>,
    cache: HashMap<(Vec<u8>, u32), CredentialMaterial>,
    /// Bumped whenever the secret changes
    generation: u64,
}

/// A key derivation prepared by [`CredentialManager`]
pub struct PendingKey {
    kdf: Arc<dyn Kdf>,
    secret: Secret,
    salt: Option<Vec<u8>>,
    iterations: u32,
    min_passphrase_len: usize,
    generation: u64,
}

impl PendingKey {
    /// Run the KDF. Blocking: async callers go through `spawn_blocking`.
    pub fn derive(&self) -> Result<CredentialMaterial, CryptoError> {
        derive_key_with(
            self.kdf.as_ref(),
            &self.secret,
            self.salt.as_deref(),
            self.iterations,
            self.min_passphrase_len,
        )
    }
}

/// Result of looking up the key for a bundle's KDF parameters
pub enum KeyLookup {
    /// No secret supplied yet
    NoSecret,
    Ready(CredentialMaterial),
    Derive(PendingKey),
}

impl CredentialManager {
    pub fn new(config: &SyncConfig) -> Self {
        Self::with_kdf(Arc::new(Pbkdf2Sha256), config)
    }

    pub fn with_kdf(kdf: Arc<dyn Kdf>, config: &SyncConfig) -> Self {
        Self {
            kdf,
            min_passphrase_len: config.min_passphrase_len,
            default_iterations: if config.kdf_iterations == 0 {
                DEFAULT_KDF_ITERATIONS
            } else {
                config.kdf_iterations
            },
            secret: None,
            current: None,
            cache: HashMap::new(),
            generation: 0,
        }
    }

    /// Validate a new secret and prepare its derivation
    ///
    /// `persisted` KDF parameters are reused when available so the same secret
    /// yields the same key as in earlier sessions.
    pub fn prepare_secret(
        &self,
        secret: Secret,
        persisted: Option<&KdfParams>,
    ) -> Result<PendingKey, CryptoError> {
        secret.validate(self.min_passphrase_len)?;

        let (salt, iterations) = match persisted {
            Some(params) => (
                Some(decode_base64url(&params.salt)?),
                params.iterations,
            ),
            None => (None, self.default_iterations),
        };

        Ok(PendingKey {
            kdf: self.kdf.clone(),
            secret,
            salt,
            iterations,
            min_passphrase_len: self.min_passphrase_len,
            generation: self.generation,
        })
    }

    /// Make the secret of `pending` current, with the key derived from it
    pub fn install(&mut self, pending: PendingKey, material: CredentialMaterial) -> &CredentialMaterial {
        self.generation += 1;
        self.cache.clear();
        self.cache
            .insert((material.salt.clone(), material.iterations), material.clone());
        self.secret = Some(pending.secret);
        self.current.insert(material)
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    pub fn current(&self) -> Option<&CredentialMaterial> {
        self.current.as_ref()
    }

    /// Key material able to open a bundle carrying `params`
    ///
    /// The parameters come from an unauthenticated download, so the iteration
    /// count is bounded before anything is derived.
    pub fn lookup(&self, params: &KdfParams) -> Result<KeyLookup, CryptoError> {
        if params.algorithm != self.kdf.algorithm() {
            return Err(CryptoError::UnsupportedKdf(params.algorithm.clone()));
        }
        if params.iterations == 0 || params.iterations > MAX_KDF_ITERATIONS {
            return Err(CryptoError::InvalidBundle(format!(
                "KDF iterations {} outside 1..={}",
                params.iterations, MAX_KDF_ITERATIONS
            )));
        }

        let Some(secret) = self.secret.as_ref() else {
            return Ok(KeyLookup::NoSecret);
        };

        if let Some(current) = self.current.as_ref().filter(|c| c.matches(params)) {
            return Ok(KeyLookup::Ready(current.clone()));
        }

        let salt = decode_base64url(&params.salt)?;
        if let Some(cached) = self.cache.get(&(salt.clone(), params.iterations)) {
            return Ok(KeyLookup::Ready(cached.clone()));
        }

        Ok(KeyLookup::Derive(PendingKey {
            kdf: self.kdf.clone(),
            secret: secret.clone(),
            salt: Some(salt),
            iterations: params.iterations,
            min_passphrase_len: self.min_passphrase_len,
            generation: self.generation,
        }))
    }

    /// Cache a key derived from a lookup; false when the secret changed meanwhile
    pub fn remember(&mut self, pending: &PendingKey, material: CredentialMaterial) -> bool {
        if pending.generation != self.generation {
            return false;
        }
        self.cache
            .insert((material.salt.clone(), material.iterations), material);
        true
    }

    /// Switch pushes to `material` (after it opened a remote bundle)
    pub fn adopt(&mut self, material: CredentialMaterial) {
        self.current = Some(material);
    }

    pub fn phone_hint(&self) -> String {
        phone_hint(self.secret.as_ref().map(|s| s.identifier()).unwrap_or(""))
    }

    /// Forget the secret and every derived key
    pub fn clear(&mut self) {
        self.generation += 1;
        self.secret = None;
        self.current = None;
        self.cache.clear();
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Non-sensitive hint: first two and last four digits, e.g. `11•••••4321`
pub fn phone_hint(identifier: &str) -> String {
    let digits: Vec<char> = identifier.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 6 {
        return "•••••".to_string();
    }
    let head: String = digits[..2].iter().collect();
    let tail: String = digits[digits.len() - 4..].iter().collect();
    format!("{}•••••{}", head, tail)
}

/// Normalize a Brazilian phone number to its 11 national digits
pub fn normalize_phone_br(input: &str) -> Result<String, CryptoError> {
    let digits: String = input.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() != 11 {
        return Err(CryptoError::InvalidPhone);
    }
    Ok(digits)
}

/// Generate cryptographically secure random salt
pub fn generate_random_salt() -> Result<[u8; SALT_LEN], CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| CryptoError::Rng)?;
    Ok(salt)
}

/// Fresh random AES-GCM nonce; never reused for a given key
pub fn generate_nonce() -> Result<[u8; NONCE_LEN], CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce)
        .map_err(|_| CryptoError::Rng)?;
    Ok(nonce)
}

pub fn encode_base64url(data: &[u8]) -> String {
    BASE64URL.encode(data)
}

pub fn decode_base64url(data: &str) -> Result<Vec<u8>, CryptoError> {
    BASE64URL
        .decode(data.trim())
        .map_err(|e| CryptoError::InvalidBundle(format!("base64url decode error: {}", e)))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const FAST_ITERATIONS: u32 = 1_000;

    fn secret() -> Secret {
        Secret::new("11987654321", "correct horse battery")
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            kdf_iterations: FAST_ITERATIONS,
            ..SyncConfig::default()
        }
    }

    fn install(manager: &mut CredentialManager, secret: Secret, persisted: Option<&KdfParams>) {
        let pending = manager.prepare_secret(secret, persisted).unwrap();
        let material = pending.derive().unwrap();
        manager.install(pending, material);
    }

    #[test]
    fn test_key_derivation_deterministic() {
        let salt = [42u8; SALT_LEN];

        let key1 = derive_key(&secret(), Some(&salt), FAST_ITERATIONS).unwrap();
        let key2 = derive_key(&secret(), Some(&salt), FAST_ITERATIONS).unwrap();

        // Same identifier + passphrase + salt + iterations = same key
        assert_eq!(key1.key, key2.key);
    }

    #[test]
    fn test_key_derivation_inputs_all_matter() {
        let salt = [7u8; SALT_LEN];
        let base = derive_key(&secret(), Some(&salt), FAST_ITERATIONS).unwrap();

        let other_pass =
            derive_key(&Secret::new("11987654321", "another passphrase"), Some(&salt), FAST_ITERATIONS)
                .unwrap();
        let other_id =
            derive_key(&Secret::new("21987654321", "correct horse battery"), Some(&salt), FAST_ITERATIONS)
                .unwrap();
        let other_salt = derive_key(&secret(), Some(&[8u8; SALT_LEN]), FAST_ITERATIONS).unwrap();
        let other_iters = derive_key(&secret(), Some(&salt), FAST_ITERATIONS + 1).unwrap();

        assert_ne!(base.key, other_pass.key);
        assert_ne!(base.key, other_id.key);
        assert_ne!(base.key, other_salt.key);
        assert_ne!(base.key, other_iters.key);
    }

    #[test]
    fn test_fresh_salt_when_omitted() {
        let a = derive_key(&secret(), None, FAST_ITERATIONS).unwrap();
        let b = derive_key(&secret(), None, FAST_ITERATIONS).unwrap();

        assert_eq!(a.salt.len(), SALT_LEN);
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.key, b.key);
    }

    #[test]
    fn test_weak_secret_rejected() {
        let result = derive_key(&Secret::new("11987654321", "short"), None, FAST_ITERATIONS);
        assert!(matches!(result, Err(CryptoError::WeakSecret { min: 8 })));

        let result = derive_key(&Secret::new("   ", "long enough pass"), None, FAST_ITERATIONS);
        assert!(matches!(result, Err(CryptoError::InvalidIdentifier)));

        let result = derive_key(&secret(), None, 0);
        assert!(matches!(result, Err(CryptoError::InvalidIterations)));

        let result = derive_key(&secret(), None, MAX_KDF_ITERATIONS + 1);
        assert!(matches!(result, Err(CryptoError::InvalidIterations)));
    }

    #[test]
    fn test_identifier_formatting_does_not_change_key() {
        let salt = [11u8; SALT_LEN];
        let plain = derive_key(&secret(), Some(&salt), FAST_ITERATIONS).unwrap();
        let formatted = derive_key(
            &Secret::new("(11) 98765-4321", "correct horse battery"),
            Some(&salt),
            FAST_ITERATIONS,
        )
        .unwrap();
        assert_eq!(plain.key, formatted.key);

        let result = derive_key(
            &Secret::new("98765-4321", "correct horse battery"),
            None,
            FAST_ITERATIONS,
        );
        assert!(matches!(result, Err(CryptoError::InvalidPhone)));

        let mut manager = CredentialManager::new(&fast_config());
        assert!(matches!(
            manager.prepare_secret(Secret::new("+55 11 98765-4321", "correct horse battery"), None),
            Err(CryptoError::InvalidPhone)
        ));
        install(&mut manager, Secret::new(" 11 98765 4321 ", "correct horse battery"), None);
        assert_eq!(manager.phone_hint(), "11•••••4321");
    }

    #[test]
    fn test_aes_gcm_roundtrip_and_tamper() {
        let material = derive_key(&secret(), Some(&[1u8; SALT_LEN]), FAST_ITERATIONS).unwrap();
        let nonce = generate_nonce().unwrap();

        let sealed = Aes256Gcm.seal(&material.key, &nonce, b"hello snapshot").unwrap();
        let opened = Aes256Gcm.open(&material.key, &nonce, &sealed).unwrap();
        assert_eq!(opened, b"hello snapshot");

        let mut tampered = sealed.clone();
        tampered[0] ^= 0x01;
        assert!(matches!(
            Aes256Gcm.open(&material.key, &nonce, &tampered),
            Err(CryptoError::DecryptionFailed)
        ));

        // Truncated nonce is rejected, not panicked on
        assert!(matches!(
            Aes256Gcm.open(&material.key, &nonce[..8], &sealed),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_credential_manager_rederives_for_foreign_params() {
        // Device B produced a bundle with its own salt
        let foreign = derive_key(&secret(), Some(&[9u8; SALT_LEN]), FAST_ITERATIONS).unwrap();

        let mut manager = CredentialManager::new(&fast_config());
        assert!(matches!(
            manager.lookup(&foreign.kdf_params()).unwrap(),
            KeyLookup::NoSecret
        ));

        install(&mut manager, secret(), None);
        assert!(!manager.current().unwrap().matches(&foreign.kdf_params()));

        let KeyLookup::Derive(pending) = manager.lookup(&foreign.kdf_params()).unwrap() else {
            panic!("expected a derivation for foreign parameters");
        };
        let material = pending.derive().unwrap();
        assert_eq!(material.key, foreign.key);
        assert!(manager.remember(&pending, material.clone()));
        assert!(matches!(
            manager.lookup(&foreign.kdf_params()).unwrap(),
            KeyLookup::Ready(_)
        ));

        manager.adopt(material);
        assert!(manager.current().unwrap().matches(&foreign.kdf_params()));
    }

    #[test]
    fn test_credential_manager_drops_keys_for_replaced_secret() {
        let foreign = derive_key(&secret(), Some(&[9u8; SALT_LEN]), FAST_ITERATIONS).unwrap();

        let mut manager = CredentialManager::new(&fast_config());
        install(&mut manager, secret(), None);
        let KeyLookup::Derive(pending) = manager.lookup(&foreign.kdf_params()).unwrap() else {
            panic!("expected a derivation for foreign parameters");
        };
        let material = pending.derive().unwrap();

        // The secret changes while the derivation runs
        install(&mut manager, Secret::new("21987654321", "another passphrase"), None);
        assert!(!manager.remember(&pending, material));
        assert!(matches!(
            manager.lookup(&foreign.kdf_params()).unwrap(),
            KeyLookup::Derive(_)
        ));
    }

    #[test]
    fn test_credential_manager_reuses_persisted_params() {
        let mut first = CredentialManager::new(&fast_config());
        install(&mut first, secret(), None);
        let params = first.current().unwrap().kdf_params();

        let mut second = CredentialManager::new(&fast_config());
        install(&mut second, secret(), Some(&params));
        let material = second.current().unwrap();
        assert!(material.matches(&params));
        assert_eq!(material.key, first.current().unwrap().key);
    }

    #[test]
    fn test_unknown_kdf_algorithm_rejected() {
        let manager = CredentialManager::new(&SyncConfig::default());
        let params = KdfParams {
            algorithm: "scrypt".to_string(),
            iterations: 1,
            salt: String::new(),
        };
        assert!(matches!(
            manager.lookup(&params),
            Err(CryptoError::UnsupportedKdf(_))
        ));
    }

    #[test]
    fn test_remote_iterations_bounded() {
        let mut manager = CredentialManager::new(&fast_config());
        install(&mut manager, secret(), None);

        for iterations in [0, MAX_KDF_ITERATIONS + 1, u32::MAX] {
            let params = KdfParams {
                algorithm: KDF_ALGORITHM.to_string(),
                iterations,
                salt: encode_base64url(&[4u8; SALT_LEN]),
            };
            assert!(matches!(
                manager.lookup(&params),
                Err(CryptoError::InvalidBundle(_))
            ));
        }
    }

    #[test]
    fn test_debug_output_redacts_key() {
        let material = derive_key(&secret(), Some(&[3u8; SALT_LEN]), FAST_ITERATIONS).unwrap();
        let rendered = format!("{:?} {:?}", material, secret());
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("correct horse"));
        assert!(!rendered.contains("11987654321"));
    }

    #[test]
    fn test_phone_hint_and_normalization() {
        assert_eq!(phone_hint("11987654321"), "11•••••4321");
        assert_eq!(phone_hint("(11) 98765-4321"), "11•••••4321");
        assert_eq!(phone_hint("123"), "•••••");
        assert_eq!(normalize_phone_br("(11) 98765-4321").unwrap(), "11987654321");
        assert!(matches!(normalize_phone_br("1234"), Err(CryptoError::InvalidPhone)));
    }

    #[test]
    fn test_base64url_accepts_padding() {
        let encoded = encode_base64url(&[0xfb, 0xff]);
        assert_eq!(encoded, "-_8");
        assert_eq!(decode_base64url("-_8=").unwrap(), vec![0xfb, 0xff]);
        assert!(decode_base64url("***").is_err());
    }
}
