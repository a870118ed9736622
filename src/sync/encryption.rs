//! Device-bound encryption for cached records.
//!
//! The cache key is derived from host characteristics plus a persisted
//! random salt and device id, so it can be re-derived on every start
//! without ever being written to disk. A sentinel ciphertext stored in
//! `meta` proves the re-derived key is the one that sealed the cache.

use crate::config::Environment;
use crate::error::{OfflineError, Result};
use crate::storage::Database;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use serde_json::Value;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const SENTINEL: &[u8] = b"flocksync:key-sentinel:v1";
/// Marks payloads stored without encryption outside production
pub const PLAINTEXT_TAG: &str = "plain:";

const META_SALT: &str = "device_salt";
const META_DEVICE_ID: &str = "device_id";
const META_KEY_VERSION: &str = "key_version";
const META_SENTINEL: &str = "key_sentinel";

/// Whether the platform can supply secure randomness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoProvider {
    System,
    Unavailable,
}

impl CryptoProvider {
    /// Pick a provider by drawing one byte from the system RNG
    pub fn detect() -> Self {
        let mut sample = [0u8; 1];
        match SystemRandom::new().fill(&mut sample) {
            Ok(()) => Self::System,
            Err(_) => Self::Unavailable,
        }
    }
}

/// Stable characteristics of the host the cache lives on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFingerprint {
    pub platform: String,
    pub locale: String,
    pub host: String,
}

impl DeviceFingerprint {
    pub fn current() -> Self {
        let locale = std::env::var("LC_ALL")
            .or_else(|_| std::env::var("LANG"))
            .unwrap_or_else(|_| "und".to_string());

        Self {
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            locale,
            host: gethostname::gethostname().to_string_lossy().into_owned(),
        }
    }

    fn signature(&self) -> String {
        format!("{}|{}|{}", self.platform, self.locale, self.host)
    }
}

/// The active AES-256-GCM cache key. Raw key bytes are not retained.
#[derive(Clone)]
pub struct DeviceKey {
    cipher: Aes256Gcm,
    version: u32,
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceKey")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl DeviceKey {
    fn derive(material: &str, salt: &[u8], version: u32) -> Result<Self> {
        let iterations = NonZeroU32::new(PBKDF2_ITERATIONS)
            .ok_or_else(|| OfflineError::CryptoUnavailable("invalid iteration count".into()))?;

        let mut key = [0u8; 32];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            salt,
            material.as_bytes(),
            &mut key,
        );

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        key.iter_mut().for_each(|b| *b = 0);

        Ok(Self { cipher, version })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    fn version_byte(&self) -> u8 {
        (self.version & 0xff) as u8
    }

    /// Encrypt into `base64(version byte || nonce || ciphertext)`
    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| OfflineError::CryptoUnavailable("nonce generation failed".into()))?;

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| OfflineError::CryptoUnavailable(format!("encryption failed: {}", e)))?;

        let mut envelope = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        envelope.push(self.version_byte());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&ciphertext);

        Ok(general_purpose::STANDARD.encode(envelope))
    }

    pub fn open(&self, encoded: &str) -> Result<Vec<u8>> {
        let envelope = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| OfflineError::Decryption(format!("invalid base64: {}", e)))?;

        if envelope.len() < 1 + NONCE_LEN {
            return Err(OfflineError::Decryption("envelope too short".into()));
        }
        if envelope[0] != self.version_byte() {
            return Err(OfflineError::Decryption(format!(
                "sealed with key version {}, active version {}",
                envelope[0], self.version
            )));
        }

        let (nonce, ciphertext) = envelope[1..].split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| OfflineError::Decryption(e.to_string()))
    }
}

/// Owns the session's cache key and its persisted derivation inputs
pub struct KeyManager {
    db: Arc<Database>,
    environment: Environment,
    provider: CryptoProvider,
    fingerprint: DeviceFingerprint,
    active: RwLock<Option<DeviceKey>>,
}

impl KeyManager {
    pub fn new(db: Arc<Database>, environment: Environment) -> Self {
        Self::with_provider(
            db,
            environment,
            CryptoProvider::detect(),
            DeviceFingerprint::current(),
        )
    }

    pub fn with_provider(
        db: Arc<Database>,
        environment: Environment,
        provider: CryptoProvider,
        fingerprint: DeviceFingerprint,
    ) -> Self {
        Self {
            db,
            environment,
            provider,
            fingerprint,
            active: RwLock::new(None),
        }
    }

    /// Return the cached key, deriving and verifying it on first use.
    ///
    /// Two callers racing here may both derive; the result is identical and
    /// the last write wins.
    pub async fn get_or_create_key(&self) -> Result<DeviceKey> {
        if let Some(key) = self.active.read().await.clone() {
            return Ok(key);
        }

        if self.provider == CryptoProvider::Unavailable {
            return Err(OfflineError::CryptoUnavailable(
                "system random source is not available".into(),
            ));
        }

        let salt = self.load_or_create_salt().await?;
        let device_id = self.load_or_create_device_id().await?;
        let version = self.key_version().await?;
        let material = format!("{}|{}|v{}", self.fingerprint.signature(), device_id, version);

        debug!("Deriving cache key version {}", version);
        let key = tokio::task::spawn_blocking(move || DeviceKey::derive(&material, &salt, version))
            .await
            .map_err(|e| OfflineError::CryptoUnavailable(format!("key derivation aborted: {}", e)))??;

        if !self.verify_integrity(&key).await? {
            warn!("Cache key integrity check failed, purging encrypted cache");
            let purged = self.db.purge_all_cache().await?;
            self.write_sentinel(&key).await?;
            info!("Purged {} cached records and re-established key sentinel", purged);
        }

        *self.active.write().await = Some(key.clone());
        Ok(key)
    }

    /// Check the stored sentinel against `key`, writing one if none exists
    pub async fn verify_integrity(&self, key: &DeviceKey) -> Result<bool> {
        let Some(stored) = self.db.get_meta(META_SENTINEL).await? else {
            self.write_sentinel(key).await?;
            return Ok(true);
        };

        match Self::check_sentinel(key, &stored) {
            Ok(()) => Ok(true),
            Err(e) => {
                debug!("Sentinel rejected: {}", e);
                Ok(false)
            }
        }
    }

    fn check_sentinel(key: &DeviceKey, stored: &str) -> Result<()> {
        let plaintext = key
            .open(stored)
            .map_err(|e| OfflineError::Integrity(e.to_string()))?;

        if plaintext != SENTINEL {
            return Err(OfflineError::Integrity("sentinel mismatch".into()));
        }
        Ok(())
    }

    async fn write_sentinel(&self, key: &DeviceKey) -> Result<()> {
        let sealed = key.seal(SENTINEL)?;
        self.db.set_meta(META_SENTINEL, &sealed).await
    }

    /// Forget the in-memory key. Salt and device id stay, so the next
    /// derivation yields the same key.
    pub async fn clear_key(&self) {
        if self.active.write().await.take().is_some() {
            debug!("Cache key dropped from memory");
        }
    }

    /// Move to a new key version; everything sealed with the old one is purged
    pub async fn rotate_key(&self) -> Result<DeviceKey> {
        let next = self.key_version().await? + 1;
        info!("Rotating cache key to version {}", next);

        self.db.set_meta(META_KEY_VERSION, &next.to_string()).await?;
        self.clear_key().await;

        let purged = self.db.purge_all_cache().await?;
        self.db.delete_meta(META_SENTINEL).await?;
        debug!("Purged {} records sealed with the previous key", purged);

        self.get_or_create_key().await
    }

    pub async fn key_version(&self) -> Result<u32> {
        let version = self
            .db
            .get_meta(META_KEY_VERSION)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        Ok(version)
    }

    pub async fn has_active_key(&self) -> bool {
        self.active.read().await.is_some()
    }

    /// Serialize and encrypt a value; returns the payload and its key version.
    ///
    /// Without a crypto provider, development builds store a `plain:` tagged
    /// payload at version 0 while production fails closed.
    pub async fn encrypt_value(&self, value: &Value) -> Result<(String, i64)> {
        let plaintext = serde_json::to_vec(value)?;

        let sealed = match self.get_or_create_key().await {
            Ok(key) => key
                .seal(&plaintext)
                .map(|payload| (payload, i64::from(key.version()))),
            Err(e) => Err(e),
        };

        match sealed {
            Err(OfflineError::CryptoUnavailable(reason)) if !self.environment.is_production() => {
                warn!("Crypto unavailable ({}), caching unencrypted", reason);
                Ok((
                    format!("{}{}", PLAINTEXT_TAG, general_purpose::STANDARD.encode(&plaintext)),
                    0,
                ))
            }
            other => other,
        }
    }

    pub async fn decrypt_value(&self, payload: &str) -> Result<Value> {
        if let Some(encoded) = payload.strip_prefix(PLAINTEXT_TAG) {
            if self.environment.is_production() {
                return Err(OfflineError::Decryption(
                    "unencrypted cache entries are rejected in production".into(),
                ));
            }
            let raw = general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| OfflineError::Decryption(format!("invalid base64: {}", e)))?;
            return Ok(serde_json::from_slice(&raw)?);
        }

        let key = self.get_or_create_key().await?;
        let plaintext = key.open(payload)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    async fn load_or_create_salt(&self) -> Result<Vec<u8>> {
        if let Some(stored) = self.db.get_meta(META_SALT).await? {
            if let Ok(salt) = general_purpose::STANDARD.decode(&stored) {
                if salt.len() == SALT_LEN {
                    return Ok(salt);
                }
            }
            warn!("Stored device salt is malformed, generating a new one");
        }

        let mut salt = vec![0u8; SALT_LEN];
        SystemRandom::new()
            .fill(&mut salt)
            .map_err(|_| OfflineError::CryptoUnavailable("salt generation failed".into()))?;
        self.db
            .set_meta(META_SALT, &general_purpose::STANDARD.encode(&salt))
            .await?;
        Ok(salt)
    }

    async fn load_or_create_device_id(&self) -> Result<String> {
        if let Some(id) = self.db.get_meta(META_DEVICE_ID).await? {
            return Ok(id);
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.db.set_meta(META_DEVICE_ID, &id).await?;
        info!("Registered new device id");
        Ok(id)
    }
}
