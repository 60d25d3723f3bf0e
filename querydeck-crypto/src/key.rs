//! Ephemeral keys for credential hand-off between contexts.
//!
//! Keys are minted per credential response, travel alongside the
//! ciphertext, and stop working after a short wall-clock lifetime.
//! Expiry is the security boundary here: messages on the shared bus may
//! be logged or replayed, and an expired key must never open anything.

use crate::error::{CryptoError, CryptoResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of encryption keys in bytes (256 bits for ChaCha20).
pub const KEY_SIZE: usize = 32;

/// A single-use key with a wall-clock expiry.
///
/// Key material is zeroized on drop. Expiry is checked against
/// `Utc::now()`, not a monotonic clock, because the key crosses context
/// boundaries and both ends must agree on when it dies.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EphemeralKey {
    material: [u8; KEY_SIZE],
    #[zeroize(skip)]
    created_at: DateTime<Utc>,
    #[zeroize(skip)]
    expires_at: DateTime<Utc>,
}

impl EphemeralKey {
    /// Mints a fresh random key valid for `ttl` from now.
    #[must_use]
    pub fn generate(ttl: Duration) -> Self {
        let mut material = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut material);
        let created_at = Utc::now();
        Self {
            material,
            created_at,
            expires_at: created_at + ChronoDuration::milliseconds(ttl.as_millis() as i64),
        }
    }

    /// Rebuilds a key received from another context.
    #[must_use]
    pub fn from_parts(material: [u8; KEY_SIZE], expires_at: DateTime<Utc>) -> Self {
        Self {
            material,
            created_at: Utc::now(),
            expires_at,
        }
    }

    /// Rebuilds a key from its base64 wire form.
    pub fn from_base64(encoded: &str, expires_at: DateTime<Utc>) -> CryptoResult<Self> {
        use base64::{engine::general_purpose::STANDARD, Engine};
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::Decryption(format!("invalid key base64: {e}")))?;
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut material = [0u8; KEY_SIZE];
        material.copy_from_slice(&bytes);
        Ok(Self::from_parts(material, expires_at))
    }

    /// Encodes the key material as base64 for the wire.
    #[must_use]
    pub fn material_base64(&self) -> String {
        use base64::{engine::general_purpose::STANDARD, Engine};
        STANDARD.encode(self.material)
    }

    /// Returns the raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.material
    }

    /// When this key was minted (local clock).
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When this key stops working.
    #[must_use]
    pub const fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Whether the key's lifetime has elapsed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

impl std::fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralKey")
            .field("material", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Holds the keys a context has minted so expired ones can be purged.
///
/// Responders mint through the ring and sweep it on a short interval;
/// sweeping is what keeps stale material from lingering in memory past
/// its usefulness.
#[derive(Debug, Default)]
pub struct KeyRing {
    keys: Mutex<Vec<EphemeralKey>>,
}

impl KeyRing {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a key valid for `ttl` and retains a copy in the ring.
    pub fn mint(&self, ttl: Duration) -> EphemeralKey {
        let key = EphemeralKey::generate(ttl);
        self.lock().push(key.clone());
        key
    }

    /// Drops expired keys, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let mut keys = self.lock();
        let before = keys.len();
        keys.retain(|key| !key.is_expired());
        before - keys.len()
    }

    /// Number of keys currently held, expired or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<EphemeralKey>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
