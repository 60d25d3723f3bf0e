//! Credential sealing using ChaCha20-Poly1305.
//!
//! Authenticated encryption keyed by an [`EphemeralKey`]. Both directions
//! check expiry before touching the cipher, so an expired key fails the
//! same way whether or not the payload is genuine.

use crate::error::{CryptoError, CryptoResult};
use crate::key::EphemeralKey;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Size of nonce in bytes (96 bits for ChaCha20-Poly1305).
pub const NONCE_SIZE: usize = 12;

/// Size of authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// A sealed credential payload ready for the wire.
///
/// The nonce and ciphertext travel as separate base64 fields in the
/// credential response message, so they are kept separate here too.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealedPayload {
    /// The nonce used for sealing (unique per seal).
    pub nonce: [u8; NONCE_SIZE],
    /// The ciphertext, auth tag included.
    pub ciphertext: Vec<u8>,
}

impl SealedPayload {
    /// Total size of nonce plus ciphertext.
    pub fn len(&self) -> usize {
        NONCE_SIZE + self.ciphertext.len()
    }

    /// Returns true if the ciphertext is empty.
    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }

    /// Encodes the nonce as base64.
    pub fn nonce_base64(&self) -> String {
        use base64::{engine::general_purpose::STANDARD, Engine};
        STANDARD.encode(self.nonce)
    }

    /// Encodes the ciphertext as base64.
    pub fn ciphertext_base64(&self) -> String {
        use base64::{engine::general_purpose::STANDARD, Engine};
        STANDARD.encode(&self.ciphertext)
    }

    /// Rebuilds a payload from its base64 wire fields.
    pub fn from_base64_parts(nonce: &str, ciphertext: &str) -> CryptoResult<Self> {
        use base64::{engine::general_purpose::STANDARD, Engine};
        let nonce_bytes = STANDARD
            .decode(nonce)
            .map_err(|e| CryptoError::Decryption(format!("invalid nonce base64: {e}")))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidNonceLength {
                expected: NONCE_SIZE,
                actual: nonce_bytes.len(),
            });
        }
        let ciphertext = STANDARD
            .decode(ciphertext)
            .map_err(|e| CryptoError::Decryption(format!("invalid ciphertext base64: {e}")))?;
        if ciphertext.len() < TAG_SIZE {
            return Err(CryptoError::Decryption("ciphertext too short".to_string()));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&nonce_bytes);
        Ok(Self { nonce, ciphertext })
    }
}

/// Seals plaintext under an ephemeral key.
///
/// Fails with [`CryptoError::KeyExpired`] if the key has already died;
/// a responder must mint a fresh key rather than reuse an old one.
pub fn seal(key: &EphemeralKey, plaintext: &[u8]) -> CryptoResult<SealedPayload> {
    if key.is_expired() {
        return Err(CryptoError::KeyExpired);
    }

    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

    // Random nonce per seal
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok(SealedPayload {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Opens a sealed payload.
///
/// The expiry check comes first and is deterministic: once the key's
/// lifetime has elapsed, opening fails even with the right material and
/// an untampered payload.
pub fn open(key: &EphemeralKey, sealed: &SealedPayload) -> CryptoResult<Vec<u8>> {
    if key.is_expired() {
        return Err(CryptoError::KeyExpired);
    }

    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    let nonce = Nonce::from_slice(&sealed.nonce);

    cipher
        .decrypt(nonce, sealed.ciphertext.as_ref())
        .map_err(|_| CryptoError::Decryption("wrong key or tampered payload".to_string()))
}
