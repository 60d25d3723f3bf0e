//! Ephemeral credential encryption for QueryDeck.
//!
//! When one browsing context asks its siblings for stored database
//! credentials, the answer crosses a shared message bus that other
//! software on the machine may be able to observe. This crate provides
//! the short-lived envelope for that hand-off:
//! - [`EphemeralKey`]: single-use keys with a wall-clock expiry
//! - [`seal`] / [`open`]: ChaCha20-Poly1305 authenticated encryption
//! - [`KeyRing`]: retention and sweeping of minted keys
//!
//! Nothing here persists. Long-term secret storage is the vault's job.

mod error;
mod key;
mod sealed;

pub use error::{CryptoError, CryptoResult};
pub use key::{EphemeralKey, KeyRing, KEY_SIZE};
pub use sealed::{open, seal, SealedPayload, NONCE_SIZE, TAG_SIZE};
