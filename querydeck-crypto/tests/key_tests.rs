use chrono::{Duration as ChronoDuration, Utc};
use querydeck_crypto::{EphemeralKey, KeyRing, KEY_SIZE};
use std::time::Duration;

// ── EphemeralKey ─────────────────────────────────────────────────

#[test]
fn generate_produces_unique_material() {
    let a = EphemeralKey::generate(Duration::from_secs(10));
    let b = EphemeralKey::generate(Duration::from_secs(10));
    assert_ne!(a.as_bytes(), b.as_bytes());
}

#[test]
fn generate_is_not_expired() {
    let key = EphemeralKey::generate(Duration::from_secs(10));
    assert!(!key.is_expired());
    assert!(key.expires_at() > key.created_at());
}

#[test]
fn zero_ttl_key_expires_immediately() {
    let key = EphemeralKey::generate(Duration::ZERO);
    std::thread::sleep(Duration::from_millis(5));
    assert!(key.is_expired());
}

#[test]
fn from_parts_respects_given_expiry() {
    let past = Utc::now() - ChronoDuration::seconds(30);
    let key = EphemeralKey::from_parts([7u8; KEY_SIZE], past);
    assert!(key.is_expired());
    assert_eq!(key.expires_at(), past);
}

#[test]
fn base64_roundtrip_preserves_material() {
    let key = EphemeralKey::generate(Duration::from_secs(10));
    let encoded = key.material_base64();
    let rebuilt = EphemeralKey::from_base64(&encoded, key.expires_at()).unwrap();
    assert_eq!(key.as_bytes(), rebuilt.as_bytes());
    assert_eq!(key.expires_at(), rebuilt.expires_at());
}

#[test]
fn from_base64_rejects_wrong_length() {
    use base64::{engine::general_purpose::STANDARD, Engine};
    let short = STANDARD.encode([1u8; 16]);
    assert!(EphemeralKey::from_base64(&short, Utc::now()).is_err());
}

#[test]
fn from_base64_rejects_garbage() {
    assert!(EphemeralKey::from_base64("not base64!!!", Utc::now()).is_err());
}

#[test]
fn debug_redacts_material() {
    let key = EphemeralKey::generate(Duration::from_secs(10));
    let printed = format!("{key:?}");
    assert!(printed.contains("[REDACTED]"));
    assert!(!printed.contains(&key.material_base64()));
}

// ── KeyRing ──────────────────────────────────────────────────────

#[test]
fn mint_retains_key_in_ring() {
    let ring = KeyRing::new();
    assert!(ring.is_empty());
    let key = ring.mint(Duration::from_secs(10));
    assert_eq!(ring.len(), 1);
    assert!(!key.is_expired());
}

#[test]
fn sweep_removes_only_expired_keys() {
    let ring = KeyRing::new();
    ring.mint(Duration::ZERO);
    ring.mint(Duration::ZERO);
    ring.mint(Duration::from_secs(60));
    std::thread::sleep(Duration::from_millis(5));
    let removed = ring.sweep();
    assert_eq!(removed, 2);
    assert_eq!(ring.len(), 1);
}

#[test]
fn sweep_on_fresh_ring_removes_nothing() {
    let ring = KeyRing::new();
    ring.mint(Duration::from_secs(60));
    assert_eq!(ring.sweep(), 0);
    assert_eq!(ring.len(), 1);
}
