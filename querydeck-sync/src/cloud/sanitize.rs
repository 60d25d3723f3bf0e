//! Upload sanitization.
//!
//! Secrets never leave the process. Connection payloads get their
//! password fields replaced with boolean presence markers, and every
//! outgoing record is then validated against a banned-key list; a
//! record that still carries a secret-looking field is excluded from
//! the batch rather than uploaded.

use crate::error::{SyncError, SyncResult};
use querydeck_types::{ChangeRecord, EntityKind};
use serde_json::Value;
use tracing::warn;

/// Key fragments that mark a field as secret-bearing.
const BANNED_KEY_FRAGMENTS: [&str; 7] = [
    "password",
    "secret",
    "token",
    "api_key",
    "apikey",
    "private_key",
    "passphrase",
];

/// Connection fields scrubbed before upload, paired with the marker
/// recording whether a value was present.
const CONNECTION_SECRET_FIELDS: [(&str, &str); 2] = [
    ("password", "has_password"),
    ("ssh_password", "has_ssh_password"),
];

/// Returns a copy of the record safe to upload.
///
/// Fails if the payload still carries a secret-looking field after
/// scrubbing; the original record is never modified.
pub fn sanitize_record(record: &ChangeRecord) -> SyncResult<ChangeRecord> {
    let mut clean = record.clone();
    if record.kind == EntityKind::Connection {
        scrub_connection(&mut clean.data);
    }
    if let Some(path) = find_banned_key(&clean.data, "") {
        return Err(SyncError::Sanitization(format!(
            "record {}/{} still carries secret field {path}",
            record.kind, record.entity_id
        )));
    }
    Ok(clean)
}

/// Sanitizes a batch, dropping records that fail. Returns the clean
/// copies and how many were excluded.
pub fn sanitize_batch(records: &[ChangeRecord]) -> (Vec<ChangeRecord>, usize) {
    let mut clean = Vec::with_capacity(records.len());
    let mut failures = 0;
    for record in records {
        match sanitize_record(record) {
            Ok(sanitized) => clean.push(sanitized),
            Err(e) => {
                failures += 1;
                warn!("Excluding record from upload: {e}");
            }
        }
    }
    (clean, failures)
}

fn scrub_connection(data: &mut Value) {
    let Value::Object(map) = data else {
        return;
    };
    for (field, marker) in CONNECTION_SECRET_FIELDS {
        if let Some(value) = map.remove(field) {
            let present = match &value {
                Value::String(secret) => !secret.is_empty(),
                Value::Null => false,
                _ => true,
            };
            map.insert(marker.to_string(), Value::Bool(present));
        }
    }
}

/// Finds the first secret-looking key anywhere in the payload.
/// Presence markers (`has_*`) are exempt.
fn find_banned_key(value: &Value, path: &str) -> Option<String> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let lowered = key.to_ascii_lowercase();
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                let flagged = !lowered.starts_with("has_")
                    && BANNED_KEY_FRAGMENTS
                        .iter()
                        .any(|fragment| lowered.contains(fragment));
                if flagged {
                    return Some(child_path);
                }
                if let Some(found) = find_banned_key(child, &child_path) {
                    return Some(found);
                }
            }
            None
        }
        Value::Array(items) => items.iter().find_map(|item| find_banned_key(item, path)),
        _ => None,
    }
}
