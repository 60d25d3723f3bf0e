//! Client-side conflict detection and resolution material.

use chrono::Utc;
use querydeck_types::{ChangeRecord, Conflict, ConflictVersion, Resolution};
use serde_json::Value;
use uuid::Uuid;

/// Suffix appended to the duplicate a keep-both resolution creates.
pub const KEEP_BOTH_SUFFIX: &str = " (conflicted copy)";

/// Flags a conflict between a local record and its downloaded
/// counterpart.
///
/// Both the version and the timestamp must differ. A re-send with
/// identical content differs in neither; a lone timestamp drift from
/// one writer's skewed clock is tolerated rather than flagged. The
/// recommended resolution keeps whichever side was edited later.
pub fn detect(local: &ChangeRecord, remote: &ChangeRecord) -> Option<Conflict> {
    if local.sync_version == remote.sync_version || local.updated_at == remote.updated_at {
        return None;
    }
    let recommended = if local.updated_at > remote.updated_at {
        Resolution::Local
    } else {
        Resolution::Remote
    };
    Some(Conflict {
        id: Uuid::new_v4().to_string(),
        entity_id: local.entity_id.clone(),
        kind: local.kind,
        local: ConflictVersion::from(local),
        remote: ConflictVersion::from(remote),
        recommended,
        detected_at: Utc::now(),
    })
}

/// Builds the record a keep-both resolution inserts: the remote data
/// under a fresh identity with a disambiguating name, left unsynced so
/// the next cycle uploads it.
pub fn keep_both_copy(conflict: &Conflict) -> ChangeRecord {
    let entity_id = Uuid::new_v4().to_string();
    let mut data = conflict.remote.data.clone();
    if let Some(name) = data.get("name").and_then(Value::as_str) {
        let renamed = format!("{name}{KEEP_BOTH_SUFFIX}");
        data["name"] = Value::String(renamed);
    }
    if let Value::Object(map) = &mut data {
        map.insert("id".to_string(), Value::String(entity_id.clone()));
    }
    ChangeRecord {
        entity_id,
        kind: conflict.kind,
        data,
        updated_at: Utc::now(),
        sync_version: 0,
        synced: false,
    }
}

/// Builds the local overwrite a remote resolution applies. The record
/// keeps the server's version and timestamp so a later local edit is
/// detectable as a fresh change.
pub fn remote_record(conflict: &Conflict) -> ChangeRecord {
    ChangeRecord {
        entity_id: conflict.entity_id.clone(),
        kind: conflict.kind,
        data: conflict.remote.data.clone(),
        updated_at: conflict.remote.updated_at,
        sync_version: conflict.remote.sync_version,
        synced: true,
    }
}
