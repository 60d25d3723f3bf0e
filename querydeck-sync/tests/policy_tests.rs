use std::time::Duration;

use pretty_assertions::assert_eq;
use querydeck_sync::{PolicyRegistry, StoreSyncPolicy};

#[test]
fn defaults_cover_the_replicated_stores() {
    let registry = PolicyRegistry::defaults();

    for store in ["connections", "saved_queries", "query_history", "preferences"] {
        assert!(registry.is_replicated(store), "{store} should replicate");
    }
    assert!(!registry.is_replicated("query_editor"));
    assert!(!registry.is_replicated("unknown_store"));
}

#[test]
fn default_connections_policy_excludes_secrets() {
    let registry = PolicyRegistry::defaults();
    let connections = registry.get("connections").unwrap();

    assert!(connections
        .exclude_fields
        .iter()
        .any(|path| path == "credential.password"));
    assert!(connections
        .exclude_fields
        .iter()
        .any(|path| path == "credential.ssh_password"));
}

#[test]
fn by_priority_orders_enabled_stores() {
    let registry = PolicyRegistry::new(vec![
        StoreSyncPolicy::new("b").priority(20),
        StoreSyncPolicy::new("a").priority(10),
        StoreSyncPolicy::new("c").priority(20),
        StoreSyncPolicy::new("hidden").priority(1).disabled(),
    ]);

    let names: Vec<&str> = registry
        .by_priority()
        .iter()
        .map(|policy| policy.name.as_str())
        .collect();
    // Priority first, name as the tie-breaker, disabled stores left out.
    assert_eq!(names, vec!["a", "b", "c"]);
}

#[test]
fn builders_compose() {
    let policy = StoreSyncPolicy::new("connections")
        .exclude("credential.password")
        .debounce(Duration::from_millis(250))
        .priority(5);

    assert!(policy.enabled);
    assert_eq!(policy.exclude_fields, vec!["credential.password"]);
    assert_eq!(policy.debounce_window(), Duration::from_millis(250));
    assert_eq!(policy.priority, 5);
}

#[test]
fn deserializes_with_sparse_fields() {
    let policy: StoreSyncPolicy = serde_json::from_str(r#"{"name": "saved_queries"}"#).unwrap();

    assert_eq!(policy.name, "saved_queries");
    assert!(policy.enabled);
    assert!(policy.exclude_fields.is_empty());
    assert_eq!(policy.debounce_window(), Duration::ZERO);
    assert_eq!(policy.priority, 0);
}

#[test]
fn registry_len_counts_all_policies() {
    assert!(PolicyRegistry::new(vec![]).is_empty());
    assert_eq!(PolicyRegistry::defaults().len(), 5);
}
