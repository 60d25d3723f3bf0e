//! Per-store replication policy.
//!
//! Each reactive state container that wants cross-context replication
//! needs a policy entry; absence means "do not replicate". Policies
//! also drive the shutdown flush order via `priority`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

fn enabled_by_default() -> bool {
    true
}

/// Replication rules for one named state container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSyncPolicy {
    /// Logical container name, matched against patch messages.
    pub name: String,
    /// Disabled entries behave as if absent, but keep their settings.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Dot-separated field paths stripped from outgoing patches,
    /// e.g. `credential.password`.
    #[serde(default)]
    pub exclude_fields: Vec<String>,
    /// Trailing-edge debounce window for outgoing patches. Zero
    /// publishes immediately.
    #[serde(default)]
    pub debounce_ms: u64,
    /// Flush order across stores; lower goes first.
    #[serde(default)]
    pub priority: u32,
}

impl StoreSyncPolicy {
    /// An enabled policy with no exclusions and no debounce.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            exclude_fields: Vec::new(),
            debounce_ms: 0,
            priority: 0,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn exclude(mut self, path: impl Into<String>) -> Self {
        self.exclude_fields.push(path.into());
        self
    }

    pub fn debounce(mut self, window: Duration) -> Self {
        self.debounce_ms = window.as_millis() as u64;
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// The debounce window as a [`Duration`].
    #[must_use]
    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// The set of policies for every replicated container.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, StoreSyncPolicy>,
}

impl PolicyRegistry {
    pub fn new(policies: Vec<StoreSyncPolicy>) -> Self {
        Self {
            policies: policies
                .into_iter()
                .map(|policy| (policy.name.clone(), policy))
                .collect(),
        }
    }

    /// The stock QueryDeck policy set. Connection credentials never
    /// leave the context; per-tab editor state stays per-tab.
    #[must_use]
    pub fn defaults() -> Self {
        Self::new(vec![
            StoreSyncPolicy::new("connections")
                .exclude("credential.password")
                .exclude("credential.ssh_password")
                .debounce(Duration::from_millis(150))
                .priority(10),
            StoreSyncPolicy::new("saved_queries")
                .debounce(Duration::from_millis(300))
                .priority(20),
            StoreSyncPolicy::new("query_history")
                .debounce(Duration::from_millis(300))
                .priority(30),
            StoreSyncPolicy::new("preferences")
                .debounce(Duration::from_millis(500))
                .priority(40),
            StoreSyncPolicy::new("query_editor").disabled(),
        ])
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StoreSyncPolicy> {
        self.policies.get(name)
    }

    /// Whether patches for this container are replicated at all.
    #[must_use]
    pub fn is_replicated(&self, name: &str) -> bool {
        self.policies.get(name).is_some_and(|policy| policy.enabled)
    }

    /// Enabled policies in flush order: ascending priority, name as
    /// the tie-breaker.
    #[must_use]
    pub fn by_priority(&self) -> Vec<&StoreSyncPolicy> {
        let mut enabled: Vec<&StoreSyncPolicy> = self
            .policies
            .values()
            .filter(|policy| policy.enabled)
            .collect();
        enabled.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.name.cmp(&b.name))
        });
        enabled
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
