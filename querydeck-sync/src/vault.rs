//! In-memory credential vault seam.
//!
//! Secrets shared between contexts live here and nowhere else. The
//! vault is deliberately not durable: credentials must be re-entered
//! or re-requested after a restart rather than written to disk.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Holds plaintext connection secrets for the life of the process.
#[async_trait]
pub trait CredentialVault: Send + Sync {
    /// Returns the secret for an entity, if one is held.
    async fn get_secret(&self, entity_id: &str) -> Option<String>;

    /// Stores or replaces the secret for an entity.
    async fn put_secret(&self, entity_id: &str, secret: &str);

    /// Drops the secret for an entity.
    async fn remove_secret(&self, entity_id: &str);

    /// Drops every held secret. Called on logout.
    async fn clear(&self);
}

/// The default vault: a map guarded by an async lock.
#[derive(Default)]
pub struct MemoryVault {
    secrets: RwLock<HashMap<String, String>>,
}

impl MemoryVault {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of held secrets.
    pub async fn len(&self) -> usize {
        self.secrets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.secrets.read().await.is_empty()
    }
}

#[async_trait]
impl CredentialVault for MemoryVault {
    async fn get_secret(&self, entity_id: &str) -> Option<String> {
        self.secrets.read().await.get(entity_id).cloned()
    }

    async fn put_secret(&self, entity_id: &str, secret: &str) {
        self.secrets
            .write()
            .await
            .insert(entity_id.to_string(), secret.to_string());
    }

    async fn remove_secret(&self, entity_id: &str) {
        self.secrets.write().await.remove(entity_id);
    }

    async fn clear(&self) {
        self.secrets.write().await.clear();
    }
}
