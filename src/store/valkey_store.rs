//! Valkey backend. Protocol-compatible with `RedisBackedStore`; the extra
//! constructor arguments only affect the connection topology, never the
//! command shape.

use redis::aio::ConnectionManager;
use redis::Client;

use super::backend::RedisBackedStore;
use super::{Store, StoreError};
use crate::model::SandboxInfo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// `disable_cache` and `force_single` are accepted for configuration
/// symmetry with the Valkey client libraries that expose them (client-side
/// caching and single-node/cluster topology pinning); the `redis` crate's
/// `ConnectionManager` does neither, so both are recorded but otherwise
/// inert here — a real cluster-aware client would consult them when
/// building its connection.
pub struct ValkeyStore {
    inner: RedisBackedStore,
    #[allow(dead_code)]
    disable_cache: bool,
    #[allow(dead_code)]
    force_single: bool,
}

impl ValkeyStore {
    pub async fn connect(
        addr: &str,
        password: Option<&str>,
        disable_cache: bool,
        force_single: bool,
    ) -> Result<Self, StoreError> {
        let url = match password {
            Some(password) if !password.is_empty() => format!("redis://:{password}@{addr}"),
            _ => format!("redis://{addr}"),
        };
        let client = Client::open(url)
            .map_err(|e| StoreError::backend("valkey client open", e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::backend("valkey connect", e))?;
        Ok(Self {
            inner: RedisBackedStore::new(conn),
            disable_cache,
            force_single,
        })
    }
}

#[async_trait]
impl Store for ValkeyStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }

    async fn get_sandbox_by_session_id(&self, session_id: &str) -> Result<SandboxInfo, StoreError> {
        self.inner.get_sandbox_by_session_id(session_id).await
    }

    async fn store_sandbox(&self, sandbox: &SandboxInfo) -> Result<(), StoreError> {
        self.inner.store_sandbox(sandbox).await
    }

    async fn update_sandbox(&self, sandbox: &SandboxInfo) -> Result<(), StoreError> {
        self.inner.update_sandbox(sandbox).await
    }

    async fn delete_sandbox_by_session_id(&self, session_id: &str) -> Result<(), StoreError> {
        self.inner.delete_sandbox_by_session_id(session_id).await
    }

    async fn list_expired_sandboxes(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SandboxInfo>, StoreError> {
        self.inner.list_expired_sandboxes(before, limit).await
    }

    async fn list_inactive_sandboxes(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SandboxInfo>, StoreError> {
        self.inner.list_inactive_sandboxes(before, limit).await
    }

    async fn update_session_last_activity(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.update_session_last_activity(session_id, at).await
    }
}
