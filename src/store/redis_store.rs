//! Plain Redis backend: a `redis://` URL plus an optional password.

use redis::aio::ConnectionManager;
use redis::Client;

use super::backend::RedisBackedStore;
use super::{Store, StoreError};
use crate::model::SandboxInfo;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Connects to a single Redis instance via `ConnectionManager`, which
/// transparently reconnects and queues requests across a dropped
/// connection rather than surfacing it to the caller.
pub struct RedisStore {
    inner: RedisBackedStore,
}

impl RedisStore {
    pub async fn connect(addr: &str, password: Option<&str>) -> Result<Self, StoreError> {
        let url = build_url(addr, password);
        let client = Client::open(url)
            .map_err(|e| StoreError::backend("redis client open", e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::backend("redis connect", e))?;
        Ok(Self {
            inner: RedisBackedStore::new(conn),
        })
    }
}

/// `addr` is a bare `host:port`; the `redis://` scheme and, if present, the
/// password are layered on here so callers only ever configure host/port.
fn build_url(addr: &str, password: Option<&str>) -> String {
    match password {
        Some(password) if !password.is_empty() => format!("redis://:{password}@{addr}"),
        _ => format!("redis://{addr}"),
    }
}

#[async_trait]
impl Store for RedisStore {
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
