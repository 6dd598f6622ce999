//! The Store abstraction: persists session↔sandbox bindings and the two
//! time-ordered indices (expiry, last-activity) that an external reaper
//! consumes. Implementable over Redis or Valkey — the two backends are
//! behaviorally interchangeable, exercised by the same contract suite in
//! `store::contract_tests`.

mod backend;
mod memory;
mod redis_store;
mod valkey_store;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::SandboxInfo;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use valkey_store::ValkeyStore;

/// Keyspace prefix for a single sandbox record: `session:{sessionID}`.
pub(crate) fn record_key(session_id: &str) -> String {
    format!("session:{session_id}")
}

/// Sorted-set key for the expiry index: score = `ExpiresAt` unix seconds.
pub(crate) const EXPIRY_INDEX_KEY: &str = "session:expiry";

/// Sorted-set key for the last-activity index: score = last-activity unix
/// seconds.
pub(crate) const LAST_ACTIVITY_INDEX_KEY: &str = "session:last_activity";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session not found")]
    NotFound,

    #[error("sandbox record is required")]
    MissingRecord,

    #[error("expiresAt must be non-zero")]
    MissingExpiry,

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store backend error ({context}): {source}")]
    Backend {
        context: &'static str,
        #[source]
        source: redis::RedisError,
    },
}

impl StoreError {
    pub(crate) fn backend(context: &'static str, source: redis::RedisError) -> Self {
        StoreError::Backend { context, source }
    }
}

/// Abstract persistence contract. One implementation per backend driver;
/// callers hold this behind `Arc<dyn Store>` and never see which backend is
/// in use.
#[async_trait]
pub trait Store: Send + Sync {
    /// Liveness check; must receive the protocol's `PONG`.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Returns `StoreError::NotFound` when the key is absent.
    async fn get_sandbox_by_session_id(&self, session_id: &str) -> Result<SandboxInfo, StoreError>;

    /// Insert-if-absent. Rejects a zero `expires_at`. Writes the record plus
    /// both index memberships as a single pipeline.
    async fn store_sandbox(&self, sandbox: &SandboxInfo) -> Result<(), StoreError>;

    /// Set-if-exists (`XX` semantics). Returns `StoreError::NotFound` if the
    /// key is absent. Does not touch either index.
    async fn update_sandbox(&self, sandbox: &SandboxInfo) -> Result<(), StoreError>;

    /// Idempotent: deleting a missing session is not an error.
    async fn delete_sandbox_by_session_id(&self, session_id: &str) -> Result<(), StoreError>;

    /// Range the expiry index with score <= `before`, bounded by `limit`.
    /// Members without a hydratable record (deleted between range and
    /// hydrate) are silently dropped.
    async fn list_expired_sandboxes(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SandboxInfo>, StoreError>;

    /// Same algorithm as `list_expired_sandboxes`, against the last-activity
    /// index.
    async fn list_inactive_sandboxes(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SandboxInfo>, StoreError>;

    /// Verifies the record exists, then updates *only* the last-activity
    /// index score. The serialized record is never rewritten.
    async fn update_session_last_activity(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
impl Store for Arc<dyn Store> {
    async fn ping(&self) -> Result<(), StoreError> {
        self.as_ref().ping().await
    }

    async fn get_sandbox_by_session_id(&self, session_id: &str) -> Result<SandboxInfo, StoreError> {
        self.as_ref().get_sandbox_by_session_id(session_id).await
    }

    async fn store_sandbox(&self, sandbox: &SandboxInfo) -> Result<(), StoreError> {
        self.as_ref().store_sandbox(sandbox).await
    }

    async fn update_sandbox(&self, sandbox: &SandboxInfo) -> Result<(), StoreError> {
        self.as_ref().update_sandbox(sandbox).await
    }

    async fn delete_sandbox_by_session_id(&self, session_id: &str) -> Result<(), StoreError> {
        self.as_ref().delete_sandbox_by_session_id(session_id).await
    }

    async fn list_expired_sandboxes(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SandboxInfo>, StoreError> {
        self.as_ref().list_expired_sandboxes(before, limit).await
    }

    async fn list_inactive_sandboxes(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SandboxInfo>, StoreError> {
        self.as_ref().list_inactive_sandboxes(before, limit).await
    }

    async fn update_session_last_activity(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.as_ref().update_session_last_activity(session_id, at).await
    }
}

#[cfg(any(test, feature = "integration"))]
pub mod contract_tests {
    //! A single contract suite, generic over `dyn Store`, exercising the
    //! invariants every backend must satisfy. Run it against
    //! [`MemoryStore`] here; the same functions are reused against a live
    //! Redis/Valkey instance by the `#[cfg(feature = "integration")]`
    //! harness in `tests/store_contract_live.rs`.

    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::model::{EntryPoint, Protocol, SandboxKind};

    fn sandbox(session_id: &str, expires_in_secs: i64) -> SandboxInfo {
        let now = Utc::now();
        SandboxInfo {
            session_id: session_id.to_string(),
            sandbox_id: format!("sb-{session_id}"),
            name: "test".to_string(),
            sandbox_namespace: "default".to_string(),
            kind: SandboxKind::AgentRuntime,
            entry_points: vec![EntryPoint {
                path: "/".to_string(),
                protocol: Protocol::Http,
                endpoint: "backend:8080".to_string(),
            }],
            created_at: now,
            expires_at: now + chrono::Duration::seconds(expires_in_secs),
            status: "running".to_string(),
        }
    }

    pub async fn run_all(store: Arc<dyn Store>) {
        store_then_get_roundtrips(store.clone()).await;
        update_on_absent_fails(store.clone()).await;
        delete_is_idempotent(store.clone()).await;
        last_activity_touch_does_not_rewrite_record(store.clone()).await;
        list_expired_respects_cutoff_and_limit(store.clone()).await;
        store_rejects_zero_expiry(store.clone()).await;
        store_does_not_overwrite_existing(store).await;
    }

    async fn store_then_get_roundtrips(store: Arc<dyn Store>) {
        let s = sandbox("contract-roundtrip", 3600);
        store.store_sandbox(&s).await.unwrap();

        let fetched = store.get_sandbox_by_session_id(&s.session_id).await.unwrap();
        assert_eq!(fetched.session_id, s.session_id);
        assert_eq!(fetched.sandbox_id, s.sandbox_id);
        assert_eq!(fetched.name, s.name);
        assert_eq!(fetched.expires_at, s.expires_at);
    }

    async fn update_on_absent_fails(store: Arc<dyn Store>) {
        let s = sandbox("contract-update-absent", 3600);
        let err = store.update_sandbox(&s).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));

        let missing = store.get_sandbox_by_session_id(&s.session_id).await;
        assert!(matches!(missing, Err(StoreError::NotFound)));
    }

    async fn delete_is_idempotent(store: Arc<dyn Store>) {
        let s = sandbox("contract-delete", 3600);
        store.store_sandbox(&s).await.unwrap();
        store.delete_sandbox_by_session_id(&s.session_id).await.unwrap();

        let missing = store.get_sandbox_by_session_id(&s.session_id).await;
        assert!(matches!(missing, Err(StoreError::NotFound)));

        // Second delete on an absent session must not error.
        store.delete_sandbox_by_session_id(&s.session_id).await.unwrap();
    }

    async fn last_activity_touch_does_not_rewrite_record(store: Arc<dyn Store>) {
        let s = sandbox("contract-touch", 3600);
        store.store_sandbox(&s).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let touch_at = Utc::now();
        store
            .update_session_last_activity(&s.session_id, touch_at)
            .await
            .unwrap();

        let fetched = store.get_sandbox_by_session_id(&s.session_id).await.unwrap();
        assert_eq!(fetched, s, "record bytes must be untouched by a liveness touch");

        let missing = store
            .update_session_last_activity("contract-touch-missing", touch_at)
            .await;
        assert!(matches!(missing, Err(StoreError::NotFound)));
    }

    async fn list_expired_respects_cutoff_and_limit(store: Arc<dyn Store>) {
        let soon = sandbox("contract-expired-soon", 1);
        let later = sandbox("contract-expired-later", 10_000);
        store.store_sandbox(&soon).await.unwrap();
        store.store_sandbox(&later).await.unwrap();

        let cutoff = Utc.timestamp_opt(soon.expires_at.timestamp() + 5, 0).unwrap();
        let expired = store.list_expired_sandboxes(cutoff, 50).await.unwrap();

        assert!(expired.iter().any(|s| s.session_id == soon.session_id));
        assert!(expired.iter().all(|s| s.expires_at <= cutoff));

        let bounded = store.list_expired_sandboxes(cutoff, 1).await.unwrap();
        assert!(bounded.len() <= 1);
    }

    async fn store_rejects_zero_expiry(store: Arc<dyn Store>) {
        let mut s = sandbox("contract-zero-expiry", 3600);
        s.expires_at = Utc.timestamp_opt(0, 0).unwrap();
        let err = store.store_sandbox(&s).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingExpiry));
    }

    async fn store_does_not_overwrite_existing(store: Arc<dyn Store>) {
        let original = sandbox("contract-no-overwrite", 3600);
        store.store_sandbox(&original).await.unwrap();

        let mut attempted_overwrite = original.clone();
        attempted_overwrite.status = "mutated".to_string();
        // StoreSandbox is insert-if-absent; this must not change the record.
        let _ = store.store_sandbox(&attempted_overwrite).await;

        let fetched = store.get_sandbox_by_session_id(&original.session_id).await.unwrap();
        assert_eq!(fetched.status, "running");
    }

    #[tokio::test]
    async fn memory_store_satisfies_contract() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        run_all(store).await;
    }
}
