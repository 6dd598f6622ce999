//! In-process fake satisfying the [`Store`] contract, for unit tests and
//! for exercising the router without a Redis/Valkey instance on hand.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::SandboxInfo;

use super::{Store, StoreError};

struct Inner {
    records: BTreeMap<String, SandboxInfo>,
    expiry_index: BTreeMap<String, i64>,
    last_activity_index: BTreeMap<String, i64>,
}

/// Mirrors the real backend's three-structure layout (record map plus two
/// score indices) so the same contract suite exercises the same shape of
/// bug either backend could have.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: BTreeMap::new(),
                expiry_index: BTreeMap::new(),
                last_activity_index: BTreeMap::new(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_sandbox_by_session_id(&self, session_id: &str) -> Result<SandboxInfo, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .get(session_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn store_sandbox(&self, sandbox: &SandboxInfo) -> Result<(), StoreError> {
        if sandbox.expires_at.timestamp() <= 0 {
            return Err(StoreError::MissingExpiry);
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.records.contains_key(&sandbox.session_id) {
            return Ok(());
        }
        inner
            .expiry_index
            .insert(sandbox.session_id.clone(), sandbox.expires_at.timestamp());
        inner
            .last_activity_index
            .insert(sandbox.session_id.clone(), Utc::now().timestamp());
        inner.records.insert(sandbox.session_id.clone(), sandbox.clone());
        Ok(())
    }

    async fn update_sandbox(&self, sandbox: &SandboxInfo) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.records.contains_key(&sandbox.session_id) {
            return Err(StoreError::NotFound);
        }
        inner.records.insert(sandbox.session_id.clone(), sandbox.clone());
        Ok(())
    }

    async fn delete_sandbox_by_session_id(&self, session_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.records.remove(session_id);
        inner.expiry_index.remove(session_id);
        inner.last_activity_index.remove(session_id);
        Ok(())
    }

    async fn list_expired_sandboxes(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SandboxInfo>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(list_by_index(&inner.expiry_index, &inner.records, before, limit))
    }

    async fn list_inactive_sandboxes(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SandboxInfo>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(list_by_index(
            &inner.last_activity_index,
            &inner.records,
            before,
            limit,
        ))
    }

    async fn update_session_last_activity(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.records.contains_key(session_id) {
            return Err(StoreError::NotFound);
        }
        inner.last_activity_index.insert(session_id.to_string(), at.timestamp());
        Ok(())
    }
}

/// Score-ordered range over `index`, bounded by `before` and `limit`,
/// hydrated against `records` with the same drop-on-miss behavior as the
/// Redis-backed implementation.
fn list_by_index(
    index: &BTreeMap<String, i64>,
    records: &BTreeMap<String, SandboxInfo>,
    before: DateTime<Utc>,
    limit: usize,
) -> Vec<SandboxInfo> {
    let cutoff = before.timestamp();
    let mut matches: Vec<(&String, &i64)> = index.iter().filter(|(_, score)| **score <= cutoff).collect();
    matches.sort_by_key(|(_, score)| **score);

    matches
        .into_iter()
        .take(limit)
        .filter_map(|(session_id, _)| records.get(session_id).cloned())
        .collect()
}
