//! Shared pipeline logic over a `redis`-protocol connection. `RedisStore`
//! and `ValkeyStore` are thin constructors around this; Redis and Valkey
//! differ only in connection URL and feature toggles, never in command
//! shape, so the pipeline logic lives exactly once.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::{aio::ConnectionManager, AsyncCommands, Script};

use crate::model::SandboxInfo;

use super::{record_key, Store, StoreError, EXPIRY_INDEX_KEY, LAST_ACTIVITY_INDEX_KEY};

/// Atomically: insert-if-absent the record, then upsert both index
/// memberships — but only if this call actually won the insert. A Lua
/// script is the only way to make "SET NX, then conditionally ZADD twice"
/// a single atomic unit across Redis/Valkey; a plain pipeline cannot
/// express the conditional without a round trip in between.
static STORE_SANDBOX_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[2], 'NX') then
  redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
  redis.call('ZADD', KEYS[3], ARGV[4], ARGV[1])
  return 1
else
  return 0
end
"#;

#[derive(Clone)]
pub(crate) struct RedisBackedStore {
    conn: ConnectionManager,
}

impl RedisBackedStore {
    pub(crate) fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl Store for RedisBackedStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::backend("ping", e))?;
        if pong != "PONG" {
            return Err(StoreError::backend(
                "ping",
                redis::RedisError::from((redis::ErrorKind::ResponseError, "unexpected PING reply")),
            ));
        }
        Ok(())
    }

    async fn get_sandbox_by_session_id(&self, session_id: &str) -> Result<SandboxInfo, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(record_key(session_id))
            .await
            .map_err(|e| StoreError::backend("get", e))?;
        let raw = raw.ok_or(StoreError::NotFound)?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn store_sandbox(&self, sandbox: &SandboxInfo) -> Result<(), StoreError> {
        if sandbox.expires_at.timestamp() <= 0 {
            return Err(StoreError::MissingExpiry);
        }

        let key = record_key(&sandbox.session_id);
        let payload = serde_json::to_string(sandbox)?;
        let now = Utc::now().timestamp();
        let expires_at = sandbox.expires_at.timestamp();

        let mut conn = self.conn.clone();
        let _won: i64 = Script::new(STORE_SANDBOX_SCRIPT)
            .key(&key)
            .key(EXPIRY_INDEX_KEY)
            .key(LAST_ACTIVITY_INDEX_KEY)
            .arg(&sandbox.session_id)
            .arg(&payload)
            .arg(expires_at)
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::backend("store_sandbox script", e))?;

        // _won == 0 means the key already existed; insert-if-absent leaves
        // the existing record and both indices untouched in that case.
        Ok(())
    }

    async fn update_sandbox(&self, sandbox: &SandboxInfo) -> Result<(), StoreError> {
        let key = record_key(&sandbox.session_id);
        let payload = serde_json::to_string(sandbox)?;

        let mut conn = self.conn.clone();
        let result: redis::Value = redis::cmd("SET")
            .arg(&key)
            .arg(&payload)
            .arg("XX")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::backend("update_sandbox", e))?;

        match result {
            redis::Value::Nil => Err(StoreError::NotFound),
            _ => Ok(()),
        }
    }

    async fn delete_sandbox_by_session_id(&self, session_id: &str) -> Result<(), StoreError> {
        let key = record_key(session_id);
        let mut conn = self.conn.clone();
        redis::pipe()
            .cmd("DEL")
            .arg(&key)
            .ignore()
            .cmd("ZREM")
            .arg(EXPIRY_INDEX_KEY)
            .arg(session_id)
            .ignore()
            .cmd("ZREM")
            .arg(LAST_ACTIVITY_INDEX_KEY)
            .arg(session_id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| StoreError::backend("delete_sandbox pipeline", e))?;
        Ok(())
    }

    async fn list_expired_sandboxes(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SandboxInfo>, StoreError> {
        self.list_by_index(EXPIRY_INDEX_KEY, before, limit).await
    }

    async fn list_inactive_sandboxes(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SandboxInfo>, StoreError> {
        self.list_by_index(LAST_ACTIVITY_INDEX_KEY, before, limit).await
    }

    async fn update_session_last_activity(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let key = record_key(session_id);
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(&key)
            .await
            .map_err(|e| StoreError::backend("update_session_last_activity exists", e))?;
        if !exists {
            return Err(StoreError::NotFound);
        }

        conn.zadd::<_, _, _, ()>(LAST_ACTIVITY_INDEX_KEY, session_id, at.timestamp())
            .await
            .map_err(|e| StoreError::backend("update_session_last_activity zadd", e))?;
        Ok(())
    }
}

impl RedisBackedStore {
    async fn list_by_index(
        &self,
        index_key: &str,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SandboxInfo>, StoreError> {
        let mut conn = self.conn.clone();
        let session_ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(index_key)
            .arg("-inf")
            .arg(before.timestamp())
            .arg("LIMIT")
            .arg(0)
            .arg(limit as i64)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::backend("list by index", e))?;

        if session_ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = session_ids.iter().map(|id| record_key(id)).collect();
        let raw_records: Vec<Option<String>> = conn
            .mget(&keys)
            .await
            .map_err(|e| StoreError::backend("list hydrate", e))?;

        let mut out = Vec::with_capacity(raw_records.len());
        for raw in raw_records.into_iter().flatten() {
            // A member without a hydratable value was deleted between the
            // range and the hydrate step; drop it silently.
            out.push(serde_json::from_str(&raw)?);
        }
        Ok(out)
    }
}

/// Helper retained for backends that want a `DateTime` back out of a raw
/// unix-seconds score (used by tests exercising index contents directly).
#[allow(dead_code)]
pub(crate) fn score_to_datetime(score: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(score, 0).single().unwrap_or_else(Utc::now)
}
