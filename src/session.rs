//! Session Manager: the single entry point for resolving a session id to a
//! running sandbox, provisioning one via the Workload Manager when absent.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{EntryPoint, SandboxInfo, SandboxKind};
use crate::store::{Store, StoreError};

const CREATE_SANDBOX_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("workload manager unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("workload manager protocol error: {0}")]
    UpstreamProtocol(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Serialize)]
struct CreateSandboxRequest<'a> {
    kind: SandboxKind,
    name: &'a str,
    namespace: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandboxResponse {
    session_id: String,
    sandbox_id: String,
    sandbox_name: String,
    entry_points: Vec<EntryPoint>,
}

/// Thin `reqwest`-based client for the external Workload Manager. Holds no
/// state beyond the shared HTTP client and base address.
pub struct WorkloadManagerClient {
    client: reqwest::Client,
    addr: String,
}

impl WorkloadManagerClient {
    pub fn new(client: reqwest::Client, addr: String) -> Self {
        Self { client, addr }
    }

    async fn create_sandbox(
        &self,
        kind: SandboxKind,
        name: &str,
        namespace: &str,
    ) -> Result<CreateSandboxResponse, SessionError> {
        let url = format!("{}{}", self.addr, kind.workload_manager_path());
        let body = CreateSandboxRequest { kind, name, namespace };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .timeout(CREATE_SANDBOX_TIMEOUT)
            .send()
            .await
            .map_err(|e| SessionError::UpstreamUnavailable(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| SessionError::UpstreamUnavailable(e.to_string()))?;

        if !status.is_success() {
            return Err(SessionError::UpstreamProtocol(format!(
                "workload manager returned {status}: {text}"
            )));
        }

        let parsed: CreateSandboxResponse = serde_json::from_str(&text)
            .map_err(|e| SessionError::UpstreamProtocol(format!("malformed response body: {e}")))?;

        if parsed.session_id.is_empty() {
            return Err(SessionError::UpstreamProtocol(
                "workload manager returned an empty sessionId".to_string(),
            ));
        }

        Ok(parsed)
    }
}

/// Stateless coordinator between the [`Store`] and the Workload Manager.
pub struct SessionManager {
    store: Arc<dyn Store>,
    workload_manager: WorkloadManagerClient,
}

impl SessionManager {
    pub fn new(store: Arc<dyn Store>, workload_manager: WorkloadManagerClient) -> Self {
        Self { store, workload_manager }
    }

    /// Resolves `session_id` to its bound sandbox, or provisions a new one
    /// when `session_id` is empty. The Session Manager never writes to the
    /// Store on the create path — that responsibility belongs to the
    /// Workload Manager, which applies warm-pool semantics the Router has
    /// no visibility into.
    pub async fn get_sandbox_by_session(
        &self,
        session_id: &str,
        namespace: &str,
        name: &str,
        kind_raw: &str,
    ) -> Result<SandboxInfo, SessionError> {
        if !session_id.is_empty() {
            return self
                .store
                .get_sandbox_by_session_id(session_id)
                .await
                .map_err(|e| match e {
                    StoreError::NotFound => SessionError::NotFound,
                    other => SessionError::Store(other),
                });
        }

        let kind = SandboxKind::parse(kind_raw)
            .ok_or_else(|| SessionError::InvalidArgument(format!("unknown sandbox kind: {kind_raw}")))?;

        let created = self.workload_manager.create_sandbox(kind, name, namespace).await?;

        let now = Utc::now();
        Ok(SandboxInfo {
            session_id: created.session_id,
            sandbox_id: created.sandbox_id,
            name: created.sandbox_name,
            sandbox_namespace: namespace.to_string(),
            kind,
            entry_points: created.entry_points,
            created_at: now,
            expires_at: now,
            status: "running".to_string(),
        })
    }

    pub async fn touch_last_activity(&self, session_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.store.update_session_last_activity(session_id, at).await
    }

    /// Used by the readiness probe: the Session Manager is only as ready as
    /// the Store it depends on.
    pub async fn store_is_ready(&self) -> bool {
        self.store.ping().await.is_ok()
    }
}
