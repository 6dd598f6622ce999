//! Wire and storage representation of a sandbox binding.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of workload a sandbox runs. Dispatch on this value decides the
/// upstream Workload Manager endpoint and whether invocations are JWT-signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxKind {
    AgentRuntime,
    CodeInterpreter,
}

impl SandboxKind {
    /// Path segment used when asking the Workload Manager to create a sandbox
    /// of this kind (`{addr}/v1/agent-runtime` / `{addr}/v1/code-interpreter`).
    pub fn workload_manager_path(&self) -> &'static str {
        match self {
            SandboxKind::AgentRuntime => "/v1/agent-runtime",
            SandboxKind::CodeInterpreter => "/v1/code-interpreter",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "agent_runtime" | "AgentRuntime" | "agent-runtime" => Some(SandboxKind::AgentRuntime),
            "code_interpreter" | "CodeInterpreter" | "code-interpreter" => {
                Some(SandboxKind::CodeInterpreter)
            }
            _ => None,
        }
    }
}

/// Transport scheme advertised by a sandbox entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn as_scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

/// One addressable service a sandbox exposes: a path prefix routed to an
/// endpoint over a given protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPoint {
    pub path: String,
    pub protocol: Protocol,
    pub endpoint: String,
}

impl EntryPoint {
    /// The fully qualified target URL prefix for this entry point.
    ///
    /// If `endpoint` already carries a scheme (contains `"://"`), it is used
    /// as-is; otherwise it is prefixed with `{protocol}://`.
    pub fn target_base(&self) -> String {
        if self.endpoint.contains("://") {
            self.endpoint.clone()
        } else {
            format!("{}://{}", self.protocol.as_scheme(), self.endpoint)
        }
    }
}

/// The record persisted per session: the binding between a session id and
/// the sandbox serving it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    pub session_id: String,
    pub sandbox_id: String,
    pub name: String,
    pub sandbox_namespace: String,
    pub kind: SandboxKind,
    pub entry_points: Vec<EntryPoint>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: String,
}

impl SandboxInfo {
    /// Select the entry point whose path is a prefix of `subpath`, falling
    /// back to the first declared entry point if none matches.
    ///
    /// Returns `None` only when `entry_points` is empty.
    pub fn select_entrypoint(&self, subpath: &str) -> Option<&EntryPoint> {
        self.entry_points
            .iter()
            .find(|ep| subpath.starts_with(ep.path.as_str()))
            .or_else(|| self.entry_points.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, endpoint: &str) -> EntryPoint {
        EntryPoint {
            path: path.to_string(),
            protocol: Protocol::Http,
            endpoint: endpoint.to_string(),
        }
    }

    #[test]
    fn entrypoint_prefix_match_wins() {
        let info = SandboxInfo {
            session_id: "s1".into(),
            sandbox_id: "sb1".into(),
            name: "n".into(),
            sandbox_namespace: "default".into(),
            kind: SandboxKind::AgentRuntime,
            entry_points: vec![entry("/exec", "backend-a:8080"), entry("/", "backend-b:8080")],
            created_at: Utc::now(),
            expires_at: Utc::now(),
            status: "running".into(),
        };

        let selected = info.select_entrypoint("/exec/run").unwrap();
        assert_eq!(selected.endpoint, "backend-a:8080");
    }

    #[test]
    fn entrypoint_falls_back_to_first() {
        let info = SandboxInfo {
            session_id: "s1".into(),
            sandbox_id: "sb1".into(),
            name: "n".into(),
            sandbox_namespace: "default".into(),
            kind: SandboxKind::AgentRuntime,
            entry_points: vec![entry("/exec", "backend-a:8080")],
            created_at: Utc::now(),
            expires_at: Utc::now(),
            status: "running".into(),
        };

        let selected = info.select_entrypoint("/unrelated").unwrap();
        assert_eq!(selected.endpoint, "backend-a:8080");
    }

    #[test]
    fn entrypoint_none_when_empty() {
        let info = SandboxInfo {
            session_id: "s1".into(),
            sandbox_id: "sb1".into(),
            name: "n".into(),
            sandbox_namespace: "default".into(),
            kind: SandboxKind::AgentRuntime,
            entry_points: vec![],
            created_at: Utc::now(),
            expires_at: Utc::now(),
            status: "running".into(),
        };

        assert!(info.select_entrypoint("/anything").is_none());
    }

    #[test]
    fn target_base_respects_absolute_endpoint() {
        let ep = entry("/", "https://already-absolute.example");
        assert_eq!(ep.target_base(), "https://already-absolute.example");
    }

    #[test]
    fn target_base_prefixes_scheme() {
        let ep = entry("/", "backend:9000");
        assert_eq!(ep.target_base(), "http://backend:9000");
    }
}
