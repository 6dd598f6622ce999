//! HTTP surface: health checks and the session-aware invocation endpoints
//! that resolve a sandbox, reverse-proxy to it, and relay the response.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Path, Request, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use http_body::{Body as HttpBody, Frame, SizeHint};
use serde_json::json;
use tokio::sync::OwnedSemaphorePermit;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::RouterError;
use crate::model::SandboxKind;
use crate::proxy;
use crate::state::AppState;

const SESSION_HEADER: &str = "x-agentcube-session-id";

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health/live", get(health_live))
        .route("/health/ready", get(health_ready))
        .route(
            "/v1/namespaces/{namespace}/agent-runtimes/{name}/invocations/{*path}",
            post(invoke_agent_runtime),
        )
        .route(
            "/v1/namespaces/{namespace}/code-interpreters/{name}/invocations/{*path}",
            post(invoke_code_interpreter),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_live() -> impl IntoResponse {
    Json(json!({"status": "alive"}))
}

async fn health_ready(State(state): State<Arc<AppState>>) -> Response {
    if state.session_manager.store_is_ready().await {
        Json(json!({"status": "ready"})).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not ready", "error": "session manager not available"})),
        )
            .into_response()
    }
}

async fn invoke_agent_runtime(
    state: State<Arc<AppState>>,
    path: Path<(String, String, String)>,
    connect_info: ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    invoke(state, path, connect_info, req, SandboxKind::AgentRuntime).await
}

async fn invoke_code_interpreter(
    state: State<Arc<AppState>>,
    path: Path<(String, String, String)>,
    connect_info: ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    invoke(state, path, connect_info, req, SandboxKind::CodeInterpreter).await
}

async fn invoke(
    State(state): State<Arc<AppState>>,
    Path((namespace, name, subpath)): Path<(String, String, String)>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    mut req: Request,
    kind: SandboxKind,
) -> Response {
    // The `{*path}` wildcard capture excludes its leading slash; normalize it
    // once here so entry-point prefix matching and the proxy rewrite below
    // agree on the same "/"-prefixed form declared sandboxes advertise.
    let subpath = if subpath.starts_with('/') {
        subpath
    } else {
        format!("/{subpath}")
    };

    let permit = match state.concurrency.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => return RouterError::Overloaded.into_response(),
    };

    let session_id = req
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let kind_raw = match kind {
        SandboxKind::AgentRuntime => "agent_runtime",
        SandboxKind::CodeInterpreter => "code_interpreter",
    };

    let sandbox = match state
        .session_manager
        .get_sandbox_by_session(&session_id, &namespace, &name, kind_raw)
        .await
    {
        Ok(sandbox) => sandbox,
        Err(e) => return session_error_response(e),
    };

    if let Err(e) = state
        .session_manager
        .touch_last_activity(&sandbox.session_id, Utc::now())
        .await
    {
        warn!(session_id = %sandbox.session_id, error = %e, "pre-proxy last-activity touch failed");
    }

    let entry_point = match sandbox.select_entrypoint(&subpath) {
        Some(ep) => ep,
        // The session resolved fine; it is the sandbox's advertised entry
        // points that are empty. Distinct from `RouterError::NotFound` so
        // the error body doesn't mislabel a found session as a missing one.
        None => return RouterError::NoEntryPoint.into_response(),
    };
    let target_base = entry_point.target_base();

    if let Err(e) = rewrite_path_to_subpath(&mut req, &subpath) {
        return e.into_response();
    }
    rewrite_for_proxy(&mut req, &state, &client_addr, &sandbox.session_id, kind);

    let response = match proxy::proxy_http(req, &target_base).await {
        Ok(mut resp) => {
            if let Ok(value) = HeaderValue::from_str(&sandbox.session_id) {
                resp.headers_mut().insert(SESSION_HEADER, value);
            }
            resp
        }
        // No body to guard yet; the permit drops when this scope returns.
        Err(e) => return e.into_response(),
    };

    if let Err(e) = state
        .session_manager
        .touch_last_activity(&sandbox.session_id, Utc::now())
        .await
    {
        warn!(session_id = %sandbox.session_id, error = %e, "post-proxy last-activity touch failed");
    }

    // Hold the permit for the full lifetime of the response body, not just
    // until headers are ready — a streaming invocation should count against
    // the concurrency gate for as long as it is actually streaming.
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, Body::new(PermitGuardedBody { inner: body, _permit: permit }))
}

/// Wraps a response body so its concurrency-gate permit is released only
/// once the body has been fully streamed (or dropped early by a
/// disconnecting client), rather than as soon as the handler returns
/// headers.
struct PermitGuardedBody {
    inner: Body,
    _permit: OwnedSemaphorePermit,
}

impl HttpBody for PermitGuardedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Replaces the request's URI path with the captured `*path` suffix
/// (prepending `/` if missing), preserving the query string. The sandbox
/// must see only its own subpath, never the `/v1/namespaces/...` prefix the
/// client addressed the Router with.
fn rewrite_path_to_subpath(req: &mut Request, subpath: &str) -> Result<(), RouterError> {
    let path = if subpath.starts_with('/') {
        subpath.to_string()
    } else {
        format!("/{subpath}")
    };
    let path_and_query = match req.uri().query() {
        Some(query) => format!("{path}?{query}"),
        None => path,
    };

    let new_uri = axum::http::Uri::builder()
        .path_and_query(path_and_query.as_str())
        .build()
        .map_err(|e| RouterError::InvalidArgument(format!("bad subpath: {e}")))?;
    *req.uri_mut() = new_uri;
    Ok(())
}

/// Sets `X-Forwarded-*` and, for code-interpreter sandboxes, the signed
/// `Authorization` header, ahead of the proxy hop.
fn rewrite_for_proxy(
    req: &mut Request,
    state: &AppState,
    client_addr: &SocketAddr,
    session_id: &str,
    kind: SandboxKind,
) {
    let headers = req.headers_mut();

    if let Some(host) = headers.get(axum::http::header::HOST).cloned() {
        headers.insert("x-forwarded-host", host);
    }
    let proto = if state.config.enable_tls { "https" } else { "http" };
    if let Ok(value) = HeaderValue::from_str(proto) {
        headers.insert("x-forwarded-proto", value);
    }

    let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {}", client_addr.ip()),
        None => client_addr.ip().to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }

    if kind == SandboxKind::CodeInterpreter {
        match state.identity.issue_token(session_id, Utc::now().timestamp()) {
            Ok(token) => {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                    headers.insert(axum::http::header::AUTHORIZATION, value);
                }
            }
            Err(e) => warn!(%e, "failed to sign sandbox invocation token"),
        }
    }
}

fn session_error_response(err: crate::session::SessionError) -> Response {
    use crate::session::SessionError;
    match err {
        SessionError::NotFound => RouterError::NotFound.into_response(),
        SessionError::InvalidArgument(msg) => RouterError::InvalidArgument(msg).into_response(),
        SessionError::UpstreamUnavailable(msg) => RouterError::UpstreamUnavailable(msg).into_response(),
        SessionError::UpstreamProtocol(msg) => RouterError::UpstreamProtocol(msg).into_response(),
        SessionError::Store(e) => RouterError::from(e).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with_uri(uri: &str) -> Request {
        axum::http::Request::builder()
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn rewrite_path_prepends_missing_slash() {
        let mut req = request_with_uri("http://router/v1/namespaces/default/agent-runtimes/foo/invocations/exec");
        rewrite_path_to_subpath(&mut req, "exec").unwrap();
        assert_eq!(req.uri().path(), "/exec");
    }

    #[test]
    fn rewrite_path_preserves_query_string() {
        let mut req = request_with_uri("http://router/v1/namespaces/default/agent-runtimes/foo/invocations/exec?x=1");
        rewrite_path_to_subpath(&mut req, "exec").unwrap();
        assert_eq!(req.uri().path_and_query().unwrap().as_str(), "/exec?x=1");
    }

    #[test]
    fn rewrite_path_handles_nested_subpath() {
        let mut req = request_with_uri("http://router/v1/namespaces/default/agent-runtimes/foo/invocations/exec/run");
        rewrite_path_to_subpath(&mut req, "exec/run").unwrap();
        assert_eq!(req.uri().path(), "/exec/run");
    }

    #[tokio::test]
    async fn permit_guarded_body_releases_permit_only_after_fully_drained() {
        use http_body_util::BodyExt;

        let semaphore = Arc::new(tokio::sync::Semaphore::new(1));
        let permit = semaphore.clone().try_acquire_owned().unwrap();
        assert_eq!(semaphore.available_permits(), 0);

        let mut guarded = PermitGuardedBody {
            inner: Body::from("hello"),
            _permit: permit,
        };

        while let Some(frame) = guarded.frame().await {
            frame.unwrap();
        }
        assert_eq!(
            semaphore.available_permits(),
            0,
            "permit must still be held while the body value is alive"
        );

        drop(guarded);
        assert_eq!(semaphore.available_permits(), 1, "permit releases once the body drops");
    }
}
