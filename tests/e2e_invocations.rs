//! End-to-end invocation scenarios, driven over real TCP against the full
//! `axum::Router` plus small local stub servers for the Workload Manager and
//! sandbox backend, rather than mocking at the trait level.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use agentcube_router::config::{Config, StoreType};
use agentcube_router::identity::IdentityManager;
use agentcube_router::model::{EntryPoint, Protocol, SandboxInfo, SandboxKind};
use agentcube_router::server;
use agentcube_router::session::{SessionManager, WorkloadManagerClient};
use agentcube_router::state::AppState;
use agentcube_router::store::{MemoryStore, Store};

struct TestServer {
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn spawn(app: Router) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub listener");
    let addr = listener.local_addr().expect("stub addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .await
            .expect("stub server failed");
    });
    TestServer { addr, handle }
}

async fn spawn_router_with_connect_info(app: Router) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind router listener");
    let addr = listener.local_addr().expect("router addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .expect("router server failed");
    });
    TestServer { addr, handle }
}

fn test_config(max_concurrent_requests: usize, workload_manager_addr: String) -> Config {
    Config {
        port: 0,
        enable_tls: false,
        tls_cert: None,
        tls_key: None,
        max_concurrent_requests,
        request_timeout: Duration::from_secs(30),
        max_idle_conns: 16,
        max_conns_per_host: 8,
        debug: true,
        workload_manager_addr,
        store_type: StoreType::Redis,
        redis_addr: "127.0.0.1:6379".to_string(),
        redis_password: None,
        valkey_addr: "127.0.0.1:6379".to_string(),
        valkey_password: None,
        valkey_disable_cache: false,
        valkey_force_single: false,
        identity_namespace: "default".to_string(),
    }
}

/// Builds the Router's own `AppState` (not `main`'s, since that reads the
/// environment) with an in-memory store and a `reqwest::Client` pointed at
/// the given stub Workload Manager address.
async fn build_app_state(max_concurrent_requests: usize, workload_manager_addr: String, store: Arc<dyn Store>) -> Arc<AppState> {
    let config = test_config(max_concurrent_requests, workload_manager_addr.clone());
    let http_client = reqwest::Client::new();
    let workload_manager = WorkloadManagerClient::new(http_client.clone(), workload_manager_addr);
    let session_manager = SessionManager::new(store, workload_manager);
    // Outside a cluster this generates and keeps an ephemeral keypair; the
    // attempt to reach a Kubernetes API server fails fast and is swallowed.
    let identity = IdentityManager::init(&config.identity_namespace)
        .await
        .expect("identity manager init");
    let concurrency = Arc::new(tokio::sync::Semaphore::new(max_concurrent_requests));

    Arc::new(AppState {
        session_manager,
        identity,
        http_client,
        concurrency,
        config,
    })
}

fn sandbox(session_id: &str, kind: SandboxKind, entry_points: Vec<EntryPoint>) -> SandboxInfo {
    let now = Utc::now();
    SandboxInfo {
        session_id: session_id.to_string(),
        sandbox_id: format!("sb-{session_id}"),
        name: "test-sandbox".to_string(),
        sandbox_namespace: "default".to_string(),
        kind,
        entry_points,
        created_at: now,
        expires_at: now + chrono::Duration::seconds(3600),
        status: "running".to_string(),
    }
}

/// Stub Workload Manager returning a fixed `CreateSandboxResponse` for every
/// `POST /v1/agent-runtime` or `/v1/code-interpreter` call.
async fn workload_manager_stub(response_body: Value) -> TestServer {
    async fn handler(State(body): State<Value>) -> Json<Value> {
        Json(body)
    }
    let app = Router::new()
        .route("/v1/agent-runtime", post(handler))
        .route("/v1/code-interpreter", post(handler))
        .with_state(response_body);
    spawn(app).await
}

/// Stub sandbox backend: records the last request's path and `Authorization`
/// header, then replies with a fixed JSON body.
#[derive(Default, Clone)]
struct CapturedRequest {
    path: String,
    authorization: Option<String>,
}

async fn backend_stub(response_body: Value) -> (TestServer, Arc<Mutex<CapturedRequest>>) {
    let captured = Arc::new(Mutex::new(CapturedRequest::default()));

    async fn handler(
        State((captured, body)): State<(Arc<Mutex<CapturedRequest>>, Value)>,
        req: axum::extract::Request,
    ) -> Json<Value> {
        let path = req.uri().path().to_string();
        let authorization = req
            .headers()
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        *captured.lock().unwrap() = CapturedRequest { path, authorization };
        Json(body)
    }

    let app = Router::new()
        .fallback(handler)
        .with_state((captured.clone(), response_body));
    let server = spawn(app).await;
    (server, captured)
}

#[tokio::test]
async fn new_session_creation_returns_backend_response_and_session_header() {
    let backend = backend_stub(json!({"r": 1})).await;
    let workload_manager = workload_manager_stub(json!({
        "sessionId": "s1",
        "sandboxId": "sb1",
        "sandboxName": "sb1",
        "entryPoints": [{"path": "/", "protocol": "http", "endpoint": format!("http://{}", backend.0.addr)}],
    }))
    .await;

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let state = build_app_state(1000, format!("http://{}", workload_manager.addr), store).await;
    let router = spawn_router_with_connect_info(server::build_router(state)).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!(
            "http://{}/v1/namespaces/default/agent-runtimes/foo/invocations/run",
            router.addr
        ))
        .send()
        .await
        .expect("request failed");

    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("x-agentcube-session-id").unwrap(),
        "s1"
    );
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"r": 1}));
}

#[tokio::test]
async fn existing_session_proxies_to_entrypoint_subpath() {
    let (backend, captured) = backend_stub(json!({"ok": true})).await;

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store
        .store_sandbox(&sandbox(
            "s1",
            SandboxKind::AgentRuntime,
            vec![EntryPoint {
                path: "/exec".to_string(),
                protocol: Protocol::Http,
                endpoint: format!("http://{}", backend.addr),
            }],
        ))
        .await
        .unwrap();

    // Workload Manager is never consulted on this path; still bind one so
    // the SessionManager has a valid address to not crash on construction.
    let workload_manager = workload_manager_stub(json!({})).await;
    let state = build_app_state(1000, format!("http://{}", workload_manager.addr), store).await;
    let router = spawn_router_with_connect_info(server::build_router(state)).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!(
            "http://{}/v1/namespaces/default/agent-runtimes/foo/invocations/exec",
            router.addr
        ))
        .header("x-agentcube-session-id", "s1")
        .send()
        .await
        .expect("request failed");

    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("x-agentcube-session-id").unwrap(),
        "s1"
    );
    assert_eq!(captured.lock().unwrap().path, "/exec");
}

#[tokio::test]
async fn missing_session_returns_404() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let workload_manager = workload_manager_stub(json!({})).await;
    let state = build_app_state(1000, format!("http://{}", workload_manager.addr), store).await;
    let router = spawn_router_with_connect_info(server::build_router(state)).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!(
            "http://{}/v1/namespaces/default/agent-runtimes/foo/invocations/run",
            router.addr
        ))
        .header("x-agentcube-session-id", "doesnotexist")
        .send()
        .await
        .expect("request failed");

    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn concurrency_limit_returns_429_overloaded() {
    // A backend that blocks until released, so the first request holds its
    // permit open while the second is attempted.
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let release_rx = Arc::new(Mutex::new(Some(release_rx)));

    async fn slow_handler(State(release_rx): State<Arc<Mutex<Option<tokio::sync::oneshot::Receiver<()>>>>>) -> Json<Value> {
        let rx = release_rx.lock().unwrap().take();
        if let Some(rx) = rx {
            let _ = rx.await;
        }
        Json(json!({"done": true}))
    }
    let backend_app = Router::new().fallback(slow_handler).with_state(release_rx);
    let backend = spawn(backend_app).await;

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store
        .store_sandbox(&sandbox(
            "s1",
            SandboxKind::AgentRuntime,
            vec![EntryPoint {
                path: "/".to_string(),
                protocol: Protocol::Http,
                endpoint: format!("http://{}", backend.addr),
            }],
        ))
        .await
        .unwrap();

    let workload_manager = workload_manager_stub(json!({})).await;
    let state = build_app_state(1, format!("http://{}", workload_manager.addr), store).await;
    let router = spawn_router_with_connect_info(server::build_router(state)).await;

    let client = reqwest::Client::new();
    let router_addr = router.addr;
    let in_flight = tokio::spawn(async move {
        client
            .post(format!(
                "http://{router_addr}/v1/namespaces/default/agent-runtimes/foo/invocations/run"
            ))
            .header("x-agentcube-session-id", "s1")
            .send()
            .await
    });

    // Give the first request time to acquire the single permit before the
    // second one is attempted.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client2 = reqwest::Client::new();
    let resp2 = client2
        .post(format!(
            "http://{router_addr}/v1/namespaces/default/agent-runtimes/foo/invocations/run"
        ))
        .header("x-agentcube-session-id", "s1")
        .send()
        .await
        .expect("second request failed");

    assert_eq!(resp2.status(), 429);
    let body: Value = resp2.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("overloaded"));

    let _ = release_tx.send(());
    let resp1 = in_flight.await.unwrap().expect("first request failed");
    assert_eq!(resp1.status(), 200);
}

#[tokio::test]
async fn entrypoint_absent_returns_404() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store
        .store_sandbox(&sandbox("s1", SandboxKind::AgentRuntime, vec![]))
        .await
        .unwrap();

    let workload_manager = workload_manager_stub(json!({})).await;
    let state = build_app_state(1000, format!("http://{}", workload_manager.addr), store).await;
    let router = spawn_router_with_connect_info(server::build_router(state)).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!(
            "http://{}/v1/namespaces/default/agent-runtimes/foo/invocations/run",
            router.addr
        ))
        .header("x-agentcube-session-id", "s1")
        .send()
        .await
        .expect("request failed");

    assert_eq!(resp.status(), 404);
    // The session itself resolved fine; the error body must describe the
    // missing entry point rather than reusing the session-not-found shape.
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "NO_ENTRY_POINT");
    assert!(body["error"].as_str().unwrap().contains("entry point"));
}

#[tokio::test]
async fn code_interpreter_invocation_carries_signed_jwt() {
    let (backend, captured) = backend_stub(json!({"ok": true})).await;

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    store
        .store_sandbox(&sandbox(
            "s1",
            SandboxKind::CodeInterpreter,
            vec![EntryPoint {
                path: "/".to_string(),
                protocol: Protocol::Http,
                endpoint: format!("http://{}", backend.addr),
            }],
        ))
        .await
        .unwrap();

    let workload_manager = workload_manager_stub(json!({})).await;
    let state = build_app_state(1000, format!("http://{}", workload_manager.addr), store).await;
    let public_key_pem = state.identity.public_key_pem().to_string();
    let router = spawn_router_with_connect_info(server::build_router(state)).await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!(
            "http://{}/v1/namespaces/default/code-interpreters/foo/invocations/run",
            router.addr
        ))
        .header("x-agentcube-session-id", "s1")
        .send()
        .await
        .expect("request failed");
    assert_eq!(resp.status(), 200);

    let authorization = captured
        .lock()
        .unwrap()
        .authorization
        .clone()
        .expect("backend did not receive an Authorization header");
    let token = authorization
        .strip_prefix("Bearer ")
        .expect("Authorization header is not a bearer token");

    #[derive(serde::Deserialize)]
    struct Claims {
        iss: String,
        session_id: String,
        exp: i64,
    }

    let decoding_key = jsonwebtoken::DecodingKey::from_rsa_pem(public_key_pem.as_bytes()).unwrap();
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &decoding_key,
        &jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::RS256),
    )
    .expect("token does not verify against the router's public key");

    assert_eq!(data.claims.iss, "agentcube-router");
    assert_eq!(data.claims.session_id, "s1");
    assert!(data.claims.exp > Utc::now().timestamp());
}
