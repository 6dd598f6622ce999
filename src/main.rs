use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use agentcube_router::config::{Config, StoreType};
use agentcube_router::identity::IdentityManager;
use agentcube_router::server;
use agentcube_router::session::{SessionManager, WorkloadManagerClient};
use agentcube_router::state::AppState;
use agentcube_router::store::{self, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let default_filter = if config.debug {
        "agentcube_router=debug,tower_http=debug"
    } else {
        "agentcube_router=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(port = config.port, store = ?config.store_type, "agentcube-router starting");

    let store: Arc<dyn Store> = match config.store_type {
        StoreType::Redis => Arc::new(
            store::RedisStore::connect(&config.redis_addr, config.redis_password.as_deref()).await?,
        ),
        StoreType::Valkey => Arc::new(
            store::ValkeyStore::connect(
                &config.valkey_addr,
                config.valkey_password.as_deref(),
                config.valkey_disable_cache,
                config.valkey_force_single,
            )
            .await?,
        ),
    };
    store.ping().await?;

    // `reqwest` only exposes an idle-pool-per-host knob, which is what
    // `MaxIdleConns` (§6: "outbound pool sizing") semantically maps to.
    // `MaxConnsPerHost` has no `reqwest` equivalent — see DESIGN.md's
    // "Known simplification" note.
    let http_client = reqwest::Client::builder()
        .pool_max_idle_per_host(config.max_idle_conns)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()?;

    let workload_manager = WorkloadManagerClient::new(http_client.clone(), config.workload_manager_addr.clone());
    let session_manager = SessionManager::new(store, workload_manager);

    let identity = IdentityManager::init(&config.identity_namespace).await?;

    let concurrency = Arc::new(Semaphore::new(config.max_concurrent_requests));

    let port = config.port;
    let state = Arc::new(AppState {
        session_manager,
        identity,
        http_client,
        concurrency,
        config,
    });

    let app = server::build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let serve_future = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        });
    tokio::pin!(serve_future);

    tokio::select! {
        res = &mut serve_future => {
            res?;
        }
        _ = shutdown_signal() => {
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), serve_future).await {
                Ok(res) => res?,
                Err(_) => tracing::warn!("graceful shutdown deadline exceeded; connections forcibly dropped"),
            }
        }
    }

    Ok(())
}

/// Resolves on Ctrl-C, bounding the drain window axum applies afterward.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received, draining in-flight requests");
}
