pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod idempotency;
pub mod precondition;
pub mod protocol;
pub mod proxy;
pub mod session;
pub mod telemetry;
pub mod websocket;

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{net::TcpListener, signal};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    config::Config,
    idempotency::{IdempotencyCoordinator, RedisKeyStore, StoreError},
    proxy::Upstream,
    session::SessionRegistry,
};

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub coordinator: IdempotencyCoordinator,
    pub metrics: PrometheusHandle,
    pub upstream: Option<Upstream>,
}

impl AppState {
    pub fn new(
        registry: SessionRegistry,
        coordinator: IdempotencyCoordinator,
        metrics: PrometheusHandle,
        upstream: Option<Upstream>,
    ) -> Self {
        Self {
            registry,
            coordinator,
            metrics,
            upstream,
        }
    }

    /// Build state from configuration, connecting to Redis when a URL is set.
    pub async fn from_config(config: &Config, metrics: PrometheusHandle) -> Result<Self, StoreError> {
        let idempotency = &config.idempotency;
        let coordinator = match &config.redis_url {
            Some(url) => {
                let store =
                    RedisKeyStore::connect(url, idempotency.key_prefix.clone(), idempotency.retention)
                        .await?;
                info!(prefix = %idempotency.key_prefix, "idempotency keys stored in redis");
                IdempotencyCoordinator::new(Arc::new(store))
            }
            None => {
                info!(
                    max_keys = ?idempotency.max_keys,
                    "idempotency keys stored in memory"
                );
                IdempotencyCoordinator::in_memory(idempotency.retention, idempotency.max_keys)
            }
        };

        Ok(Self::new(
            SessionRegistry::new(),
            coordinator,
            metrics,
            config.upstream_url.clone().map(Upstream::new),
        ))
    }
}

/// Assemble the gateway router. Each route group carries only the state it needs.
pub fn build_router(state: AppState) -> Router {
    let http_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/debug/stats", get(handlers::stats))
        .route("/metrics", get(handlers::metrics))
        .with_state(state.clone());

    let ws_routes = Router::new()
        .route("/ws", get(websocket::websocket_handler))
        .with_state(state.registry.clone());

    let mut app = Router::new().merge(http_routes).merge(ws_routes);

    if let Some(upstream) = state.upstream {
        app = app.route(
            "/api/*path",
            proxy::api_routes(state.coordinator).with_state(upstream),
        );
    }

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve `router` on an already bound listener until `shutdown` resolves.
pub async fn run<F>(listener: TcpListener, router: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("server shutdown with error")
}

pub async fn serve(config: Config, metrics: PrometheusHandle) -> Result<()> {
    let state = AppState::from_config(&config, metrics)
        .await
        .context("failed to initialise idempotency store")?;

    let sweeper = config.session_idle_timeout.map(|idle_timeout| {
        info!(
            idle_timeout_secs = idle_timeout.as_secs(),
            sweep_interval_secs = config.idle_sweep_interval.as_secs(),
            "idle session pruning enabled"
        );
        state
            .registry
            .spawn_idle_sweeper(config.idle_sweep_interval, idle_timeout)
    });

    // Redis expires keys itself.
    let purger = match (&config.redis_url, config.idempotency.retention) {
        (None, Some(_)) => Some(
            state
                .coordinator
                .spawn_purger(config.idempotency.purge_interval),
        ),
        _ => None,
    };

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    info!("beach-pier listening on {}", config.listen_addr);

    run(listener, build_router(state), shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    for handle in [sweeper, purger].into_iter().flatten() {
        handle.abort();
    }
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
