use crate::config::Config;
use axum::{
    Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use promcat_core::{
    CatalogError, CatalogService, DiscoveryWriter, LockManager, Result, SweepScheduler, open_store,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

mod routes;

use routes::{healthz, hello, list, metrics, register, unregister};

pub struct ServerState {
    pub(crate) catalog: Arc<CatalogService>,
}

/// Opens the store named by `config` and wires the catalog around it.
pub fn build_catalog(config: &Config) -> Result<Arc<CatalogService>> {
    let store = open_store(config.store.backend, config.store.path.clone())?;
    let lock = LockManager::new(config.lock_path())
        .with_poll_interval(config.poll_interval())
        .with_stale_after(config.stale_after());
    let discovery = DiscoveryWriter::new(config.discovery.path.clone());

    tracing::info!(
        "Catalog store {:?} ({:?}), discovery file {:?}, lock {:?}",
        config.store.path,
        config.store.backend,
        config.discovery.path,
        lock.lock_path()
    );

    let catalog = CatalogService::new(store, lock, discovery, config.time_to_live())?;
    Ok(Arc::new(catalog))
}

pub async fn run_server(config: Config, develop: bool) -> Result<()> {
    let catalog = build_catalog(&config)?;
    catalog.refresh_discovery().await?;

    let _sweep_task = if config.sweep.enabled && !develop {
        let scheduler = Arc::new(SweepScheduler::new(
            catalog.clone(),
            config.sweep_interval(),
        ));
        Some(scheduler.start())
    } else {
        tracing::warn!(
            "Expiration sweep is disabled in this process, entries will not expire unless another worker sweeps"
        );
        None
    };

    let app = router(Arc::new(ServerState { catalog }));

    let listener = TcpListener::bind(&config.server.bind_addr).await?;
    tracing::info!("Promcat listening on {}", config.server.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|error| CatalogError::Internal(error.to_string()))?;

    Ok(())
}

pub(crate) fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/", get(hello))
        .route("/healthz", get(healthz))
        .route("/register", post(register))
        .route("/unregister/:hostname", delete(unregister))
        .route("/list", get(list))
        .route("/metrics", get(metrics))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", error);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

pub(crate) fn response_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, message.into()).into_response()
}

/// Client mistakes become 400 with the error text; storage trouble is 500.
pub(crate) fn catalog_error_response(error: &CatalogError) -> Response {
    if error.is_client_error() {
        return response_error(StatusCode::BAD_REQUEST, error.to_string());
    }

    tracing::error!("Catalog request failed: {}", error);
    response_error(StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}
