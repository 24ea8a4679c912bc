use super::{ServerState, catalog_error_response};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use promcat_core::{CatalogError, RegisterRequest};
use std::sync::Arc;

pub(crate) async fn hello() -> &'static str {
    "Hello World!"
}

pub(crate) async fn healthz() -> &'static str {
    "OK"
}

/// The body is decoded as JSON whatever the declared content type.
pub(crate) async fn register(State(state): State<Arc<ServerState>>, body: Bytes) -> Response {
    let request = match RegisterRequest::from_slice(&body) {
        Ok(request) => request,
        Err(error) => return catalog_error_response(&error),
    };

    // Spawned so a client hanging up cannot abort the write half way.
    let catalog = state.catalog.clone();
    let outcome = tokio::spawn(async move { catalog.register(request).await }).await;

    match outcome.map_err(CatalogError::from).and_then(|result| result) {
        Ok(_) => StatusCode::CREATED.into_response(),
        Err(error) => catalog_error_response(&error),
    }
}

pub(crate) async fn unregister(
    State(state): State<Arc<ServerState>>,
    Path(hostname): Path<String>,
) -> Response {
    let catalog = state.catalog.clone();
    let outcome = tokio::spawn(async move { catalog.unregister(&hostname).await }).await;

    match outcome.map_err(CatalogError::from).and_then(|result| result) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(error) => catalog_error_response(&error),
    }
}

pub(crate) async fn list(State(state): State<Arc<ServerState>>) -> Response {
    let view = match state.catalog.list_view() {
        Ok(view) => view,
        Err(error) => return catalog_error_response(&error),
    };

    match serde_json::to_string(&view) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => catalog_error_response(&CatalogError::from(error)),
    }
}

pub(crate) async fn metrics(State(state): State<Arc<ServerState>>) -> Response {
    let metrics = match state.catalog.metrics() {
        Ok(metrics) => metrics,
        Err(error) => return catalog_error_response(&error),
    };

    let body = format!(
        "prometheus_catalog_hosts {}\nprometheus_catalog_up 1\n",
        metrics.host_count
    );
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], body).into_response()
}
