//! Axum JSON API over the earthquake store.

pub mod query;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use quake_sync::Syncer;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub use query::{NearestParams, QueryError, QueryService};

#[derive(Clone)]
pub struct AppState {
    pub queries: QueryService,
    /// Absent when the process serves a store it does not ingest into.
    pub syncer: Option<Arc<Syncer>>,
}

impl AppState {
    pub fn new(queries: QueryService, syncer: Option<Arc<Syncer>>) -> Self {
        Self { queries, syncer }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/quakes", get(quakes_handler))
        .route("/nearest", get(nearest_handler))
        .route("/refresh", get(refresh_handler))
        .route("/status", get(status_handler))
        .with_state(Arc::new(state))
}

pub fn web_port_from_env() -> u16 {
    std::env::var("QUAKES_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8090)
}

pub fn query_timeout_from_env() -> Duration {
    std::env::var("QUAKES_QUERY_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(query::DEFAULT_QUERY_TIMEOUT)
}

pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "serving quake API");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn quakes_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.queries.list_all().await {
        Ok(events) => Json(events).into_response(),
        Err(err) => {
            error!(error = %err, "error handling /quakes request");
            err.into_response()
        }
    }
}

async fn nearest_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<NearestParams>,
) -> Response {
    match state.queries.find_nearest(&params).await {
        Ok(matches) => Json(matches).into_response(),
        Err(err @ QueryError::InvalidQuery(_)) => {
            warn!(error = %err, "rejected /nearest request");
            err.into_response()
        }
        Err(err) => {
            error!(error = %err, "error handling /nearest request");
            err.into_response()
        }
    }
}

fn sync_disabled() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "success": false, "err": "ingestion is not configured" })),
    )
        .into_response()
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(syncer) = &state.syncer else {
        return sync_disabled();
    };
    match syncer.replace_all().await {
        Ok(report) => Json(serde_json::json!({ "success": true, "report": report })).into_response(),
        Err(err) => {
            error!(error = %err, "error handling /refresh request");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "success": false, "err": err.to_string() })),
            )
                .into_response()
        }
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.syncer {
        Some(syncer) => Json(syncer.status().await).into_response(),
        None => sync_disabled(),
    }
}
