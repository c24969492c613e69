//! HTTP server for health, metrics and view query endpoints.

use axum::{
    extract::{Path, Query as QueryParams, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use rill_core::health::{HealthCheck, HealthReport, HealthStatus};
use rill_core::metrics::export_prometheus_text;
use rill_core::query::{Query, ViewCatalog};
use rill_core::{QueryError, StreamHandle, StreamProgress, StreamState};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// Shared state for HTTP endpoints.
pub struct ServerState {
    pub health: Arc<HealthCheck>,
    pub catalog: ViewCatalog,
    pub streams: Vec<Arc<StreamHandle>>,
}

/// Health response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    #[serde(flatten)]
    pub report: HealthReport,
    pub streams: Vec<StreamStatusResponse>,
}

/// State and progress of one stream.
#[derive(Debug, Serialize)]
pub struct StreamStatusResponse {
    pub id: String,
    pub state: StreamState,
    pub progress: StreamProgress,
}

/// Query string of `GET /views/{name}`.
#[derive(Debug, Default, Deserialize)]
pub struct ViewQueryParams {
    pub select: Option<String>,
    #[serde(rename = "where")]
    pub filter: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Build the router.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/metrics", get(metrics_handler))
        .route("/views", get(views_handler))
        .route("/views/:name", get(view_query_handler))
        .with_state(state)
}

/// Serve until `shutdown_rx` flips to true.
pub async fn start_server(state: Arc<ServerState>, port: u16, mut shutdown_rx: watch::Receiver<bool>) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, port, "Failed to bind HTTP server");
            return;
        }
    };

    info!(port, "HTTP server started");

    let shutdown = async move {
        let _ = shutdown_rx.wait_for(|stop| *stop).await;
        info!("HTTP server shutting down");
    };

    if let Err(e) = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(error = %e, "HTTP server error");
    }
}

/// Health endpoint handler.
async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let report = state.health.report();
    let status_code = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    let streams = state
        .streams
        .iter()
        .map(|handle| StreamStatusResponse {
            id: handle.id().to_string(),
            state: handle.state(),
            progress: handle.progress(),
        })
        .collect();

    (status_code, Json(HealthResponse { report, streams }))
}

/// Kubernetes liveness probe handler.
async fn healthz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    // Liveness: Is the process alive?
    if state.health.overall_status() != HealthStatus::Unhealthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Kubernetes readiness probe handler.
async fn readyz_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    // Readiness: every stream running and no component unhealthy
    let all_running = state.streams.iter().all(|handle| handle.is_active());
    if state.health.is_operational() && all_running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus metrics endpoint handler.
async fn metrics_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let streams: Vec<(&str, &rill_core::metrics::StreamMetrics)> = state
        .streams
        .iter()
        .map(|handle| (handle.id(), handle.metrics().as_ref()))
        .collect();
    let output = export_prometheus_text("rill", &streams);

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        output,
    )
}

/// List registered views.
async fn views_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let views: Vec<serde_json::Value> = state
        .catalog
        .names()
        .into_iter()
        .filter_map(|name| state.catalog.get(&name).ok())
        .map(|view| {
            serde_json::json!({
                "name": view.name(),
                "rows": view.row_count(),
                "columns": view.schema().field_names(),
            })
        })
        .collect();
    Json(views)
}

/// Run a select/filter query against a view.
async fn view_query_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    QueryParams(params): QueryParams<ViewQueryParams>,
) -> Response {
    let query = match Query::parse(
        params.select.as_deref(),
        params.filter.as_deref(),
        params.limit,
    ) {
        Ok(query) => query,
        Err(e) => return query_error(e),
    };

    match state.catalog.query(&name, &query) {
        Ok(result) => Json(result).into_response(),
        Err(e) => query_error(e),
    }
}

fn query_error(e: QueryError) -> Response {
    let status = match e {
        QueryError::ViewNotFound(_) => StatusCode::NOT_FOUND,
        QueryError::Parse { .. } | QueryError::UnknownColumn(_) => StatusCode::BAD_REQUEST,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_status() {
        let response = query_error(QueryError::ViewNotFound("x".into()));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = query_error(QueryError::Parse {
            position: 0,
            message: "bad".into(),
        });
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = query_error(QueryError::UnknownColumn("nope".into()));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_view_query_params_rename() {
        let params: ViewQueryParams =
            serde_json::from_value(serde_json::json!({"select": "a,b", "where": "a > 1", "limit": 5}))
                .unwrap();
        assert_eq!(params.select.as_deref(), Some("a,b"));
        assert_eq!(params.filter.as_deref(), Some("a > 1"));
        assert_eq!(params.limit, Some(5));
    }

    #[test]
    fn test_health_response_flattens_report() {
        let health = HealthCheck::new();
        health.mark_healthy("weather:source");
        let response = HealthResponse {
            report: health.report(),
            streams: vec![],
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["components"]["weather:source"]["status"], "healthy");
    }
}
