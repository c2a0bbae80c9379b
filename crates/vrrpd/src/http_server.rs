//! HTTP server for the status and Prometheus metrics endpoints.

use crate::metrics::MetricsRegistry;
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use vrrp::binder::DropCounters;
use vrrp::registry::RegistryHandle;
use vrrp::BulkState;

/// Page size when the query does not give one
const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Clone)]
struct AppState {
    registry: RegistryHandle,
    drops: Arc<DropCounters>,
    metrics: Arc<MetricsRegistry>,
}

/// Query parameters of `GET /state`
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub start: Option<usize>,
    pub count: Option<usize>,
}

pub struct StatusServer {
    state: AppState,
    listen_addr: String,
}

impl StatusServer {
    pub fn new(
        registry: RegistryHandle,
        drops: Arc<DropCounters>,
        metrics: Arc<MetricsRegistry>,
        listen_addr: String,
    ) -> Self {
        Self {
            state: AppState {
                registry,
                drops,
                metrics,
            },
            listen_addr,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/state", get(state_handler))
            .route("/metrics", get(metrics_handler))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` completes
    pub async fn run<F>(self, shutdown: F) -> common::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(listen_addr = %self.listen_addr, "Starting status HTTP server");
        let app = self.router();

        let listener = TcpListener::bind(&self.listen_addr).await?;
        info!(listen_addr = %self.listen_addr, "Status server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

/// Handler for /state: one page of the bulk-state query
async fn state_handler(
    State(state): State<AppState>,
    Query(page): Query<PageQuery>,
) -> Json<BulkState> {
    let start = page.start.unwrap_or(0);
    let count = page.count.unwrap_or(DEFAULT_PAGE_SIZE);
    Json(state.registry.bulk(start, count).await)
}

/// Handler for /metrics endpoint
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let snapshots = state.registry.bulk(0, usize::MAX).await.entries;
    state.metrics.refresh(&snapshots, &state.drops.snapshot());

    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &state.metrics.registry) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
        .into_response()
}
