//! REST API Handlers
//!
//! Read access to the latest scan, on-demand scans, health and readiness
//! probes, and the Prometheus exposition.

use crate::error::Error;
use crate::metrics::PrometheusMetrics;
use crate::monitor::{ScanOrchestrator, ScanResult};
use crate::orphan::OrphanFinding;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Findings of one category from the latest scan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanListResponse {
    pub scan_id: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub count: usize,
    pub items: Vec<OrphanFinding>,
}

/// Readiness probe body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessResponse {
    pub ready: bool,
    pub systems: BTreeMap<String, bool>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiErrorResponse {
    fn new(error: &str, message: impl Into<String>) -> Self {
        Self {
            error: error.to_string(),
            message: message.into(),
            details: None,
        }
    }

    fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

fn error_response(status: StatusCode, body: ApiErrorResponse) -> Response {
    (status, Json(body)).into_response()
}

fn no_scan_yet() -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        ApiErrorResponse::new("no_scan", "No scan has completed yet"),
    )
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    orchestrator: Arc<ScanOrchestrator>,
    metrics: Arc<PrometheusMetrics>,
}

impl RestRouter {
    pub fn new(orchestrator: Arc<ScanOrchestrator>, metrics: Arc<PrometheusMetrics>) -> Self {
        Self {
            orchestrator,
            metrics,
        }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            orchestrator: self.orchestrator,
            metrics: self.metrics,
        };

        Router::new()
            // Scan endpoints
            .route("/v1/scan", get(get_last_scan).post(trigger_scan))
            .route("/v1/orphans/:kind", get(list_orphans))
            // Probes
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .route("/metrics", get(metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    orchestrator: Arc<ScanOrchestrator>,
    metrics: Arc<PrometheusMetrics>,
}

// =============================================================================
// Handlers
// =============================================================================

async fn get_last_scan(State(state): State<AppState>) -> Response {
    match state.orchestrator.last_result() {
        Some(result) => Json(result.as_ref()).into_response(),
        None => no_scan_yet(),
    }
}

/// Run an on-demand scan, or join the one in flight
async fn trigger_scan(State(state): State<AppState>) -> Response {
    info!("On-demand scan requested");

    // Detached so a disconnecting client does not abort the scan
    let orchestrator = state.orchestrator.clone();
    let outcome = tokio::spawn(async move { orchestrator.trigger_scan().await }).await;

    match outcome {
        Ok(Ok(result)) => Json(result.as_ref()).into_response(),
        Ok(Err(e @ (Error::Stopped | Error::Cancelled { .. }))) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            ApiErrorResponse::new("scan_unavailable", "Scan did not complete")
                .with_details(e.to_string()),
        ),
        Ok(Err(e)) => {
            error!(error = %e, "On-demand scan failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiErrorResponse::new("scan_failed", "Scan failed").with_details(e.to_string()),
            )
        }
        Err(e) => {
            error!(error = %e, "On-demand scan task panicked");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiErrorResponse::new("internal_error", "Scan task failed"),
            )
        }
    }
}

fn findings_for<'a>(result: &'a ScanResult, kind: &str) -> Option<&'a [OrphanFinding]> {
    match kind {
        "volumes" => Some(&result.orphaned_volumes),
        "claims" => Some(&result.orphaned_claims),
        "snapshots" => Some(&result.orphaned_snapshots),
        _ => None,
    }
}

async fn list_orphans(State(state): State<AppState>, Path(kind): Path<String>) -> Response {
    let kind = kind.to_lowercase();
    let Some(result) = state.orchestrator.last_result() else {
        return no_scan_yet();
    };

    match findings_for(&result, &kind) {
        Some(items) => Json(OrphanListResponse {
            scan_id: result.scan_id,
            timestamp: result.timestamp,
            count: items.len(),
            items: items.to_vec(),
            kind,
        })
        .into_response(),
        None => error_response(
            StatusCode::BAD_REQUEST,
            ApiErrorResponse::new(
                "invalid_kind",
                format!(
                    "Invalid orphan kind: {}. Use 'volumes', 'claims', or 'snapshots'",
                    kind
                ),
            ),
        ),
    }
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Ready once both upstream systems answer
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let systems = state.orchestrator.check_connectivity().await;
    let ready = !systems.is_empty() && systems.values().all(|up| *up);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadinessResponse { ready, systems }))
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.encode() {
        Ok((content_type, body)) => {
            ([(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiErrorResponse::new("metrics_error", e.to_string()),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{ResourceIdentity, ResourceKind, ResourcePhase};
    use crate::gateways::{FailureMode, InMemoryBackend, InMemoryCluster};
    use crate::monitor::OrchestratorConfig;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::Duration as ChronoDuration;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    struct Fixture {
        router: Router,
        orchestrator: Arc<ScanOrchestrator>,
        backend: Arc<InMemoryBackend>,
    }

    fn fixture() -> Fixture {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.add_claim(
            ResourceIdentity::new(
                ResourceKind::Claim,
                "c1",
                Utc::now() - ChronoDuration::hours(2),
            )
            .with_namespace("apps")
            .with_phase(ResourcePhase::Pending),
        );
        let backend = Arc::new(InMemoryBackend::new());
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let orchestrator = ScanOrchestrator::new(
            OrchestratorConfig::default(),
            cluster,
            backend.clone(),
            metrics.clone(),
            CancellationToken::new(),
        )
        .unwrap();

        Fixture {
            router: RestRouter::new(orchestrator.clone(), metrics).build(),
            orchestrator,
            backend,
        }
    }

    async fn call(router: &Router, method: &str, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_health() {
        let fx = fixture();
        let (status, body) = call(&fx.router, "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn test_last_scan_before_first_scan() {
        let fx = fixture();
        let (status, body) = call(&fx.router, "GET", "/v1/scan").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let err: ApiErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.error, "no_scan");

        let (status, _) = call(&fx.router, "GET", "/v1/orphans/claims").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_trigger_then_read() {
        let fx = fixture();
        let (status, body) = call(&fx.router, "POST", "/v1/scan").await;
        assert_eq!(status, StatusCode::OK);
        let result: ScanResult = serde_json::from_slice(&body).unwrap();
        assert_eq!(result.scan_id, 1);
        assert_eq!(result.orphaned_claims.len(), 1);

        let (status, body) = call(&fx.router, "GET", "/v1/scan").await;
        assert_eq!(status, StatusCode::OK);
        let cached: ScanResult = serde_json::from_slice(&body).unwrap();
        assert_eq!(cached.scan_id, 1);

        let (status, body) = call(&fx.router, "GET", "/v1/orphans/Claims").await;
        assert_eq!(status, StatusCode::OK);
        let list: OrphanListResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(list.count, 1);
        assert_eq!(list.kind, "claims");
        assert_eq!(list.items[0].name, "c1");

        let (status, _) = call(&fx.router, "GET", "/v1/orphans/pods").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_trigger_after_shutdown() {
        let fx = fixture();
        fx.orchestrator.shutdown().await;
        let (status, body) = call(&fx.router, "POST", "/v1/scan").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let err: ApiErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(err.error, "scan_unavailable");
    }

    #[tokio::test]
    async fn test_readiness_follows_connectivity() {
        let fx = fixture();
        let (status, _) = call(&fx.router, "GET", "/ready").await;
        assert_eq!(status, StatusCode::OK);

        fx.backend
            .fail_always("test_connection", FailureMode::Unauthorized);
        let (status, body) = call(&fx.router, "GET", "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let ready: ReadinessResponse = serde_json::from_slice(&body).unwrap();
        assert!(!ready.ready);
        assert_eq!(ready.systems.get("truenas"), Some(&false));
        assert_eq!(ready.systems.get("kubernetes"), Some(&true));
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let fx = fixture();
        call(&fx.router, "POST", "/v1/scan").await;
        let (status, body) = call(&fx.router, "GET", "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("orphan_monitor_orphaned_claims 1"));
    }
}
