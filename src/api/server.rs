//! API Server
//!
//! Serves the REST router until the shutdown token is cancelled.

use crate::error::{Error, Result};
use crate::metrics::PrometheusMetrics;
use crate::monitor::ScanOrchestrator;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::rest::RestRouter;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

pub struct ApiServer {
    config: ApiServerConfig,
    orchestrator: Arc<ScanOrchestrator>,
    metrics: Arc<PrometheusMetrics>,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub fn new(
        config: ApiServerConfig,
        orchestrator: Arc<ScanOrchestrator>,
        metrics: Arc<PrometheusMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            orchestrator,
            metrics,
            shutdown,
        }
    }

    /// Serve until the shutdown token fires
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.rest_addr;
        let app = RestRouter::new(self.orchestrator.clone(), self.metrics.clone()).build();

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
        info!("REST API listening on {}", addr);

        let shutdown = self.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("REST server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

        Ok(())
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateways::{InMemoryBackend, InMemoryCluster};
    use crate::monitor::OrchestratorConfig;

    #[test]
    fn test_default_config() {
        let config = ApiServerConfig::default();
        assert_eq!(config.rest_addr.port(), 8090);
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        let orchestrator = ScanOrchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(InMemoryCluster::new()),
            Arc::new(InMemoryBackend::new()),
            metrics.clone(),
            CancellationToken::new(),
        )
        .unwrap();
        let server = ApiServer::new(
            ApiServerConfig {
                rest_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            },
            orchestrator,
            metrics,
            CancellationToken::new(),
        );

        server.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(5), server.run())
            .await
            .expect("server did not stop")
            .unwrap();
    }
}
