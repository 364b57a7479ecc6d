//! TrueNAS Orphan Monitor
//!
//! Periodically reconciles Kubernetes storage objects against a TrueNAS
//! backend and reports orphans through a REST API and Prometheus metrics.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use truenas_orphan_monitor::config::parse_duration;
use truenas_orphan_monitor::{
    ApiServer, ApiServerConfig, AppConfig, BackendGatewayRef, ClusterGatewayRef, Error,
    KubeClusterGateway, OrchestratorConfig, PrometheusMetrics, Resilient, Result, RetryPolicy,
    ScanOrchestrator, TrueNasGateway,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// TrueNAS Orphan Monitor - orphaned volume, claim and snapshot detection
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// YAML configuration file
    #[arg(long, short = 'c', env = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// TrueNAS base URL
    #[arg(long, env = "TRUENAS_URL")]
    truenas_url: Option<String>,

    /// TrueNAS API key
    #[arg(long, env = "TRUENAS_API_KEY", hide_env_values = true)]
    truenas_api_key: Option<String>,

    /// TrueNAS username (basic auth)
    #[arg(long, env = "TRUENAS_USERNAME")]
    truenas_username: Option<String>,

    /// TrueNAS password (basic auth)
    #[arg(long, env = "TRUENAS_PASSWORD", hide_env_values = true)]
    truenas_password: Option<String>,

    /// Skip TLS certificate verification for TrueNAS
    #[arg(long, env = "TRUENAS_INSECURE")]
    truenas_insecure: bool,

    /// Parent dataset of CSI volumes, enables backend-side checks
    #[arg(long, env = "DATASET_PREFIX")]
    dataset_prefix: Option<String>,

    /// Restrict claim and snapshot checks to one namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Scan interval (e.g. 30s, 5m, 1h)
    #[arg(long, env = "SCAN_INTERVAL")]
    scan_interval: Option<String>,

    /// Run a single scan, print it as JSON and exit
    #[arg(long, env = "RUN_ONCE")]
    once: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = load_config(&args)?;

    info!("Starting TrueNAS Orphan Monitor");
    info!("  Version: {}", truenas_orphan_monitor::VERSION);
    info!("  TrueNAS: {}", config.truenas.url);
    info!("  REST API: {}", args.api_addr);
    info!("  Metrics: {}", args.metrics_addr);
    info!(
        "  Scan interval: {}",
        truenas_orphan_monitor::config::format_duration(config.scan.interval)
    );

    let shutdown = CancellationToken::new();
    let policy = RetryPolicy::from(&config.retry);

    let kube = KubeClusterGateway::try_default(config.kubernetes.clone()).await?;
    let cluster: ClusterGatewayRef = Arc::new(Resilient::new(
        Arc::new(kube),
        policy.clone(),
        shutdown.child_token(),
    ));
    let truenas = TrueNasGateway::new(config.truenas.clone())?;
    let backend: BackendGatewayRef = Arc::new(Resilient::new(
        Arc::new(truenas),
        policy,
        shutdown.child_token(),
    ));

    let metrics = Arc::new(PrometheusMetrics::new()?);
    let orchestrator = ScanOrchestrator::new(
        OrchestratorConfig::from(&config),
        cluster,
        backend,
        metrics.clone(),
        shutdown.clone(),
    )?;

    if args.once {
        let result = orchestrator.trigger_scan().await?;
        println!("{}", serde_json::to_string_pretty(result.as_ref())?);
        return Ok(());
    }

    // Start metrics server
    let metrics_addr: SocketAddr = args
        .metrics_addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid metrics address: {}", e)))?;
    let metrics_server = tokio::spawn(run_metrics_server(
        metrics_addr,
        metrics.clone(),
        shutdown.clone(),
    ));

    // Start periodic scans
    let scanner = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run().await })
    };

    // Create and run API server
    let api_config = ApiServerConfig {
        rest_addr: args
            .api_addr
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid REST API address: {}", e)))?,
    };
    let api_server = ApiServer::new(
        api_config,
        orchestrator.clone(),
        metrics,
        shutdown.child_token(),
    );
    let api = tokio::spawn(async move { api_server.run().await });

    wait_for_signal().await;
    info!("Shutdown signal received");

    orchestrator.shutdown().await;

    for (name, handle) in [("REST API", api), ("metrics", metrics_server)] {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{} server error: {}", name, e),
            Err(e) => error!("{} server task failed: {}", name, e),
        }
    }
    if let Err(e) = scanner.await {
        error!("Scan loop task failed: {}", e);
    }

    info!("TrueNAS Orphan Monitor stopped");
    Ok(())
}

/// Merge the config file, then command-line overrides, and validate
fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            AppConfig::from_file(path)?
        }
        None => AppConfig::default(),
    };

    if let Some(url) = &args.truenas_url {
        config.truenas.url = url.trim_end_matches('/').to_string();
    }
    if args.truenas_api_key.is_some() {
        config.truenas.api_key = args.truenas_api_key.clone();
    }
    if args.truenas_username.is_some() {
        config.truenas.username = args.truenas_username.clone();
    }
    if args.truenas_password.is_some() {
        config.truenas.password = args.truenas_password.clone();
    }
    if args.truenas_insecure {
        config.truenas.verify_tls = false;
    }
    if args.dataset_prefix.is_some() {
        config.truenas.dataset_prefix = args.dataset_prefix.clone();
    }
    if args.namespace.is_some() {
        config.scan.namespace = args.namespace.clone();
    }
    if let Some(interval) = &args.scan_interval {
        config.scan.interval = parse_duration(interval)?;
    }

    config.validate()?;
    Ok(config)
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
    }
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "axum=info", "reqwest=warn"] {
        if let Ok(d) = directive.parse() {
            filter = filter.add_directive(d);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<PrometheusMetrics>,
    shutdown: CancellationToken,
) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok((content_type, buffer)) => {
                                let mut response = Response::new(Body::from(buffer));
                                if let Ok(value) = HeaderValue::from_str(&content_type) {
                                    response.headers_mut().insert(CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => {
                                error!("Failed to encode metrics: {}", e);
                                let mut response = Response::new(Body::from(e.to_string()));
                                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                                response
                            }
                        },
                        "/healthz" => Response::new(Body::from("ok")),
                        _ => {
                            let mut response = Response::new(Body::from("not found"));
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            response
                        }
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
