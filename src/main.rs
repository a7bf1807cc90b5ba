//! Kernel Module Operator
//!
//! Runs the Module controller on spoke clusters, the ManagedClusterModule
//! controller on a hub, or both, next to health and metrics endpoints.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kernel_module_operator::{
    domain::ImageRegistryRef, metrics, run_hub_controller, run_module_controller, Error,
    OperatorConfig, RegistryClient, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Which controllers to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Module controller only
    Spoke,
    /// ManagedClusterModule controller only
    Hub,
    /// Both controllers
    Both,
}

/// Kernel Module Operator - build, sign and load out-of-tree kernel modules
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Controllers to run
    #[arg(long, env = "OPERATOR_MODE", value_enum, default_value = "spoke")]
    mode: Mode,

    /// Operator configuration file (YAML)
    #[arg(long, env = "OPERATOR_CONFIG")]
    config: Option<String>,

    /// Node label holding the full kernel version (overrides the config file)
    #[arg(long, env = "KERNEL_LABEL")]
    kernel_label: Option<String>,

    /// Namespace for hub build and sign jobs (overrides the config file)
    #[arg(long, env = "HUB_JOB_NAMESPACE")]
    hub_job_namespace: Option<String>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

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

    init_logging(&args)?;

    info!("Starting Kernel Module Operator");
    info!("  Version: {}", kernel_module_operator::VERSION);
    info!("  Mode: {:?}", args.mode);

    let mut config = match &args.config {
        Some(path) => OperatorConfig::from_file(path)?,
        None => OperatorConfig::default(),
    };
    if let Some(label) = &args.kernel_label {
        config.kernel_label = label.clone();
    }
    if let Some(namespace) = &args.hub_job_namespace {
        config.hub_job_namespace = namespace.clone();
    }
    config.validate()?;
    info!("  Kernel label: {}", config.kernel_label);
    info!("  Hub job namespace: {}", config.hub_job_namespace);
    let config = Arc::new(config);

    metrics::register();

    let registry: ImageRegistryRef = Arc::new(RegistryClient::new(&config.registry)?);
    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes API");

    // Start health server
    let health_addr = parse_addr(&args.health_addr, "health")?;
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = parse_addr(&args.metrics_addr, "metrics")?;
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    match args.mode {
        Mode::Spoke => run_module_controller(client, config, registry).await?,
        Mode::Hub => run_hub_controller(client, config, registry).await?,
        Mode::Both => {
            tokio::try_join!(
                run_module_controller(client.clone(), config.clone(), registry.clone()),
                run_hub_controller(client, config, registry),
            )?;
        }
    }

    info!("Operator shutdown complete");
    Ok(())
}

fn parse_addr(addr: &str, server: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} server address: {}", server, e)))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let directive = |d: &str| {
        d.parse::<Directive>()
            .map_err(|e| Error::Configuration(format!("Invalid log directive {}: {}", d, e)))
    };
    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive(directive("hyper=warn")?)
        .add_directive(directive("kube=info")?)
        .add_directive(directive("reqwest=warn")?);

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
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn respond(status: hyper::StatusCode, body: hyper::Body) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body);
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: SocketAddr) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => respond(StatusCode::OK, Body::from("ok")),
                _ => respond(StatusCode::NOT_FOUND, Body::from("not found")),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    match encoder.encode(&prometheus::gather(), &mut buffer) {
                        Ok(()) => {
                            let mut response = respond(StatusCode::OK, Body::from(buffer));
                            if let Ok(value) = HeaderValue::from_str(encoder.format_type()) {
                                response.headers_mut().insert(CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => respond(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            Body::from(format!("encoding failed: {}", e)),
                        ),
                    }
                }
                _ => respond(StatusCode::NOT_FOUND, Body::from("not found")),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
