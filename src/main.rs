//! Replicated Volume Operator
//!
//! Runs the volume and attachment controllers against a Kubernetes cluster,
//! or against an in-memory store with `--standalone`.

use clap::Parser;
use kube::CustomResourceExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use replicated_volume_operator::{
    Attachment, Error, EventSource, InMemoryProvisioner, InMemoryStore, KubeStore, NodeInfo,
    NodeInventory, ObjectStoreRef, Operator, OperatorConfig, PlacementPolicy, Result, Volume,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Replicated Volume Operator - volume lifecycle and mount replica controller
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace holding Volume and Attachment objects
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "storage-system")]
    namespace: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Concurrent reconciles per resource kind
    #[arg(long, env = "CONCURRENCY", default_value = "10")]
    concurrency: usize,

    /// Seconds between a primary deletion and cleanup of its volume's attachments
    #[arg(long, env = "GC_GRACE_SECS", default_value = "300")]
    gc_grace_secs: u64,

    /// Replicas created per reconcile pass
    #[arg(long, env = "MAX_REPLICA_UPDATE_COUNT", default_value = "1")]
    max_replica_update_count: usize,

    /// Attempts made to replace a lost replica
    #[arg(long, env = "MAX_REPLICA_RETRIES", default_value = "5")]
    max_replica_retries: u32,

    /// Seconds between checks that a deleted replica is gone
    #[arg(long, env = "DELETION_POLL_SECS", default_value = "10")]
    deletion_poll_secs: u64,

    /// Replica placement policy (lexical, spread-zones)
    #[arg(long, env = "PLACEMENT_POLICY", default_value = "spread-zones")]
    placement_policy: PlacementPolicy,

    /// Skip rebuilding Volumes from existing PersistentVolumes at startup
    #[arg(long, env = "SKIP_RECOVERY")]
    skip_recovery: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Run in standalone mode (no Kubernetes)
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// Simulated nodes in standalone mode
    #[arg(long, env = "STANDALONE_NODES", default_value = "3")]
    standalone_nodes: usize,

    /// Print the CRD manifests and exit
    #[arg(long)]
    print_crds: bool,
}

impl Args {
    fn operator_config(&self) -> OperatorConfig {
        let mut config = OperatorConfig {
            namespace: self.namespace.clone(),
            concurrency: self.concurrency,
            recover_on_start: !self.skip_recovery,
            ..Default::default()
        };
        config.gc.grace_interval = Duration::from_secs(self.gc_grace_secs);
        config.replica.max_replica_update_count = self.max_replica_update_count;
        config.replica.max_replica_retries = self.max_replica_retries;
        config.replica.deletion_poll_interval = Duration::from_secs(self.deletion_poll_secs);
        config.replica.placement_policy = self.placement_policy;
        config
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crds {
        return print_crds();
    }

    // Initialize logging
    init_logging(&args)?;

    info!("Starting Replicated Volume Operator");
    info!("  Version: {}", replicated_volume_operator::VERSION);
    info!("  Namespace: {}", args.namespace);
    info!("  Placement policy: {}", args.placement_policy);
    info!("  GC grace: {}s", args.gc_grace_secs);
    info!("  Standalone mode: {}", args.standalone);

    let config = args.operator_config();
    let inventory = Arc::new(NodeInventory::new());
    let provisioner = Arc::new(InMemoryProvisioner::new());

    let (store, source): (ObjectStoreRef, EventSource) = if args.standalone {
        for i in 0..args.standalone_nodes {
            inventory.upsert(NodeInfo::new(format!("node-{}", i)));
        }
        let store = Arc::new(InMemoryStore::new(args.namespace.clone()));
        info!(
            "Using in-memory store with {} simulated node(s)",
            args.standalone_nodes
        );
        (store.clone(), EventSource::InMemory(store))
    } else {
        let client = kube::Client::try_default().await?;
        warn!("No cloud provisioner configured, disks are simulated in memory");
        (
            Arc::new(KubeStore::new(client.clone(), &args.namespace)),
            EventSource::Kubernetes(client),
        )
    };

    let operator = Operator::new(
        config,
        store,
        provisioner,
        inventory,
        prometheus::default_registry(),
    )?;

    // Start health server
    let ready = Arc::new(AtomicBool::new(false));
    let health_addr = args.health_addr.clone();
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received interrupt, shutting down"),
            Err(e) => error!("Failed to listen for interrupt: {}", e),
        }
        signal.cancel();
    });

    ready.store(true, Ordering::Relaxed);
    operator.run(source, shutdown).await?;

    info!("Operator shutdown complete");
    Ok(())
}

fn print_crds() -> Result<()> {
    let volume = serde_yaml::to_string(&Volume::crd())?;
    let attachment = serde_yaml::to_string(&Attachment::crd())?;
    print!("{}---\n{}", volume, attachment);
    Ok(())
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

    let directive = |d: &str| -> Result<tracing_subscriber::filter::Directive> {
        d.parse()
            .map_err(|e| Error::Configuration(format!("Invalid log directive {}: {}", d, e)))
    };
    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive(directive("hyper=warn")?)
        .add_directive(directive("kube=info")?);

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

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::Relaxed);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" if ready => text_response(StatusCode::OK, "ok"),
                        "/readyz" => text_response(StatusCode::SERVICE_UNAVAILABLE, "starting"),
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid health server address: {}", e)))?;

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

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = prometheus::gather();
                    let mut buffer = Vec::new();
                    match encoder.encode(&metric_families, &mut buffer) {
                        Ok(()) => {
                            let mut response = Response::new(Body::from(buffer));
                            if let Ok(value) = encoder.format_type().parse() {
                                response
                                    .headers_mut()
                                    .insert(hyper::header::CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => {
                            warn!("Failed to encode metrics: {}", e);
                            text_response(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
                        }
                    }
                }
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
