//! meshcache node
//!
//! Runs one cache node, or a cluster of in-process nodes for a quick
//! stampede/coherence check.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         meshcache node                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ CacheRegistry│───▶│  RemoteStore │    │ EventChannel │       │
//! │  │  (L1 + core) │───▶│  + Lock (L2) │    │  (pub/sub)   │       │
//! │  └──────────────┘    └──────────────┘    └──────┬───────┘       │
//! │         ▲                                       │               │
//! │         └────────────── SyncAgent ◀─────────────┘               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use meshcache::adapters::{InMemoryCluster, LoggingEventChannel, RecordingEventChannel};
use meshcache::error::{Error, Result};
use meshcache::{Backends, CacheMetricsExporter, CacheRegistry, CacheSettings, SyncAgent};

// =============================================================================
// CLI Arguments
// =============================================================================

/// meshcache - Multi-level cache node with cross-node L1 sync
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML settings file
    #[arg(long, env = "MESHCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Node id (overrides the settings file; generated when unset)
    #[arg(long, env = "MESHCACHE_NODE_ID")]
    node_id: Option<String>,

    /// Redis URL for the shared L2, lock and pub/sub
    #[cfg(feature = "redis")]
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Log every published cache event at info level
    #[arg(long, env = "LOG_EVENTS")]
    log_events: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one cache node until Ctrl-C (default)
    Serve,

    /// Run several in-process nodes against shared memory backends
    Simulate {
        /// Number of nodes
        #[arg(long, default_value = "3")]
        nodes: usize,

        /// Concurrent gets for one cold key
        #[arg(long, default_value = "100")]
        requests: usize,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut settings = match &args.config {
        Some(path) => CacheSettings::from_yaml_file(path)?,
        None => CacheSettings::default(),
    };
    if args.node_id.is_some() {
        settings.node_id = args.node_id.clone();
    }
    settings.validate()?;

    match args.command {
        Some(Command::Simulate { nodes, requests }) => simulate(settings, nodes, requests).await,
        Some(Command::Serve) | None => serve(&args, settings).await,
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => args.log_level.to_lowercase(),
        _ => "info".to_string(),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},hyper=warn,redis=info", level)));

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
// Serve
// =============================================================================

#[cfg_attr(not(feature = "redis"), allow(unused_variables))]
async fn build_backends(args: &Args) -> Result<Backends> {
    #[cfg(feature = "redis")]
    {
        if let Some(url) = &args.redis_url {
            let backend = meshcache::adapters::RedisBackend::connect(url).await?;
            return Ok(backend.backends());
        }
    }
    warn!("No shared backend configured; L2, locks and events stay in this process");
    Ok(InMemoryCluster::new().backends())
}

async fn serve(args: &Args, settings: CacheSettings) -> Result<()> {
    info!("Starting meshcache node");
    info!("  Sync enabled: {}", settings.sync.enabled);
    info!("  Event topic: {}", settings.sync.topic);
    info!("  Configured caches: {}", settings.caches.len());
    info!("  Warm on start: {}", settings.warmup.warm_on_start);

    let mut backends = build_backends(args).await?;
    backends.channel = if args.log_events {
        Arc::new(LoggingEventChannel::info_level(backends.channel))
    } else {
        Arc::new(LoggingEventChannel::new(backends.channel))
    };
    let caches = Arc::new(CacheRegistry::new(settings, backends));
    for name in caches.settings().caches.keys() {
        caches.cache(name);
    }
    caches.warm_on_start().await;

    let sync = caches.start_sync().await?;
    let cancel = CancellationToken::new();
    let reporter = caches.spawn_stats_reporter(cancel.clone());

    let ready = Arc::new(AtomicBool::new(true));
    let state = Arc::new(MetricsState {
        exporter: CacheMetricsExporter::new()?,
        caches: caches.clone(),
        agent: sync.as_ref().map(|handle| handle.agent().clone()),
    });

    // Start health server
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
        if let Err(e) = run_metrics_server(&metrics_addr, state).await {
            error!("Metrics server error: {}", e);
        }
    });

    info!(node_id = %caches.node_id(), "Node running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    ready.store(false, Ordering::SeqCst);
    cancel.cancel();
    if let Some(handle) = sync {
        handle.shutdown().await;
    }
    if let Some(reporter) = reporter {
        if let Err(e) = reporter.await {
            error!("Stats reporter task failed: {}", e);
        }
    }

    info!("Node shutdown complete");
    Ok(())
}

// =============================================================================
// Simulate
// =============================================================================

async fn simulate(settings: CacheSettings, nodes: usize, requests: usize) -> Result<()> {
    if nodes == 0 {
        return Err(Error::Config("--nodes must be > 0".into()));
    }
    info!(nodes, requests, "Starting in-process simulation");

    let cluster = InMemoryCluster::new();
    // node 0 records what it announces
    let announced = Arc::new(RecordingEventChannel::new(cluster.channel.clone()));
    let mut registries = Vec::with_capacity(nodes);
    let mut handles = Vec::with_capacity(nodes);
    for i in 0..nodes {
        let node_settings = CacheSettings {
            node_id: Some(format!("sim-node-{}", i)),
            ..settings.clone()
        };
        let backends = if i == 0 {
            Backends {
                channel: announced.clone(),
                ..cluster.backends()
            }
        } else {
            cluster.backends()
        };
        let registry = Arc::new(CacheRegistry::new(node_settings, backends));
        if let Some(handle) = registry.start_sync().await? {
            handles.push(handle);
        }
        registries.push(registry);
    }

    // Stampede: every request misses the same cold key at once
    let loads = Arc::new(AtomicU64::new(0));
    let gets = (0..requests).map(|i| {
        let registry = registries[i % nodes].clone();
        let loads = loads.clone();
        async move {
            registry
                .get("sim", "hot", || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok(Some(json!({"id": "hot", "loaded": true})))
                })
                .await
        }
    });
    let results = futures::future::join_all(gets).await;
    let served = results
        .iter()
        .filter(|r| matches!(r, Ok(Some(v)) if v["id"] == "hot"))
        .count();
    let failed = results.iter().filter(|r| r.is_err()).count();
    info!(
        requests,
        served,
        failed,
        loader_invocations = loads.load(Ordering::SeqCst),
        "Stampede check finished"
    );

    // Coherence: a put on node 0 reaches every other node's L1
    let writer = &registries[0];
    writer
        .put("sim", "coherence", Some(json!({"written_by": writer.node_id()})))
        .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let coherent = registries
        .iter()
        .filter(|r| r.cache("sim").local().peek("coherence").is_some())
        .count();
    info!(
        coherent,
        nodes,
        announced = announced.len(),
        "Coherence check finished"
    );

    for registry in &registries {
        for s in registry.stats_all().await {
            info!(
                node_id = %registry.node_id(),
                cache = %s.cache_name,
                requests = s.requests,
                l1_hits = s.l1.hits,
                l2_hits = s.l2.hits,
                loads = s.loads,
                hit_ratio = %format!("{:.2}%", s.hit_ratio * 100.0),
                "Node stats"
            );
        }
    }

    for handle in handles {
        handle.shutdown().await;
    }
    info!("Simulation complete");
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid health server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind health server: {}", e)))?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let ready = ready.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let response = match req.uri().path() {
                    "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                    "/readyz" if ready.load(Ordering::SeqCst) => {
                        text_response(StatusCode::OK, "ok")
                    }
                    "/readyz" => text_response(StatusCode::SERVICE_UNAVAILABLE, "shutting down"),
                    _ => text_response(StatusCode::NOT_FOUND, "not found"),
                };
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

struct MetricsState {
    exporter: CacheMetricsExporter,
    caches: Arc<CacheRegistry>,
    agent: Option<Arc<SyncAgent>>,
}

impl MetricsState {
    async fn scrape(&self) -> Response<Full<Bytes>> {
        self.exporter.refresh(&self.caches).await;
        if let Some(agent) = &self.agent {
            self.exporter.observe_sync(&agent.stats());
        }
        match self.exporter.gather_text() {
            Ok(body) => {
                let mut response = text_response(StatusCode::OK, body);
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static(self.exporter.format_type()),
                );
                response
            }
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
            }
        }
    }
}

async fn run_metrics_server(addr: &str, state: Arc<MetricsState>) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid metrics server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let state = state.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => state.scrape().await,
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
