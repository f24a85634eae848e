//! Kiln - Development-Time Compile Server
//!
//! Serves project files through a compile cache with conditional HTTP
//! semantics. The binary wires the lock registry, cache engine and serving
//! adapter together and runs auxiliary health and metrics listeners.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kiln::cache::{CacheConfig, CompileCache};
use kiln::compiler::PassthroughCompiler;
use kiln::error::{Error, Result};
use kiln::lock::{LockConfig, ResourceLockRegistry};
use kiln::operation::{run_stoppable_operation, CancellationSource};
use kiln::server::{self, CacheStrategy, ServeConfig, ServeContext};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Kiln - development-time compile server with on-disk artifact caching
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Compile server bind address
    #[arg(long, env = "KILN_LISTEN", default_value = "127.0.0.1:3464")]
    listen: String,

    /// Health server bind address
    #[arg(long, env = "KILN_HEALTH_ADDR", default_value = "127.0.0.1:3465")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "KILN_METRICS_ADDR", default_value = "127.0.0.1:3466")]
    metrics_addr: String,

    /// Project root directory served by the compile server
    #[arg(long, env = "KILN_PROJECT_ROOT", default_value = ".")]
    project_root: PathBuf,

    /// Cache directory, relative to the project root
    #[arg(long, env = "KILN_CACHE_DIR", default_value = ".kiln")]
    cache_dir: PathBuf,

    /// Conditional-request strategy (etag, mtime, none)
    #[arg(long, env = "KILN_CACHE_STRATEGY", default_value = "etag")]
    cache_strategy: String,

    /// Disable reading previously cached artifacts
    #[arg(long, env = "KILN_DISABLE_CACHE_READ")]
    disable_cache_read: bool,

    /// Disable writing artifacts and cache entries to disk
    #[arg(long, env = "KILN_DISABLE_PERSIST")]
    disable_persist: bool,

    /// Track validated-hit counters in cache entries
    #[arg(long, env = "KILN_CACHE_HIT_TRACKING")]
    cache_hit_tracking: bool,

    /// Guard cache targets with OS file locks for multi-process setups
    #[arg(long, env = "KILN_CROSS_PROCESS_LOCKING")]
    cross_process_locking: bool,

    /// Per-request deadline in seconds
    #[arg(long, env = "KILN_REQUEST_TIMEOUT_SECONDS", default_value = "30")]
    request_timeout_seconds: u64,

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

    info!("Starting Kiln compile server v{}", kiln::VERSION);
    info!("  Listen address: {}", args.listen);
    info!("  Project root: {}", args.project_root.display());
    info!("  Cache strategy: {}", args.cache_strategy);
    info!("  Cross-process locking: {}", args.cross_process_locking);

    let strategy = match args.cache_strategy.to_lowercase().as_str() {
        "etag" => CacheStrategy::Etag,
        "mtime" => CacheStrategy::Mtime,
        "none" => CacheStrategy::None,
        other => {
            return Err(Error::Config(format!(
                "unknown cache strategy '{other}' (expected etag, mtime or none)"
            )));
        }
    };

    let project_root = args.project_root.canonicalize().map_err(|err| {
        Error::Config(format!(
            "project root {} is not accessible: {err}",
            args.project_root.display()
        ))
    })?;
    let cache_dir = project_root.join(&args.cache_dir);

    // One registry per server instance; tests and embedders build their own.
    let locks = Arc::new(ResourceLockRegistry::new(LockConfig {
        cross_process: args.cross_process_locking,
        ..LockConfig::default()
    }));

    let cache = CompileCache::new(
        CacheConfig {
            project_root: project_root.clone(),
            read_from_cache: !args.disable_cache_read,
            persist: !args.disable_persist,
            track_hits: args.cache_hit_tracking,
            ..CacheConfig::default()
        },
        locks,
    );

    let shutdown = CancellationSource::new();
    let ctx = Arc::new(ServeContext {
        cache,
        compiler: Arc::new(PassthroughCompiler),
        config: ServeConfig {
            strategy,
            project_root,
            cache_dir,
            request_timeout: Duration::from_secs(args.request_timeout_seconds),
        },
        shutdown: shutdown.token(),
    });

    // Ctrl-C cancels the server-wide scope; every in-flight request runs
    // under a token composed from it.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel("shutdown requested");
        }
    });

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
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

    let listen_addr = args
        .listen
        .parse()
        .map_err(|err| Error::Config(format!("invalid listen address: {err}")))?;

    // The compile server runs as a stoppable operation: whether the shutdown
    // scope cancels or a manual stop fires first, the listener is torn down
    // exactly once.
    let token = ctx.shutdown.clone();
    let server_ctx = Arc::clone(&ctx);
    let operation = run_stoppable_operation(
        &token,
        async move { server::start(server_ctx, listen_addr).await.map_err(Arc::new) },
        |started, reason| async move {
            if let Ok(handle) = started {
                handle.shutdown(&reason);
            }
        },
    )?;
    let stopper = operation.stopper();

    match operation.wait().await {
        Ok(Ok(handle)) => {
            info!("Compile server ready on {}", handle.local_addr());
            ctx.shutdown.cancelled().await;
            stopper
                .stop(ctx.shutdown.reason().unwrap_or_default())
                .await;
            info!("Compile server shutdown complete");
            Ok(())
        }
        Ok(Err(err)) => Err(Arc::try_unwrap(err)
            .unwrap_or_else(|shared| Error::Internal(shared.to_string()))),
        Err(cancelled) => {
            info!("Startup cancelled: {}", cancelled.reason);
            Ok(())
        }
    }
}

// =============================================================================
// Logging Setup
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

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("tower=warn".parse().unwrap());

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
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    async fn health_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/healthz" | "/livez" | "/readyz" => Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("ok")))
                .unwrap(),
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("not found")))
                .unwrap(),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("invalid health server address: {e}")))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("failed to bind health server: {e}")))?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("health server accept error: {e}")))?;

        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(health_handler))
                .await
            {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::{Encoder, TextEncoder};
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    // Touch the lazily-registered metrics so scrapes see them from the start.
    kiln::server::INFLIGHT_REQUESTS.set(0);

    async fn metrics_handler(
        req: Request<hyper::body::Incoming>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        let response = match req.uri().path() {
            "/metrics" => {
                let encoder = TextEncoder::new();
                let metric_families = prometheus::gather();
                let mut buffer = Vec::new();
                encoder.encode(&metric_families, &mut buffer).unwrap();

                Response::builder()
                    .status(StatusCode::OK)
                    .header("Content-Type", encoder.format_type())
                    .body(Full::new(Bytes::from(buffer)))
                    .unwrap()
            }
            _ => Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from("not found")))
                .unwrap(),
        };
        Ok(response)
    }

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("invalid metrics server address: {e}")))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("failed to bind metrics server: {e}")))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("metrics server accept error: {e}")))?;

        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(metrics_handler))
                .await
            {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
