//! HTTP Serving Adapter
//!
//! Thin glue that exposes the compile cache over HTTP/1: each request path
//! maps to a project file, the engine produces (or validates) its compiled
//! artifact, and the adapter answers with conditional-request semantics.

mod metrics;
mod serve;

pub use metrics::{COMPILE_OUTCOMES, INFLIGHT_REQUESTS, REQUESTS_TOTAL};
pub use serve::handle_request;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::cache::CompileCache;
use crate::compiler::Compiler;
use crate::error::{Error, Result};
use crate::operation::{CancellationSource, CancellationToken};

/// Which conditional-request strategy the server advertises
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStrategy {
    /// `ETag` / `If-None-Match`
    Etag,
    /// `Last-Modified` / `If-Modified-Since` (second precision)
    Mtime,
    /// No validators; responses carry `Cache-Control: no-store`
    None,
}

impl std::fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheStrategy::Etag => write!(f, "etag"),
            CacheStrategy::Mtime => write!(f, "mtime"),
            CacheStrategy::None => write!(f, "none"),
        }
    }
}

/// Configuration for the serving adapter
#[derive(Debug, Clone)]
pub struct ServeConfig {
    /// Conditional-request strategy
    pub strategy: CacheStrategy,

    /// Directory request paths resolve inside
    pub project_root: PathBuf,

    /// Directory compiled artifacts are written under (inside the root)
    pub cache_dir: PathBuf,

    /// Deadline for one request; expiry cancels the compile with reason
    /// "timeout"
    pub request_timeout: Duration,
}

/// Everything a request handler needs, shared across connections.
pub struct ServeContext {
    /// The cache engine
    pub cache: CompileCache,
    /// The external transform
    pub compiler: Arc<dyn Compiler>,
    /// Serving configuration
    pub config: ServeConfig,
    /// Server-wide cancellation scope; composed with each request's deadline
    pub shutdown: CancellationToken,
}

struct HandleInner {
    addr: SocketAddr,
    shutdown: CancellationSource,
}

/// Running compile server. Cloneable; any clone can stop it.
#[derive(Clone)]
pub struct ServerHandle {
    inner: Arc<HandleInner>,
}

impl ServerHandle {
    /// Address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Stops accepting connections. Idempotent.
    pub fn shutdown(&self, reason: &str) {
        self.inner.shutdown.cancel(reason);
    }
}

/// Binds `addr` and starts the accept loop in the background.
pub async fn start(ctx: Arc<ServeContext>, addr: SocketAddr) -> Result<ServerHandle> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| Error::Internal(format!("failed to bind compile server on {addr}: {err}")))?;
    let local_addr = listener
        .local_addr()
        .map_err(|err| Error::Internal(format!("failed to read bound address: {err}")))?;

    let shutdown = CancellationSource::new();
    let accept_token = shutdown.token();
    info!("compile server listening on {}", local_addr);

    tokio::spawn(accept_loop(listener, ctx, accept_token));

    Ok(ServerHandle {
        inner: Arc::new(HandleInner {
            addr: local_addr,
            shutdown,
        }),
    })
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ServeContext>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!(
                    reason = token.reason().unwrap_or_default(),
                    "compile server stopped accepting connections"
                );
                break;
            }
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!("compile server accept error: {}", err);
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let ctx = Arc::clone(&ctx);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let ctx = Arc::clone(&ctx);
                        async move { Ok::<_, Infallible>(handle_request(ctx, req).await) }
                    });
                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        error!("compile server connection error: {}", err);
                    }
                });
            }
        }
    }
}
