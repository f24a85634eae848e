//! End-to-end conditional HTTP scenarios against a running compile server.
//!
//! Requests go over a real TCP connection so status lines, validator headers
//! and bodies are observed exactly as a client would see them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use kiln::cache::{CacheConfig, CacheEntry, CompileCache};
use kiln::compiler::{CompileError, CompileRequest, CompileResult, Compiler, PassthroughCompiler};
use kiln::lock::{LockConfig, ResourceLockRegistry};
use kiln::operation::CancellationSource;
use kiln::server::{self, CacheStrategy, ServeConfig, ServeContext, ServerHandle};

// =============================================================================
// Harness
// =============================================================================

struct HttpResponse {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }
}

async fn http_get(addr: SocketAddr, path: &str, headers: &[(&str, &str)]) -> HttpResponse {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let mut request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n");
    for (name, value) in headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("send request");

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.expect("read response");

    let split = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .expect("response has a header block");
    let head = String::from_utf8_lossy(&raw[..split]).to_string();
    let body = raw[split + 4..].to_vec();

    let mut lines = head.lines();
    let status_line = lines.next().expect("status line");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .expect("status code")
        .parse()
        .expect("numeric status");

    let mut parsed_headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            parsed_headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }

    HttpResponse {
        status,
        headers: parsed_headers,
        body,
    }
}

async fn start_server(
    root: &Path,
    strategy: CacheStrategy,
    compiler: Arc<dyn Compiler>,
) -> ServerHandle {
    let locks = Arc::new(ResourceLockRegistry::new(LockConfig::default()));
    let cache = CompileCache::new(
        CacheConfig {
            project_root: root.to_path_buf(),
            ..CacheConfig::default()
        },
        locks,
    );
    let shutdown = CancellationSource::new();
    let ctx = Arc::new(ServeContext {
        cache,
        compiler,
        config: ServeConfig {
            strategy,
            project_root: root.to_path_buf(),
            cache_dir: root.join(".kiln"),
            request_timeout: Duration::from_secs(10),
        },
        shutdown: shutdown.token(),
    });
    server::start(ctx, "127.0.0.1:0".parse().expect("loopback addr"))
        .await
        .expect("server starts")
}

async fn read_meta(root: &Path, relative: &str) -> CacheEntry {
    let compiled = root.join(".kiln").join(relative);
    let bytes = tokio::fs::read(kiln::cache::meta_path(&compiled))
        .await
        .expect("meta.json exists");
    serde_json::from_slice(&bytes).expect("meta.json parses")
}

// =============================================================================
// ETag strategy
// =============================================================================

#[tokio::test]
async fn etag_roundtrip_serves_validates_and_invalidates() {
    let dir = tempfile::tempdir().expect("tempdir");
    tokio::fs::write(dir.path().join("a.js"), "export const a = 1;\n")
        .await
        .expect("source");

    let handle = start_server(dir.path(), CacheStrategy::Etag, Arc::new(PassthroughCompiler)).await;
    let addr = handle.local_addr();

    // Fresh compile: 200 with a validator, entry tracks a.js under the same
    // validator (the passthrough output is byte-identical to the source).
    let first = http_get(addr, "/a.js", &[]).await;
    assert_eq!(first.status, 200);
    assert_eq!(first.header("content-type"), Some("application/javascript"));
    assert_eq!(first.body, b"export const a = 1;\n");
    let etag_1 = first.header("etag").expect("etag header").to_string();

    let entry = read_meta(dir.path(), "a.js").await;
    assert_eq!(entry.sources.len(), 1);
    assert_eq!(entry.sources[0].path, Path::new("a.js"));
    assert_eq!(entry.sources[0].etag, etag_1);

    // Conditional revalidation: 304, empty body.
    let second = http_get(addr, "/a.js", &[("If-None-Match", &etag_1)]).await;
    assert_eq!(second.status, 304);
    assert!(second.body.is_empty());

    // Mutate the source; the stale validator must not produce a 304.
    tokio::fs::write(dir.path().join("a.js"), "export const a = 2;\n")
        .await
        .expect("mutate");

    let third = http_get(addr, "/a.js", &[("If-None-Match", &etag_1)]).await;
    assert_eq!(third.status, 200);
    let etag_2 = third.header("etag").expect("etag header").to_string();
    assert_ne!(etag_2, etag_1);
    assert_eq!(third.body, b"export const a = 2;\n");

    let entry = read_meta(dir.path(), "a.js").await;
    assert_eq!(entry.sources[0].etag, etag_2);

    handle.shutdown("test done");
}

// =============================================================================
// Mtime strategy
// =============================================================================

#[tokio::test]
async fn mtime_strategy_honours_if_modified_since() {
    let dir = tempfile::tempdir().expect("tempdir");
    tokio::fs::write(dir.path().join("a.js"), "export const a = 1;\n")
        .await
        .expect("source");

    let handle =
        start_server(dir.path(), CacheStrategy::Mtime, Arc::new(PassthroughCompiler)).await;
    let addr = handle.local_addr();

    let first = http_get(addr, "/a.js", &[]).await;
    assert_eq!(first.status, 200);
    let last_modified = first
        .header("last-modified")
        .expect("last-modified header")
        .to_string();

    let second = http_get(addr, "/a.js", &[("If-Modified-Since", &last_modified)]).await;
    assert_eq!(second.status, 304);

    let malformed = http_get(addr, "/a.js", &[("If-Modified-Since", "not a date")]).await;
    assert_eq!(malformed.status, 400);

    handle.shutdown("test done");
}

// =============================================================================
// Disabled caching
// =============================================================================

#[tokio::test]
async fn disabled_strategy_marks_responses_no_store() {
    let dir = tempfile::tempdir().expect("tempdir");
    tokio::fs::write(dir.path().join("a.js"), "export const a = 1;\n")
        .await
        .expect("source");

    let handle =
        start_server(dir.path(), CacheStrategy::None, Arc::new(PassthroughCompiler)).await;
    let addr = handle.local_addr();

    let response = http_get(addr, "/a.js", &[]).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header("cache-control"), Some("no-store"));
    assert!(response.header("etag").is_none());

    handle.shutdown("test done");
}

// =============================================================================
// Failure mapping
// =============================================================================

/// Always fails the way a transform does on broken input.
struct BrokenSyntaxCompiler;

#[async_trait]
impl Compiler for BrokenSyntaxCompiler {
    async fn compile(
        &self,
        request: CompileRequest<'_>,
    ) -> std::result::Result<CompileResult, CompileError> {
        Err(CompileError::Parse {
            message: "unexpected token".to_string(),
            file: request.original_path.display().to_string(),
            line: 3,
            column: 14,
        })
    }
}

#[tokio::test]
async fn parse_errors_become_structured_500_responses() {
    let dir = tempfile::tempdir().expect("tempdir");
    tokio::fs::write(dir.path().join("broken.js"), "let let let;\n")
        .await
        .expect("source");

    let handle =
        start_server(dir.path(), CacheStrategy::Etag, Arc::new(BrokenSyntaxCompiler)).await;
    let addr = handle.local_addr();

    let response = http_get(addr, "/broken.js", &[]).await;
    assert_eq!(response.status, 500);
    assert_eq!(response.header("content-type"), Some("application/json"));

    let body: serde_json::Value = serde_json::from_slice(&response.body).expect("json body");
    assert_eq!(body["code"], "PARSE_ERROR");
    assert_eq!(body["line"], 3);
    assert_eq!(body["column"], 14);
    assert!(body["file"].as_str().expect("file field").ends_with("broken.js"));

    handle.shutdown("test done");
}

#[tokio::test]
async fn missing_files_and_escapes_map_to_client_errors() {
    let dir = tempfile::tempdir().expect("tempdir");

    let handle = start_server(dir.path(), CacheStrategy::Etag, Arc::new(PassthroughCompiler)).await;
    let addr = handle.local_addr();

    let missing = http_get(addr, "/nope.js", &[]).await;
    assert_eq!(missing.status, 404);

    let escape = http_get(addr, "/a/../../etc/passwd", &[]).await;
    assert_eq!(escape.status, 403);

    handle.shutdown("test done");
}
