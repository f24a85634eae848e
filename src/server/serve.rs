//! Maps cache engine outcomes onto conditional HTTP responses.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{
    CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    LAST_MODIFIED, RETRY_AFTER,
};
use hyper::{Request, Response, StatusCode};
use tracing::{debug, error, warn};

use crate::cache::{CacheConditions, CacheStatus, GenerateOutcome};
use crate::compiler::CompileError;
use crate::error::Error;
use crate::operation::token_with_deadline;

use super::metrics;
use super::{CacheStrategy, ServeContext};

/// Serves one compiled-file request end to end: resolve paths, forward the
/// conditional validator to the cache engine, and translate the outcome (or
/// failure) into a response.
pub async fn handle_request(
    ctx: Arc<ServeContext>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    metrics::INFLIGHT_REQUESTS.inc();
    let response = respond(&ctx, &req).await;
    metrics::INFLIGHT_REQUESTS.dec();
    metrics::REQUESTS_TOTAL
        .with_label_values(&[response.status().as_str()])
        .inc();
    response
}

async fn respond(ctx: &ServeContext, req: &Request<Incoming>) -> Response<Full<Bytes>> {
    let Some(relative) = request_file_path(req.uri().path()) else {
        return plain(StatusCode::FORBIDDEN, "path escapes the served directory");
    };
    if relative.as_os_str().is_empty() {
        return plain(StatusCode::NOT_FOUND, "not found");
    }

    let conditions = match read_conditions(ctx.config.strategy, req) {
        Ok(conditions) => conditions,
        Err(response) => return response,
    };

    let original = ctx.config.project_root.join(&relative);
    let compiled = ctx.config.cache_dir.join(&relative);
    let token = token_with_deadline(&ctx.shutdown, ctx.config.request_timeout);

    match ctx
        .cache
        .get_or_generate(&original, &compiled, ctx.compiler.as_ref(), &conditions, &token)
        .await
    {
        Ok(outcome) => {
            metrics::COMPILE_OUTCOMES
                .with_label_values(&[&outcome.status.to_string()])
                .inc();
            success_response(ctx.config.strategy, &conditions, outcome)
        }
        Err(err) => failure_response(&relative, &err),
    }
}

/// Decodes and sanitizes the request path. `None` means traversal.
fn request_file_path(raw: &str) -> Option<PathBuf> {
    let decoded = urlencoding::decode(raw).ok()?;
    let path = Path::new(decoded.trim_start_matches('/'));
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            // `..`, roots and prefixes would escape the project directory.
            _ => return None,
        }
    }
    Some(clean)
}

/// Extracts the conditional validator matching the active strategy.
fn read_conditions(
    strategy: CacheStrategy,
    req: &Request<Incoming>,
) -> Result<CacheConditions, Response<Full<Bytes>>> {
    let mut conditions = CacheConditions::default();
    match strategy {
        CacheStrategy::Etag => {
            if let Some(header) = req.headers().get(IF_NONE_MATCH) {
                if let Ok(value) = header.to_str() {
                    conditions.if_etag_match = Some(value.trim().trim_matches('"').to_string());
                }
            }
        }
        CacheStrategy::Mtime => {
            if let Some(header) = req.headers().get(IF_MODIFIED_SINCE) {
                let parsed = header
                    .to_str()
                    .ok()
                    .and_then(|value| DateTime::parse_from_rfc2822(value).ok());
                match parsed {
                    Some(date) => conditions.if_modified_since = Some(date.with_timezone(&Utc)),
                    None => {
                        return Err(plain(
                            StatusCode::BAD_REQUEST,
                            "if-modified-since header is not a valid date",
                        ));
                    }
                }
            }
        }
        CacheStrategy::None => {}
    }
    Ok(conditions)
}

fn success_response(
    strategy: CacheStrategy,
    conditions: &CacheConditions,
    outcome: GenerateOutcome,
) -> Response<Full<Bytes>> {
    // The engine already compared the supplied validator against the
    // compiled file: a mismatch forced a recompile, so `Cached` plus a
    // conditional request means "validated unchanged".
    let not_modified = outcome.status == CacheStatus::Cached && conditions.is_conditional();

    match strategy {
        CacheStrategy::Etag => {
            let builder = Response::builder().header(ETAG, outcome.output.etag.as_str());
            if not_modified {
                builder
                    .status(StatusCode::NOT_MODIFIED)
                    .body(Full::new(Bytes::new()))
                    .unwrap()
            } else {
                with_body(builder, outcome)
            }
        }
        CacheStrategy::Mtime => {
            let builder = Response::builder()
                .header(LAST_MODIFIED, http_date(outcome.entry.last_modified_ms));
            if not_modified {
                builder
                    .status(StatusCode::NOT_MODIFIED)
                    .body(Full::new(Bytes::new()))
                    .unwrap()
            } else {
                with_body(builder, outcome)
            }
        }
        CacheStrategy::None => {
            let builder = Response::builder().header(CACHE_CONTROL, "no-store");
            with_body(builder, outcome)
        }
    }
}

fn with_body(builder: hyper::http::response::Builder, outcome: GenerateOutcome) -> Response<Full<Bytes>> {
    builder
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, outcome.output.content_type.as_str())
        .header(CONTENT_LENGTH, outcome.output.bytes.len())
        .body(Full::new(outcome.output.bytes))
        .unwrap()
}

/// Translates engine failures into HTTP statuses.
///
/// Cancellation is expected control flow (client gone, deadline fired) and
/// is logged at debug, never as a failure.
fn failure_response(relative: &Path, err: &Error) -> Response<Full<Bytes>> {
    if err.is_cancellation() {
        debug!(file = %relative.display(), "request cancelled before completion");
        return plain(StatusCode::INTERNAL_SERVER_ERROR, "request cancelled");
    }

    match err {
        Error::Compile(CompileError::Parse {
            message,
            file,
            line,
            column,
        }) => {
            debug!(file = %file, line, column, "parse error surfaced to client");
            let body = serde_json::json!({
                "code": "PARSE_ERROR",
                "message": message,
                "file": file,
                "line": line,
                "column": column,
            });
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .header(CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::from(body.to_string())))
                .unwrap()
        }
        Error::Compile(CompileError::Io { source, .. })
            if source.kind() == ErrorKind::NotFound =>
        {
            plain(StatusCode::NOT_FOUND, "file not found")
        }
        Error::LockTimeout { .. } => {
            warn!(file = %relative.display(), error = %err, "lock contention exhausted retries");
            retry_later()
        }
        Error::Io { source, .. } => match source.kind() {
            ErrorKind::PermissionDenied => plain(StatusCode::FORBIDDEN, "permission denied"),
            ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted => retry_later(),
            _ => {
                error!(file = %relative.display(), error = %err, "request failed");
                plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        },
        Error::OutsideProjectRoot { .. } => plain(StatusCode::FORBIDDEN, "forbidden"),
        _ => {
            error!(file = %relative.display(), error = %err, "request failed");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn retry_later() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .header(RETRY_AFTER, "1")
        .body(Full::new(Bytes::from("temporarily unavailable, retry shortly")))
        .unwrap()
}

fn plain(status: StatusCode, message: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(message)))
        .unwrap()
}

/// Formats epoch milliseconds as an IMF-fixdate (`Last-Modified` form).
fn http_date(ms: i64) -> String {
    let date = Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now);
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
