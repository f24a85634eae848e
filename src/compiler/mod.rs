//! Compiler collaborator seam.
//!
//! The cache engine never transforms code itself; it calls an external
//! [`Compiler`] and interprets its structured result. The engine hashes and
//! persists the declared source and asset dependencies without inspecting
//! their meaning.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::operation::CancellationToken;

/// Failure modes of the external compile step
#[derive(Debug, Error)]
pub enum CompileError {
    /// The source could not be parsed. Recovered into a structured HTTP 500
    /// so a calling tool can map the error back to the original file.
    #[error("parse error in {file}:{line}:{column}: {message}")]
    Parse {
        message: String,
        file: String,
        line: u32,
        column: u32,
    },

    /// Reading an input failed
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Anything else the compiler could not recover from
    #[error("compile failed: {0}")]
    Internal(String),
}

/// One compile invocation: which file to transform and where the output goes.
pub struct CompileRequest<'a> {
    /// Source file being compiled
    pub original_path: &'a Path,
    /// Target path the output will be served from
    pub compiled_path: &'a Path,
    /// Configured project root; all dependency paths are relative to it
    pub project_root: &'a Path,
    /// Cooperative cancellation for the compile step
    pub token: &'a CancellationToken,
}

/// A source file the compiled output depends on.
///
/// `path` is relative to the project root. When `content` is present the
/// engine hashes it directly; otherwise it re-reads the file from disk.
#[derive(Debug, Clone)]
pub struct SourceDependency {
    pub path: PathBuf,
    pub content: Option<String>,
}

/// A generated companion file (sourcemap, coverage data). `path` is relative
/// to the compiled file's `__asset__` directory, where the engine writes it.
#[derive(Debug, Clone)]
pub struct GeneratedAsset {
    pub path: PathBuf,
    pub content: String,
}

/// Structured result of a successful compile.
#[derive(Debug, Clone)]
pub struct CompileResult {
    /// Content type the compiled output should be served with
    pub content_type: String,
    /// The compiled output itself
    pub compiled_source: String,
    /// Source files the output was derived from
    pub sources: Vec<SourceDependency>,
    /// Generated companion files
    pub assets: Vec<GeneratedAsset>,
}

/// The source-to-target transformation, supplied by the embedding tool.
#[async_trait]
pub trait Compiler: Send + Sync {
    /// Transforms one source file into servable output.
    async fn compile(
        &self,
        request: CompileRequest<'_>,
    ) -> std::result::Result<CompileResult, CompileError>;
}

/// Serves sources unchanged while still recording them as dependencies.
///
/// Used by the binary as the default pipeline and by tests; it exercises the
/// whole cache lifecycle without a real transform.
pub struct PassthroughCompiler;

#[async_trait]
impl Compiler for PassthroughCompiler {
    async fn compile(
        &self,
        request: CompileRequest<'_>,
    ) -> std::result::Result<CompileResult, CompileError> {
        let bytes = tokio::fs::read(request.original_path)
            .await
            .map_err(|source| CompileError::Io {
                path: request.original_path.to_path_buf(),
                source,
            })?;
        let content = String::from_utf8(bytes).map_err(|_| {
            CompileError::Internal(format!(
                "{} is not valid UTF-8",
                request.original_path.display()
            ))
        })?;

        let relative = request
            .original_path
            .strip_prefix(request.project_root)
            .unwrap_or(request.original_path)
            .to_path_buf();

        Ok(CompileResult {
            content_type: content_type_for_path(request.original_path).to_string(),
            compiled_source: content.clone(),
            sources: vec![SourceDependency {
                path: relative,
                content: Some(content),
            }],
            assets: Vec::new(),
        })
    }
}

/// Content type by file extension, for sources served as-is.
pub fn content_type_for_path(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("js") | Some("mjs") | Some("cjs") => "application/javascript",
        Some("json") | Some("map") => "application/json",
        Some("css") => "text/css",
        Some("html") | Some("htm") => "text/html",
        Some("svg") => "image/svg+xml",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}
