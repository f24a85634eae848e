//! Kiln Integration Tests
//!
//! Covers the concurrency substrate and the compile cache lifecycle:
//! - Cancellation framework: idempotent cancel, first-wins composition,
//!   wave-based concurrency fairness
//! - Resource locks: mutual exclusion, single-waiter handoff
//! - Cache engine: idempotent hits, invalidation, dependency pruning

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Cancellation / Operation Framework
// =============================================================================

mod operation_tests {
    use super::*;
    use kiln::operation::{
        compose_tokens, run_concurrent, token_with_deadline, CancellationSource,
        CancellationToken, TIMEOUT_REASON,
    };
    use std::sync::Mutex;

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let source = CancellationSource::new();
        let token = source.token();
        let fired = Arc::new(AtomicUsize::new(0));

        let witness = Arc::clone(&fired);
        token.register(Arc::new(move |_| {
            witness.fetch_add(1, Ordering::SeqCst);
        }));

        source.cancel("first");
        source.cancel("second");

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(token.reason().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn composed_token_captures_the_first_parents_reason() {
        let s1 = CancellationSource::new();
        let s2 = CancellationSource::new();
        let composed = compose_tokens(&[s1.token(), s2.token()]);

        s1.cancel("disk full");
        s2.cancel("keyboard interrupt");

        assert!(composed.cancellation_requested());
        assert_eq!(composed.reason().as_deref(), Some("disk full"));
    }

    #[tokio::test]
    async fn deadline_reports_timeout_as_the_reason() {
        let caller = CancellationToken::never();
        let token = token_with_deadline(&caller, Duration::from_millis(10));

        token.cancelled().await;
        assert_eq!(token.reason().as_deref(), Some(TIMEOUT_REASON));
    }

    #[tokio::test]
    async fn caller_cancellation_beats_a_distant_deadline() {
        let caller = CancellationSource::new();
        let token = token_with_deadline(&caller.token(), Duration::from_secs(60));

        caller.cancel("client disconnected");
        token.cancelled().await;
        assert_eq!(token.reason().as_deref(), Some("client disconnected"));
    }

    #[tokio::test]
    async fn later_waves_start_only_after_the_previous_wave_settled() {
        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        // a is slow, b is fast; with limit 2, c and d belong to wave two.
        let delays = vec![("a", 60u64), ("b", 5), ("c", 5), ("d", 5)];
        let log = Arc::clone(&events);
        run_concurrent(delays, 2, move |(name, delay)| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(format!("start:{name}"));
                tokio::time::sleep(Duration::from_millis(delay)).await;
                log.lock().unwrap().push(format!("end:{name}"));
            }
        })
        .await;

        let events = events.lock().unwrap();
        let position = |needle: &str| {
            events
                .iter()
                .position(|event| event == needle)
                .unwrap_or_else(|| panic!("missing event {needle}"))
        };

        // Neither c nor d may start before both a and b settled.
        assert!(position("start:c") > position("end:a"));
        assert!(position("start:c") > position("end:b"));
        assert!(position("start:d") > position("end:a"));
        assert!(position("start:d") > position("end:b"));
    }
}

// =============================================================================
// Resource Lock Registry
// =============================================================================

mod lock_tests {
    use super::*;
    use kiln::lock::{LockConfig, ResourceLockRegistry};
    use kiln::operation::CancellationToken;

    #[tokio::test]
    async fn critical_sections_for_one_key_never_overlap() {
        let registry = Arc::new(ResourceLockRegistry::new(LockConfig::default()));
        let active = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            let active = Arc::clone(&active);
            let overlapped = Arc::clone(&overlapped);
            workers.push(tokio::spawn(async move {
                let token = CancellationToken::never();
                let guard = registry.lock("shared/meta.json", &token).await.expect("lock");
                if active.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlapped.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                guard.unlock();
            }));
        }
        for worker in workers {
            worker.await.expect("worker");
        }

        assert_eq!(overlapped.load(Ordering::SeqCst), 0);
        assert_eq!(registry.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn release_unblocks_exactly_one_waiter() {
        let registry = Arc::new(ResourceLockRegistry::new(LockConfig::default()));
        let token = CancellationToken::never();
        let holder = registry.lock("k", &token).await.expect("holder");

        let entered = Arc::new(AtomicUsize::new(0));
        let mut waiters = Vec::new();
        for _ in 0..2 {
            let registry = Arc::clone(&registry);
            let entered = Arc::clone(&entered);
            waiters.push(tokio::spawn(async move {
                let token = CancellationToken::never();
                let guard = registry.lock("k", &token).await.expect("waiter lock");
                entered.fetch_add(1, Ordering::SeqCst);
                // Hold until the test drops the task output.
                tokio::time::sleep(Duration::from_millis(50)).await;
                guard.unlock();
            }));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(entered.load(Ordering::SeqCst), 0);

        holder.unlock();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(entered.load(Ordering::SeqCst), 1);

        for waiter in waiters {
            waiter.await.expect("waiter");
        }
        assert_eq!(entered.load(Ordering::SeqCst), 2);
    }
}

// =============================================================================
// Compile Cache Engine
// =============================================================================

mod cache_tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use kiln::cache::{CacheConditions, CacheConfig, CacheStatus, CompileCache};
    use kiln::compiler::{
        CompileError, CompileRequest, CompileResult, Compiler, PassthroughCompiler,
        SourceDependency,
    };
    use kiln::lock::{LockConfig, ResourceLockRegistry};
    use kiln::operation::CancellationToken;

    fn engine_for(root: &Path) -> CompileCache {
        CompileCache::new(
            CacheConfig {
                project_root: root.to_path_buf(),
                ..CacheConfig::default()
            },
            Arc::new(ResourceLockRegistry::new(LockConfig::default())),
        )
    }

    /// Declares a fixed dependency list, reading only the requested file.
    struct MultiSourceCompiler {
        dependencies: Vec<&'static str>,
    }

    #[async_trait]
    impl Compiler for MultiSourceCompiler {
        async fn compile(
            &self,
            request: CompileRequest<'_>,
        ) -> std::result::Result<CompileResult, CompileError> {
            let content = tokio::fs::read_to_string(request.original_path)
                .await
                .map_err(|source| CompileError::Io {
                    path: request.original_path.to_path_buf(),
                    source,
                })?;
            Ok(CompileResult {
                content_type: "application/javascript".to_string(),
                compiled_source: content,
                sources: self
                    .dependencies
                    .iter()
                    .map(|path| SourceDependency {
                        path: PathBuf::from(path),
                        content: None,
                    })
                    .collect(),
                assets: Vec::new(),
            })
        }
    }

    #[tokio::test]
    async fn second_call_without_changes_is_a_byte_identical_cache_hit() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("a.js"), "export const a = 1;\n")
            .await
            .expect("source");

        let engine = engine_for(dir.path());
        let token = CancellationToken::never();
        let original = dir.path().join("a.js");
        let compiled = dir.path().join(".kiln").join("a.js");

        let first = engine
            .get_or_generate(&original, &compiled, &PassthroughCompiler, &CacheConditions::default(), &token)
            .await
            .expect("first call");
        assert_eq!(first.status, CacheStatus::Created);

        let second = engine
            .get_or_generate(&original, &compiled, &PassthroughCompiler, &CacheConditions::default(), &token)
            .await
            .expect("second call");
        assert_eq!(second.status, CacheStatus::Cached);
        assert_eq!(first.output.bytes, second.output.bytes);
        assert_eq!(first.output.etag, second.output.etag);
    }

    #[tokio::test]
    async fn mutating_a_tracked_source_invalidates_and_rerecords_its_etag() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("a.js"), "export const a = 1;\n")
            .await
            .expect("source");

        let engine = engine_for(dir.path());
        let token = CancellationToken::never();
        let original = dir.path().join("a.js");
        let compiled = dir.path().join(".kiln").join("a.js");

        let first = engine
            .get_or_generate(&original, &compiled, &PassthroughCompiler, &CacheConditions::default(), &token)
            .await
            .expect("created");
        let recorded_before = first.entry.sources[0].etag.clone();

        // One byte of difference must invalidate.
        tokio::fs::write(&original, "export const a = 2;\n")
            .await
            .expect("mutate");

        let second = engine
            .get_or_generate(&original, &compiled, &PassthroughCompiler, &CacheConditions::default(), &token)
            .await
            .expect("updated");
        assert_eq!(second.status, CacheStatus::Updated);
        assert_ne!(second.entry.sources[0].etag, recorded_before);
    }

    #[tokio::test]
    async fn deleted_dependency_is_pruned_from_the_persisted_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("a.js"), "import './util.js';\n")
            .await
            .expect("entry source");
        tokio::fs::write(dir.path().join("util.js"), "export const u = 1;\n")
            .await
            .expect("util source");

        let compiler = MultiSourceCompiler {
            dependencies: vec!["a.js", "util.js"],
        };
        let engine = engine_for(dir.path());
        let token = CancellationToken::never();
        let original = dir.path().join("a.js");
        let compiled = dir.path().join(".kiln").join("a.js");

        let first = engine
            .get_or_generate(&original, &compiled, &compiler, &CacheConditions::default(), &token)
            .await
            .expect("created");
        assert_eq!(first.entry.sources.len(), 2);

        tokio::fs::remove_file(dir.path().join("util.js"))
            .await
            .expect("delete dependency");

        // Recompiles (the tracked source is gone) and must not fail; the
        // persisted entry simply stops depending on the deleted file.
        let second = engine
            .get_or_generate(&original, &compiled, &compiler, &CacheConditions::default(), &token)
            .await
            .expect("updated without error");
        assert_matches!(second.status, CacheStatus::Updated);
        let paths: Vec<_> = second
            .entry
            .sources
            .iter()
            .map(|source| source.path.as_path())
            .collect();
        assert_eq!(paths, vec![Path::new("a.js")]);

        let persisted = tokio::fs::read(kiln::cache::meta_path(&compiled))
            .await
            .expect("meta.json exists");
        let persisted: kiln::cache::CacheEntry =
            serde_json::from_slice(&persisted).expect("meta.json parses");
        assert!(persisted
            .sources
            .iter()
            .all(|source| source.path != Path::new("util.js")));
    }

    #[tokio::test]
    async fn concurrent_requests_for_one_target_compile_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        tokio::fs::write(dir.path().join("a.js"), "export const a = 1;\n")
            .await
            .expect("source");

        let compiles = Arc::new(AtomicUsize::new(0));

        struct CountingCompiler {
            compiles: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl Compiler for CountingCompiler {
            async fn compile(
                &self,
                request: CompileRequest<'_>,
            ) -> std::result::Result<CompileResult, CompileError> {
                self.compiles.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                PassthroughCompiler.compile(request).await
            }
        }

        let engine = Arc::new(engine_for(dir.path()));
        let compiler = Arc::new(CountingCompiler {
            compiles: Arc::clone(&compiles),
        });

        let mut requests = Vec::new();
        for _ in 0..4 {
            let engine = Arc::clone(&engine);
            let compiler = Arc::clone(&compiler);
            let original = dir.path().join("a.js");
            let compiled = dir.path().join(".kiln").join("a.js");
            requests.push(tokio::spawn(async move {
                let token = CancellationToken::never();
                engine
                    .get_or_generate(
                        &original,
                        &compiled,
                        compiler.as_ref(),
                        &CacheConditions::default(),
                        &token,
                    )
                    .await
            }));
        }

        let mut statuses = Vec::new();
        for request in requests {
            statuses.push(request.await.expect("request").expect("outcome").status);
        }

        // The lock serializes the target: one compile, the rest validate.
        assert_eq!(compiles.load(Ordering::SeqCst), 1);
        assert_eq!(
            statuses
                .iter()
                .filter(|status| **status == CacheStatus::Created)
                .count(),
            1
        );
        assert_eq!(
            statuses
                .iter()
                .filter(|status| **status == CacheStatus::Cached)
                .count(),
            3
        );
    }
}
