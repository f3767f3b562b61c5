use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lattice_backfill::embed_backfill::{NO_TEXT_CONTENT, RETRIES_EXHAUSTED};
use lattice_backfill::{
    BackfillDriver, BackfillOptions, BackfillSummary, MemoryRowStore, ProgressRecord,
    ProgressStore, RetryPolicy,
};
use lattice_core::error::{check_dimension, EmbedError};
use lattice_core::traits::{EmbeddingClient, RowStore};
use lattice_core::types::{BackfillTarget, RowId, SourceField};
use lattice_embed::FakeEmbedder;
use serde_json::{json, Value};

const DIM: usize = 1536;

type Script = dyn Fn(&str, usize, usize) -> Result<Vec<f32>, EmbedError> + Send + Sync;

/// Embedder whose answer is scripted per call: `(text, dimension, earlier
/// calls with the same text)`. Every call is recorded.
struct ScriptedEmbedder {
    calls: Mutex<Vec<String>>,
    respond: Box<Script>,
}

impl ScriptedEmbedder {
    fn new<F>(respond: F) -> Arc<Self>
    where
        F: Fn(&str, usize, usize) -> Result<Vec<f32>, EmbedError> + Send + Sync + 'static,
    {
        Arc::new(Self { calls: Mutex::new(Vec::new()), respond: Box::new(respond) })
    }

    fn always_ok() -> Arc<Self> {
        Self::new(|_, dim, _| Ok(vec![0.5; dim]))
    }

    fn recorded(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn calls(&self) -> usize {
        self.recorded().len()
    }

    fn calls_containing(&self, needle: &str) -> usize {
        self.recorded().iter().filter(|t| t.contains(needle)).count()
    }
}

#[async_trait]
impl EmbeddingClient for ScriptedEmbedder {
    fn model_id(&self) -> &str {
        "scripted"
    }

    async fn embed(&self, text: &str, dimension: usize) -> Result<Vec<f32>, EmbedError> {
        let earlier = {
            let mut calls = self.recorded();
            let earlier = calls.iter().filter(|t| t.as_str() == text).count();
            calls.push(text.to_string());
            earlier
        };
        check_dimension((self.respond)(text, dimension, earlier)?, dimension)
    }
}

fn target() -> BackfillTarget {
    BackfillTarget::new(
        "mental_models",
        "mental_models",
        vec![SourceField::text("name"), SourceField::text("description")],
    )
}

fn options() -> BackfillOptions {
    BackfillOptions {
        dimension: DIM,
        page_size: 50,
        page_concurrency: 1,
        request_delay: Duration::ZERO,
        fetch_retry_delay: Duration::from_millis(1),
        retry: RetryPolicy::new(2, Duration::from_millis(1)),
        max_rows: None,
        show_progress: false,
    }
}

fn numbered_rows(count: i64) -> Vec<Value> {
    (1..=count)
        .map(|i| json!({"id": i, "name": format!("model {i}"), "description": "a way of thinking"}))
        .collect()
}

fn memory_store(rows: Vec<Value>) -> Arc<MemoryRowStore> {
    Arc::new(MemoryRowStore::new().with_rows("mental_models", rows))
}

fn driver(
    store: &Arc<MemoryRowStore>,
    embedder: &Arc<ScriptedEmbedder>,
    options: BackfillOptions,
) -> BackfillDriver {
    let store: Arc<dyn RowStore> = store.clone();
    let embedder: Arc<dyn EmbeddingClient> = embedder.clone();
    BackfillDriver::new(store, embedder, options)
}

fn progress_file(dir: &Path) -> PathBuf {
    dir.join("progress.json")
}

fn progress_in(dir: &Path) -> ProgressStore {
    ProgressStore::load(progress_file(dir))
}

fn models(progress: &ProgressStore) -> Result<&ProgressRecord> {
    progress.record("mental_models").context("no record for mental_models")
}

fn ids(set: &BTreeSet<RowId>) -> Vec<RowId> {
    set.iter().cloned().collect()
}

#[tokio::test]
async fn three_row_scenario() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = memory_store(vec![
        json!({"id": 1, "name": "Inversion", "description": "Think backwards"}),
        json!({"id": 2, "name": "", "description": null}),
        json!({"id": 3, "name": "Short vector", "description": "provider ignores dimension"}),
    ]);
    let embedder = ScriptedEmbedder::new(|text, dim, _| {
        if text.starts_with("Short vector") {
            Ok(vec![0.5; 512])
        } else {
            Ok(vec![0.5; dim])
        }
    });
    let mut progress = progress_in(tmp.path());

    let summary = driver(&store, &embedder, options()).run(&target(), &mut progress).await;

    assert_eq!(summary, BackfillSummary { scanned: 3, processed: 1, failed: 2, skipped: 0 });
    let record = models(&progress)?;
    assert_eq!(ids(&record.processed_ids), vec![RowId::Int(1)]);

    let empty = record.failure(&RowId::Int(2)).context("row 2 not failed")?;
    assert_eq!(empty.error, NO_TEXT_CONTENT);
    assert_eq!(empty.attempts, 0);

    let mismatch = record.failure(&RowId::Int(3)).context("row 3 not failed")?;
    assert!(mismatch.error.contains("dimension mismatch"), "{}", mismatch.error);
    assert_eq!(mismatch.attempts, 1);

    assert_eq!(embedder.calls(), 2, "no provider call for the empty row");
    assert_eq!(embedder.calls_containing("Short vector"), 1);
    assert_eq!(embedder.calls_containing("Inversion\nThink backwards"), 1);
    assert_eq!(store.embedding(&target(), &RowId::Int(1)).map(|v| v.len()), Some(DIM));
    assert_eq!(store.embedding(&target(), &RowId::Int(3)), None);
    Ok(())
}

#[tokio::test]
async fn rerun_makes_no_provider_calls() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = memory_store(vec![
        json!({"id": 1, "name": "Inversion"}),
        json!({"id": 2, "name": null}),
        json!({"id": 3, "name": "Broken"}),
    ]);
    let embedder = ScriptedEmbedder::new(|text, dim, _| {
        if text == "Broken" {
            Err(EmbedError::api(Some(400), "invalid argument"))
        } else {
            Ok(vec![0.5; dim])
        }
    });

    let mut progress = progress_in(tmp.path());
    driver(&store, &embedder, options()).run(&target(), &mut progress).await;
    let calls_after_first = embedder.calls();
    let first = models(&progress)?.clone();

    let mut reloaded = progress_in(tmp.path());
    let second = driver(&store, &embedder, options()).run(&target(), &mut reloaded).await;

    assert_eq!(embedder.calls(), calls_after_first);
    assert_eq!(second, BackfillSummary { scanned: 2, processed: 0, failed: 0, skipped: 2 });
    let record = models(&reloaded)?;
    assert_eq!(record.processed_ids, first.processed_ids);
    assert_eq!(record.failed_ids, first.failed_ids);
    Ok(())
}

#[tokio::test]
async fn interrupted_run_resumes_without_duplicates() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = memory_store(numbered_rows(5));
    let embedder = ScriptedEmbedder::always_ok();

    let mut capped = options();
    capped.max_rows = Some(2);
    capped.page_size = 2;
    let mut progress = progress_in(tmp.path());
    let first = driver(&store, &embedder, capped).run(&target(), &mut progress).await;
    assert_eq!(first.processed, 2);

    let mut progress = progress_in(tmp.path());
    let second = driver(&store, &embedder, options()).run(&target(), &mut progress).await;
    assert_eq!(second.processed, 3);

    assert_eq!(embedder.calls(), 5);
    for i in 1..=5 {
        assert_eq!(embedder.calls_containing(&format!("model {i}\n")), 1, "row {i}");
    }
    assert_eq!(models(&progress)?.processed_ids.len(), 5);
    Ok(())
}

#[tokio::test]
async fn walks_pages_past_failed_rows() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut rows = numbered_rows(5);
    rows[0] = json!({"id": 1});
    rows[1] = json!({"id": 2, "name": "  "});
    let store = memory_store(rows);
    let embedder = ScriptedEmbedder::always_ok();

    let mut paged = options();
    paged.page_size = 2;
    let mut progress = progress_in(tmp.path());
    let summary = driver(&store, &embedder, paged).run(&target(), &mut progress).await;

    assert_eq!(summary, BackfillSummary { scanned: 5, processed: 3, failed: 2, skipped: 0 });
    assert_eq!(store.fetch_count(), 3, "pages [1,2] [3,4] [5]");
    assert_eq!(models(&progress)?.last_successfully_processed_offset, 5);
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_record_attempts() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = memory_store(numbered_rows(1));
    let embedder =
        ScriptedEmbedder::new(|_, _, _| Err(EmbedError::api(Some(429), "Too Many Requests")));

    let mut progress = progress_in(tmp.path());
    let summary = driver(&store, &embedder, options()).run(&target(), &mut progress).await;

    assert_eq!(summary.failed, 1);
    assert_eq!(embedder.calls(), 3, "max_retries = 2");
    let failure = models(&progress)?.failure(&RowId::Int(1)).context("row 1 not failed")?;
    assert!(failure.error.starts_with(RETRIES_EXHAUSTED), "{}", failure.error);
    assert_eq!(failure.attempts, 3);
    assert_eq!(store.write_count(), 0);
    Ok(())
}

#[tokio::test]
async fn fetch_errors_stall_then_recover() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = memory_store(numbered_rows(2));
    store.fail_next_fetches(2);
    let embedder = ScriptedEmbedder::always_ok();

    let mut progress = progress_in(tmp.path());
    let summary = driver(&store, &embedder, options()).run(&target(), &mut progress).await;

    assert_eq!(summary.processed, 2);
    assert_eq!(store.fetch_count(), 3);
    Ok(())
}

#[tokio::test]
async fn write_failure_marks_row_failed() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = memory_store(numbered_rows(2));
    store.fail_writes_for(1);
    let embedder = ScriptedEmbedder::always_ok();

    let mut progress = progress_in(tmp.path());
    let summary = driver(&store, &embedder, options()).run(&target(), &mut progress).await;

    assert_eq!(summary, BackfillSummary { scanned: 2, processed: 1, failed: 1, skipped: 0 });
    let record = models(&progress)?;
    let failure = record.failure(&RowId::Int(1)).context("row 1 not failed")?;
    assert!(failure.error.contains("failed to write embedding"), "{}", failure.error);
    assert_eq!(failure.attempts, 1);
    assert!(!record.is_processed(&RowId::Int(1)));
    assert!(record.is_processed(&RowId::Int(2)));
    Ok(())
}

#[tokio::test]
async fn reset_failed_rows_are_retried() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = memory_store(numbered_rows(3));
    // Row 2 fails on its first request only.
    let embedder = ScriptedEmbedder::new(|text, dim, earlier| {
        if text.starts_with("model 2\n") && earlier == 0 {
            Err(EmbedError::api(Some(403), "permission denied"))
        } else {
            Ok(vec![0.5; dim])
        }
    });

    let mut progress = progress_in(tmp.path());
    driver(&store, &embedder, options()).run(&target(), &mut progress).await;
    assert!(progress.is_failed("mental_models", &RowId::Int(2)));

    assert!(progress.reset_failed("mental_models")?);
    let summary = driver(&store, &embedder, options()).run(&target(), &mut progress).await;

    assert_eq!(summary, BackfillSummary { scanned: 1, processed: 1, failed: 0, skipped: 0 });
    let record = models(&progress)?;
    assert_eq!(record.processed_ids.len(), 3);
    assert!(record.failed_ids.is_empty());
    Ok(())
}

#[tokio::test]
async fn fan_out_matches_sequential_bookkeeping() -> Result<()> {
    let rows = {
        let mut rows = numbered_rows(7);
        rows[2] = json!({"id": 3, "name": ""});
        rows[5] = json!({"id": 6, "name": "bad row"});
        rows
    };
    let script = |text: &str, dim: usize, _: usize| {
        if text == "bad row" {
            Ok(vec![0.5; 8])
        } else {
            Ok(vec![0.5; dim])
        }
    };

    let mut results = Vec::new();
    for concurrency in [1, 3] {
        let tmp = tempfile::tempdir()?;
        let store = memory_store(rows.clone());
        let embedder = ScriptedEmbedder::new(script);
        let mut opts = options();
        opts.page_size = 4;
        opts.page_concurrency = concurrency;
        let mut progress = progress_in(tmp.path());
        let summary = driver(&store, &embedder, opts).run(&target(), &mut progress).await;
        let record = models(&progress)?.clone();
        let failed: Vec<_> = record
            .failed_ids
            .iter()
            .map(|f| (f.id.clone(), f.error.clone()))
            .collect();
        results.push((summary, record.processed_ids, failed, embedder.calls()));
    }

    assert_eq!(results[0], results[1]);
    assert_eq!(results[0].0, BackfillSummary { scanned: 7, processed: 5, failed: 2, skipped: 0 });
    Ok(())
}

#[tokio::test]
async fn fan_out_records_nothing_until_page_settles() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = memory_store(vec![
        json!({"id": 1, "name": ""}),
        json!({"id": 2, "name": "Inversion"}),
        json!({"id": 3, "name": "Second order"}),
    ]);
    // Every provider call reads the progress file as it is on disk.
    let path = progress_file(tmp.path());
    let early_records = Arc::new(AtomicUsize::new(0));
    let seen = early_records.clone();
    let embedder = ScriptedEmbedder::new(move |_, dim, _| {
        let on_disk = ProgressStore::load(&path);
        if let Some(record) = on_disk.record("mental_models") {
            let recorded = record.processed_ids.len() + record.failed_ids.len();
            seen.fetch_add(recorded, Ordering::SeqCst);
        }
        Ok(vec![0.5; dim])
    });

    let mut opts = options();
    opts.page_concurrency = 3;
    let mut progress = progress_in(tmp.path());
    let summary = driver(&store, &embedder, opts).run(&target(), &mut progress).await;

    assert_eq!(embedder.calls(), 2);
    assert_eq!(early_records.load(Ordering::SeqCst), 0, "rows recorded mid-page");
    assert_eq!(summary, BackfillSummary { scanned: 3, processed: 2, failed: 1, skipped: 0 });
    let on_disk = progress_in(tmp.path());
    let empty = models(&on_disk)?.failure(&RowId::Int(1)).context("row 1 not failed")?;
    assert_eq!(empty.error, NO_TEXT_CONTENT);
    assert_eq!(models(&on_disk)?.last_successfully_processed_offset, 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn request_delay_follows_provider_calls_only() -> Result<()> {
    let delay = Duration::from_secs(10);
    // (page_concurrency, delays expected): one per embedded row when
    // sequential, one per page when fanned out.
    for (concurrency, expected) in [(1, 2u32), (3, 1)] {
        let tmp = tempfile::tempdir()?;
        let store = memory_store(vec![
            json!({"id": 1, "name": "Already done"}),
            json!({"id": 2, "name": " "}),
            json!({"id": 3, "name": "Inversion"}),
            json!({"id": 4, "name": "Second order"}),
        ]);
        let embedder = ScriptedEmbedder::always_ok();
        let mut progress = progress_in(tmp.path());
        progress.mark_processed("mental_models", &RowId::Int(1), 1)?;

        let mut opts = options();
        opts.request_delay = delay;
        opts.page_concurrency = concurrency;
        let started = tokio::time::Instant::now();
        let summary = driver(&store, &embedder, opts).run(&target(), &mut progress).await;
        let elapsed = started.elapsed();

        assert_eq!(summary, BackfillSummary { scanned: 4, processed: 2, failed: 1, skipped: 1 });
        assert_eq!(embedder.calls(), 2);
        assert!(
            elapsed >= delay * expected && elapsed < delay * (expected + 1),
            "concurrency {concurrency}: slept {elapsed:?}"
        );
    }
    Ok(())
}

#[tokio::test]
async fn dry_run_with_fake_embedder() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = memory_store(numbered_rows(3));
    let rows: Arc<dyn RowStore> = store.clone();
    let embedder: Arc<dyn EmbeddingClient> = Arc::new(FakeEmbedder::new());
    let mut opts = options();
    opts.dimension = 64;

    let mut progress = progress_in(tmp.path());
    let summary = BackfillDriver::new(rows, embedder, opts).run(&target(), &mut progress).await;

    assert_eq!(summary.processed, 3);
    for i in 1..=3 {
        assert_eq!(store.embedding(&target(), &RowId::Int(i)).map(|v| v.len()), Some(64));
    }
    let snapshot = models(&progress)?.config_snapshot.clone().context("no snapshot")?;
    assert_eq!(snapshot.embedding_model, lattice_embed::fake::FAKE_MODEL_ID);
    assert_eq!(snapshot.dimension, 64);
    assert_eq!(snapshot.source_fields, vec!["name", "description"]);
    Ok(())
}
