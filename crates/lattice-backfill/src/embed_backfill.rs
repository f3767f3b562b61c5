//! Resumable per-table embedding backfill.
//!
//! Walks the rows of one target whose embedding column is still null, in id
//! order with a keyset cursor, embeds each row's prompt and writes the vector
//! back. Row outcomes are recorded in the [`ProgressStore`] as they happen
//! (per row when sequential, per settled page when fanned out), so an
//! interrupted run resumes where it stopped.

use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use lattice_core::config::BackfillSettings;
use lattice_core::traits::{EmbeddingClient, RowStore};
use lattice_core::types::{BackfillTarget, RowId, RowPage, SourceRow};
use tracing::{debug, error, info, warn};

use crate::progress::{ConfigSnapshot, ProgressStore};
use crate::retry::{with_retries, RetryOutcome, RetryPolicy};

pub const NO_TEXT_CONTENT: &str = "no text content";
pub const RETRIES_EXHAUSTED: &str = "embedding generation failed after retries";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillOptions {
    pub dimension: usize,
    pub page_size: usize,
    /// Rows of one page embedded concurrently; 1 is strictly sequential.
    pub page_concurrency: usize,
    pub request_delay: Duration,
    pub fetch_retry_delay: Duration,
    pub retry: RetryPolicy,
    /// Cap on rows examined in one run.
    pub max_rows: Option<usize>,
    pub show_progress: bool,
}

impl BackfillOptions {
    pub fn from_settings(settings: &BackfillSettings) -> Self {
        Self {
            dimension: settings.embedding_dimension,
            page_size: settings.page_size.max(1),
            page_concurrency: settings.page_concurrency.max(1),
            request_delay: settings.request_delay(),
            fetch_retry_delay: settings.fetch_retry_delay(),
            retry: RetryPolicy::new(settings.max_retries, settings.retry_base_delay()),
            max_rows: None,
            show_progress: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    /// Rows examined, skipped ones included.
    pub scanned: usize,
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl AddAssign for BackfillSummary {
    fn add_assign(&mut self, other: Self) {
        self.scanned += other.scanned;
        self.processed += other.processed;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Processed { attempts: u32 },
    Failed { error: String, attempts: u32 },
}

/// What the skip and empty-prompt rules decided for one row.
enum Admission {
    Skip,
    /// Settled without a provider call.
    Settled(RowOutcome),
    Embed(String),
}

/// Walk state shared by the pages of one run.
struct Walk<'a> {
    target: &'a BackfillTarget,
    position: u64,
    summary: BackfillSummary,
    bar: ProgressBar,
}

impl Walk<'_> {
    /// Counts the row as examined and returns its walk position.
    fn step(&mut self) -> u64 {
        self.position += 1;
        self.summary.scanned += 1;
        self.bar.inc(1);
        self.position
    }

    /// Applies the skip and empty-prompt rules without touching progress.
    fn admit(&mut self, row: &SourceRow, progress: &ProgressStore) -> Admission {
        let name = &self.target.name;
        if progress.is_processed(name, &row.id) || progress.is_failed(name, &row.id) {
            debug!(target_name = %name, id = %row.id, "already recorded; skipping");
            self.summary.skipped += 1;
            return Admission::Skip;
        }
        let prompt = row.prompt_text();
        if prompt.is_empty() {
            return Admission::Settled(RowOutcome::Failed {
                error: NO_TEXT_CONTENT.to_string(),
                attempts: 0,
            });
        }
        Admission::Embed(prompt)
    }

    fn record(
        &mut self,
        progress: &mut ProgressStore,
        id: &RowId,
        position: u64,
        outcome: RowOutcome,
    ) {
        let name = &self.target.name;
        let persisted = match outcome {
            RowOutcome::Processed { attempts } => {
                debug!(target_name = %name, %id, attempts, "embedding written");
                self.summary.processed += 1;
                progress.mark_processed(name, id, position)
            }
            RowOutcome::Failed { error, attempts } => {
                warn!(target_name = %name, %id, attempts, %error, "row failed");
                self.summary.failed += 1;
                progress.mark_failed(name, id, &error, attempts)
            }
        };
        if let Err(err) = persisted {
            error!(
                target_name = %name,
                %id,
                error = %format_args!("{err:#}"),
                "failed to persist progress"
            );
        }
    }
}

pub struct BackfillDriver {
    store: Arc<dyn RowStore>,
    embedder: Arc<dyn EmbeddingClient>,
    options: BackfillOptions,
}

impl BackfillDriver {
    pub fn new(
        store: Arc<dyn RowStore>,
        embedder: Arc<dyn EmbeddingClient>,
        options: BackfillOptions,
    ) -> Self {
        Self { store, embedder, options }
    }

    pub fn options(&self) -> &BackfillOptions {
        &self.options
    }

    /// Backfills one target until no pending row is left, or the row cap is
    /// reached. Never fails: per-row problems end up in the failed set and
    /// fetch errors are retried.
    pub async fn run(
        &self,
        target: &BackfillTarget,
        progress: &mut ProgressStore,
    ) -> BackfillSummary {
        let model = self.embedder.model_id();
        let snapshot = ConfigSnapshot::new(model, self.options.dimension, target);
        let record = progress.get_or_init(&target.name, &snapshot);
        info!(
            target_name = %target.name,
            table = %target.table,
            model,
            already_processed = record.processed_ids.len(),
            already_failed = record.failed_ids.len(),
            "starting backfill"
        );

        let mut walk = Walk {
            target,
            position: 0,
            summary: BackfillSummary::default(),
            bar: self.progress_bar(target),
        };
        let mut cursor: Option<RowId> = None;

        loop {
            let remaining = self
                .options
                .max_rows
                .map(|cap| cap.saturating_sub(walk.summary.scanned));
            if remaining == Some(0) {
                info!(target_name = %target.name, "row cap reached");
                break;
            }

            let page = self.fetch_page(target, cursor.as_ref()).await;
            debug!(
                target_name = %target.name,
                rows = page.rows.len(),
                scanned = page.scanned,
                after = ?cursor,
                "fetched page"
            );
            if page.scanned == 0 {
                break;
            }
            let last_page = page.scanned < self.options.page_size;
            let next_cursor = page.last_id.clone();

            let mut rows = page.rows;
            if let Some(remaining) = remaining {
                rows.truncate(remaining);
            }
            if self.options.page_concurrency > 1 {
                self.process_page_concurrent(&mut walk, rows, progress).await;
            } else {
                self.process_page_sequential(&mut walk, rows, progress).await;
            }
            info!(
                target_name = %target.name,
                scanned = walk.summary.scanned,
                processed = walk.summary.processed,
                failed = walk.summary.failed,
                "page done"
            );

            if last_page {
                break;
            }
            match next_cursor {
                Some(id) => cursor = Some(id),
                None => {
                    warn!(
                        target_name = %target.name,
                        "page had no usable id; cannot advance cursor"
                    );
                    break;
                }
            }
        }

        let summary = walk.summary;
        walk.bar.finish_with_message(format!(
            "{} processed, {} failed, {} skipped",
            summary.processed, summary.failed, summary.skipped
        ));
        info!(
            target_name = %target.name,
            scanned = summary.scanned,
            processed = summary.processed,
            failed = summary.failed,
            skipped = summary.skipped,
            "backfill finished"
        );
        summary
    }

    async fn process_page_sequential(
        &self,
        walk: &mut Walk<'_>,
        rows: Vec<SourceRow>,
        progress: &mut ProgressStore,
    ) {
        for row in rows {
            let position = walk.step();
            let prompt = match walk.admit(&row, progress) {
                Admission::Skip => continue,
                Admission::Settled(outcome) => {
                    walk.record(progress, &row.id, position, outcome);
                    continue;
                }
                Admission::Embed(prompt) => prompt,
            };
            walk.bar.set_message(format!("row {}", row.id));
            let outcome = self.process_row(walk.target, &row.id, &prompt).await;
            walk.record(progress, &row.id, position, outcome);
            tokio::time::sleep(self.options.request_delay).await;
        }
    }

    /// Embeds the eligible rows of a page with bounded concurrency. Nothing
    /// is written to the progress store until the whole page has settled;
    /// outcomes are then applied in row order.
    async fn process_page_concurrent(
        &self,
        walk: &mut Walk<'_>,
        rows: Vec<SourceRow>,
        progress: &mut ProgressStore,
    ) {
        let mut planned = Vec::new();
        for row in rows {
            let position = walk.step();
            match walk.admit(&row, progress) {
                Admission::Skip => {}
                admission => planned.push((position, row.id, admission)),
            }
        }
        if planned.is_empty() {
            return;
        }

        let target = walk.target;
        let requests: Vec<(&RowId, &str)> = planned
            .iter()
            .filter_map(|(_, id, admission)| match admission {
                Admission::Embed(prompt) => Some((id, prompt.as_str())),
                _ => None,
            })
            .collect();
        let in_flight = requests.len();
        walk.bar.set_message(format!("{in_flight} rows in flight"));
        let embedded: Vec<RowOutcome> = stream::iter(
            requests
                .into_iter()
                .map(|(id, prompt)| self.process_row(target, id, prompt)),
        )
        .buffered(self.options.page_concurrency)
        .collect()
        .await;

        let mut embedded = embedded.into_iter();
        for (position, id, admission) in planned {
            let outcome = match admission {
                Admission::Settled(outcome) => outcome,
                Admission::Embed(_) => match embedded.next() {
                    Some(outcome) => outcome,
                    None => break,
                },
                Admission::Skip => continue,
            };
            walk.record(progress, &id, position, outcome);
        }
        if in_flight > 0 {
            tokio::time::sleep(self.options.request_delay).await;
        }
    }

    async fn process_row(&self, target: &BackfillTarget, id: &RowId, prompt: &str) -> RowOutcome {
        let embedder = &self.embedder;
        let dimension = self.options.dimension;
        let outcome =
            with_retries(&self.options.retry, || embedder.embed(prompt, dimension)).await;
        match outcome {
            RetryOutcome::Success { value, attempts } => {
                match self.store.write_embedding(target, id, &value).await {
                    Ok(()) => RowOutcome::Processed { attempts },
                    Err(err) => RowOutcome::Failed {
                        error: format!("failed to write embedding: {err}"),
                        attempts,
                    },
                }
            }
            RetryOutcome::Exhausted { attempts, last_error } => RowOutcome::Failed {
                error: format!("{RETRIES_EXHAUSTED}: {last_error}"),
                attempts,
            },
            RetryOutcome::Fatal { attempts, error } => RowOutcome::Failed {
                error: error.to_string(),
                attempts,
            },
        }
    }

    async fn fetch_page(&self, target: &BackfillTarget, after: Option<&RowId>) -> RowPage {
        loop {
            match self.store.fetch_pending(target, after, self.options.page_size).await {
                Ok(page) => return page,
                Err(err) => {
                    warn!(
                        target_name = %target.name,
                        error = %err,
                        retry_in_ms = self.options.fetch_retry_delay.as_millis() as u64,
                        "fetching rows failed; retrying"
                    );
                    tokio::time::sleep(self.options.fetch_retry_delay).await;
                }
            }
        }
    }

    fn progress_bar(&self, target: &BackfillTarget) -> ProgressBar {
        if !self.options.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {prefix} {pos} rows {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        bar.set_style(style);
        bar.set_prefix(target.name.clone());
        bar.enable_steady_tick(Duration::from_millis(120));
        bar
    }
}
