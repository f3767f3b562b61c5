//! Durable per-target backfill progress.
//!
//! The whole state is one JSON object keyed by target name. Every mutation
//! rewrites the file (temp file + rename) before returning, so a killed run
//! resumes from the last row it finished.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lattice_core::types::{BackfillTarget, RowId};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{error, info, warn};

/// Configuration in effect when a record was first written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    pub embedding_model: String,
    pub dimension: usize,
    pub source_fields: Vec<String>,
    pub embedding_column: String,
}

impl ConfigSnapshot {
    pub fn new(model: &str, dimension: usize, target: &BackfillTarget) -> Self {
        Self {
            embedding_model: model.to_string(),
            dimension,
            source_fields: target.field_columns(),
            embedding_column: target.embedding_column.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRecord {
    pub id: RowId,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    #[serde(default)]
    pub last_successfully_processed_offset: u64,
    #[serde(rename = "processedRecordIds", default)]
    pub processed_ids: BTreeSet<RowId>,
    #[serde(rename = "failedRecordIds", default)]
    pub failed_ids: Vec<FailedRecord>,
    pub last_ran_at: DateTime<Utc>,
    #[serde(rename = "configUsedSnapshot", default, skip_serializing_if = "Option::is_none")]
    pub config_snapshot: Option<ConfigSnapshot>,
}

impl ProgressRecord {
    pub fn new(config_snapshot: Option<ConfigSnapshot>) -> Self {
        Self {
            last_successfully_processed_offset: 0,
            processed_ids: BTreeSet::new(),
            failed_ids: Vec::new(),
            last_ran_at: Utc::now(),
            config_snapshot,
        }
    }

    pub fn is_processed(&self, id: &RowId) -> bool {
        self.processed_ids.contains(id)
    }

    pub fn failure(&self, id: &RowId) -> Option<&FailedRecord> {
        self.failed_ids.iter().find(|f| &f.id == id)
    }

    pub fn is_failed(&self, id: &RowId) -> bool {
        self.failure(id).is_some()
    }
}

pub struct ProgressStore {
    path: PathBuf,
    records: BTreeMap<String, ProgressRecord>,
}

impl ProgressStore {
    /// Reads the progress file. A missing, unreadable or corrupt file yields
    /// an empty store; a corrupt file is copied aside before it gets
    /// overwritten.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(records) => records,
                Err(err) => {
                    let backup = backup_path(&path);
                    warn!(
                        path = %path.display(),
                        backup = %backup.display(),
                        error = %err,
                        "progress file is corrupt; starting from empty state"
                    );
                    if let Err(err) = fs::copy(&path, &backup) {
                        warn!(error = %err, "could not back up corrupt progress file");
                    }
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no progress file yet; starting fresh");
                BTreeMap::new()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "could not read progress file; starting from empty state"
                );
                BTreeMap::new()
            }
        };
        Self { path, records }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, target: &str) -> Option<&ProgressRecord> {
        self.records.get(target)
    }

    pub fn targets(&self) -> impl Iterator<Item = (&str, &ProgressRecord)> {
        self.records.iter().map(|(name, record)| (name.as_str(), record))
    }

    pub fn is_processed(&self, target: &str, id: &RowId) -> bool {
        self.record(target).is_some_and(|r| r.is_processed(id))
    }

    pub fn is_failed(&self, target: &str, id: &RowId) -> bool {
        self.record(target).is_some_and(|r| r.is_failed(id))
    }

    /// Returns the record for `target`, creating it with `snapshot` if absent.
    /// A differing stored snapshot is reported and left in place until the
    /// target is reset.
    pub fn get_or_init(&mut self, target: &str, snapshot: &ConfigSnapshot) -> &ProgressRecord {
        let mut changed = false;
        let record = self.records.entry(target.to_string()).or_insert_with(|| {
            changed = true;
            ProgressRecord::new(Some(snapshot.clone()))
        });
        if record.config_snapshot.is_none() {
            record.config_snapshot = Some(snapshot.clone());
            changed = true;
        } else if let Some(stored) = record.config_snapshot.as_ref().filter(|s| *s != snapshot) {
            warn!(
                target_name = target,
                stored = ?stored,
                current = ?snapshot,
                "configuration differs from the one recorded in the progress file; \
                 run with --reset-progress --table={} to start over",
                target
            );
        }
        if changed {
            if let Err(err) = self.persist() {
                error!(error = %err, "failed to persist new progress record");
            }
        }
        &self.records[target]
    }

    /// Records a written row. Idempotent on the processed set; always clears
    /// any earlier failure for the id.
    pub fn mark_processed(&mut self, target: &str, id: &RowId, offset: u64) -> Result<()> {
        let record = self.entry(target);
        record.processed_ids.insert(id.clone());
        record.failed_ids.retain(|f| &f.id != id);
        record.last_successfully_processed_offset = offset;
        record.last_ran_at = Utc::now();
        self.persist()
    }

    /// Upserts a failure for the id.
    pub fn mark_failed(
        &mut self,
        target: &str,
        id: &RowId,
        error: &str,
        attempts: u32,
    ) -> Result<()> {
        let record = self.entry(target);
        record.processed_ids.remove(id);
        match record.failed_ids.iter_mut().find(|f| &f.id == id) {
            Some(existing) => {
                existing.error = error.to_string();
                existing.attempts = attempts;
            }
            None => record.failed_ids.push(FailedRecord {
                id: id.clone(),
                error: error.to_string(),
                attempts,
            }),
        }
        record.last_ran_at = Utc::now();
        self.persist()
    }

    /// With a target, replaces its record with a fresh one; without, drops
    /// every record.
    pub fn reset(&mut self, target: Option<&str>) -> Result<()> {
        match target {
            Some(name) => {
                self.records.insert(name.to_string(), ProgressRecord::new(None));
            }
            None => self.records.clear(),
        }
        self.persist()
    }

    /// Clears only the failed set so those rows are retried on the next run.
    /// Returns `false` when the target has no record.
    pub fn reset_failed(&mut self, target: &str) -> Result<bool> {
        let Some(record) = self.records.get_mut(target) else {
            return Ok(false);
        };
        record.failed_ids.clear();
        self.persist()?;
        Ok(true)
    }

    fn entry(&mut self, target: &str) -> &mut ProgressRecord {
        self.records
            .entry(target.to_string())
            .or_insert_with(|| ProgressRecord::new(None))
    }

    fn persist(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
        serde_json::to_writer_pretty(&mut tmp, &self.records)
            .context("failed to serialize progress")?;
        tmp.write_all(b"\n")?;
        tmp.persist(&self.path)
            .with_context(|| format!("failed to write progress file {}", self.path.display()))?;
        Ok(())
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".corrupt");
    path.with_file_name(name)
}
