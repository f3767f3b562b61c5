//! In-process row store with the same filter, order and cursor semantics as
//! the PostgREST store. Backs the dry-run example and the driver tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use lattice_core::error::StoreError;
use lattice_core::traits::RowStore;
use lattice_core::types::{BackfillTarget, RowId, RowPage};
use serde_json::Value;

#[derive(Default)]
struct State {
    tables: BTreeMap<String, Vec<Value>>,
    failing_writes: HashSet<RowId>,
    fetch_failures: usize,
    fetches: usize,
    writes: usize,
}

#[derive(Default)]
pub struct MemoryRowStore {
    state: Mutex<State>,
}

impl MemoryRowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(self, table: &str, rows: Vec<Value>) -> Self {
        self.insert_rows(table, rows);
        self
    }

    pub fn insert_rows(&self, table: &str, rows: Vec<Value>) {
        self.lock().tables.entry(table.to_string()).or_default().extend(rows);
    }

    /// Makes every write to `id` fail with an HTTP 500.
    pub fn fail_writes_for(&self, id: impl Into<RowId>) {
        self.lock().failing_writes.insert(id.into());
    }

    /// Makes the next `count` fetches fail with a transport error.
    pub fn fail_next_fetches(&self, count: usize) {
        self.lock().fetch_failures = count;
    }

    pub fn row(&self, table: &str, id: &RowId) -> Option<Value> {
        let state = self.lock();
        let rows = state.tables.get(table)?;
        rows.iter().find(|row| row_id(row, "id").as_ref() == Some(id)).cloned()
    }

    /// The stored vector of a row, if one has been written.
    pub fn embedding(&self, target: &BackfillTarget, id: &RowId) -> Option<Vec<f32>> {
        let state = self.lock();
        let row = state
            .tables
            .get(&target.table)?
            .iter()
            .find(|row| row_id(row, &target.id_column).as_ref() == Some(id))?;
        serde_json::from_value(row.get(&target.embedding_column)?.clone()).ok()
    }

    pub fn fetch_count(&self) -> usize {
        self.lock().fetches
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn row_id(row: &Value, id_column: &str) -> Option<RowId> {
    row.get(id_column).and_then(RowId::from_json)
}

#[async_trait]
impl RowStore for MemoryRowStore {
    async fn fetch_pending(
        &self,
        target: &BackfillTarget,
        after: Option<&RowId>,
        limit: usize,
    ) -> Result<RowPage, StoreError> {
        let mut state = self.lock();
        state.fetches += 1;
        if state.fetch_failures > 0 {
            state.fetch_failures -= 1;
            return Err(StoreError::Transport("injected fetch failure".to_string()));
        }
        let Some(rows) = state.tables.get(&target.table) else {
            return Err(StoreError::Http {
                status: 404,
                message: format!("relation \"{}\" does not exist", target.table),
            });
        };

        let mut pending: Vec<(RowId, &Value)> = rows
            .iter()
            .filter(|row| row.get(&target.embedding_column).map_or(true, Value::is_null))
            .filter_map(|row| row_id(row, &target.id_column).map(|id| (id, row)))
            .filter(|(id, _)| after.map_or(true, |cursor| id > cursor))
            .collect();
        pending.sort_by(|a, b| a.0.cmp(&b.0));
        pending.truncate(limit);

        let last_id = pending.last().map(|(id, _)| id.clone());
        let rows = pending.iter().filter_map(|(_, row)| target.project_row(row)).collect();
        Ok(RowPage { rows, scanned: pending.len(), last_id })
    }

    async fn write_embedding(
        &self,
        target: &BackfillTarget,
        id: &RowId,
        vector: &[f32],
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.writes += 1;
        if state.failing_writes.contains(id) {
            return Err(StoreError::Http {
                status: 500,
                message: "injected write failure".to_string(),
            });
        }
        let row = state
            .tables
            .get_mut(&target.table)
            .and_then(|rows| {
                rows.iter_mut()
                    .find(|row| row_id(row, &target.id_column).as_ref() == Some(id))
            })
            .ok_or_else(|| StoreError::UnknownRow(id.to_string()))?;
        let Some(fields) = row.as_object_mut() else {
            return Err(StoreError::Decode(format!("row {id} is not an object")));
        };
        fields.insert(target.embedding_column.clone(), Value::from(vector.to_vec()));
        Ok(())
    }
}
