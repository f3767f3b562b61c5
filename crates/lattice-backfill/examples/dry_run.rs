//! Runs the first configured target against an in-memory copy of a few rows
//! with the fake embedder. No network, no credentials.
//!
//! cargo run -p lattice-backfill --example dry_run

use std::sync::Arc;

use lattice_backfill::{BackfillDriver, BackfillOptions, MemoryRowStore, ProgressStore};
use lattice_core::config::Config;
use lattice_embed::FakeEmbedder;
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Config::load()?.settings()?;
    let target = settings
        .targets
        .first()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no targets configured"))?;

    let store = Arc::new(MemoryRowStore::new().with_rows(
        &target.table,
        vec![
            json!({
                "id": 1,
                "name": "Inversion",
                "category": "Thinking",
                "description": "Solve the problem backwards."
            }),
            json!({
                "id": 2,
                "name": "Second-order thinking",
                "category": "Thinking",
                "description": null
            }),
            json!({"id": 3, "name": null, "category": null, "description": null}),
        ],
    ));
    let tmp = tempfile::tempdir()?;
    let mut progress = ProgressStore::load(tmp.path().join("progress.json"));

    let mut options = BackfillOptions::from_settings(&settings);
    options.request_delay = std::time::Duration::ZERO;
    let driver = BackfillDriver::new(store, Arc::new(FakeEmbedder::new()), options);
    let summary = driver.run(&target, &mut progress).await;

    println!(
        "{}: scanned={} processed={} failed={} skipped={}",
        target.name, summary.scanned, summary.processed, summary.failed, summary.skipped
    );
    println!("{}", std::fs::read_to_string(progress.path())?);
    Ok(())
}
