//! Backfill pipeline: retry policy, durable progress, the per-table driver
//! and the row stores it walks.

pub mod embed_backfill;
pub mod memory;
pub mod progress;
pub mod retry;
pub mod supabase;

pub use embed_backfill::{BackfillDriver, BackfillOptions, BackfillSummary, RowOutcome};
pub use memory::MemoryRowStore;
pub use progress::{ConfigSnapshot, FailedRecord, ProgressRecord, ProgressStore};
pub use retry::{with_retries, RetryOutcome, RetryPolicy};
pub use supabase::SupabaseStore;
