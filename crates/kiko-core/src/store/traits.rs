//! Catalog store trait.

use crate::error::Result;
use crate::models::{EnrichmentRecord, ModelRecord, ScanRun};
use std::collections::HashSet;

/// Storage backend for the catalog.
///
/// All operations are synchronous to match rusqlite's API. Each write is a
/// single atomic statement or transaction.
pub trait CatalogStore: Send + Sync {
    /// Look up the record for a file path.
    fn get_by_path(&self, path: &str) -> Result<Option<ModelRecord>>;

    /// Look up enrichment by content identity.
    fn get_enrichment(&self, hash: &str) -> Result<Option<EnrichmentRecord>>;

    /// Insert or replace the record for `record.path`.
    fn upsert_model(&self, record: &ModelRecord) -> Result<()>;

    /// Insert or replace the enrichment for `record.hash`.
    fn upsert_enrichment(&self, record: &EnrichmentRecord) -> Result<()>;

    /// Whether a path is absent or was stored with a different modified time.
    fn needs_update(&self, path: &str, modified_at: &str) -> Result<bool> {
        Ok(self
            .get_by_path(path)?
            .map(|record| record.modified_at != modified_at)
            .unwrap_or(true))
    }

    /// Delete every model record whose path is not in `observed`.
    ///
    /// Returns the number of records removed.
    fn delete_all_except(&self, observed: &HashSet<String>) -> Result<usize>;

    /// Number of model records.
    fn count_models(&self) -> Result<usize>;

    /// Record the start of a run.
    fn create_scan_run(&self, run: &ScanRun) -> Result<()>;

    /// Store the final state of a run created earlier.
    fn finalize_scan_run(&self, run: &ScanRun) -> Result<()>;

    /// Most recent runs, newest first.
    fn recent_scan_runs(&self, limit: usize) -> Result<Vec<ScanRun>>;
}
