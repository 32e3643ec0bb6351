//! Persistent catalog of model records, enrichment and scan history.
//!
//! The orchestrator only talks to the [`CatalogStore`] trait; the shipped
//! backend is a single SQLite database.

mod sqlite;
mod traits;

pub use sqlite::SqliteCatalog;
pub use traits::CatalogStore;
