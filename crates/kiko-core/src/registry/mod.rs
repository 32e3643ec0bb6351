//! Remote model registry lookups.
//!
//! - [`RegistryClient`]: the lookup seam, keyed by content identity
//! - [`CivitaiClient`]: the shipped HTTP implementation
//! - [`MetadataFetcher`]: bounded worker pool that drains a batch of identities

mod civitai;
mod client;
mod fetcher;

pub use civitai::CivitaiClient;
pub use client::RegistryClient;
pub use fetcher::{FetchBatch, FetchOutcome, MetadataFetcher};
