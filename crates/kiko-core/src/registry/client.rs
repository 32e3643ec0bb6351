//! Registry client trait.

use crate::error::Result;
use crate::models::EnrichmentRecord;
use async_trait::async_trait;

/// Lookup of remote metadata by content identity.
///
/// `Ok(None)` means the registry answered that it does not know the
/// identity. Transport failures, timeouts, rate limiting and unparseable
/// bodies are `Err`.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn lookup_by_hash(&self, hash: &str) -> Result<Option<EnrichmentRecord>>;

    /// Short name used in logs and error messages.
    fn name(&self) -> &str {
        "registry"
    }
}
