//! Catalog data types.
//!
//! These types are persisted by the store and serialized (camelCase) for
//! progress observers and the CLI report.

use crate::error::ScanIssue;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// The class a model file is cataloged under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelClass {
    /// Primary model (checkpoint / diffusion model / unet)
    Checkpoint,
    /// Auxiliary adapter
    Lora,
    /// Auxiliary textual-inversion embedding
    Embedding,
}

impl ModelClass {
    /// Scan order for a run.
    pub const ALL: [ModelClass; 3] = [ModelClass::Checkpoint, ModelClass::Lora, ModelClass::Embedding];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelClass::Checkpoint => "checkpoint",
            ModelClass::Lora => "lora",
            ModelClass::Embedding => "embedding",
        }
    }

    /// Plural label used in phase names and messages.
    pub fn plural(&self) -> &'static str {
        match self {
            ModelClass::Checkpoint => "checkpoints",
            ModelClass::Lora => "loras",
            ModelClass::Embedding => "embeddings",
        }
    }

    /// Accepted file extensions, lowercase and without the leading dot.
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            ModelClass::Checkpoint => &["safetensors", "ckpt", "pt"],
            ModelClass::Lora => &["safetensors", "pt"],
            ModelClass::Embedding => &["safetensors", "pt", "bin"],
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "checkpoint" | "checkpoints" => Some(ModelClass::Checkpoint),
            "lora" | "loras" => Some(ModelClass::Lora),
            "embedding" | "embeddings" => Some(ModelClass::Embedding),
            _ => None,
        }
    }
}

impl std::fmt::Display for ModelClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Canonical text form of a timestamp in the store.
///
/// Nanosecond precision so that freshness comparisons are exact.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// A file found by the directory walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub class: ModelClass,
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    /// Folder relative to the root the file was found under ("" at the root).
    pub folder: String,
}

impl DiscoveredFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn is_container(&self) -> bool {
        self.path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(crate::config::ScanConfig::CONTAINER_EXTENSION))
            .unwrap_or(false)
    }
}

/// Values derived from a container header (and sidecar file, if any).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderSummary {
    #[serde(default)]
    pub trigger_words: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub base_model: Option<String>,
    #[serde(default)]
    pub remote_model_id: Option<String>,
    #[serde(default)]
    pub remote_version_id: Option<String>,
    #[serde(default)]
    pub preview_url: Option<String>,
}

impl HeaderSummary {
    pub fn is_empty(&self) -> bool {
        self == &HeaderSummary::default()
    }
}

/// One cataloged file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRecord {
    pub path: String,
    pub name: String,
    pub folder: String,
    pub class: ModelClass,
    pub size: u64,
    pub modified_at: String,
    /// Content identity, `None` until computed (or when hashing failed).
    pub hash: Option<String>,
    pub scanned_at: String,
    #[serde(default)]
    pub header: Option<HeaderSummary>,
}

/// A preview image as described by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewImage {
    pub url: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub nsfw: Option<serde_json::Value>,
}

/// Registry popularity numbers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    #[serde(default)]
    pub download_count: u64,
    #[serde(default)]
    pub rating: f64,
    #[serde(default)]
    pub rating_count: u64,
}

/// Remote metadata for one content identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentRecord {
    pub hash: String,
    pub remote_id: i64,
    pub remote_model_id: Option<i64>,
    pub name: Option<String>,
    pub model_name: Option<String>,
    pub description: Option<String>,
    pub base_model: Option<String>,
    pub trained_words: Vec<String>,
    pub images: Vec<PreviewImage>,
    pub stats: UsageStats,
    pub download_url: Option<String>,
    pub fetched_at: String,
    /// Local path of the cached preview, if one was downloaded.
    pub preview_path: Option<String>,
}

impl EnrichmentRecord {
    /// URL of the image the preview cache should use.
    pub fn first_preview_url(&self) -> Option<&str> {
        self.images
            .first()
            .map(|img| img.url.as_str())
            .filter(|url| !url.is_empty())
    }
}

/// A preview image cached on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewAsset {
    pub hash: String,
    pub local_path: PathBuf,
    pub source_url: String,
    pub content_type: Option<String>,
}

/// Final state of a scan run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "completed" => ScanStatus::Completed,
            "failed" => ScanStatus::Failed,
            _ => ScanStatus::Running,
        }
    }
}

/// Audit record of one orchestrator invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRun {
    pub id: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    /// Description of the root-resolution input (YAML path or explicit roots).
    pub config_ref: String,
    pub class_counts: BTreeMap<ModelClass, usize>,
    pub errors: Vec<ScanIssue>,
    pub enrichment_enabled: bool,
    pub duration_secs: Option<f64>,
    pub status: ScanStatus,
}

/// Aggregate numbers for a finished run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanStats {
    pub total: usize,
    /// Files whose stored identity was reused without hashing.
    pub cached: usize,
    /// New or changed files cataloged again this run, hashed or not.
    pub indexed: usize,
    pub hashed: usize,
    /// Identities that gained an enrichment record this run.
    pub enriched: usize,
    pub remote_calls: usize,
    pub previews: usize,
    pub removed: usize,
    pub errors: usize,
    pub class_counts: BTreeMap<ModelClass, usize>,
    pub duration_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_model_class_roundtrip() {
        for class in ModelClass::ALL {
            assert_eq!(ModelClass::from_str(class.as_str()), Some(class));
            assert_eq!(ModelClass::from_str(class.plural()), Some(class));
        }
        assert_eq!(ModelClass::from_str("vae"), None);
    }

    #[test]
    fn test_class_counts_serialize_as_named_keys() {
        let mut counts = BTreeMap::new();
        counts.insert(ModelClass::Lora, 2usize);
        let json = serde_json::to_value(&counts).unwrap();
        assert_eq!(json["lora"], 2);
    }

    #[test]
    fn test_timestamp_keeps_nanoseconds() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        assert_eq!(format_timestamp(&ts), "2023-11-14T22:13:20.123456789Z");
    }

    #[test]
    fn test_container_detection_is_case_insensitive() {
        let file = DiscoveredFile {
            path: PathBuf::from("/models/loras/Style.SafeTensors"),
            class: ModelClass::Lora,
            size: 1,
            modified_at: Utc::now(),
            folder: String::new(),
        };
        assert!(file.is_container());
        assert_eq!(file.file_name(), "Style.SafeTensors");
    }

    #[test]
    fn test_first_preview_url_skips_missing() {
        let record = EnrichmentRecord {
            hash: "AB".into(),
            remote_id: 1,
            remote_model_id: None,
            name: None,
            model_name: None,
            description: None,
            base_model: None,
            trained_words: vec![],
            images: vec![],
            stats: UsageStats::default(),
            download_url: None,
            fetched_at: "now".into(),
            preview_path: None,
        };
        assert!(record.first_preview_url().is_none());
    }
}
