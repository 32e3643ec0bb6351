//! Safetensors header extraction.
//!
//! A safetensors file starts with an 8-byte little-endian header length, then
//! that many bytes of JSON, then tensor data. Only the prefix and the declared
//! header bytes are read. Free-form training metadata lives under the
//! `__metadata__` key; the helpers here pull trigger words, descriptions,
//! base-model tags and registry hints out of it.

use crate::config::ScanConfig;
use crate::error::{KikoError, Result};
use crate::models::HeaderSummary;
use serde_json::{Map, Value};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Metadata object stored under `__metadata__`.
pub type ContainerMetadata = Map<String, Value>;

/// Number of tags taken from each `ss_tag_frequency` dataset.
const TAGS_PER_DATASET: usize = 5;

const DESCRIPTION_KEYS: &[&str] = &["modelspec.description", "ss_comment", "description"];
const BASE_MODEL_KEYS: &[&str] = &["modelspec.architecture", "ss_base_model_version", "base_model"];
const MODEL_ID_KEYS: &[&str] = &["modelspec.sai_model_spec", "ss_model_id", "modelId", "model_id"];
const VERSION_ID_KEYS: &[&str] = &["ss_version_id", "versionId", "version_id"];
const PREVIEW_URL_KEYS: &[&str] = &["ss_preview_url", "preview_url", "previewUrl", "preview_image"];

/// Read the `__metadata__` object, reporting why it could not be read.
///
/// `Ok(None)` means the header is valid but carries no metadata object.
pub fn try_read_container_metadata(path: impl AsRef<Path>) -> Result<Option<ContainerMetadata>> {
    let path = path.as_ref();
    let invalid = |message: String| KikoError::InvalidHeader {
        path: path.to_path_buf(),
        message,
    };

    let mut file = std::fs::File::open(path).map_err(|e| KikoError::io_with_path(e, path))?;

    // Read header size (8 bytes, little-endian)
    let mut size_buf = [0u8; 8];
    file.read_exact(&mut size_buf)
        .map_err(|e| invalid(format!("cannot read header length: {}", e)))?;
    let header_size = u64::from_le_bytes(size_buf);

    if header_size == 0 {
        return Err(invalid("declared header length is zero".into()));
    }
    if header_size > ScanConfig::MAX_HEADER_BYTES {
        return Err(invalid(format!(
            "declared header length {} exceeds {} bytes",
            header_size,
            ScanConfig::MAX_HEADER_BYTES
        )));
    }

    let mut header_buf = vec![0u8; header_size as usize];
    file.read_exact(&mut header_buf)
        .map_err(|e| invalid(format!("truncated header: {}", e)))?;

    let header: Value = serde_json::from_slice(&header_buf)
        .map_err(|e| invalid(format!("header is not valid JSON: {}", e)))?;

    match header.get("__metadata__") {
        Some(Value::Object(metadata)) => Ok(Some(metadata.clone())),
        Some(_) => Err(invalid("__metadata__ is not an object".into())),
        None => Ok(None),
    }
}

/// Read the `__metadata__` object, or `None` for any failure.
pub fn read_container_metadata(path: impl AsRef<Path>) -> Option<ContainerMetadata> {
    let path = path.as_ref();
    match try_read_container_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) => {
            debug!("No readable header metadata in {}: {}", path.display(), e);
            None
        }
    }
}

/// Render a metadata value as a non-empty string.
fn value_as_string(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

/// First key in `keys` that holds a usable value.
fn first_present(metadata: &ContainerMetadata, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| metadata.get(*key))
        .find_map(value_as_string)
}

/// Collect trigger words, deduplicated in first-seen order.
pub fn extract_trigger_words(metadata: &ContainerMetadata) -> Vec<String> {
    let mut words: Vec<String> = Vec::new();

    match metadata.get("modelspec.trigger_words") {
        Some(Value::Array(items)) => words.extend(items.iter().filter_map(value_as_string)),
        Some(other) => words.extend(value_as_string(other)),
        None => {}
    }

    // ss_tag_frequency is a JSON document encoded as a string:
    // {"dataset": {"tag": count, ...}, ...}
    let tag_frequency = metadata
        .get("ss_tag_frequency")
        .and_then(Value::as_str)
        .and_then(|raw| serde_json::from_str::<Map<String, Value>>(raw).ok());
    if let Some(datasets) = tag_frequency {
        for tags in datasets.values().filter_map(Value::as_object) {
            let mut ranked: Vec<(&String, u64)> = tags
                .iter()
                .map(|(tag, count)| (tag, count.as_u64().unwrap_or(0)))
                .collect();
            ranked.sort_by(|a, b| b.1.cmp(&a.1));
            words.extend(
                ranked
                    .into_iter()
                    .take(TAGS_PER_DATASET)
                    .map(|(tag, _)| tag.trim().to_string()),
            );
        }
    }

    let mut seen = std::collections::HashSet::new();
    words.retain(|w| !w.is_empty() && seen.insert(w.clone()));
    words
}

pub fn extract_description(metadata: &ContainerMetadata) -> Option<String> {
    first_present(metadata, DESCRIPTION_KEYS)
}

pub fn extract_base_model(metadata: &ContainerMetadata) -> Option<String> {
    first_present(metadata, BASE_MODEL_KEYS)
}

/// Registry identifiers and a preview URL found alongside a model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryHints {
    pub model_id: Option<String>,
    pub version_id: Option<String>,
    pub preview_url: Option<String>,
}

impl RegistryHints {
    fn has_ids(&self) -> bool {
        self.model_id.is_some() || self.version_id.is_some()
    }
}

pub fn extract_registry_hints(metadata: &ContainerMetadata) -> RegistryHints {
    RegistryHints {
        model_id: first_present(metadata, MODEL_ID_KEYS),
        version_id: first_present(metadata, VERSION_ID_KEYS),
        preview_url: first_present(metadata, PREVIEW_URL_KEYS),
    }
}

/// Location of the LoRA-manager sidecar for a container.
pub fn sidecar_path(container: &Path) -> PathBuf {
    let stem = container
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    container.with_file_name(format!("{}{}", stem, ScanConfig::SIDECAR_SUFFIX))
}

/// Registry hints from a `<stem>.metadata.json` sidecar, if one exists and
/// names a model or version.
pub fn read_sidecar_hints(container: &Path) -> Option<RegistryHints> {
    let path = sidecar_path(container);
    if !path.is_file() {
        return None;
    }

    let parsed: Value = match std::fs::read_to_string(&path)
        .map_err(KikoError::from)
        .and_then(|raw| serde_json::from_str(&raw).map_err(KikoError::from))
    {
        Ok(value) => value,
        Err(e) => {
            warn!("Failed to read sidecar {}: {}", path.display(), e);
            return None;
        }
    };

    let civitai = parsed.get("civitai")?;
    let preview_url = civitai
        .get("images")
        .and_then(Value::as_array)
        .and_then(|images| images.first())
        .and_then(|first| first.get("url").and_then(value_as_string).or_else(|| value_as_string(first)));

    let hints = RegistryHints {
        model_id: civitai.get("modelId").and_then(value_as_string),
        version_id: civitai.get("id").and_then(value_as_string),
        preview_url,
    };
    hints.has_ids().then_some(hints)
}

/// Build the header summary stored on a model record.
///
/// Sidecar hints take precedence over hints embedded in the header.
pub fn summarize(metadata: Option<&ContainerMetadata>, container: &Path) -> Option<HeaderSummary> {
    let mut summary = HeaderSummary::default();

    if let Some(metadata) = metadata {
        let hints = extract_registry_hints(metadata);
        summary.trigger_words = extract_trigger_words(metadata);
        summary.description = extract_description(metadata);
        summary.base_model = extract_base_model(metadata);
        summary.remote_model_id = hints.model_id;
        summary.remote_version_id = hints.version_id;
        summary.preview_url = hints.preview_url;
    }

    if let Some(sidecar) = read_sidecar_hints(container) {
        summary.remote_model_id = sidecar.model_id;
        summary.remote_version_id = sidecar.version_id;
        if sidecar.preview_url.is_some() {
            summary.preview_url = sidecar.preview_url;
        }
    }

    (!summary.is_empty()).then_some(summary)
}
