//! Root directory resolution.
//!
//! Roots come either from explicit per-class lists or from a ComfyUI
//! `extra_model_paths.yaml`. For the YAML form the ComfyUI install's own
//! `models/` folder (next to the YAML) is included ahead of the extra paths.

use crate::error::{KikoError, Result};
use crate::models::ModelClass;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Input to root resolution, recorded on the scan run as its config reference.
#[derive(Debug, Clone)]
pub enum RootSource {
    /// Explicit directories per class.
    Explicit(ModelRoots),
    /// Path to a ComfyUI `extra_model_paths.yaml`.
    ExtraModelPaths(PathBuf),
}

impl RootSource {
    /// Short description stored on the scan run.
    pub fn describe(&self) -> String {
        match self {
            RootSource::Explicit(roots) => format!("explicit:{} roots", roots.len()),
            RootSource::ExtraModelPaths(path) => path.display().to_string(),
        }
    }

    /// Turn the source into concrete per-class roots.
    pub fn resolve(&self) -> Result<ModelRoots> {
        match self {
            RootSource::Explicit(roots) => Ok(roots.clone()),
            RootSource::ExtraModelPaths(path) => ModelRoots::from_extra_model_paths(path),
        }
    }
}

/// Root directories per model class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelRoots {
    roots: BTreeMap<ModelClass, Vec<PathBuf>>,
}

impl ModelRoots {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a root for a class. Duplicates are ignored.
    pub fn with_root(mut self, class: ModelClass, root: impl Into<PathBuf>) -> Self {
        self.add_root(class, root);
        self
    }

    pub fn add_root(&mut self, class: ModelClass, root: impl Into<PathBuf>) {
        let root = root.into();
        let entry = self.roots.entry(class).or_default();
        if !entry.contains(&root) {
            entry.push(root);
        }
    }

    pub fn roots_for(&self, class: ModelClass) -> &[PathBuf] {
        self.roots.get(&class).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total number of configured roots across classes.
    pub fn len(&self) -> usize {
        self.roots.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of configured roots that currently exist as directories.
    pub fn existing_count(&self) -> usize {
        self.roots.values().flatten().filter(|p| p.is_dir()).count()
    }

    /// Parse a ComfyUI `extra_model_paths.yaml`.
    ///
    /// Uses the `comfyui` section when present, otherwise the document root.
    /// `base_path` is required; relative entries are joined onto it.
    pub fn from_extra_model_paths(yaml_path: impl AsRef<Path>) -> Result<Self> {
        let yaml_path = yaml_path.as_ref();
        let content = std::fs::read_to_string(yaml_path)
            .map_err(|e| KikoError::io_with_path(e, yaml_path))?;

        let document: Value = serde_yaml::from_str(&content)?;
        if document.is_null() {
            return Err(KikoError::Config {
                message: format!("{} is empty", yaml_path.display()),
            });
        }

        let section = document.get("comfyui").unwrap_or(&document);
        let base_path = section
            .get("base_path")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| KikoError::Config {
                message: format!("No base_path found in {}", yaml_path.display()),
            })?;
        let base_path = PathBuf::from(base_path);

        let mut roots = ModelRoots::new();

        // The ComfyUI install's own models directory lives next to the YAML.
        if let Some(models_dir) = yaml_path.parent().map(|dir| dir.join("models")) {
            if models_dir.is_dir() {
                debug!("ComfyUI base models directory: {}", models_dir.display());
                for sub in ["checkpoints", "diffusion_models", "unet"] {
                    roots.add_root(ModelClass::Checkpoint, models_dir.join(sub));
                }
                roots.add_root(ModelClass::Lora, models_dir.join("loras"));
                roots.add_root(ModelClass::Embedding, models_dir.join("embeddings"));
            } else {
                warn!(
                    "ComfyUI models directory not found at {}, skipping base models",
                    models_dir.display()
                );
            }
        }

        for key in ["checkpoints", "diffusion_models", "unet"] {
            for path in parse_path_field(section.get(key), &base_path) {
                roots.add_root(ModelClass::Checkpoint, path);
            }
        }
        for path in parse_path_field(section.get("loras"), &base_path) {
            roots.add_root(ModelClass::Lora, path);
        }
        for path in parse_path_field(section.get("embeddings"), &base_path) {
            roots.add_root(ModelClass::Embedding, path);
        }

        info!(
            "Resolved {} model roots from {}",
            roots.len(),
            yaml_path.display()
        );
        Ok(roots)
    }
}

/// Read a path field that is either a list or a newline-separated string.
fn parse_path_field(field: Option<&Value>, base_path: &Path) -> Vec<PathBuf> {
    let entries: Vec<String> = match field {
        Some(Value::String(s)) => s
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
        Some(Value::Sequence(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };

    entries
        .into_iter()
        .map(|entry| {
            let path = PathBuf::from(&entry);
            if path.is_absolute() {
                path
            } else {
                base_path.join(path)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_explicit_roots_deduplicate() {
        let roots = ModelRoots::new()
            .with_root(ModelClass::Lora, "/a")
            .with_root(ModelClass::Lora, "/a")
            .with_root(ModelClass::Embedding, "/b");
        assert_eq!(roots.len(), 2);
        assert_eq!(roots.roots_for(ModelClass::Lora), &[PathBuf::from("/a")]);
        assert!(roots.roots_for(ModelClass::Checkpoint).is_empty());
    }

    #[test]
    fn test_parse_yaml_with_multiline_and_lists() {
        let temp = TempDir::new().unwrap();
        let yaml = temp.path().join("extra_model_paths.yaml");
        std::fs::write(
            &yaml,
            r#"
comfyui:
  base_path: /data/ai
  checkpoints: |
    models/checkpoints
    /mnt/big/checkpoints
  unet: models/unet
  loras:
    - models/loras
  embeddings: models/embeddings
"#,
        )
        .unwrap();

        let roots = ModelRoots::from_extra_model_paths(&yaml).unwrap();
        assert_eq!(
            roots.roots_for(ModelClass::Checkpoint),
            &[
                PathBuf::from("/data/ai/models/checkpoints"),
                PathBuf::from("/mnt/big/checkpoints"),
                PathBuf::from("/data/ai/models/unet"),
            ]
        );
        assert_eq!(
            roots.roots_for(ModelClass::Lora),
            &[PathBuf::from("/data/ai/models/loras")]
        );
        assert_eq!(roots.len(), 5);
    }

    #[test]
    fn test_includes_comfyui_models_dir_when_present() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("models")).unwrap();
        let yaml = temp.path().join("extra_model_paths.yaml");
        std::fs::write(&yaml, "base_path: /srv\nloras: extra/loras\n").unwrap();

        let roots = ModelRoots::from_extra_model_paths(&yaml).unwrap();
        let models = temp.path().join("models");
        assert_eq!(
            roots.roots_for(ModelClass::Lora),
            &[models.join("loras"), PathBuf::from("/srv/extra/loras")]
        );
        assert_eq!(roots.roots_for(ModelClass::Checkpoint).len(), 3);
        assert_eq!(roots.roots_for(ModelClass::Embedding), &[models.join("embeddings")]);
    }

    #[test]
    fn test_missing_base_path_is_config_error() {
        let temp = TempDir::new().unwrap();
        let yaml = temp.path().join("extra_model_paths.yaml");
        std::fs::write(&yaml, "comfyui:\n  loras: models/loras\n").unwrap();

        let err = ModelRoots::from_extra_model_paths(&yaml).unwrap_err();
        assert!(matches!(err, KikoError::Config { .. }));
    }

    #[test]
    fn test_missing_yaml_is_io_error() {
        let err = ModelRoots::from_extra_model_paths("/nonexistent/extra_model_paths.yaml")
            .unwrap_err();
        assert!(matches!(err, KikoError::Io { .. }));
    }

    #[test]
    fn test_existing_count_ignores_missing_dirs() {
        let temp = TempDir::new().unwrap();
        let roots = ModelRoots::new()
            .with_root(ModelClass::Checkpoint, temp.path())
            .with_root(ModelClass::Lora, temp.path().join("missing"));
        assert_eq!(roots.existing_count(), 1);
    }
}
