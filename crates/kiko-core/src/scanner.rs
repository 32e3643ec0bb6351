//! Directory traversal for model files.
//!
//! Walks each root with an explicit work stack (walkdir's iterative walker),
//! so pathologically deep trees cannot exhaust the call stack. Symlinks are
//! not followed.

use crate::cancel::CancellationToken;
use crate::error::{IssueKind, KikoError, Result, ScanIssue};
use crate::models::{DiscoveredFile, ModelClass};
use crate::roots::ModelRoots;
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Files found under one class's roots, plus anything that went wrong.
#[derive(Debug, Default)]
pub struct ScanListing {
    pub files: Vec<DiscoveredFile>,
    pub issues: Vec<ScanIssue>,
}

/// Check a path's extension against an accepted list (case-insensitive).
pub fn has_accepted_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| extensions.iter().any(|accepted| ext.eq_ignore_ascii_case(accepted)))
        .unwrap_or(false)
}

/// Enumerate candidate files for `class` under every configured root.
///
/// Missing roots are skipped with a warning. Entries that cannot be read are
/// reported as `FileSystem` issues and the walk continues.
pub fn scan_class(
    roots: &ModelRoots,
    class: ModelClass,
    cancel: &CancellationToken,
) -> Result<ScanListing> {
    let mut listing = ScanListing::default();

    for root in roots.roots_for(class) {
        if !root.exists() {
            warn!("Skipping non-existent directory: {}", root.display());
            continue;
        }
        if !root.is_dir() {
            warn!("Path is not a directory: {}", root.display());
            continue;
        }

        debug!("Scanning {} root: {}", class, root.display());
        for entry in WalkDir::new(root).follow_links(false) {
            cancel.check()?;

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let subject = e
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| root.display().to_string());
                    warn!("Error walking {}: {}", subject, e);
                    listing
                        .issues
                        .push(ScanIssue::new(IssueKind::FileSystem, subject, e.to_string()));
                    continue;
                }
            };

            if !entry.file_type().is_file()
                || !has_accepted_extension(entry.path(), class.extensions())
            {
                continue;
            }

            match describe_file(entry.path(), root, class) {
                Ok(file) => listing.files.push(file),
                Err(e) => {
                    warn!("Failed to stat {}: {}", entry.path().display(), e);
                    listing.issues.push(ScanIssue::new(
                        IssueKind::FileSystem,
                        entry.path().display().to_string(),
                        e.to_string(),
                    ));
                }
            }
        }
    }

    Ok(listing)
}

/// Count candidate files across every class without collecting them.
///
/// Used for the progress total; unreadable entries are silently skipped here
/// because the real walk reports them.
pub fn count_candidates(roots: &ModelRoots, cancel: &CancellationToken) -> Result<usize> {
    let mut count = 0;
    for class in ModelClass::ALL {
        for root in roots.roots_for(class).iter().filter(|r| r.is_dir()) {
            for entry in WalkDir::new(root).follow_links(false).into_iter().filter_map(|e| e.ok()) {
                cancel.check()?;
                if entry.file_type().is_file()
                    && has_accepted_extension(entry.path(), class.extensions())
                {
                    count += 1;
                }
            }
        }
    }
    Ok(count)
}

fn describe_file(path: &Path, root: &Path, class: ModelClass) -> Result<DiscoveredFile> {
    let metadata = std::fs::metadata(path).map_err(|e| KikoError::io_with_path(e, path))?;
    let modified = metadata
        .modified()
        .map_err(|e| KikoError::io_with_path(e, path))?;

    let folder = path
        .strip_prefix(root)
        .ok()
        .and_then(|rel| rel.parent())
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(DiscoveredFile {
        path: path.to_path_buf(),
        class,
        size: metadata.len(),
        modified_at: DateTime::<Utc>::from(modified),
        folder,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path, content: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_extension_matching() {
        let exts = ModelClass::Lora.extensions();
        assert!(has_accepted_extension(Path::new("a.safetensors"), exts));
        assert!(has_accepted_extension(Path::new("a.PT"), exts));
        assert!(!has_accepted_extension(Path::new("a.ckpt"), exts));
        assert!(!has_accepted_extension(Path::new("safetensors"), exts));
    }

    #[test]
    fn test_scan_finds_nested_files_with_folders() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("loras");
        touch(&root.join("top.safetensors"), b"a");
        touch(&root.join("style/anime/deep.pt"), b"bb");
        touch(&root.join("style/readme.txt"), b"ignored");
        touch(&root.join("style/model.ckpt"), b"wrong class");

        let roots = ModelRoots::new().with_root(ModelClass::Lora, &root);
        let listing = scan_class(&roots, ModelClass::Lora, &CancellationToken::new()).unwrap();

        assert!(listing.issues.is_empty());
        let mut files = listing.files;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].folder, "style/anime");
        assert_eq!(files[0].size, 2);
        assert_eq!(files[1].folder, "");
        assert!(files.iter().all(|f| f.class == ModelClass::Lora));
    }

    #[test]
    fn test_missing_root_is_skipped() {
        let temp = TempDir::new().unwrap();
        let roots = ModelRoots::new()
            .with_root(ModelClass::Checkpoint, temp.path().join("does-not-exist"));
        let listing =
            scan_class(&roots, ModelClass::Checkpoint, &CancellationToken::new()).unwrap();
        assert!(listing.files.is_empty());
        assert!(listing.issues.is_empty());
    }

    #[test]
    fn test_count_matches_per_class_extensions() {
        let temp = TempDir::new().unwrap();
        touch(&temp.path().join("ckpt/a.ckpt"), b"1");
        touch(&temp.path().join("ckpt/b.bin"), b"1");
        touch(&temp.path().join("emb/c.bin"), b"1");

        let roots = ModelRoots::new()
            .with_root(ModelClass::Checkpoint, temp.path().join("ckpt"))
            .with_root(ModelClass::Embedding, temp.path().join("emb"));
        let count = count_candidates(&roots, &CancellationToken::new()).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_cancelled_walk_stops() {
        let temp = TempDir::new().unwrap();
        touch(&temp.path().join("a.safetensors"), b"1");
        let roots = ModelRoots::new().with_root(ModelClass::Lora, temp.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            scan_class(&roots, ModelClass::Lora, &cancel),
            Err(KikoError::Cancelled)
        ));
    }
}
