//! SQLite-backed catalog store.

use super::traits::CatalogStore;
use crate::error::{KikoError, Result};
use crate::models::{
    EnrichmentRecord, HeaderSummary, ModelClass, ModelRecord, ScanRun, ScanStatus,
};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// SQLite catalog.
///
/// Thread-safe via internal mutex on the connection.
pub struct SqliteCatalog {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCatalog {
    /// Open (or create) the catalog at `db_path`.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| KikoError::Io {
                message: format!("Failed to create catalog directory: {}", e),
                path: Some(parent.to_path_buf()),
                source: Some(e),
            })?;
        }

        let conn = Connection::open(db_path).map_err(|e| KikoError::Database {
            message: format!("Failed to open catalog database: {}", e),
            source: Some(e),
        })?;

        // Enable WAL mode for better concurrent access
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| KikoError::Database {
                message: format!("Failed to set pragmas: {}", e),
                source: Some(e),
            })?;

        let catalog = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        catalog.init_schema()?;
        info!("Opened model catalog at {}", db_path.display());
        Ok(catalog)
    }

    /// In-memory catalog, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let catalog = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        catalog.init_schema()?;
        Ok(catalog)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| KikoError::Database {
            message: format!("Failed to lock database: {}", e),
            source: None,
        })
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS models (
                path TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                folder TEXT NOT NULL,
                class TEXT NOT NULL,
                size INTEGER NOT NULL,
                modified_at TEXT NOT NULL,
                hash TEXT,
                scanned_at TEXT NOT NULL,
                header_json TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_models_hash ON models(hash);
            CREATE INDEX IF NOT EXISTS idx_models_class ON models(class);

            CREATE TABLE IF NOT EXISTS enrichment (
                hash TEXT PRIMARY KEY,
                remote_id INTEGER NOT NULL,
                remote_model_id INTEGER,
                name TEXT,
                model_name TEXT,
                description TEXT,
                base_model TEXT,
                trained_words TEXT NOT NULL,
                images TEXT NOT NULL,
                stats TEXT NOT NULL,
                download_url TEXT,
                fetched_at TEXT NOT NULL,
                preview_path TEXT
            );

            CREATE TABLE IF NOT EXISTS scan_runs (
                id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                config_ref TEXT NOT NULL,
                class_counts TEXT NOT NULL,
                errors TEXT NOT NULL,
                enrichment_enabled INTEGER NOT NULL,
                duration_secs REAL,
                status TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_scan_runs_started ON scan_runs(started_at);
            "#,
        )
        .map_err(|e| KikoError::Database {
            message: format!("Failed to initialize catalog schema: {}", e),
            source: Some(e),
        })?;
        Ok(())
    }
}

fn json_column<T: serde::de::DeserializeOwned>(raw: String, idx: usize) -> rusqlite::Result<T> {
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn model_from_row(row: &Row<'_>) -> rusqlite::Result<ModelRecord> {
    let class: String = row.get(3)?;
    let class = ModelClass::from_str(&class).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown model class: {}", class).into(),
        )
    })?;
    let header: Option<String> = row.get(8)?;
    let header: Option<HeaderSummary> = header.map(|raw| json_column(raw, 8)).transpose()?;

    Ok(ModelRecord {
        path: row.get(0)?,
        name: row.get(1)?,
        folder: row.get(2)?,
        class,
        size: row.get::<_, i64>(4)? as u64,
        modified_at: row.get(5)?,
        hash: row.get(6)?,
        scanned_at: row.get(7)?,
        header,
    })
}

fn enrichment_from_row(row: &Row<'_>) -> rusqlite::Result<EnrichmentRecord> {
    Ok(EnrichmentRecord {
        hash: row.get(0)?,
        remote_id: row.get(1)?,
        remote_model_id: row.get(2)?,
        name: row.get(3)?,
        model_name: row.get(4)?,
        description: row.get(5)?,
        base_model: row.get(6)?,
        trained_words: json_column(row.get(7)?, 7)?,
        images: json_column(row.get(8)?, 8)?,
        stats: json_column(row.get(9)?, 9)?,
        download_url: row.get(10)?,
        fetched_at: row.get(11)?,
        preview_path: row.get(12)?,
    })
}

fn scan_run_from_row(row: &Row<'_>) -> rusqlite::Result<ScanRun> {
    let status: String = row.get(8)?;
    Ok(ScanRun {
        id: row.get(0)?,
        started_at: row.get(1)?,
        completed_at: row.get(2)?,
        config_ref: row.get(3)?,
        class_counts: json_column(row.get(4)?, 4)?,
        errors: json_column(row.get(5)?, 5)?,
        enrichment_enabled: row.get(6)?,
        duration_secs: row.get(7)?,
        status: ScanStatus::from_str(&status),
    })
}

impl CatalogStore for SqliteCatalog {
    fn get_by_path(&self, path: &str) -> Result<Option<ModelRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT path, name, folder, class, size, modified_at, hash, scanned_at, header_json
                 FROM models WHERE path = ?1",
                params![path],
                model_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn get_enrichment(&self, hash: &str) -> Result<Option<EnrichmentRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT hash, remote_id, remote_model_id, name, model_name, description,
                        base_model, trained_words, images, stats, download_url, fetched_at,
                        preview_path
                 FROM enrichment WHERE hash = ?1",
                params![hash],
                enrichment_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn upsert_model(&self, record: &ModelRecord) -> Result<()> {
        let header_json = record
            .header
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO models (path, name, folder, class, size, modified_at, hash, scanned_at, header_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(path) DO UPDATE SET
                name = excluded.name,
                folder = excluded.folder,
                class = excluded.class,
                size = excluded.size,
                modified_at = excluded.modified_at,
                hash = excluded.hash,
                scanned_at = excluded.scanned_at,
                header_json = excluded.header_json",
            params![
                record.path,
                record.name,
                record.folder,
                record.class.as_str(),
                record.size as i64,
                record.modified_at,
                record.hash,
                record.scanned_at,
                header_json,
            ],
        )?;
        Ok(())
    }

    fn upsert_enrichment(&self, record: &EnrichmentRecord) -> Result<()> {
        let trained_words = serde_json::to_string(&record.trained_words)?;
        let images = serde_json::to_string(&record.images)?;
        let stats = serde_json::to_string(&record.stats)?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO enrichment (hash, remote_id, remote_model_id, name, model_name,
                description, base_model, trained_words, images, stats, download_url,
                fetched_at, preview_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(hash) DO UPDATE SET
                remote_id = excluded.remote_id,
                remote_model_id = excluded.remote_model_id,
                name = excluded.name,
                model_name = excluded.model_name,
                description = excluded.description,
                base_model = excluded.base_model,
                trained_words = excluded.trained_words,
                images = excluded.images,
                stats = excluded.stats,
                download_url = excluded.download_url,
                fetched_at = excluded.fetched_at,
                preview_path = excluded.preview_path",
            params![
                record.hash,
                record.remote_id,
                record.remote_model_id,
                record.name,
                record.model_name,
                record.description,
                record.base_model,
                trained_words,
                images,
                stats,
                record.download_url,
                record.fetched_at,
                record.preview_path,
            ],
        )?;
        Ok(())
    }

    fn needs_update(&self, path: &str, modified_at: &str) -> Result<bool> {
        let conn = self.lock()?;
        let stored: Option<String> = conn
            .query_row(
                "SELECT modified_at FROM models WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stored.as_deref() != Some(modified_at))
    }

    fn delete_all_except(&self, observed: &HashSet<String>) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute_batch(
            "CREATE TEMP TABLE IF NOT EXISTS observed_paths (path TEXT PRIMARY KEY);
             DELETE FROM observed_paths;",
        )?;
        {
            let mut insert = tx.prepare("INSERT OR IGNORE INTO observed_paths (path) VALUES (?1)")?;
            for path in observed {
                insert.execute(params![path])?;
            }
        }
        let removed = tx.execute(
            "DELETE FROM models WHERE path NOT IN (SELECT path FROM observed_paths)",
            [],
        )?;
        tx.execute_batch("DROP TABLE observed_paths;")?;
        tx.commit()?;

        debug!("Swept {} model records not observed in this run", removed);
        Ok(removed)
    }

    fn count_models(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM models", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn create_scan_run(&self, run: &ScanRun) -> Result<()> {
        let class_counts = serde_json::to_string(&run.class_counts)?;
        let errors = serde_json::to_string(&run.errors)?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO scan_runs (id, started_at, completed_at, config_ref, class_counts,
                errors, enrichment_enabled, duration_secs, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                run.id,
                run.started_at,
                run.completed_at,
                run.config_ref,
                class_counts,
                errors,
                run.enrichment_enabled,
                run.duration_secs,
                run.status.as_str(),
            ],
        )?;
        Ok(())
    }

    fn finalize_scan_run(&self, run: &ScanRun) -> Result<()> {
        let class_counts = serde_json::to_string(&run.class_counts)?;
        let errors = serde_json::to_string(&run.errors)?;

        let conn = self.lock()?;
        let updated = conn.execute(
            "UPDATE scan_runs SET completed_at = ?2, class_counts = ?3, errors = ?4,
                enrichment_enabled = ?5, duration_secs = ?6, status = ?7
             WHERE id = ?1",
            params![
                run.id,
                run.completed_at,
                class_counts,
                errors,
                run.enrichment_enabled,
                run.duration_secs,
                run.status.as_str(),
            ],
        )?;
        if updated == 0 {
            return Err(KikoError::Database {
                message: format!("Scan run {} was never created", run.id),
                source: None,
            });
        }
        Ok(())
    }

    fn recent_scan_runs(&self, limit: usize) -> Result<Vec<ScanRun>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, started_at, completed_at, config_ref, class_counts, errors,
                    enrichment_enabled, duration_secs, status
             FROM scan_runs ORDER BY started_at DESC, rowid DESC LIMIT ?1",
        )?;
        let runs = stmt
            .query_map(params![limit as i64], scan_run_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{IssueKind, ScanIssue};
    use crate::models::{PreviewImage, UsageStats};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn model(path: &str, modified_at: &str, hash: Option<&str>) -> ModelRecord {
        ModelRecord {
            path: path.to_string(),
            name: path.rsplit('/').next().unwrap().to_string(),
            folder: String::new(),
            class: ModelClass::Lora,
            size: 1024,
            modified_at: modified_at.to_string(),
            hash: hash.map(str::to_string),
            scanned_at: "2025-01-01T00:00:00Z".to_string(),
            header: None,
        }
    }

    fn enrichment(hash: &str) -> EnrichmentRecord {
        EnrichmentRecord {
            hash: hash.to_string(),
            remote_id: 1,
            remote_model_id: Some(55),
            name: Some("v1".into()),
            model_name: Some("X".into()),
            description: None,
            base_model: Some("SDXL 1.0".into()),
            trained_words: vec!["glow".into()],
            images: vec![PreviewImage {
                url: "https://img/1.png".into(),
                width: Some(512),
                height: Some(768),
                nsfw: None,
            }],
            stats: UsageStats {
                download_count: 10,
                rating: 4.5,
                rating_count: 2,
            },
            download_url: None,
            fetched_at: "2025-01-01T00:00:00Z".into(),
            preview_path: None,
        }
    }

    fn run(id: &str, started_at: &str) -> ScanRun {
        ScanRun {
            id: id.to_string(),
            started_at: started_at.to_string(),
            completed_at: None,
            config_ref: "explicit:1 roots".into(),
            class_counts: BTreeMap::new(),
            errors: vec![],
            enrichment_enabled: true,
            duration_secs: None,
            status: ScanStatus::Running,
        }
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let temp = TempDir::new().unwrap();
        let db = temp.path().join("nested/dir/models.db");
        let catalog = SqliteCatalog::open(&db).unwrap();
        assert!(db.exists());
        assert_eq!(catalog.count_models().unwrap(), 0);
    }

    #[test]
    fn test_upsert_and_get_model() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        let mut record = model("/m/a.safetensors", "t1", Some("AA"));
        record.header = Some(HeaderSummary {
            trigger_words: vec!["x".into()],
            ..Default::default()
        });
        catalog.upsert_model(&record).unwrap();
        assert_eq!(catalog.get_by_path("/m/a.safetensors").unwrap(), Some(record.clone()));

        record.hash = Some("BB".into());
        catalog.upsert_model(&record).unwrap();
        let stored = catalog.get_by_path("/m/a.safetensors").unwrap().unwrap();
        assert_eq!(stored.hash.as_deref(), Some("BB"));
        assert_eq!(catalog.count_models().unwrap(), 1);
    }

    #[test]
    fn test_needs_update() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        assert!(catalog.needs_update("/m/a.pt", "t1").unwrap());
        catalog.upsert_model(&model("/m/a.pt", "t1", None)).unwrap();
        assert!(!catalog.needs_update("/m/a.pt", "t1").unwrap());
        assert!(catalog.needs_update("/m/a.pt", "t2").unwrap());
    }

    #[test]
    fn test_enrichment_round_trip() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        assert!(catalog.get_enrichment("AA").unwrap().is_none());
        let record = enrichment("AA");
        catalog.upsert_enrichment(&record).unwrap();
        assert_eq!(catalog.get_enrichment("AA").unwrap(), Some(record));
    }

    #[test]
    fn test_delete_all_except() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        for path in ["/m/a", "/m/b", "/m/c"] {
            catalog.upsert_model(&model(path, "t", None)).unwrap();
        }
        let observed: HashSet<String> = ["/m/a".to_string(), "/m/c".to_string()].into();
        assert_eq!(catalog.delete_all_except(&observed).unwrap(), 1);
        assert!(catalog.get_by_path("/m/b").unwrap().is_none());
        assert_eq!(catalog.count_models().unwrap(), 2);

        // A second sweep with the same set removes nothing.
        assert_eq!(catalog.delete_all_except(&observed).unwrap(), 0);
        assert_eq!(catalog.delete_all_except(&HashSet::new()).unwrap(), 2);
    }

    #[test]
    fn test_scan_run_lifecycle() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        let mut first = run("r1", "2025-01-01T00:00:00.000000000Z");
        catalog.create_scan_run(&first).unwrap();
        catalog
            .create_scan_run(&run("r2", "2025-01-02T00:00:00.000000000Z"))
            .unwrap();

        first.status = ScanStatus::Failed;
        first.completed_at = Some("2025-01-01T00:00:05.000000000Z".into());
        first.duration_secs = Some(5.0);
        first.class_counts.insert(ModelClass::Lora, 3);
        first
            .errors
            .push(ScanIssue::new(IssueKind::Configuration, "roots", "none"));
        catalog.finalize_scan_run(&first).unwrap();

        let runs = catalog.recent_scan_runs(10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, "r2");
        assert_eq!(runs[0].status, ScanStatus::Running);
        assert_eq!(runs[1], first);

        assert_eq!(catalog.recent_scan_runs(1).unwrap().len(), 1);
    }

    #[test]
    fn test_finalize_unknown_run_fails() {
        let catalog = SqliteCatalog::open_in_memory().unwrap();
        assert!(catalog.finalize_scan_run(&run("missing", "t")).is_err());
    }
}
