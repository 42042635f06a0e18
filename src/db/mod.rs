//! Database module for ac-sync
//!
//! SQLite storage for the local side of the engine:
//! - `settings`: string settings (device id, KDF parameters), backs `KeyValueStore`
//! - `projects`: the local dataset as JSON payloads, backs `ProjectStore`

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::sync::dataset::{meta_for, DatasetError, KeyValueStore, ProjectStore};
use crate::sync::models::{ProjectMeta, ProjectPayload};
use crate::sync::snapshot::ApplyReport;

/// File name of the database inside the data directory
pub const DB_FILE_NAME: &str = "ac-sync.db";

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Data directory unavailable: {0}")]
    DataDir(String),
}

pub type DbResult<T> = Result<T, DbError>;

impl From<DbError> for DatasetError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(id) => DatasetError::NotFound(id),
            DbError::Constraint(id) => DatasetError::AlreadyExists(id),
            other => DatasetError::Unavailable(other.to_string()),
        }
    }
}

/// Default database location in the platform data directory, created if missing
pub fn default_db_path() -> DbResult<PathBuf> {
    let app_dir = directories::ProjectDirs::from("app", "ac", "ac-sync").ok_or_else(|| {
        DbError::DataDir("cannot determine home directory".to_string())
    })?;
    let data_dir = app_dir.data_dir();
    std::fs::create_dir_all(data_dir)
        .map_err(|e| DbError::DataDir(format!("{:?}: {}", data_dir, e)))?;
    Ok(data_dir.join(DB_FILE_NAME))
}

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Open (or create) the database file and apply the schema
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        let manager = SqliteConnectionManager::file(&db_path);

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(2))
            .connection_timeout(std::time::Duration::from_secs(10))
            .test_on_check_out(false)
            .build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;
        Self::init_schema(&conn)?;
        drop(conn);

        log::debug!("Database opened at {:?}", db_path);
        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every pooled connection to `:memory:` is its own database, so the pool
    /// holds a single connection.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;

        let conn = pool.get()?;
        Self::init_schema(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn init_schema(conn: &Connection) -> DbResult<()> {
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(())
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json =
            serde_json::to_string(value).map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))",
            params![key, json],
        )?;
        Ok(())
    }

    pub fn remove_setting(&self, key: &str) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM settings WHERE key = ?1", [key])?;
        Ok(())
    }

    // =========================================================================
    // PROJECTS
    // =========================================================================

    /// All projects ordered by id
    pub fn get_projects(&self) -> DbResult<Vec<(String, ProjectPayload)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT id, payload FROM projects ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut projects = Vec::new();
        for row in rows {
            let (id, json) = row?;
            projects.push((id, parse_payload(&json)?));
        }
        Ok(projects)
    }

    pub fn get_project(&self, id: &str) -> DbResult<Option<ProjectPayload>> {
        let conn = self.get_conn()?;
        let json: Option<String> = conn
            .query_row("SELECT payload FROM projects WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;
        json.map(|json| parse_payload(&json)).transpose()
    }

    pub fn insert_project(&self, id: &str, payload: &ProjectPayload) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json = encode_payload(payload)?;

        match conn.execute(
            "INSERT INTO projects (id, payload, updated_at) VALUES (?1, ?2, ?3)",
            params![id, json, payload_updated_at(payload)],
        ) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(DbError::Constraint(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn update_project(&self, id: &str, payload: &ProjectPayload) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json = encode_payload(payload)?;

        let affected = conn.execute(
            "UPDATE projects SET payload = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, json, payload_updated_at(payload)],
        )?;
        if affected == 0 {
            return Err(DbError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn delete_project(&self, id: &str) -> DbResult<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute("DELETE FROM projects WHERE id = ?1", [id])?;
        if affected == 0 {
            return Err(DbError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Replace the whole projects table with `projects` in one transaction
    ///
    /// Nothing is changed unless every delete, update and insert succeeds.
    pub fn replace_projects(&self, projects: &[(&str, &ProjectPayload)]) -> DbResult<ApplyReport> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let mut report = ApplyReport::default();

        let existing: BTreeSet<String> = {
            let mut stmt = tx.prepare("SELECT id FROM projects")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let ids: BTreeSet<String> = rows.collect::<Result<_, _>>()?;
            ids
        };
        let incoming: BTreeSet<&str> = projects.iter().map(|(id, _)| *id).collect();

        {
            let mut delete = tx.prepare("DELETE FROM projects WHERE id = ?1")?;
            for id in existing.iter().filter(|id| !incoming.contains(id.as_str())) {
                delete.execute([id])?;
                report.deleted += 1;
            }

            let mut update =
                tx.prepare("UPDATE projects SET payload = ?2, updated_at = ?3 WHERE id = ?1")?;
            let mut insert =
                tx.prepare("INSERT INTO projects (id, payload, updated_at) VALUES (?1, ?2, ?3)")?;
            for (id, payload) in projects {
                let json = encode_payload(payload)?;
                let updated_at = payload_updated_at(payload);
                if existing.contains(*id) {
                    update.execute(params![id, json, updated_at])?;
                    report.updated += 1;
                } else {
                    match insert.execute(params![id, json, updated_at]) {
                        Ok(_) => report.created += 1,
                        Err(rusqlite::Error::SqliteFailure(e, _))
                            if e.code == ErrorCode::ConstraintViolation =>
                        {
                            return Err(DbError::Constraint(id.to_string()));
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        tx.commit()?;
        Ok(report)
    }

    pub fn count_projects(&self) -> DbResult<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM projects", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn parse_payload(json: &str) -> DbResult<ProjectPayload> {
    serde_json::from_str(json).map_err(|e| DbError::Serialization(e.to_string()))
}

fn encode_payload(payload: &ProjectPayload) -> DbResult<String> {
    serde_json::to_string(payload).map_err(|e| DbError::Serialization(e.to_string()))
}

fn payload_updated_at(payload: &ProjectPayload) -> Option<i64> {
    payload.get("updatedAt").and_then(|v| v.as_i64())
}

// =========================================================================
// Engine collaborators
// =========================================================================

impl KeyValueStore for Database {
    fn get(&self, key: &str) -> Result<Option<String>, DatasetError> {
        Ok(self.get_setting::<String>(key)?)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), DatasetError> {
        Ok(self.set_setting(key, &value)?)
    }

    fn remove(&self, key: &str) -> Result<(), DatasetError> {
        Ok(self.remove_setting(key)?)
    }
}

impl ProjectStore for Database {
    fn list_projects(&self) -> Result<Vec<ProjectMeta>, DatasetError> {
        Ok(self
            .get_projects()?
            .iter()
            .map(|(id, payload)| meta_for(id, payload))
            .collect())
    }

    fn get_project(&self, id: &str) -> Result<Option<ProjectPayload>, DatasetError> {
        Ok(Database::get_project(self, id)?)
    }

    fn create_project(&self, id: &str, payload: &ProjectPayload) -> Result<(), DatasetError> {
        Ok(self.insert_project(id, payload)?)
    }

    fn update_project(&self, id: &str, payload: &ProjectPayload) -> Result<(), DatasetError> {
        Ok(Database::update_project(self, id, payload)?)
    }

    fn delete_project(&self, id: &str) -> Result<(), DatasetError> {
        Ok(Database::delete_project(self, id)?)
    }

    fn replace_all(
        &self,
        projects: &[(&str, &ProjectPayload)],
    ) -> Result<Option<ApplyReport>, DatasetError> {
        Ok(Some(self.replace_projects(projects)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::device::{get_or_create_device_id, DEVICE_ID_KEY};
    use crate::sync::models::Snapshot;
    use crate::sync::snapshot::{apply_snapshot, local_watermark, SnapshotCodec};
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_settings() {
        let db = Database::in_memory().expect("Failed to create database");

        let missing: Option<String> = db.get_setting("theme").expect("Failed to get setting");
        assert_eq!(missing, None);

        db.set_setting("custom_key", &"custom_value")
            .expect("Failed to set setting");
        let value: Option<String> = db.get_setting("custom_key").expect("Failed to get setting");
        assert_eq!(value, Some("custom_value".to_string()));

        db.set_setting("custom_key", &"replaced").unwrap();
        let value: Option<String> = db.get_setting("custom_key").unwrap();
        assert_eq!(value, Some("replaced".to_string()));
    }

    #[test]
    fn test_key_value_store() {
        let db = Database::in_memory().unwrap();
        let store: &dyn KeyValueStore = &db;

        store.set("ac:kdf", r#"{"algorithm":"PBKDF2"}"#).unwrap();
        assert_eq!(
            store.get("ac:kdf").unwrap().as_deref(),
            Some(r#"{"algorithm":"PBKDF2"}"#)
        );

        store.remove("ac:kdf").unwrap();
        assert_eq!(store.get("ac:kdf").unwrap(), None);
    }

    #[test]
    fn test_project_crud() {
        let db = Database::in_memory().unwrap();
        let store: &dyn ProjectStore = &db;

        store
            .create_project("b", &json!({ "name": "Wedding", "updatedAt": 20 }))
            .unwrap();
        store.create_project("a", &json!({ "title": "Gala" })).unwrap();

        let metas = store.list_projects().unwrap();
        let ids: Vec<&str> = metas.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(metas[1].updated_at(), Some(20));

        assert!(matches!(
            store.create_project("a", &json!({})),
            Err(DatasetError::AlreadyExists(_))
        ));

        store.update_project("a", &json!({ "title": "Gala 2" })).unwrap();
        assert_eq!(store.get_project("a").unwrap().unwrap()["title"], "Gala 2");

        assert!(matches!(
            store.update_project("zz", &json!({})),
            Err(DatasetError::NotFound(_))
        ));

        store.delete_project("a").unwrap();
        assert_eq!(store.get_project("a").unwrap(), None);
        assert!(matches!(store.delete_project("a"), Err(DatasetError::NotFound(_))));
        assert_eq!(db.count_projects().unwrap(), 1);
    }

    #[test]
    fn test_file_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DB_FILE_NAME);

        let first_id = {
            let db = Database::new(path.clone()).expect("Failed to open database");
            db.insert_project("p1", &json!({ "name": "Party", "updatedAt": 42 }))
                .unwrap();
            get_or_create_device_id(&db)
        };

        let db = Database::new(path).expect("Failed to reopen database");
        assert_eq!(get_or_create_device_id(&db), first_id);
        assert_eq!(
            db.get_setting::<String>(DEVICE_ID_KEY).unwrap(),
            Some(first_id)
        );
        assert_eq!(local_watermark(&db).unwrap(), 42);
    }

    #[test]
    fn test_apply_snapshot_replaces_table() {
        let db = Database::in_memory().unwrap();
        db.insert_project("A", &json!({ "v": 1 })).unwrap();
        db.insert_project("C", &json!({ "v": 3 })).unwrap();

        let remote = crate::sync::dataset::MemoryProjectStore::with_projects(vec![
            ("A".to_string(), json!({ "v": 10 })),
            ("B".to_string(), json!({ "v": 2 })),
        ]);
        let snapshot: Snapshot = SnapshotCodec::default()
            .build_snapshot(&remote, "dev_remote", 1_000)
            .unwrap();

        let report = apply_snapshot(&snapshot, &db).unwrap();
        assert_eq!((report.created, report.updated, report.deleted), (1, 1, 1));

        let projects: BTreeMap<String, ProjectPayload> =
            db.get_projects().unwrap().into_iter().collect();
        assert_eq!(projects.len(), 2);
        assert_eq!(projects["A"], json!({ "v": 10 }));
        assert!(!projects.contains_key("C"));
    }

    #[test]
    fn test_failed_replace_leaves_table_untouched() {
        let db = Database::in_memory().unwrap();
        db.insert_project("A", &json!({ "v": 1 })).unwrap();
        db.insert_project("B", &json!({ "v": 2 })).unwrap();

        // The second "N" insert fails after A was updated and B deleted
        let a = json!({ "v": 10 });
        let n = json!({ "v": 3 });
        let result = db.replace_projects(&[("A", &a), ("N", &n), ("N", &n)]);
        assert!(matches!(result, Err(DbError::Constraint(id)) if id == "N"));

        let projects: BTreeMap<String, ProjectPayload> =
            db.get_projects().unwrap().into_iter().collect();
        assert_eq!(projects.len(), 2);
        assert_eq!(projects["A"], json!({ "v": 1 }));
        assert_eq!(projects["B"], json!({ "v": 2 }));

        let report = db.replace_projects(&[("A", &a), ("N", &n)]).unwrap();
        assert_eq!((report.created, report.updated, report.deleted), (1, 1, 1));
        assert_eq!(db.count_projects().unwrap(), 2);
    }

    #[test]
    fn test_wal_mode_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join(DB_FILE_NAME)).unwrap();
        let conn = db.get_conn().unwrap();

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .expect("Failed to query journal mode");
        assert_eq!(journal_mode, "wal");
    }
}
