//! Dataset Collaborators
//!
//! The engine never owns the project data. It reads and replaces it through the
//! host's store, and keeps its own small bits of state (device id, KDF
//! parameters) in a key-value store:
//! - ProjectStore: list/get/create/update/delete of opaque project records
//! - KeyValueStore: durable string settings
//!
//! Both are called synchronously from the engine's execution context.
//! In-memory implementations are provided for tests and embedding; the SQLite
//! implementations live in `crate::db`.

use super::models::{ProjectMeta, ProjectPayload};
use super::snapshot::ApplyReport;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Host application's project store
pub trait ProjectStore: Send + Sync {
    fn list_projects(&self) -> Result<Vec<ProjectMeta>, DatasetError>;
    fn get_project(&self, id: &str) -> Result<Option<ProjectPayload>, DatasetError>;
    fn create_project(&self, id: &str, payload: &ProjectPayload) -> Result<(), DatasetError>;
    fn update_project(&self, id: &str, payload: &ProjectPayload) -> Result<(), DatasetError>;
    fn delete_project(&self, id: &str) -> Result<(), DatasetError>;

    /// Replace every record with `projects` as one atomic step
    ///
    /// `Ok(None)` means the store has no such step and the caller goes
    /// record by record.
    fn replace_all(
        &self,
        _projects: &[(&str, &ProjectPayload)],
    ) -> Result<Option<ApplyReport>, DatasetError> {
        Ok(None)
    }
}

/// Durable string settings
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, DatasetError>;
    fn set(&self, key: &str, value: &str) -> Result<(), DatasetError>;
    fn remove(&self, key: &str) -> Result<(), DatasetError>;
}

/// Listing entry derived from a payload: id plus `name`/`title`/`updatedAt` when present
pub fn meta_for(id: &str, payload: &ProjectPayload) -> ProjectMeta {
    let mut meta = ProjectMeta::new(id);
    if let Some(object) = payload.as_object() {
        for key in ["name", "title", "updatedAt"] {
            if let Some(value) = object.get(key) {
                meta.extra.insert(key.to_string(), value.clone());
            }
        }
    }
    meta
}

// ============================================================================
// In-Memory Implementations
// ============================================================================

/// Project store held in memory, ordered by id
#[derive(Default)]
pub struct MemoryProjectStore {
    projects: RwLock<BTreeMap<String, ProjectPayload>>,
}

impl MemoryProjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_projects<I>(projects: I) -> Self
    where
        I: IntoIterator<Item = (String, ProjectPayload)>,
    {
        Self {
            projects: RwLock::new(projects.into_iter().collect()),
        }
    }

    pub fn ids(&self) -> Vec<String> {
        let projects = self.projects.read().unwrap_or_else(|e| e.into_inner());
        projects.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.projects.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProjectStore for MemoryProjectStore {
    fn list_projects(&self) -> Result<Vec<ProjectMeta>, DatasetError> {
        let projects = self.projects.read().unwrap_or_else(|e| e.into_inner());
        Ok(projects
            .iter()
            .map(|(id, payload)| meta_for(id, payload))
            .collect())
    }

    fn get_project(&self, id: &str) -> Result<Option<ProjectPayload>, DatasetError> {
        let projects = self.projects.read().unwrap_or_else(|e| e.into_inner());
        Ok(projects.get(id).cloned())
    }

    fn create_project(&self, id: &str, payload: &ProjectPayload) -> Result<(), DatasetError> {
        let mut projects = self.projects.write().unwrap_or_else(|e| e.into_inner());
        if projects.contains_key(id) {
            return Err(DatasetError::AlreadyExists(id.to_string()));
        }
        projects.insert(id.to_string(), payload.clone());
        Ok(())
    }

    fn update_project(&self, id: &str, payload: &ProjectPayload) -> Result<(), DatasetError> {
        let mut projects = self.projects.write().unwrap_or_else(|e| e.into_inner());
        match projects.get_mut(id) {
            Some(existing) => {
                *existing = payload.clone();
                Ok(())
            }
            None => Err(DatasetError::NotFound(id.to_string())),
        }
    }

    fn delete_project(&self, id: &str) -> Result<(), DatasetError> {
        let mut projects = self.projects.write().unwrap_or_else(|e| e.into_inner());
        projects
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| DatasetError::NotFound(id.to_string()))
    }

    fn replace_all(
        &self,
        incoming: &[(&str, &ProjectPayload)],
    ) -> Result<Option<ApplyReport>, DatasetError> {
        let mut projects = self.projects.write().unwrap_or_else(|e| e.into_inner());
        let mut report = ApplyReport::default();

        let mut replacement = BTreeMap::new();
        for (id, payload) in incoming {
            if replacement.insert(id.to_string(), (*payload).clone()).is_some() {
                return Err(DatasetError::AlreadyExists(id.to_string()));
            }
            if projects.contains_key(*id) {
                report.updated += 1;
            } else {
                report.created += 1;
            }
        }
        let kept: BTreeSet<&str> = incoming.iter().map(|(id, _)| *id).collect();
        report.deleted = projects.keys().filter(|id| !kept.contains(id.as_str())).count();

        *projects = replacement;
        Ok(Some(report))
    }
}

/// Settings held in memory; `unavailable()` simulates storage that always fails
#[derive(Default)]
pub struct MemoryKeyValueStore {
    values: Mutex<HashMap<String, String>>,
    unavailable: bool,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unavailable() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            unavailable: true,
        }
    }

    fn check(&self) -> Result<(), DatasetError> {
        if self.unavailable {
            return Err(DatasetError::Unavailable("storage disabled".to_string()));
        }
        Ok(())
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, DatasetError> {
        self.check()?;
        let values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), DatasetError> {
        self.check()?;
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), DatasetError> {
        self.check()?;
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.remove(key);
        Ok(())
    }
}
