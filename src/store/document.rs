//! Document backend: collections of JSON documents held in memory.
//!
//! With persistence enabled every write snapshots the whole store to a JSON
//! file (temp file + rename) and the snapshot is loaded again on open. The
//! same type doubles as the local cache behind [`super::FallbackStore`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Collection, Filter, RowMeta, Store};
use crate::error::{AppError, AppResult};

#[derive(Debug, Default, Serialize, Deserialize)]
struct DocumentState {
    #[serde(default)]
    collections: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default)]
    codes: BTreeMap<String, i64>,
}

pub struct DocumentStore {
    state: Mutex<DocumentState>,
    snapshot_path: Option<PathBuf>,
}

impl DocumentStore {
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(DocumentState::default()),
            snapshot_path: None,
        }
    }

    /// Open a persistent store, loading the snapshot when it exists.
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let state = if path.exists() {
            let raw = fs::read_to_string(path)?;
            let state: DocumentState = serde_json::from_str(&raw)?;
            info!(
                path = %path.display(),
                collections = state.collections.len(),
                "Loaded document snapshot"
            );
            state
        } else {
            DocumentState::default()
        };
        Ok(Self {
            state: Mutex::new(state),
            snapshot_path: Some(path.to_path_buf()),
        })
    }

    pub fn is_persistent(&self) -> bool {
        self.snapshot_path.is_some()
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, DocumentState>> {
        self.state
            .lock()
            .map_err(|e| AppError::Store(format!("document store lock poisoned: {e}")))
    }

    fn persist(&self, state: &DocumentState) -> AppResult<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(state)?)?;
        fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "Document snapshot written");
        Ok(())
    }

    /// Insert or replace without existence checks (cache mirroring).
    pub fn upsert(&self, collection: Collection, doc: &Value) -> AppResult<()> {
        let meta = RowMeta::from_doc(doc)?;
        let mut state = self.lock()?;
        state
            .collections
            .entry(collection.as_str().to_string())
            .or_default()
            .insert(meta.id, doc.clone());
        self.persist(&state)
    }
}

impl Store for DocumentStore {
    fn backend_name(&self) -> &'static str {
        "document"
    }

    fn insert(&self, collection: Collection, doc: &Value) -> AppResult<()> {
        let meta = RowMeta::from_doc(doc)?;
        let mut state = self.lock()?;
        let docs = state
            .collections
            .entry(collection.as_str().to_string())
            .or_default();
        if docs.contains_key(&meta.id) {
            return Err(AppError::Conflict(format!(
                "{collection} {} already exists",
                meta.id
            )));
        }
        docs.insert(meta.id, doc.clone());
        self.persist(&state)
    }

    fn update(&self, collection: Collection, doc: &Value) -> AppResult<()> {
        let meta = RowMeta::from_doc(doc)?;
        let mut state = self.lock()?;
        let slot = state
            .collections
            .get_mut(collection.as_str())
            .and_then(|docs| docs.get_mut(&meta.id))
            .ok_or_else(|| AppError::not_found(collection.as_str(), meta.id.clone()))?;
        *slot = doc.clone();
        self.persist(&state)
    }

    fn get(&self, collection: Collection, id: &str) -> AppResult<Option<Value>> {
        let state = self.lock()?;
        Ok(state
            .collections
            .get(collection.as_str())
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    fn list(&self, collection: Collection, filter: &Filter) -> AppResult<Vec<Value>> {
        filter.validate_fields()?;
        let state = self.lock()?;
        let docs = state
            .collections
            .get(collection.as_str())
            .map(|docs| docs.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        Ok(filter.apply(docs))
    }

    fn delete(&self, collection: Collection, id: &str) -> AppResult<bool> {
        let mut state = self.lock()?;
        let removed = state
            .collections
            .get_mut(collection.as_str())
            .and_then(|docs| docs.remove(id))
            .is_some();
        if removed {
            if let Err(e) = self.persist(&state) {
                warn!(collection = %collection, id, "snapshot after delete failed: {e}");
                return Err(e);
            }
        }
        Ok(removed)
    }

    fn next_code(&self, collection: Collection) -> AppResult<i64> {
        let mut state = self.lock()?;
        let counter = state
            .codes
            .entry(collection.as_str().to_string())
            .or_insert(0);
        *counter += 1;
        let code = *counter;
        self.persist(&state)?;
        Ok(code)
    }
}
