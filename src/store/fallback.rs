//! Local cache fallback around a primary store.
//!
//! Reads fail open: when the primary backend errors, whatever the local
//! cache holds is served instead. Writes are mirrored into the cache; a write
//! the primary rejects is still applied locally and the error is re-thrown.

use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use super::{Collection, DocumentStore, Filter, Store};
use crate::error::AppResult;

pub struct FallbackStore {
    primary: Arc<dyn Store>,
    cache: DocumentStore,
}

impl FallbackStore {
    pub fn new(primary: Arc<dyn Store>, cache: DocumentStore) -> Self {
        Self { primary, cache }
    }

    pub fn cache(&self) -> &DocumentStore {
        &self.cache
    }

    fn mirror(&self, collection: Collection, doc: &Value) {
        if let Err(e) = self.cache.upsert(collection, doc) {
            warn!(collection = %collection, "local cache write failed: {e}");
        }
    }
}

impl Store for FallbackStore {
    fn backend_name(&self) -> &'static str {
        self.primary.backend_name()
    }

    fn insert(&self, collection: Collection, doc: &Value) -> AppResult<()> {
        let result = self.primary.insert(collection, doc);
        if let Err(ref e) = result {
            warn!(collection = %collection, error = %e, "insert failed, keeping local copy");
        }
        self.mirror(collection, doc);
        result
    }

    fn update(&self, collection: Collection, doc: &Value) -> AppResult<()> {
        let result = self.primary.update(collection, doc);
        if let Err(ref e) = result {
            warn!(collection = %collection, error = %e, "update failed, keeping local copy");
        }
        self.mirror(collection, doc);
        result
    }

    fn get(&self, collection: Collection, id: &str) -> AppResult<Option<Value>> {
        match self.primary.get(collection, id) {
            Ok(Some(doc)) => {
                self.mirror(collection, &doc);
                Ok(Some(doc))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(collection = %collection, id, error = %e, "read failed, serving local cache");
                Ok(self.cache.get(collection, id).unwrap_or(None))
            }
        }
    }

    fn list(&self, collection: Collection, filter: &Filter) -> AppResult<Vec<Value>> {
        match self.primary.list(collection, filter) {
            Ok(docs) => {
                for doc in &docs {
                    self.mirror(collection, doc);
                }
                Ok(docs)
            }
            Err(e) => {
                warn!(collection = %collection, error = %e, "list failed, serving local cache");
                Ok(self.cache.list(collection, filter).unwrap_or_default())
            }
        }
    }

    fn delete(&self, collection: Collection, id: &str) -> AppResult<bool> {
        let result = self.primary.delete(collection, id);
        if let Err(ref e) = result {
            warn!(collection = %collection, id, error = %e, "delete failed, removing local copy");
        }
        if let Err(e) = self.cache.delete(collection, id) {
            warn!(collection = %collection, "local cache delete failed: {e}");
        }
        result
    }

    fn next_code(&self, collection: Collection) -> AppResult<i64> {
        self.primary.next_code(collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Primary store that can be switched offline.
    struct FlakyStore {
        inner: DocumentStore,
        offline: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: DocumentStore::in_memory(),
                offline: AtomicBool::new(false),
            }
        }

        fn check(&self) -> AppResult<()> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(AppError::Http("service unreachable".into()));
            }
            Ok(())
        }
    }

    impl Store for FlakyStore {
        fn backend_name(&self) -> &'static str {
            "flaky"
        }
        fn insert(&self, c: Collection, doc: &Value) -> AppResult<()> {
            self.check()?;
            self.inner.insert(c, doc)
        }
        fn update(&self, c: Collection, doc: &Value) -> AppResult<()> {
            self.check()?;
            self.inner.update(c, doc)
        }
        fn get(&self, c: Collection, id: &str) -> AppResult<Option<Value>> {
            self.check()?;
            self.inner.get(c, id)
        }
        fn list(&self, c: Collection, f: &Filter) -> AppResult<Vec<Value>> {
            self.check()?;
            self.inner.list(c, f)
        }
        fn delete(&self, c: Collection, id: &str) -> AppResult<bool> {
            self.check()?;
            self.inner.delete(c, id)
        }
        fn next_code(&self, c: Collection) -> AppResult<i64> {
            self.check()?;
            self.inner.next_code(c)
        }
    }

    #[test]
    fn test_reads_fail_open_to_cache() {
        let primary = Arc::new(FlakyStore::new());
        let store = FallbackStore::new(primary.clone(), DocumentStore::in_memory());

        store
            .insert(Collection::Customers, &json!({"id": "c-1", "name": "Ana"}))
            .unwrap();
        assert_eq!(store.list(Collection::Customers, &Filter::new()).unwrap().len(), 1);

        primary.offline.store(true, Ordering::SeqCst);
        let cached = store.get(Collection::Customers, "c-1").unwrap();
        assert_eq!(cached.unwrap()["name"], "Ana");
        assert_eq!(store.list(Collection::Customers, &Filter::new()).unwrap().len(), 1);
        assert!(store.get(Collection::Customers, "c-404").unwrap().is_none());
        assert!(store.list(Collection::Products, &Filter::new()).unwrap().is_empty());
    }

    #[test]
    fn test_failed_write_is_cached_and_rethrown() {
        let primary = Arc::new(FlakyStore::new());
        primary.offline.store(true, Ordering::SeqCst);
        let store = FallbackStore::new(primary.clone(), DocumentStore::in_memory());

        let err = store
            .insert(Collection::Products, &json!({"id": "p-1", "price": 2.0}))
            .unwrap_err();
        assert!(matches!(err, AppError::Http(_)));
        assert!(store.cache().get(Collection::Products, "p-1").unwrap().is_some());

        primary.offline.store(false, Ordering::SeqCst);
        assert!(store.get(Collection::Products, "p-1").unwrap().is_none());
        assert!(store.next_code(Collection::Products).is_ok());
    }
}
