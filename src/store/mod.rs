//! Storage seam shared by every backend.
//!
//! Records travel as JSON objects keyed by `id`. Each backend maps a
//! [`Collection`] to its own unit of storage (a SQLite table, an in-memory
//! map, a REST resource) and evaluates the same [`Filter`] language.

use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{AppConfig, BackendKind};
use crate::error::{AppError, AppResult};

pub mod document;
pub mod fallback;
pub mod rest;
pub mod sqlite;

pub use document::DocumentStore;
pub use fallback::FallbackStore;
pub use rest::RestStore;
pub use sqlite::SqliteStore;

const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Customers,
    Products,
    Orders,
    OrderItems,
    PaymentTables,
    SalesReps,
    Vehicles,
    DeliveryRoutes,
    MobileOrders,
    MobileOrderItems,
    Visits,
    ImportReports,
}

impl Collection {
    pub const ALL: [Collection; 12] = [
        Collection::Customers,
        Collection::Products,
        Collection::Orders,
        Collection::OrderItems,
        Collection::PaymentTables,
        Collection::SalesReps,
        Collection::Vehicles,
        Collection::DeliveryRoutes,
        Collection::MobileOrders,
        Collection::MobileOrderItems,
        Collection::Visits,
        Collection::ImportReports,
    ];

    /// Table / collection name used by every backend.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customers => "customers",
            Self::Products => "products",
            Self::Orders => "orders",
            Self::OrderItems => "order_items",
            Self::PaymentTables => "payment_tables",
            Self::SalesReps => "sales_reps",
            Self::Vehicles => "vehicles",
            Self::DeliveryRoutes => "delivery_routes",
            Self::MobileOrders => "mobile_orders",
            Self::MobileOrderItems => "mobile_order_items",
            Self::Visits => "visits",
            Self::ImportReports => "import_reports",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == normalized)
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    IsNull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub op: Op,
    pub value: Value,
}

/// Conjunction of field conditions plus optional ordering and limit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub conditions: Vec<Condition>,
    pub order_by: Option<(String, SortDirection)>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, field: &str, op: Op, value: Value) -> Self {
        self.conditions.push(Condition {
            field: field.to_string(),
            op,
            value,
        });
        self
    }

    pub fn eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.push(field, Op::Eq, value.into())
    }

    pub fn ne(self, field: &str, value: impl Into<Value>) -> Self {
        self.push(field, Op::Ne, value.into())
    }

    pub fn gt(self, field: &str, value: impl Into<Value>) -> Self {
        self.push(field, Op::Gt, value.into())
    }

    pub fn gte(self, field: &str, value: impl Into<Value>) -> Self {
        self.push(field, Op::Gte, value.into())
    }

    pub fn lt(self, field: &str, value: impl Into<Value>) -> Self {
        self.push(field, Op::Lt, value.into())
    }

    pub fn lte(self, field: &str, value: impl Into<Value>) -> Self {
        self.push(field, Op::Lte, value.into())
    }

    pub fn is_in(self, field: &str, values: Vec<Value>) -> Self {
        self.push(field, Op::In, Value::Array(values))
    }

    pub fn is_null(self, field: &str) -> Self {
        self.push(field, Op::IsNull, Value::Null)
    }

    pub fn order_by(mut self, field: &str, direction: SortDirection) -> Self {
        self.order_by = Some((field.to_string(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Field names end up inside SQL and query strings, so only plain
    /// identifiers are accepted.
    pub fn validate_fields(&self) -> AppResult<()> {
        let fields = self
            .conditions
            .iter()
            .map(|c| c.field.as_str())
            .chain(self.order_by.iter().map(|(f, _)| f.as_str()));
        for field in fields {
            if !is_plain_identifier(field) {
                return Err(AppError::validation(format!(
                    "invalid filter field: {field:?}"
                )));
            }
        }
        Ok(())
    }

    /// Evaluate the conditions against a document (used by in-process backends).
    pub fn matches(&self, doc: &Value) -> bool {
        self.conditions.iter().all(|c| condition_matches(c, doc))
    }

    /// Filter, sort and truncate a set of documents in memory.
    pub fn apply(&self, docs: impl IntoIterator<Item = Value>) -> Vec<Value> {
        let mut out: Vec<Value> = docs.into_iter().filter(|d| self.matches(d)).collect();
        if let Some((field, direction)) = &self.order_by {
            out.sort_by(|a, b| {
                let ord = compare_optional(a.get(field), b.get(field));
                match direction {
                    SortDirection::Asc => ord,
                    SortDirection::Desc => ord.reverse(),
                }
            });
        }
        if let Some(limit) = self.limit {
            out.truncate(limit);
        }
        out
    }
}

pub(crate) fn is_plain_identifier(field: &str) -> bool {
    !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !field.starts_with(|c: char| c.is_ascii_digit())
}

fn condition_matches(condition: &Condition, doc: &Value) -> bool {
    let actual = doc.get(&condition.field).filter(|v| !v.is_null());
    match condition.op {
        Op::IsNull => actual.is_none(),
        Op::Eq if condition.value.is_null() => actual.is_none(),
        Op::Ne if condition.value.is_null() => actual.is_some(),
        Op::Eq => actual.is_some_and(|v| values_equal(v, &condition.value)),
        Op::Ne => !actual.is_some_and(|v| values_equal(v, &condition.value)),
        Op::In => match (actual, condition.value.as_array()) {
            (Some(v), Some(candidates)) => candidates.iter().any(|c| values_equal(v, c)),
            _ => false,
        },
        Op::Gt | Op::Gte | Op::Lt | Op::Lte => {
            let Some(v) = actual else {
                return false;
            };
            match compare_values(v, &condition.value) {
                Some(ord) => match condition.op {
                    Op::Gt => ord == Ordering::Greater,
                    Op::Gte => ord != Ordering::Less,
                    Op::Lt => ord == Ordering::Less,
                    _ => ord != Ordering::Greater,
                },
                None => false,
            }
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
        _ => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Missing values sort first, like NULLs in SQLite ascending order.
fn compare_optional(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

pub trait Store: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Insert a new document. Fails with `Conflict` if the id already exists.
    fn insert(&self, collection: Collection, doc: &Value) -> AppResult<()>;

    /// Replace an existing document. Fails with `NotFound` if it is missing.
    fn update(&self, collection: Collection, doc: &Value) -> AppResult<()>;

    fn get(&self, collection: Collection, id: &str) -> AppResult<Option<Value>>;

    fn list(&self, collection: Collection, filter: &Filter) -> AppResult<Vec<Value>>;

    /// Hard delete. Returns whether a document was removed.
    fn delete(&self, collection: Collection, id: &str) -> AppResult<bool>;

    /// Next value of the per-collection numeric code sequence (starts at 1).
    fn next_code(&self, collection: Collection) -> AppResult<i64>;

    fn count(&self, collection: Collection, filter: &Filter) -> AppResult<usize> {
        Ok(self.list(collection, filter)?.len())
    }
}

/// Bookkeeping columns pulled out of a document for backends that store them
/// alongside the JSON body.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RowMeta {
    pub id: String,
    pub code: Option<i64>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub deleted_at: Option<String>,
}

impl RowMeta {
    pub fn from_doc(doc: &Value) -> AppResult<Self> {
        let id = doc
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::validation("document is missing an id"))?
            .to_string();
        let text = |key: &str| doc.get(key).and_then(Value::as_str).map(String::from);
        Ok(Self {
            id,
            code: doc.get("code").and_then(Value::as_i64),
            created_at: text("createdAt"),
            updated_at: text("updatedAt"),
            deleted_at: text("deletedAt"),
        })
    }
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// Build the backend selected by the configuration.
///
/// Initialisation is retried once after a short delay; a second failure is
/// returned to the caller.
pub fn open_store(config: &AppConfig) -> AppResult<Arc<dyn Store>> {
    let primary = retry_once(INIT_RETRY_DELAY, || open_backend(config))?;

    if !config.store.local_cache {
        return Ok(primary);
    }

    let cache_path = config.data_dir().join("local-cache.json");
    let cache = DocumentStore::open(&cache_path)?;
    info!(path = %cache_path.display(), "Local read cache enabled");
    Ok(Arc::new(FallbackStore::new(primary, cache)))
}

fn retry_once<T>(delay: Duration, mut attempt: impl FnMut() -> AppResult<T>) -> AppResult<T> {
    match attempt() {
        Ok(value) => Ok(value),
        Err(first_err) => {
            warn!(error = %first_err, "Store initialisation failed, retrying once");
            std::thread::sleep(delay);
            attempt()
        }
    }
}

fn open_backend(config: &AppConfig) -> AppResult<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match config.store.backend {
        BackendKind::Sqlite => Arc::new(SqliteStore::open(&config.data_dir())?),
        BackendKind::Document => {
            if config.store.persist {
                let path = config.data_dir().join("documents.json");
                Arc::new(DocumentStore::open(&path)?)
            } else {
                Arc::new(DocumentStore::in_memory())
            }
        }
        BackendKind::Rest => {
            let (url, key) = config.rest.resolve()?;
            Arc::new(RestStore::new(
                &url,
                &key,
                Duration::from_secs(config.rest.timeout_secs),
            )?)
        }
    };
    info!(backend = store.backend_name(), "Store opened");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docs() -> Vec<Value> {
        vec![
            json!({"id": "a", "code": 3, "name": "Ana", "imported": false}),
            json!({"id": "b", "code": 1, "name": "Bruno", "imported": true, "deletedAt": null}),
            json!({"id": "c", "code": 2, "name": "Carla", "imported": false, "deletedAt": "2026-01-01T00:00:00.000Z"}),
        ]
    }

    fn ids(docs: &[Value]) -> Vec<&str> {
        docs.iter().filter_map(|d| d["id"].as_str()).collect()
    }

    #[test]
    fn test_collection_parse_round_trips_names() {
        for collection in Collection::ALL {
            assert_eq!(Collection::parse(collection.as_str()), Some(collection));
        }
        assert_eq!(
            Collection::parse("Mobile-Orders"),
            Some(Collection::MobileOrders)
        );
        assert_eq!(Collection::parse("widgets"), None);
    }

    #[test]
    fn test_filter_eq_and_is_null() {
        let filter = Filter::new().eq("imported", false).is_null("deletedAt");
        assert_eq!(ids(&filter.apply(docs())), vec!["a"]);
    }

    #[test]
    fn test_filter_in_and_numeric_comparison() {
        let filter = Filter::new()
            .is_in("id", vec![json!("a"), json!("c")])
            .gte("code", 3);
        assert_eq!(ids(&filter.apply(docs())), vec!["a"]);

        let none = Filter::new().is_in("id", vec![]);
        assert!(none.apply(docs()).is_empty());
    }

    #[test]
    fn test_filter_order_and_limit() {
        let filter = Filter::new()
            .order_by("code", SortDirection::Desc)
            .limit(2);
        assert_eq!(ids(&filter.apply(docs())), vec!["a", "c"]);
    }

    #[test]
    fn test_filter_ne_treats_missing_as_different() {
        let filter = Filter::new().ne("name", "Ana");
        assert_eq!(ids(&filter.apply(docs())), vec!["b", "c"]);
    }

    #[test]
    fn test_validate_fields_rejects_sql_fragments() {
        assert!(Filter::new().eq("customerId", "x").validate_fields().is_ok());
        assert!(Filter::new()
            .eq("id') OR 1=1 --", "x")
            .validate_fields()
            .is_err());
        assert!(Filter::new()
            .order_by("code desc", SortDirection::Asc)
            .validate_fields()
            .is_err());
    }

    #[test]
    fn test_row_meta_requires_id() {
        assert!(RowMeta::from_doc(&json!({"name": "x"})).is_err());
        let meta = RowMeta::from_doc(&json!({"id": "a", "code": 7, "createdAt": "t"})).unwrap();
        assert_eq!(meta.code, Some(7));
        assert_eq!(meta.created_at.as_deref(), Some("t"));
        assert!(meta.deleted_at.is_none());
    }

    #[test]
    fn test_retry_once_makes_exactly_two_attempts() {
        let mut attempts = 0;
        let result: AppResult<()> = retry_once(Duration::from_millis(1), || {
            attempts += 1;
            Err(AppError::Store("locked".into()))
        });
        assert!(result.is_err());
        assert_eq!(attempts, 2);

        let mut attempts = 0;
        let value = retry_once(Duration::from_millis(1), || {
            attempts += 1;
            if attempts == 1 {
                Err(AppError::Store("busy".into()))
            } else {
                Ok(attempts)
            }
        })
        .unwrap();
        assert_eq!(value, 2);
    }

    #[test]
    fn test_open_store_document_without_persistence() {
        let mut config = AppConfig::default();
        config.store.backend = BackendKind::Document;
        config.store.persist = false;
        let store = open_store(&config).expect("open document store");
        assert_eq!(store.backend_name(), "document");
    }

    #[test]
    fn test_open_store_sqlite_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.store.data_dir = Some(dir.path().to_path_buf());
        let store = open_store(&config).expect("open sqlite store");
        assert_eq!(store.backend_name(), "sqlite");
        assert!(dir.path().join("sales.db").exists());
    }
}
