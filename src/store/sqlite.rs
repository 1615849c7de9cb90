//! SQLite relational backend.
//!
//! Uses rusqlite with WAL mode. Every collection gets its own table holding
//! the bookkeeping columns next to the JSON body; filters compile to
//! `json_extract` predicates. Numeric codes come from the `entity_codes`
//! counter table.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use super::{Collection, Filter, Op, RowMeta, SortDirection, Store};
use crate::error::{AppError, AppResult};

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

const DB_FILE_NAME: &str = "sales.db";

pub struct SqliteStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the database at `{data_dir}/sales.db`.
    ///
    /// Creates the directory if needed, sets pragmas and runs pending
    /// migrations. The file is never removed on failure; retrying is left to
    /// [`super::open_store`].
    pub fn open(data_dir: &Path) -> AppResult<Self> {
        fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join(DB_FILE_NAME);
        info!("Opening database at {}", db_path.display());

        let conn = open_and_configure(&db_path)?;

        run_migrations(&conn)?;
        info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    pub fn open_in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| AppError::Store(format!("connection lock poisoned: {e}")))
    }

    pub fn schema_version(&self) -> AppResult<i32> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?)
    }
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> AppResult<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

// ---------------------------------------------------------------------------
// Migrations
// ---------------------------------------------------------------------------

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: code sequences.
fn migrate_v1(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS entity_codes (
            collection TEXT PRIMARY KEY,
            last_code INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        AppError::Store(format!("migration v1: {e}"))
    })?;

    info!("Applied migration v1 (entity_codes table)");
    Ok(())
}

/// Migration v2: one table per collection.
fn migrate_v2(conn: &Connection) -> AppResult<()> {
    let mut sql = String::new();
    for collection in Collection::ALL {
        sql.push_str(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                code INTEGER,
                data TEXT NOT NULL,
                created_at TEXT,
                updated_at TEXT,
                deleted_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_code ON {table}(code);
            ",
            table = collection.as_str()
        ));
    }
    sql.push_str("INSERT INTO schema_version (version) VALUES (2);");

    conn.execute_batch(&sql).map_err(|e| {
        error!("Migration v2 failed: {e}");
        AppError::Store(format!("migration v2: {e}"))
    })?;

    info!("Applied migration v2 (collection tables)");
    Ok(())
}

/// Migration v3: expression indexes for the import lookups.
fn migrate_v3(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_mobile_orders_imported
            ON mobile_orders(json_extract(data, '$.imported'));
        CREATE INDEX IF NOT EXISTS idx_mobile_order_items_order
            ON mobile_order_items(json_extract(data, '$.mobileOrderId'));
        CREATE INDEX IF NOT EXISTS idx_orders_source_mobile
            ON orders(json_extract(data, '$.sourceMobileOrderId'));
        CREATE INDEX IF NOT EXISTS idx_visits_source_mobile
            ON visits(json_extract(data, '$.sourceMobileOrderId'));
        CREATE INDEX IF NOT EXISTS idx_order_items_order
            ON order_items(json_extract(data, '$.orderId'));

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        AppError::Store(format!("migration v3: {e}"))
    })?;

    info!("Applied migration v3 (import lookup indexes)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Filter compilation
// ---------------------------------------------------------------------------

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Compile a filter into a `WHERE ... ORDER BY ... LIMIT ...` suffix.
fn compile_filter(filter: &Filter) -> AppResult<(String, Vec<SqlValue>)> {
    filter.validate_fields()?;

    let mut clauses = Vec::new();
    let mut args = Vec::new();
    for condition in &filter.conditions {
        let column = format!("json_extract(data, '$.{}')", condition.field);
        let clause = match condition.op {
            Op::IsNull => format!("{column} IS NULL"),
            Op::Eq if condition.value.is_null() => format!("{column} IS NULL"),
            Op::Ne if condition.value.is_null() => format!("{column} IS NOT NULL"),
            Op::In => {
                let candidates = condition.value.as_array().cloned().unwrap_or_default();
                if candidates.is_empty() {
                    "0".to_string()
                } else {
                    let marks = vec!["?"; candidates.len()].join(", ");
                    args.extend(candidates.iter().map(to_sql_value));
                    format!("{column} IN ({marks})")
                }
            }
            Op::Ne => {
                args.push(to_sql_value(&condition.value));
                format!("({column} IS NULL OR {column} <> ?)")
            }
            op => {
                let symbol = match op {
                    Op::Eq => "=",
                    Op::Gt => ">",
                    Op::Gte => ">=",
                    Op::Lt => "<",
                    _ => "<=",
                };
                args.push(to_sql_value(&condition.value));
                format!("{column} {symbol} ?")
            }
        };
        clauses.push(clause);
    }

    let mut sql = String::new();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    match &filter.order_by {
        Some((field, direction)) => {
            let dir = match direction {
                SortDirection::Asc => "ASC",
                SortDirection::Desc => "DESC",
            };
            sql.push_str(&format!(" ORDER BY json_extract(data, '$.{field}') {dir}"));
        }
        None => sql.push_str(" ORDER BY rowid ASC"),
    }
    if let Some(limit) = filter.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    Ok((sql, args))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

// ---------------------------------------------------------------------------
// Store implementation
// ---------------------------------------------------------------------------

impl Store for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn insert(&self, collection: Collection, doc: &Value) -> AppResult<()> {
        let meta = RowMeta::from_doc(doc)?;
        let body = serde_json::to_string(doc)?;
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO {} (id, code, data, created_at, updated_at, deleted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                collection.as_str()
            ),
            params![
                meta.id,
                meta.code,
                body,
                meta.created_at,
                meta.updated_at,
                meta.deleted_at
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                AppError::Conflict(format!("{collection} {} already exists", meta.id))
            } else {
                AppError::Store(format!("insert {collection}: {e}"))
            }
        })?;
        Ok(())
    }

    fn update(&self, collection: Collection, doc: &Value) -> AppResult<()> {
        let meta = RowMeta::from_doc(doc)?;
        let body = serde_json::to_string(doc)?;
        let conn = self.lock()?;
        let changed = conn
            .execute(
                &format!(
                    "UPDATE {} SET code = ?2, data = ?3, created_at = ?4,
                        updated_at = ?5, deleted_at = ?6
                     WHERE id = ?1",
                    collection.as_str()
                ),
                params![
                    meta.id,
                    meta.code,
                    body,
                    meta.created_at,
                    meta.updated_at,
                    meta.deleted_at
                ],
            )
            .map_err(|e| AppError::Store(format!("update {collection}: {e}")))?;
        if changed == 0 {
            return Err(AppError::not_found(collection.as_str(), meta.id));
        }
        Ok(())
    }

    fn get(&self, collection: Collection, id: &str) -> AppResult<Option<Value>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                &format!("SELECT data FROM {} WHERE id = ?1", collection.as_str()),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|body| serde_json::from_str(&body).map_err(AppError::from))
            .transpose()
    }

    fn list(&self, collection: Collection, filter: &Filter) -> AppResult<Vec<Value>> {
        let (suffix, args) = compile_filter(filter)?;
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT data FROM {}{suffix}",
            collection.as_str()
        ))?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            row.get::<_, String>(0)
        })?;

        let mut docs = Vec::new();
        for row in rows {
            match row {
                Ok(body) => match serde_json::from_str(&body) {
                    Ok(doc) => docs.push(doc),
                    Err(e) => warn!(collection = %collection, "skipping malformed row: {e}"),
                },
                Err(e) => warn!(collection = %collection, "skipping unreadable row: {e}"),
            }
        }
        Ok(docs)
    }

    fn delete(&self, collection: Collection, id: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let removed = conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", collection.as_str()),
            params![id],
        )?;
        Ok(removed > 0)
    }

    fn next_code(&self, collection: Collection) -> AppResult<i64> {
        let conn = self.lock()?;
        let code = conn.query_row(
            "INSERT INTO entity_codes (collection, last_code, updated_at)
             VALUES (?1, 1, datetime('now'))
             ON CONFLICT(collection) DO UPDATE SET
                last_code = last_code + 1,
                updated_at = excluded.updated_at
             RETURNING last_code",
            params![collection.as_str()],
            |row| row.get(0),
        )?;
        Ok(code)
    }

    fn count(&self, collection: Collection, filter: &Filter) -> AppResult<usize> {
        if filter.limit.is_some() {
            return Ok(self.list(collection, filter)?.len());
        }
        let (suffix, args) = compile_filter(filter)?;
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}{suffix}", collection.as_str()),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
