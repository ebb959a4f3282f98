//! SQL index: a rebuildable mirror of the metadata log.
//!
//! One master table, `sak_tasks`, holds a row per fingerprint with status,
//! timestamps and the log content hash last mirrored. Each namespace owns a
//! satellite table keyed by the same fingerprint, with one typed column per
//! declared parameter.
//!
//! Sessions are thread-scoped: every thread gets its own connection per
//! database file, opened lazily and reused until the factory is reset.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::hasher;
use crate::log::record::{format_time, parse_time, TaskRecord, TaskStatus};

/// Master table name.
pub const MASTER_TABLE: &str = "sak_tasks";

/// Primary key column shared by master and satellite tables.
pub const KEY_COLUMN: &str = "key_hash";

const MASTER_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sak_tasks (
    key_hash      TEXT PRIMARY KEY NOT NULL,
    namespace     TEXT NOT NULL,
    status        TEXT NOT NULL,
    start_time    TEXT,
    end_time      TEXT,
    metadata_hash TEXT,
    last_changed  TEXT
);
CREATE INDEX IF NOT EXISTS sak_tasks_namespace ON sak_tasks (namespace, status);
";

const MASTER_COLUMNS: &str =
    "key_hash, namespace, status, start_time, end_time, metadata_hash, last_changed";

thread_local! {
    static SESSIONS: RefCell<HashMap<PathBuf, (u64, Connection)>> = RefCell::new(HashMap::new());
}

static GENERATION: AtomicU64 = AtomicU64::new(1);

/// Thread-scoped connection factory for one index file.
#[derive(Debug)]
pub struct SessionFactory {
    path: PathBuf,
    busy_timeout: Duration,
    generation: AtomicU64,
}

impl SessionFactory {
    pub fn new(path: impl Into<PathBuf>, busy_timeout_ms: u64) -> Self {
        Self {
            path: path.into(),
            busy_timeout: Duration::from_millis(busy_timeout_ms),
            generation: AtomicU64::new(GENERATION.fetch_add(1, Ordering::SeqCst)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(MASTER_SCHEMA)?;
        debug!(path = %self.path.display(), "opened index session");
        Ok(conn)
    }

    /// Run `f` with this thread's session, opening it if needed.
    pub fn with_session<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let generation = self.generation.load(Ordering::SeqCst);
        let cached = SESSIONS.with(|sessions| sessions.borrow_mut().remove(&self.path));
        let mut conn = match cached {
            Some((cached_generation, conn)) if cached_generation == generation => conn,
            _ => self.open()?,
        };

        let result = f(&mut conn);

        SESSIONS.with(|sessions| {
            sessions
                .borrow_mut()
                .insert(self.path.clone(), (generation, conn));
        });
        result
    }

    /// Run `f` inside one transaction; committed only if `f` succeeds.
    pub fn transaction<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        self.with_session(|conn| {
            let tx = conn.transaction()?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    /// `PRAGMA quick_check` passes. A file that cannot be opened fails.
    pub fn quick_check(&self) -> Result<bool> {
        let outcome = self.with_session(|conn| {
            let verdict: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
            Ok(verdict)
        });
        match outcome {
            Ok(verdict) => Ok(verdict.eq_ignore_ascii_case("ok")),
            Err(Error::Sql(err)) => {
                debug!(error = %err, "index failed integrity check");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Delete the index file. Sessions on every thread are invalidated.
    pub fn remove(&self) -> Result<()> {
        self.generation
            .store(GENERATION.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
        SESSIONS.with(|sessions| {
            sessions.borrow_mut().remove(&self.path);
        });
        for suffix in ["", "-wal", "-shm"] {
            let mut name = self.path.clone().into_os_string();
            name.push(suffix);
            let path = PathBuf::from(name);
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// SQL storage class of a parameter column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Real,
    Boolean,
    Text,
    /// Any structured value, stored as canonical JSON text.
    Json,
}

impl ColumnType {
    fn sql(&self) -> &'static str {
        match self {
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text | ColumnType::Json => "TEXT",
        }
    }

    fn to_sql(self, column: &str, value: &Value) -> Result<SqlValue> {
        let mismatch = || {
            Error::InvalidArgument(format!(
                "column '{column}' expects {:?}, got {}",
                self,
                hasher::json_kind(value)
            ))
        };
        if value.is_null() {
            return Ok(SqlValue::Null);
        }
        let converted = match self {
            ColumnType::Integer => match value {
                Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
                _ => SqlValue::Integer(value.as_i64().ok_or_else(mismatch)?),
            },
            ColumnType::Real => SqlValue::Real(value.as_f64().ok_or_else(mismatch)?),
            ColumnType::Boolean => SqlValue::Integer(i64::from(value.as_bool().ok_or_else(mismatch)?)),
            ColumnType::Text => match value {
                Value::String(text) => SqlValue::Text(text.clone()),
                Value::Number(number) => SqlValue::Text(number.to_string()),
                Value::Bool(flag) => SqlValue::Text(flag.to_string()),
                _ => return Err(mismatch()),
            },
            ColumnType::Json => SqlValue::Text(
                String::from_utf8(hasher::canonical_bytes(value))
                    .map_err(|err| Error::InvalidArgument(err.to_string()))?,
            ),
        };
        Ok(converted)
    }

    fn from_sql(self, raw: ValueRef<'_>) -> Result<Value> {
        let value = match (self, raw) {
            (_, ValueRef::Null) => Value::Null,
            (ColumnType::Boolean, ValueRef::Integer(n)) => Value::Bool(n != 0),
            (_, ValueRef::Integer(n)) => Value::from(n),
            (_, ValueRef::Real(f)) => Value::from(f),
            (ColumnType::Json, ValueRef::Text(text)) => serde_json::from_slice(text)?,
            (_, ValueRef::Text(text)) => Value::String(String::from_utf8_lossy(text).into_owned()),
            (_, ValueRef::Blob(bytes)) => Value::String(hex::encode(bytes)),
        };
        Ok(value)
    }
}

/// One declared parameter column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Real)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Boolean)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Json)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Satellite table name for a namespace: lowercased, with anything outside
/// `[a-z0-9_]` replaced by `_`.
pub fn satellite_table_name(namespace: &str) -> String {
    let mut table: String = namespace
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if table.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        table.insert_str(0, "ns_");
    }
    table
}

/// Static satellite table declaration of one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SatelliteSchema {
    pub table: String,
    pub columns: Vec<ColumnDef>,
}

impl SatelliteSchema {
    pub fn new(namespace: &str, columns: Vec<ColumnDef>) -> Result<Self> {
        if namespace.trim().is_empty() {
            return Err(Error::InvalidArgument("namespace name cannot be empty".to_string()));
        }
        let table = satellite_table_name(namespace);
        if table == MASTER_TABLE || table.starts_with("sqlite_") {
            return Err(Error::InvalidArgument(format!(
                "namespace '{namespace}' maps to reserved table '{table}'"
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for column in &columns {
            if !is_identifier(&column.name) {
                return Err(Error::InvalidArgument(format!(
                    "invalid parameter column name '{}'",
                    column.name
                )));
            }
            if column.name.eq_ignore_ascii_case(KEY_COLUMN) {
                return Err(Error::InvalidArgument(format!(
                    "parameter column '{}' collides with the key column",
                    column.name
                )));
            }
            if !seen.insert(column.name.to_ascii_lowercase()) {
                return Err(Error::InvalidArgument(format!(
                    "duplicate parameter column '{}'",
                    column.name
                )));
            }
        }

        Ok(Self { table, columns })
    }

    fn create_sql(&self) -> String {
        let mut columns = vec![format!(
            "\"{KEY_COLUMN}\" TEXT PRIMARY KEY NOT NULL REFERENCES {MASTER_TABLE}({KEY_COLUMN}) DEFERRABLE INITIALLY DEFERRED"
        )];
        for column in &self.columns {
            columns.push(format!("\"{}\" {}", column.name, column.ty.sql()));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (\n    {}\n)",
            self.table,
            columns.join(",\n    ")
        )
    }
}

/// Master table row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MasterRow {
    pub fingerprint: String,
    pub namespace: String,
    pub status: TaskStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub metadata_hash: Option<String>,
    pub last_changed: Option<String>,
}

impl MasterRow {
    /// Row mirroring `record`, stamped with the log content hash it was
    /// read at.
    pub fn from_record(
        fingerprint: &str,
        namespace: &str,
        record: &TaskRecord,
        metadata_hash: Option<String>,
    ) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            namespace: namespace.to_string(),
            status: record.effective_status(),
            start_time: record.start_time,
            end_time: record.end_time,
            metadata_hash,
            last_changed: record.last_changed.clone(),
        }
    }

    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMasterRow> {
        Ok(RawMasterRow {
            fingerprint: row.get(0)?,
            namespace: row.get(1)?,
            status: row.get(2)?,
            start_time: row.get(3)?,
            end_time: row.get(4)?,
            metadata_hash: row.get(5)?,
            last_changed: row.get(6)?,
        })
    }
}

struct RawMasterRow {
    fingerprint: String,
    namespace: String,
    status: String,
    start_time: Option<String>,
    end_time: Option<String>,
    metadata_hash: Option<String>,
    last_changed: Option<String>,
}

impl RawMasterRow {
    fn decode(self) -> Result<MasterRow> {
        let fingerprint = self.fingerprint;
        let bad = |err: Error| Error::corrupt(&fingerprint, format!("index row: {err}"));
        let status = self.status.parse().map_err(bad)?;
        let start_time = self.start_time.as_deref().map(parse_time).transpose().map_err(bad)?;
        let end_time = self.end_time.as_deref().map(parse_time).transpose().map_err(bad)?;
        Ok(MasterRow {
            fingerprint,
            namespace: self.namespace,
            status,
            start_time,
            end_time,
            metadata_hash: self.metadata_hash,
            last_changed: self.last_changed,
        })
    }
}

pub fn upsert_master(conn: &Connection, row: &MasterRow) -> Result<()> {
    conn.execute(
        "INSERT INTO sak_tasks (key_hash, namespace, status, start_time, end_time, metadata_hash, last_changed)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(key_hash) DO UPDATE SET
             namespace = excluded.namespace,
             status = excluded.status,
             start_time = excluded.start_time,
             end_time = excluded.end_time,
             metadata_hash = excluded.metadata_hash,
             last_changed = excluded.last_changed",
        params![
            row.fingerprint,
            row.namespace,
            row.status.as_str(),
            row.start_time.as_ref().map(format_time),
            row.end_time.as_ref().map(format_time),
            row.metadata_hash,
            row.last_changed,
        ],
    )?;
    Ok(())
}

pub fn get_master(conn: &Connection, fingerprint: &str) -> Result<Option<MasterRow>> {
    let raw = conn
        .query_row(
            &format!("SELECT {MASTER_COLUMNS} FROM sak_tasks WHERE key_hash = ?1"),
            [fingerprint],
            MasterRow::from_row,
        )
        .optional()?;
    raw.map(RawMasterRow::decode).transpose()
}

pub fn delete_master(conn: &Connection, fingerprint: &str) -> Result<bool> {
    let deleted = conn.execute("DELETE FROM sak_tasks WHERE key_hash = ?1", [fingerprint])?;
    Ok(deleted > 0)
}

pub fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

pub fn ensure_satellite(conn: &Connection, schema: &SatelliteSchema) -> Result<()> {
    conn.execute_batch(&schema.create_sql())?;
    Ok(())
}

/// Insert or replace the satellite row of `fingerprint` from decoded
/// parameter values. Columns missing from `values` are stored as NULL.
pub fn upsert_satellite(
    conn: &Connection,
    schema: &SatelliteSchema,
    fingerprint: &str,
    values: &Map<String, Value>,
) -> Result<()> {
    let mut names = vec![format!("\"{KEY_COLUMN}\"")];
    let mut bound = vec![SqlValue::Text(fingerprint.to_string())];
    for column in &schema.columns {
        names.push(format!("\"{}\"", column.name));
        let value = values.get(&column.name).unwrap_or(&Value::Null);
        bound.push(column.ty.to_sql(&column.name, value)?);
    }
    let placeholders: Vec<String> = (1..=bound.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT OR REPLACE INTO \"{}\" ({}) VALUES ({})",
        schema.table,
        names.join(", "),
        placeholders.join(", ")
    );
    conn.execute(&sql, rusqlite::params_from_iter(bound))?;
    Ok(())
}

pub fn get_satellite(
    conn: &Connection,
    schema: &SatelliteSchema,
    fingerprint: &str,
) -> Result<Option<Map<String, Value>>> {
    if schema.columns.is_empty() {
        let sql = format!("SELECT 1 FROM \"{}\" WHERE \"{KEY_COLUMN}\" = ?1", schema.table);
        let found: Option<i64> = conn.query_row(&sql, [fingerprint], |row| row.get(0)).optional()?;
        return Ok(found.map(|_| Map::new()));
    }

    let names: Vec<String> = schema
        .columns
        .iter()
        .map(|column| format!("\"{}\"", column.name))
        .collect();
    let sql = format!(
        "SELECT {} FROM \"{}\" WHERE \"{KEY_COLUMN}\" = ?1",
        names.join(", "),
        schema.table
    );
    let mut statement = conn.prepare(&sql)?;
    let mut rows = statement.query([fingerprint])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };

    let mut values = Map::new();
    for (idx, column) in schema.columns.iter().enumerate() {
        values.insert(column.name.clone(), column.ty.from_sql(row.get_ref(idx)?)?);
    }
    Ok(Some(values))
}

pub fn delete_satellite(conn: &Connection, table: &str, fingerprint: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }
    let sql = format!("DELETE FROM \"{table}\" WHERE \"{KEY_COLUMN}\" = ?1");
    Ok(conn.execute(&sql, [fingerprint])? > 0)
}

fn collect_keys(conn: &Connection, sql: &str, namespace: &str) -> Result<Vec<String>> {
    let mut statement = conn.prepare(sql)?;
    let keys = statement
        .query_map([namespace], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(keys)
}

/// Master rows of `namespace` with no satellite row.
pub fn missing_satellite_keys(
    conn: &Connection,
    namespace: &str,
    schema: &SatelliteSchema,
) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT m.key_hash FROM sak_tasks m
         LEFT JOIN \"{table}\" s ON s.\"{KEY_COLUMN}\" = m.key_hash
         WHERE m.namespace = ?1 AND s.\"{KEY_COLUMN}\" IS NULL
         ORDER BY m.key_hash",
        table = schema.table
    );
    collect_keys(conn, &sql, namespace)
}

/// Satellite rows with no master row under `namespace`.
pub fn orphan_satellite_keys(
    conn: &Connection,
    namespace: &str,
    schema: &SatelliteSchema,
) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT s.\"{KEY_COLUMN}\" FROM \"{table}\" s
         LEFT JOIN sak_tasks m ON m.key_hash = s.\"{KEY_COLUMN}\" AND m.namespace = ?1
         WHERE m.key_hash IS NULL
         ORDER BY s.\"{KEY_COLUMN}\"",
        table = schema.table
    );
    collect_keys(conn, &sql, namespace)
}

pub fn master_keys(conn: &Connection, namespace: &str) -> Result<Vec<String>> {
    collect_keys(
        conn,
        "SELECT key_hash FROM sak_tasks WHERE namespace = ?1 ORDER BY key_hash",
        namespace,
    )
}

pub fn count(conn: &Connection, namespace: &str) -> Result<u64> {
    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sak_tasks WHERE namespace = ?1",
        [namespace],
        |row| row.get(0),
    )?;
    Ok(u64::try_from(total).unwrap_or_default())
}

/// Row count per namespace, sorted by name.
pub fn namespace_counts(conn: &Connection) -> Result<Vec<(String, u64)>> {
    let mut statement = conn.prepare(
        "SELECT namespace, COUNT(*) FROM sak_tasks GROUP BY namespace ORDER BY namespace",
    )?;
    let counts = statement
        .query_map([], |row| {
            let total: i64 = row.get(1)?;
            Ok((row.get::<_, String>(0)?, u64::try_from(total).unwrap_or_default()))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(counts)
}

/// Master rows of `namespace`, newest start first.
pub fn list(
    conn: &Connection,
    namespace: &str,
    status: Option<TaskStatus>,
    limit: Option<usize>,
) -> Result<Vec<MasterRow>> {
    let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
    let sql = format!(
        "SELECT {MASTER_COLUMNS} FROM sak_tasks
         WHERE namespace = ?1 AND (?2 IS NULL OR status = ?2)
         ORDER BY start_time IS NULL, start_time DESC, key_hash
         LIMIT ?3"
    );
    let mut statement = conn.prepare(&sql)?;
    let raw = statement
        .query_map(
            params![namespace, status.map(|s| s.as_str()), limit],
            MasterRow::from_row,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raw.into_iter().map(RawMasterRow::decode).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn schema() -> SatelliteSchema {
        SatelliteSchema::new(
            "Resize-Image",
            vec![
                ColumnDef::text("path"),
                ColumnDef::integer("width"),
                ColumnDef::boolean("keep_ratio"),
                ColumnDef::json("tags"),
            ],
        )
        .unwrap()
    }

    fn row(fingerprint: &str, status: TaskStatus) -> MasterRow {
        MasterRow {
            fingerprint: fingerprint.to_string(),
            namespace: "Resize-Image".to_string(),
            status,
            start_time: None,
            end_time: None,
            metadata_hash: Some("h".to_string()),
            last_changed: None,
        }
    }

    #[test]
    fn table_names_are_sanitized() {
        assert_eq!(satellite_table_name("Resize-Image"), "resize_image");
        assert_eq!(satellite_table_name("3d.render"), "ns_3d_render");
        assert!(SatelliteSchema::new("sak_tasks", Vec::new()).is_err());
        assert!(SatelliteSchema::new("x", vec![ColumnDef::text("key_hash")]).is_err());
        assert!(SatelliteSchema::new("x", vec![ColumnDef::text("bad name")]).is_err());
    }

    #[test]
    fn master_and_satellite_round_trip() {
        let temp = TempDir::new().unwrap();
        let factory = SessionFactory::new(temp.path().join("db.sqlite"), 1000);
        let schema = schema();
        let values = json!({"path": "a.png", "width": 640, "keep_ratio": true, "tags": {"b": 1, "a": 2}});

        factory
            .transaction(|tx| {
                ensure_satellite(tx, &schema)?;
                upsert_master(tx, &row("fp1", TaskStatus::Pending))?;
                upsert_satellite(tx, &schema, "fp1", values.as_object().unwrap())
            })
            .unwrap();

        factory
            .with_session(|conn| {
                let master = get_master(conn, "fp1")?.unwrap();
                assert_eq!(master.status, TaskStatus::Pending);
                let satellite = get_satellite(conn, &schema, "fp1")?.unwrap();
                assert_eq!(Value::Object(satellite), values);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn gaps_are_found_both_ways() {
        let temp = TempDir::new().unwrap();
        let factory = SessionFactory::new(temp.path().join("db.sqlite"), 1000);
        let schema = schema();
        let values = json!({"path": "a.png", "width": 1}).as_object().cloned().unwrap();

        // an orphan satellite row can only exist without foreign key enforcement
        factory
            .with_session(|conn| {
                conn.pragma_update(None, "foreign_keys", "OFF")?;
                ensure_satellite(conn, &schema)?;
                upsert_master(conn, &row("fp1", TaskStatus::Pending))?;
                upsert_master(conn, &row("fp2", TaskStatus::Success))?;
                upsert_satellite(conn, &schema, "fp2", &values)?;
                upsert_satellite(conn, &schema, "fp3", &values)?;
                conn.pragma_update(None, "foreign_keys", "ON")?;

                assert_eq!(missing_satellite_keys(conn, "Resize-Image", &schema)?, vec!["fp1"]);
                assert_eq!(orphan_satellite_keys(conn, "Resize-Image", &schema)?, vec!["fp3"]);
                assert_eq!(count(conn, "Resize-Image")?, 2);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn list_filters_by_status() {
        let temp = TempDir::new().unwrap();
        let factory = SessionFactory::new(temp.path().join("db.sqlite"), 1000);
        factory
            .transaction(|tx| {
                upsert_master(tx, &row("fp1", TaskStatus::Pending))?;
                upsert_master(tx, &row("fp2", TaskStatus::Success))?;
                upsert_master(tx, &row("fp3", TaskStatus::Success))?;
                Ok(())
            })
            .unwrap();

        factory
            .with_session(|conn| {
                let done = list(conn, "Resize-Image", Some(TaskStatus::Success), None)?;
                assert_eq!(done.len(), 2);
                let one = list(conn, "Resize-Image", None, Some(1))?;
                assert_eq!(one.len(), 1);
                assert_eq!(namespace_counts(conn)?, vec![("Resize-Image".to_string(), 3)]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn remove_discards_file_and_sessions() {
        let temp = TempDir::new().unwrap();
        let factory = SessionFactory::new(temp.path().join("db.sqlite"), 1000);
        factory
            .with_session(|conn| upsert_master(conn, &row("fp1", TaskStatus::Pending)))
            .unwrap();
        assert!(factory.exists());
        assert!(factory.quick_check().unwrap());

        factory.remove().unwrap();
        assert!(!factory.exists());
        let found = factory.with_session(|conn| get_master(conn, "fp1")).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn garbage_file_fails_quick_check() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("db.sqlite");
        fs::write(&path, b"definitely not a database, just some bytes to fill a page").unwrap();
        let factory = SessionFactory::new(&path, 1000);
        assert!(!factory.quick_check().unwrap());
    }
}
