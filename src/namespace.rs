//! Task kinds and their namespaces.
//!
//! A namespace is one registered [`TaskKind`]: it owns a satellite table
//! derived from the kind's declared parameter columns and knows how to turn
//! the log's untyped `key_data` back into the kind's typed parameters.

use std::any::Any;
use std::path::PathBuf;
use std::sync::Arc;

use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::hasher::{self, TaskKey};
use crate::index::{self, ColumnDef, MasterRow, SatelliteSchema};
use crate::log::{TaskRecord, TaskStatus};
use crate::storage::Storage;
use crate::task::{RunContext, Task};

/// Typed parameters of a task kind.
///
/// The column list is the static satellite table declaration. `decode` and
/// `encode` default to serde; override them when the stored shape differs
/// from the struct.
///
/// Serde writes a `HashSet` in iteration order. A set field must either
/// serialize through [`hasher::sorted_set`] or be replaced in
/// [`key_data`](TaskParams::key_data) by its
/// [`CanonicalHash`](crate::hasher::CanonicalHash) form, or equal sets get
/// different fingerprints.
pub trait TaskParams: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn columns() -> Vec<ColumnDef>;

    fn decode(key_data: &Map<String, Value>) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(key_data.clone()))?)
    }

    fn encode(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(Error::InvalidArgument(format!(
                "task parameters must encode to an object, got {}",
                hasher::json_kind(&other)
            ))),
        }
    }

    /// Parameters as they enter the fingerprint, the log's `key_data` and
    /// the satellite row. Must decode back through [`decode`](Self::decode).
    fn key_data(&self) -> Result<Map<String, Value>> {
        Ok(self
            .encode()?
            .into_iter()
            .map(|(name, value)| {
                let value = hasher::canonicalize(&value);
                (name, value)
            })
            .collect())
    }
}

/// A kind of task: its name, parameter type and body.
pub trait TaskKind: Send + Sync + 'static {
    type Params: TaskParams;

    /// Namespace name. Also names the satellite table.
    fn name(&self) -> &str;

    /// Task body. Everything written to `ctx` is recorded as the run's log.
    fn run(&self, params: &Self::Params, ctx: &mut RunContext<'_>) -> anyhow::Result<()>;

    /// Whether a task that already succeeded should run again.
    fn has_to_rerun(&self, _record: &TaskRecord) -> bool {
        false
    }
}

/// Outcome of a gap repair pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResyncReport {
    pub healed: usize,
    pub unhealed: usize,
}

/// Type-erased view of a namespace, used by storage-wide sync.
pub trait NamespaceHandle: Send + Sync {
    fn name(&self) -> &str;

    fn schema(&self) -> &SatelliteSchema;

    /// Create the satellite table if it is missing.
    fn ensure_schema(&self) -> Result<()>;

    /// Write master and satellite rows for `record`, read from the log at
    /// content hash `metadata_hash`. Fails with `CorruptRecord` before
    /// touching the database if the record cannot become a task.
    fn mirror(
        &self,
        conn: &Connection,
        fingerprint: &str,
        record: &TaskRecord,
        metadata_hash: Option<String>,
    ) -> Result<()>;

    fn resync_index(&self) -> Result<ResyncReport>;

    fn all_keys(&self) -> Result<Vec<String>>;

    fn count_tasks(&self) -> Result<u64>;

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

pub struct Namespace<K: TaskKind> {
    kind: K,
    name: String,
    schema: SatelliteSchema,
    storage: Arc<Storage>,
}

impl<K: TaskKind> Namespace<K> {
    /// Create the namespace on `storage`, creating its satellite table.
    pub fn new(kind: K, storage: Arc<Storage>) -> Result<Arc<Self>> {
        let name = kind.name().to_string();
        let schema = SatelliteSchema::new(&name, K::Params::columns())?;
        let namespace = Self {
            kind,
            name,
            schema,
            storage,
        };
        namespace.ensure_schema()?;
        Ok(Arc::new(namespace))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn schema(&self) -> &SatelliteSchema {
        &self.schema
    }

    /// Directory holding this namespace's task directories.
    pub fn path(&self) -> PathBuf {
        self.storage.namespace_path(&self.schema.table)
    }

    /// Task for `params`, creating its PENDING record on first reference.
    pub fn task(self: &Arc<Self>, params: K::Params) -> Result<Task<K>> {
        Task::create(Arc::clone(self), params)
    }

    /// Task already known to the index, rehydrated from its satellite row.
    ///
    /// `None` when the index has no row for `fingerprint` under this
    /// namespace, or the log no longer has the key.
    pub fn get_task(self: &Arc<Self>, fingerprint: &str) -> Result<Option<Task<K>>> {
        let stored = self.storage.index().with_session(|conn| {
            let Some(master) = index::get_master(conn, fingerprint)? else {
                return Ok(None);
            };
            if master.namespace != self.name {
                return Ok(None);
            }
            Ok(Some(index::get_satellite(conn, &self.schema, fingerprint)?))
        })?;
        let Some(satellite) = stored else {
            return Ok(None);
        };

        let record = self.storage.log().get(fingerprint)?;
        if record.is_empty() {
            debug!(fingerprint, namespace = %self.name, "index row without log entry");
            return Ok(None);
        }

        let task = match satellite {
            Some(values) => {
                let params = K::Params::decode(&values)
                    .map_err(|err| Error::corrupt(fingerprint, err.to_string()))?;
                let key_data = record.key_data.clone().unwrap_or(values);
                Task::from_parts(
                    Arc::clone(self),
                    TaskKey::with_fingerprint(key_data, fingerprint),
                    params,
                    record,
                )
            }
            None => {
                let key_data = record
                    .key_data
                    .clone()
                    .ok_or_else(|| Error::corrupt(fingerprint, "log entry has no key_data"))?;
                self.load_from_log(fingerprint, &key_data)?
            }
        };
        task.refresh_index()?;
        Ok(Some(task))
    }

    /// Rebuild a task from the log's untyped `key_data`. Nothing is written.
    pub fn load_from_log(
        self: &Arc<Self>,
        fingerprint: &str,
        key_data: &Map<String, Value>,
    ) -> Result<Task<K>> {
        let params = self.decode_params(fingerprint, Some(key_data))?;
        let record = self.storage.log().get(fingerprint)?;
        Ok(Task::from_parts(
            Arc::clone(self),
            TaskKey::with_fingerprint(key_data.clone(), fingerprint),
            params,
            record,
        ))
    }

    pub fn all_keys(&self) -> Result<Vec<String>> {
        self.storage
            .index()
            .with_session(|conn| index::master_keys(conn, &self.name))
    }

    pub fn count_tasks(&self) -> Result<u64> {
        self.storage
            .index()
            .with_session(|conn| index::count(conn, &self.name))
    }

    /// Index rows of this namespace, most recently started first.
    pub fn list(&self, status: Option<TaskStatus>, limit: Option<usize>) -> Result<Vec<MasterRow>> {
        self.storage
            .index()
            .with_session(|conn| index::list(conn, &self.name, status, limit))
    }

    /// Like [`list`](Self::list), rehydrated into tasks.
    pub fn tasks(
        self: &Arc<Self>,
        status: Option<TaskStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Task<K>>> {
        let mut tasks = Vec::new();
        for row in self.list(status, limit)? {
            if let Some(task) = self.get_task(&row.fingerprint)? {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    /// Repair master/satellite gaps of this namespace from the log.
    ///
    /// Master rows are never deleted here. Keys the log cannot restore are
    /// left in place, logged, and counted as unhealed.
    pub fn resync_index(&self) -> Result<ResyncReport> {
        let mut report = ResyncReport::default();
        let (missing, orphans) = self.storage.index().with_session(|conn| {
            Ok((
                index::missing_satellite_keys(conn, &self.name, &self.schema)?,
                index::orphan_satellite_keys(conn, &self.name, &self.schema)?,
            ))
        })?;

        for fingerprint in missing.iter().chain(orphans.iter()) {
            match self.heal(fingerprint) {
                Ok(()) => report.healed += 1,
                Err(err) => {
                    warn!(fingerprint = %fingerprint, namespace = %self.name, error = %err, "index gap left unhealed");
                    report.unhealed += 1;
                }
            }
        }

        if report.unhealed > 0 {
            let gap = Error::ConsistencyGap {
                namespace: self.name.clone(),
                missing: report.unhealed,
            };
            warn!("{gap}");
        } else if report.healed > 0 {
            debug!(namespace = %self.name, healed = report.healed, "index gaps healed");
        }
        Ok(report)
    }

    fn heal(&self, fingerprint: &str) -> Result<()> {
        let log = self.storage.log();
        let record = log.get(fingerprint)?;
        let hash = log.content_hash(fingerprint)?;

        self.storage.index().transaction(|tx| {
            if record.is_empty() {
                // the key was dropped; only a satellite row can be left over
                if index::get_master(tx, fingerprint)?.is_none() {
                    index::delete_satellite(tx, &self.schema.table, fingerprint)?;
                    return Ok(());
                }
                return Err(Error::corrupt(fingerprint, "log entry is empty"));
            }
            if let Some(owner) = record.namespace.as_deref() {
                if owner != self.name {
                    return Err(Error::corrupt(
                        fingerprint,
                        format!("log entry belongs to namespace '{owner}'"),
                    ));
                }
            }
            self.mirror_record(tx, fingerprint, &record, hash)
        })
    }

    pub(crate) fn decode_params(
        &self,
        fingerprint: &str,
        key_data: Option<&Map<String, Value>>,
    ) -> Result<K::Params> {
        let key_data =
            key_data.ok_or_else(|| Error::corrupt(fingerprint, "log entry has no key_data"))?;
        K::Params::decode(key_data).map_err(|err| {
            Error::corrupt(
                fingerprint,
                format!("key_data does not decode as {}: {err}", self.name),
            )
        })
    }

    pub(crate) fn mirror_record(
        &self,
        conn: &Connection,
        fingerprint: &str,
        record: &TaskRecord,
        metadata_hash: Option<String>,
    ) -> Result<()> {
        let params = self.decode_params(fingerprint, record.key_data.as_ref())?;
        let values = params.key_data()?;
        let row = MasterRow::from_record(fingerprint, &self.name, record, metadata_hash);

        // satellite first: a rejected value must leave no master row
        index::upsert_satellite(conn, &self.schema, fingerprint, &values).map_err(|err| match err {
            Error::InvalidArgument(reason) => Error::corrupt(fingerprint, reason),
            other => other,
        })?;
        index::upsert_master(conn, &row)
    }

    /// Mirror `record` into the index in its own transaction. Failures are
    /// logged only: the log already holds the truth and the next sync or
    /// access repairs the row.
    pub(crate) fn mirror_quietly(&self, fingerprint: &str, record: &TaskRecord) {
        let result = self
            .storage
            .log()
            .content_hash(fingerprint)
            .and_then(|hash| {
                self.storage
                    .index()
                    .transaction(|tx| self.mirror_record(tx, fingerprint, record, hash))
            });
        if let Err(err) = result {
            warn!(fingerprint, namespace = %self.name, error = %err, "failed to update index row");
        }
    }
}

impl<K: TaskKind> NamespaceHandle for Namespace<K> {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &SatelliteSchema {
        &self.schema
    }

    fn ensure_schema(&self) -> Result<()> {
        self.storage
            .index()
            .with_session(|conn| index::ensure_satellite(conn, &self.schema))
    }

    fn mirror(
        &self,
        conn: &Connection,
        fingerprint: &str,
        record: &TaskRecord,
        metadata_hash: Option<String>,
    ) -> Result<()> {
        self.mirror_record(conn, fingerprint, record, metadata_hash)
    }

    fn resync_index(&self) -> Result<ResyncReport> {
        Namespace::resync_index(self)
    }

    fn all_keys(&self) -> Result<Vec<String>> {
        Namespace::all_keys(self)
    }

    fn count_tasks(&self) -> Result<u64> {
        Namespace::count_tasks(self)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
