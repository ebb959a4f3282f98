//! One task instance and its run state machine.
//!
//! ```text
//! PENDING ──run──▶ (running: lock held, never persisted) ──▶ SUCCESS | FAIL
//! ```
//!
//! `ABORTED` is only ever set from outside via [`Task::set_status`]. A
//! SUCCESS task is skipped by `run` unless forced or its kind asks for a
//! rerun; every other state runs.

use std::any::Any;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::capture::CaptureHandle;
use crate::error::{Error, Result};
use crate::hasher::TaskKey;
use crate::index;
use crate::lock::FileLock;
use crate::log::{RecordUpdate, TaskRecord, TaskStatus};
use crate::namespace::{Namespace, TaskKind, TaskParams};

const LOCK_FILE: &str = "obj.lock";
const WORK_DIR: &str = "data";

/// Options for [`Task::run_with`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run even if the task already succeeded.
    pub force: bool,
    /// Run arguments handed to the body; not part of the fingerprint.
    pub args: Map<String, Value>,
}

impl RunOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The body did not run: the task had already succeeded.
    Cached,
    /// The body ran and succeeded.
    Ran,
}

/// What a task body sees while it runs.
///
/// Writes go to the run's capture buffer and end up in the task's `log`
/// field.
pub struct RunContext<'a> {
    args: &'a Map<String, Value>,
    out: &'a mut CaptureHandle,
    work_path: &'a Path,
    fingerprint: &'a str,
}

impl<'a> RunContext<'a> {
    pub fn args(&self) -> &Map<String, Value> {
        self.args
    }

    /// Typed run argument, `None` if absent.
    pub fn arg<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        match self.args.get(name) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Scratch directory owned by this task.
    pub fn work_path(&self) -> &Path {
        self.work_path
    }

    pub fn fingerprint(&self) -> &str {
        self.fingerprint
    }

    /// Output captured so far in this run.
    pub fn captured(&self) -> String {
        self.out.text()
    }
}

impl Write for RunContext<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.out.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// One `(namespace, fingerprint)` task.
pub struct Task<K: TaskKind> {
    namespace: Arc<Namespace<K>>,
    key: TaskKey,
    params: K::Params,
    record: TaskRecord,
}

impl<K: TaskKind> Clone for Task<K> {
    fn clone(&self) -> Self {
        Self {
            namespace: Arc::clone(&self.namespace),
            key: self.key.clone(),
            params: self.params.clone(),
            record: self.record.clone(),
        }
    }
}

impl<K: TaskKind> std::fmt::Debug for Task<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("namespace", &self.namespace.name())
            .field("fingerprint", &self.key.fingerprint())
            .field("status", &self.status())
            .finish()
    }
}

impl<K: TaskKind> Task<K> {
    /// Fingerprint `params`; write the PENDING record if the log has none,
    /// then make sure the index rows exist and are current.
    pub(crate) fn create(namespace: Arc<Namespace<K>>, params: K::Params) -> Result<Self> {
        let key_data = params.key_data()?;
        let key = TaskKey::from_map(key_data.clone());
        let fingerprint = key.fingerprint().to_string();

        let initial = RecordUpdate::new()
            .fingerprint(fingerprint.as_str())
            .namespace(namespace.name())
            .key_data(key_data)
            .status(TaskStatus::Pending);
        let record = namespace
            .storage()
            .log()
            .ensure(&fingerprint, &initial, None)?;

        if let Some(owner) = record.namespace.as_deref() {
            if owner != namespace.name() {
                return Err(Error::InvalidArgument(format!(
                    "task {fingerprint} already belongs to namespace '{owner}'"
                )));
            }
        }

        let task = Self::from_parts(namespace, key, params, record);
        task.refresh_index()?;
        Ok(task)
    }

    pub(crate) fn from_parts(
        namespace: Arc<Namespace<K>>,
        key: TaskKey,
        params: K::Params,
        record: TaskRecord,
    ) -> Self {
        Self {
            namespace,
            key,
            params,
            record,
        }
    }

    /// Re-mirror the index rows unless they match the log's content hash.
    pub(crate) fn refresh_index(&self) -> Result<()> {
        let storage = self.namespace.storage();
        let fingerprint = self.fingerprint();
        let hash = storage.log().content_hash(fingerprint)?;

        let fresh = storage.index().with_session(|conn| {
            let master = index::get_master(conn, fingerprint)?;
            let has_satellite = index::get_satellite(conn, self.namespace.schema(), fingerprint)?.is_some();
            let current = match master {
                Some(row) => hash.is_some() && row.metadata_hash == hash,
                None => false,
            };
            Ok(current && has_satellite)
        })?;
        if fresh {
            return Ok(());
        }

        debug!(fingerprint, namespace = %self.namespace.name(), "refreshing stale index row");
        storage
            .index()
            .transaction(|tx| self.namespace.mirror_record(tx, fingerprint, &self.record, hash))
    }

    pub fn fingerprint(&self) -> &str {
        self.key.fingerprint()
    }

    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    pub fn params(&self) -> &K::Params {
        &self.params
    }

    /// Parameters as stored in `key_data`.
    pub fn key_data(&self) -> &Map<String, Value> {
        self.key.data()
    }

    pub fn namespace(&self) -> &Arc<Namespace<K>> {
        &self.namespace
    }

    /// Record as last read from or written to the log.
    pub fn record(&self) -> &TaskRecord {
        &self.record
    }

    pub fn status(&self) -> TaskStatus {
        self.record.effective_status()
    }

    pub fn is_pending(&self) -> bool {
        self.status() == TaskStatus::Pending
    }

    pub fn user_data(&self) -> Map<String, Value> {
        self.record.user_data.clone().unwrap_or_default()
    }

    /// Re-read the record from the log.
    pub fn refresh(&mut self) -> Result<&TaskRecord> {
        self.record = self.namespace.storage().log().get(self.fingerprint())?;
        Ok(&self.record)
    }

    /// Write `update`, mirroring the result into the index if anything
    /// changed.
    fn write(&mut self, update: &RecordUpdate) -> Result<()> {
        let namespace = Arc::clone(&self.namespace);
        let fingerprint = self.fingerprint().to_string();
        let mut mirror = |record: &TaskRecord| -> Result<()> {
            namespace.mirror_quietly(&fingerprint, record);
            Ok(())
        };
        self.record = namespace
            .storage()
            .log()
            .set(&fingerprint, update, Some(&mut mirror))?;
        Ok(())
    }

    /// Merge `values` into `user_data`.
    pub fn update_user_data(&mut self, values: Map<String, Value>) -> Result<()> {
        self.refresh()?;
        let mut merged = self.user_data();
        merged.extend(values);
        self.write(&RecordUpdate::new().user_data(merged))
    }

    /// Set the status directly, e.g. to mark a task ABORTED.
    pub fn set_status(&mut self, status: TaskStatus) -> Result<()> {
        self.write(&RecordUpdate::new().status(status))
    }

    /// `<root>/nm/<namespace>/obj/<fp[..3]>/<fp>`
    pub fn object_path(&self) -> Result<PathBuf> {
        self.namespace
            .storage()
            .object_path(&self.namespace.schema().table, self.fingerprint())
    }

    /// Per-task scratch directory, created on demand.
    pub fn work_path(&self) -> Result<PathBuf> {
        let path = self.object_path()?.join(WORK_DIR);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    pub fn lock_path(&self) -> Result<PathBuf> {
        Ok(self.object_path()?.join(LOCK_FILE))
    }

    fn needs_run(&self, force: bool) -> bool {
        force
            || self.status() != TaskStatus::Success
            || self.namespace.kind().has_to_rerun(&self.record)
    }

    /// Run with `args` unless the task already succeeded.
    pub fn run(&mut self, args: Map<String, Value>) -> Result<RunOutcome> {
        self.run_with(RunOptions {
            args,
            ..RunOptions::default()
        })
    }

    /// Run the body under the per-task lock.
    ///
    /// The start time is recorded before the body runs. Afterwards the
    /// captured output, the end time and the final status are written in
    /// one change-detected update. A body error is returned as
    /// [`Error::TaskFailed`] and a panic resumes, both only once the FAIL
    /// record is in the log.
    pub fn run_with(&mut self, options: RunOptions) -> Result<RunOutcome> {
        if !self.needs_run(options.force) {
            debug!(fingerprint = %self.fingerprint(), "task already succeeded");
            return Ok(RunOutcome::Cached);
        }

        let lock = FileLock::acquire_blocking(self.lock_path()?)?;

        // another holder may have finished the task while we waited
        self.refresh()?;
        if !self.needs_run(options.force) {
            debug!(fingerprint = %self.fingerprint(), "task finished by another runner");
            return Ok(RunOutcome::Cached);
        }

        let namespace = Arc::clone(&self.namespace);
        let storage = namespace.storage();
        let fingerprint = self.fingerprint().to_string();
        let work_path = self.work_path()?;

        let started = Utc::now();
        self.record = storage
            .log()
            .set(&fingerprint, &RecordUpdate::new().start_time(started), None)?;
        info!(namespace = %namespace.name(), fingerprint = %fingerprint, "running task");

        let mut capture = storage.capture().start(storage.config().task.echo_output);
        let outcome = {
            let mut ctx = RunContext {
                args: &options.args,
                out: &mut capture,
                work_path: &work_path,
                fingerprint: &fingerprint,
            };
            let params = &self.params;
            panic::catch_unwind(AssertUnwindSafe(|| namespace.kind().run(params, &mut ctx)))
        };

        let (failure, panicked) = match outcome {
            Ok(Ok(())) => (None, None),
            Ok(Err(err)) => {
                let _ = writeln!(capture, "error: {err:?}");
                (Some(err), None)
            }
            Err(payload) => {
                let _ = writeln!(capture, "panicked: {}", panic_message(payload.as_ref()));
                (None, Some(payload))
            }
        };
        let log_text = capture.finish();

        let status = if failure.is_none() && panicked.is_none() {
            TaskStatus::Success
        } else {
            TaskStatus::Fail
        };
        let ended = Utc::now().max(started + Duration::nanoseconds(1));
        let update = RecordUpdate::new()
            .log_text(log_text)
            .end_time(ended)
            .status(status);

        let mut mirror = |record: &TaskRecord| -> Result<()> {
            namespace.mirror_quietly(&fingerprint, record);
            Ok(())
        };
        let written = storage.log().set(&fingerprint, &update, Some(&mut mirror));
        drop(lock);

        if let Err(err) = &written {
            if status == TaskStatus::Fail {
                let body_error = match (&failure, &panicked) {
                    (Some(source), _) => format!("{source:#}"),
                    (None, Some(payload)) => format!("panicked: {}", panic_message(payload.as_ref())),
                    (None, None) => String::new(),
                };
                warn!(
                    fingerprint = %fingerprint,
                    error = %err,
                    body_error = %body_error,
                    "could not record task failure"
                );
            }
        }
        if let Some(payload) = panicked {
            panic::resume_unwind(payload);
        }
        let failure = match (written, failure) {
            (Ok(record), failure) => {
                self.record = record;
                failure
            }
            (Err(err), Some(source)) => {
                return Err(Error::FailureNotRecorded {
                    fingerprint,
                    source,
                    record: Box::new(err),
                });
            }
            (Err(err), None) => return Err(err),
        };
        info!(namespace = %namespace.name(), fingerprint = %fingerprint, %status, "task finished");

        match failure {
            Some(source) => Err(Error::TaskFailed {
                fingerprint,
                source,
            }),
            None => Ok(RunOutcome::Ran),
        }
    }

    /// Remove the task from the log and the index.
    pub fn drop(self) -> Result<()> {
        self.namespace.storage().drop_key(self.fingerprint())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_messages_are_extracted() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(3);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn forced_options() {
        let options = RunOptions::forced();
        assert!(options.force);
        assert!(options.args.is_empty());
    }
}
