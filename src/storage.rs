//! Storage: one metadata log plus the SQL index mirroring it.
//!
//! # Directory Structure
//!
//! ```text
//! <root>/                          # git repository holding the log branch
//!   .sak.toml                      # optional configuration
//!   db.sqlite                      # SQL index (rebuildable)
//!   nm/<namespace>/obj/<fp[..3]>/<fp>/
//!     obj.lock                     # per-task run lock
//!     data/                        # task work directory
//!   .git/sak/
//!     LAST_SYNC_COMMIT             # log revision the index is synced to
//!     LAST_SYNC_COMMIT.lock        # serializes syncs
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::capture::CaptureRegistry;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::index::{self, SessionFactory};
use crate::lock::{self, FileLock};
use crate::log::{MetadataLog, TaskRecord};
use crate::namespace::NamespaceHandle;

/// Sync cursor file name inside `.git/sak/`
pub const CURSOR_FILE: &str = "LAST_SYNC_COMMIT";

/// Base pause between retries of a batch that hit a busy database
const RETRY_BACKOFF_MS: u64 = 50;

/// What one `sync` pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Cursor the pass started from; `None` means a full scan.
    pub from: Option<String>,
    /// Log revision the index is now synced to.
    pub to: Option<String>,
    pub changed: usize,
    pub mirrored: usize,
    pub skipped_unknown: usize,
    pub skipped_corrupt: usize,
    pub removed: usize,
    pub healed: usize,
    pub unhealed: usize,
}

/// Snapshot for `sak status`.
#[derive(Debug, Clone, Serialize)]
pub struct StorageStatus {
    pub name: String,
    pub root: PathBuf,
    pub branch: String,
    pub last_synced: Option<String>,
    pub current_revision: Option<String>,
    pub index_present: bool,
    pub namespaces: Vec<NamespaceCount>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NamespaceCount {
    pub namespace: String,
    pub tasks: u64,
}

/// One prepared change of a sync batch.
enum Planned {
    Remove {
        fingerprint: String,
    },
    Mirror {
        fingerprint: String,
        namespace: Arc<dyn NamespaceHandle>,
        record: TaskRecord,
        hash: Option<String>,
    },
}

#[derive(Default)]
struct BatchCounts {
    mirrored: usize,
    removed: usize,
    corrupt: usize,
}

/// A metadata log and its SQL mirror.
pub struct Storage {
    name: String,
    root: PathBuf,
    config: Config,
    log: MetadataLog,
    index: SessionFactory,
    capture: CaptureRegistry,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("name", &self.name)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl Storage {
    /// Open the storage at `root`, reading `<root>/.sak.toml`.
    pub fn open(name: impl Into<String>, root: impl Into<PathBuf>, capture: CaptureRegistry) -> Result<Self> {
        let root = root.into();
        let config = Config::load_from_root(&root)?;
        Ok(Self::with_config(name, root, config, capture))
    }

    pub fn with_config(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        config: Config,
        capture: CaptureRegistry,
    ) -> Self {
        let root = root.into();
        let log = MetadataLog::open(&root, &config.log);
        Self::with_log(name, root, config, log, capture)
    }

    /// Storage over an already-built log driver.
    pub fn with_log(
        name: impl Into<String>,
        root: impl Into<PathBuf>,
        config: Config,
        log: MetadataLog,
        capture: CaptureRegistry,
    ) -> Self {
        let root = root.into();
        let index = SessionFactory::new(root.join(&config.index.file), config.index.busy_timeout_ms);
        Self {
            name: name.into(),
            root,
            config,
            log,
            index,
            capture,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn log(&self) -> &MetadataLog {
        &self.log
    }

    pub fn index(&self) -> &SessionFactory {
        &self.index
    }

    pub fn capture(&self) -> &CaptureRegistry {
        &self.capture
    }

    // =========================================================================
    // Path accessors
    // =========================================================================

    fn state_dir(&self) -> PathBuf {
        self.root.join(".git").join("sak")
    }

    pub fn cursor_path(&self) -> PathBuf {
        self.state_dir().join(CURSOR_FILE)
    }

    pub fn cursor_lock_path(&self) -> PathBuf {
        self.state_dir().join(format!("{CURSOR_FILE}.lock"))
    }

    /// `<root>/nm/<dir>`
    pub fn namespace_path(&self, dir: &str) -> PathBuf {
        self.root.join("nm").join(dir)
    }

    /// `<root>/nm/<dir>/obj/<fp[..3]>/<fp>`
    pub fn object_path(&self, dir: &str, fingerprint: &str) -> Result<PathBuf> {
        let valid = fingerprint.len() >= 3 && fingerprint.chars().all(|c| c.is_ascii_alphanumeric());
        if !valid {
            return Err(Error::InvalidArgument(format!(
                "not a task fingerprint: '{fingerprint}'"
            )));
        }
        Ok(self
            .namespace_path(dir)
            .join("obj")
            .join(&fingerprint[..3])
            .join(fingerprint))
    }

    // =========================================================================
    // Sync cursor
    // =========================================================================

    /// Log revision the index was last synced to.
    pub fn last_synced_revision(&self) -> Result<Option<String>> {
        let path = self.cursor_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let revision = content.trim();
        Ok((!revision.is_empty()).then(|| revision.to_string()))
    }

    fn write_cursor(&self, revision: Option<&str>) -> Result<()> {
        let path = self.cursor_path();
        match revision {
            Some(revision) => lock::write_atomic(&path, &format!("{revision}\n")),
            None if path.exists() => Ok(fs::remove_file(&path)?),
            None => Ok(()),
        }
    }

    fn lock_cursor(&self) -> Result<FileLock> {
        FileLock::acquire_with(self.cursor_lock_path(), self.config.lock.timeout_ms)
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Bring the index up to date with the log.
    ///
    /// Only keys changed since the cursor are replayed, in batches of one
    /// transaction each. The cursor moves only after every batch committed.
    /// Keys of namespaces not in `namespaces` are skipped. Afterwards every
    /// namespace repairs its master/satellite gaps.
    pub fn sync(&self, namespaces: &[Arc<dyn NamespaceHandle>]) -> Result<SyncReport> {
        let _lock = self.lock_cursor()?;

        // let the backend flush anything it buffered before reading history
        self.log.close()?;

        let mut report = SyncReport {
            from: self.checked_cursor()?,
            ..SyncReport::default()
        };

        let registered: HashMap<&str, &Arc<dyn NamespaceHandle>> = namespaces
            .iter()
            .map(|namespace| (namespace.name(), namespace))
            .collect();
        for namespace in namespaces {
            namespace.ensure_schema()?;
        }

        if let Some(current) = self.log.current_revision()? {
            let changed = self.log.changed_keys(report.from.as_deref(), &current)?;
            report.changed = changed.len();
            debug!(from = ?report.from, to = %current, changed = changed.len(), "syncing index");

            for batch in changed.chunks(self.config.sync.batch_size) {
                let plan = self.plan_batch(batch, &registered, &mut report)?;
                let counts = self.commit_batch(&plan)?;
                report.mirrored += counts.mirrored;
                report.removed += counts.removed;
                report.skipped_corrupt += counts.corrupt;
            }

            self.write_cursor(Some(&current))?;
            report.to = Some(current);
        }

        for namespace in namespaces {
            let repaired = namespace.resync_index()?;
            report.healed += repaired.healed;
            report.unhealed += repaired.unhealed;
        }

        info!(
            storage = %self.name,
            changed = report.changed,
            mirrored = report.mirrored,
            removed = report.removed,
            skipped_unknown = report.skipped_unknown,
            skipped_corrupt = report.skipped_corrupt,
            healed = report.healed,
            unhealed = report.unhealed,
            "index sync finished"
        );
        Ok(report)
    }

    /// Cursor to sync from, discarded when the index cannot be trusted.
    fn checked_cursor(&self) -> Result<Option<String>> {
        let cursor = self.last_synced_revision()?;
        if !self.index.exists() {
            // sessions may still hold the unlinked file open
            self.index.remove()?;
            if cursor.is_some() {
                warn!(path = %self.index.path().display(), "index missing; full resync");
                self.write_cursor(None)?;
            }
            return Ok(None);
        }
        if !self.index.quick_check()? {
            warn!(path = %self.index.path().display(), "index corrupt; recreating");
            self.index.remove()?;
            self.write_cursor(None)?;
            return Ok(None);
        }
        Ok(cursor)
    }

    /// Read the log side of a batch, outside any SQL transaction.
    fn plan_batch(
        &self,
        batch: &[String],
        registered: &HashMap<&str, &Arc<dyn NamespaceHandle>>,
        report: &mut SyncReport,
    ) -> Result<Vec<Planned>> {
        let mut plan = Vec::with_capacity(batch.len());
        for fingerprint in batch {
            let record = match self.log.get(fingerprint) {
                Ok(record) => record,
                Err(err @ Error::CorruptRecord { .. }) => {
                    warn!(fingerprint = %fingerprint, error = %err, "skipping corrupt log entry");
                    report.skipped_corrupt += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };

            if record.is_empty() {
                plan.push(Planned::Remove {
                    fingerprint: fingerprint.clone(),
                });
                continue;
            }

            let namespace = record
                .namespace
                .as_deref()
                .and_then(|name| registered.get(name));
            let Some(namespace) = namespace else {
                debug!(fingerprint = %fingerprint, namespace = ?record.namespace, "no namespace registered; skipping");
                report.skipped_unknown += 1;
                continue;
            };

            plan.push(Planned::Mirror {
                fingerprint: fingerprint.clone(),
                namespace: Arc::clone(namespace),
                hash: self.log.content_hash(fingerprint)?,
                record,
            });
        }
        Ok(plan)
    }

    /// Apply a planned batch in one transaction, retrying the whole batch
    /// on transient failures.
    fn commit_batch(&self, plan: &[Planned]) -> Result<BatchCounts> {
        let attempts = self.config.sync.commit_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.index.transaction(|tx| apply_batch(tx, plan)) {
                Ok(counts) => return Ok(counts),
                Err(err) if err.is_transient() && attempt < attempts => {
                    warn!(attempt, error = %err, "index batch failed; retrying");
                    std::thread::sleep(Duration::from_millis(RETRY_BACKOFF_MS * u64::from(attempt)));
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Forget the cursor so the next sync replays the whole log.
    pub fn rebuild(&self) -> Result<()> {
        let _lock = self.lock_cursor()?;
        self.write_cursor(None)?;
        info!(storage = %self.name, "sync cursor cleared");
        Ok(())
    }

    // =========================================================================
    // Keys
    // =========================================================================

    /// Remove a key from the log, then its master and satellite rows.
    ///
    /// The log removal is verified before the index is touched; the index
    /// rows go in one transaction.
    pub fn drop_key(&self, fingerprint: &str) -> Result<()> {
        let record = self.log.get(fingerprint)?;
        let master = self
            .index
            .with_session(|conn| index::get_master(conn, fingerprint))?;
        if record.is_empty() && master.is_none() {
            return Err(Error::TaskNotFound(fingerprint.to_string()));
        }

        if !record.is_empty() {
            self.log.drop_key(fingerprint)?;
        }

        let namespace = record
            .namespace
            .or_else(|| master.map(|row| row.namespace));
        self.index.transaction(|tx| {
            if let Some(namespace) = namespace.as_deref() {
                index::delete_satellite(tx, &index::satellite_table_name(namespace), fingerprint)?;
            }
            index::delete_master(tx, fingerprint)?;
            Ok(())
        })?;

        info!(fingerprint, namespace = ?namespace, "dropped task");
        Ok(())
    }

    pub fn status(&self) -> Result<StorageStatus> {
        let index_present = self.index.exists();
        let namespaces = if index_present {
            self.index
                .with_session(|conn| index::namespace_counts(conn))?
                .into_iter()
                .map(|(namespace, tasks)| NamespaceCount { namespace, tasks })
                .collect()
        } else {
            Vec::new()
        };

        Ok(StorageStatus {
            name: self.name.clone(),
            root: self.root.clone(),
            branch: self.log.branch().to_string(),
            last_synced: self.last_synced_revision()?,
            current_revision: self.log.current_revision()?,
            index_present,
            namespaces,
        })
    }

    /// Close the log backend. It reconnects on next use.
    pub fn close(&self) -> Result<()> {
        self.log.close()
    }
}

fn apply_batch(tx: &rusqlite::Transaction<'_>, plan: &[Planned]) -> Result<BatchCounts> {
    let mut counts = BatchCounts::default();
    for step in plan {
        match step {
            Planned::Remove { fingerprint } => {
                if let Some(master) = index::get_master(tx, fingerprint)? {
                    let table = index::satellite_table_name(&master.namespace);
                    index::delete_satellite(tx, &table, fingerprint)?;
                    index::delete_master(tx, fingerprint)?;
                    counts.removed += 1;
                }
            }
            Planned::Mirror {
                fingerprint,
                namespace,
                record,
                hash,
            } => match namespace.mirror(tx, fingerprint, record, hash.clone()) {
                Ok(()) => counts.mirrored += 1,
                Err(err @ Error::CorruptRecord { .. }) => {
                    warn!(fingerprint = %fingerprint, error = %err, "skipping corrupt log entry");
                    counts.corrupt += 1;
                }
                Err(err) => return Err(err),
            },
        }
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogBackendKind;
    use crate::log::{RecordUpdate, TaskStatus};
    use git2::Repository;
    use tempfile::TempDir;

    fn storage() -> (TempDir, Storage) {
        let temp = TempDir::new().unwrap();
        Repository::init(temp.path()).unwrap();
        let mut config = Config::default();
        config.log.backend = LogBackendKind::Git;
        let storage = Storage::with_config("main", temp.path(), config, CaptureRegistry::new());
        (temp, storage)
    }

    #[test]
    fn cursor_round_trips() {
        let (_temp, storage) = storage();
        assert_eq!(storage.last_synced_revision().unwrap(), None);
        storage.write_cursor(Some("abc123")).unwrap();
        assert_eq!(storage.last_synced_revision().unwrap().as_deref(), Some("abc123"));
        storage.rebuild().unwrap();
        assert_eq!(storage.last_synced_revision().unwrap(), None);
    }

    #[test]
    fn object_path_layout() {
        let (temp, storage) = storage();
        let path = storage.object_path("resize", "abcdef").unwrap();
        assert_eq!(path, temp.path().join("nm/resize/obj/abc/abcdef"));
        assert!(storage.object_path("resize", "../x").is_err());
    }

    #[test]
    fn sync_without_namespaces_skips_and_advances() {
        let (_temp, storage) = storage();
        let update = RecordUpdate::new()
            .fingerprint("fp1")
            .namespace("unregistered")
            .status(TaskStatus::Pending);
        storage.log().set("fp1", &update, None).unwrap();

        let report = storage.sync(&[]).unwrap();
        assert_eq!(report.changed, 1);
        assert_eq!(report.skipped_unknown, 1);
        assert_eq!(report.mirrored, 0);
        assert_eq!(storage.last_synced_revision().unwrap(), report.to);

        let again = storage.sync(&[]).unwrap();
        assert_eq!(again.changed, 0);
    }

    #[test]
    fn missing_index_discards_cursor() {
        let (_temp, storage) = storage();
        storage.write_cursor(Some("deadbeef")).unwrap();
        let report = storage.sync(&[]).unwrap();
        assert_eq!(report.from, None);
    }

    #[test]
    fn drop_unknown_key_is_not_found() {
        let (_temp, storage) = storage();
        let err = storage.drop_key("nothing").unwrap_err();
        assert!(matches!(err, Error::TaskNotFound(_)));
    }
}
