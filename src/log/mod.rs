//! Metadata log driver.
//!
//! The log is the source of truth: an append-only, git-versioned key/value
//! store holding one metadata file per task fingerprint. This driver
//!
//! - reads and writes the fixed record schema over a batch backend
//!   ([`MetadataBackend`]), eliding fields whose content is unchanged so
//!   no-op writes never reach the log
//! - hashes a key's stored representation without decoding it
//!   ([`MetadataLog::content_hash`])
//! - enumerates keys touched between two log revisions
//!   ([`MetadataLog::changed_keys`])

pub mod annex;
pub mod gitlog;
pub mod protocol;
pub mod record;

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use git2::{ErrorCode, Repository};
use tracing::{debug, warn};

use crate::config::{LogBackendKind, LogConfig};
use crate::error::{Error, Result};
use crate::hasher;

pub use annex::AnnexBatch;
pub use gitlog::GitLog;
pub use protocol::{BatchRequest, BatchResponse, MetadataBackend};
pub use record::{FieldMap, RecordUpdate, TaskRecord, TaskStatus};

/// Opaque identifier of a point in the log's history (a commit id).
pub type Revision = String;

/// Driver for one metadata log.
pub struct MetadataLog {
    root: PathBuf,
    branch: String,
    backend: Mutex<Box<dyn MetadataBackend>>,
}

impl MetadataLog {
    /// Driver with the backend selected by configuration.
    pub fn open(root: impl Into<PathBuf>, config: &LogConfig) -> Self {
        let root = root.into();
        let backend: Box<dyn MetadataBackend> = match config.backend {
            LogBackendKind::Annex => Box::new(AnnexBatch::new(&root, &config.annex_command)),
            LogBackendKind::Git => Box::new(GitLog::new(&root, &config.branch)),
        };
        Self::with_backend(root, &config.branch, backend)
    }

    pub fn with_backend(
        root: impl Into<PathBuf>,
        branch: impl Into<String>,
        backend: Box<dyn MetadataBackend>,
    ) -> Self {
        Self {
            root: root.into(),
            branch: branch.into(),
            backend: Mutex::new(backend),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    fn backend(&self) -> Result<MutexGuard<'_, Box<dyn MetadataBackend>>> {
        self.backend
            .lock()
            .map_err(|_| Error::TransientStore("metadata backend lock poisoned".to_string()))
    }

    fn decode(fingerprint: &str, response: &BatchResponse) -> Result<TaskRecord> {
        TaskRecord::from_fields(fingerprint, &response.fields)
    }

    /// Current record of `fingerprint` (empty if never written).
    pub fn get(&self, fingerprint: &str) -> Result<TaskRecord> {
        let response = self.backend()?.exchange(&BatchRequest::read(fingerprint))?;
        Self::decode(fingerprint, &response)
    }

    /// Write the changed fields of `update`.
    ///
    /// Fields whose content digest equals the stored one are stripped; if
    /// nothing is left, nothing is sent. When something was written,
    /// `on_changed` receives the resulting full record.
    pub fn set(
        &self,
        fingerprint: &str,
        update: &RecordUpdate,
        on_changed: Option<&mut dyn FnMut(&TaskRecord) -> Result<()>>,
    ) -> Result<TaskRecord> {
        self.write(fingerprint, update, WriteMode::Overwrite, on_changed)
    }

    /// Like [`set`](Self::set), but only fields currently absent are
    /// written. Used for set-once fields at task creation.
    pub fn ensure(
        &self,
        fingerprint: &str,
        update: &RecordUpdate,
        on_changed: Option<&mut dyn FnMut(&TaskRecord) -> Result<()>>,
    ) -> Result<TaskRecord> {
        self.write(fingerprint, update, WriteMode::IfAbsent, on_changed)
    }

    fn write(
        &self,
        fingerprint: &str,
        update: &RecordUpdate,
        mode: WriteMode,
        on_changed: Option<&mut dyn FnMut(&TaskRecord) -> Result<()>>,
    ) -> Result<TaskRecord> {
        let mut fields = update.to_fields()?;
        let candidate = TaskRecord::from_fields(fingerprint, &fields)?;
        let wanted = candidate.field_digests()?;

        let record = {
            let mut backend = self.backend()?;
            let current_response = backend.exchange(&BatchRequest::read(fingerprint))?;
            let current = Self::decode(fingerprint, &current_response)?;
            let stored = current.field_digests()?;

            fields.retain(|name, _| {
                let stored_digest = stored.get(name.as_str());
                match mode {
                    WriteMode::IfAbsent => stored_digest.is_none(),
                    WriteMode::Overwrite => stored_digest != wanted.get(name.as_str()),
                }
            });

            if fields.is_empty() {
                debug!(fingerprint, "metadata unchanged; write elided");
                return Ok(current);
            }

            debug!(fingerprint, fields = ?fields.keys().collect::<Vec<_>>(), "writing metadata");
            let response = backend.exchange(&BatchRequest::write(fingerprint, fields))?;
            Self::decode(fingerprint, &response)?
        };

        if let Some(callback) = on_changed {
            callback(&record)?;
        }
        Ok(record)
    }

    /// Remove every field of `fingerprint`, then verify the removal landed.
    pub fn drop_key(&self, fingerprint: &str) -> Result<()> {
        let mut backend = self.backend()?;
        backend.remove_all(&protocol::log_key(fingerprint))?;

        let response = backend.exchange(&BatchRequest::read(fingerprint))?;
        let remaining = Self::decode(fingerprint, &response)?;
        if !remaining.is_empty() {
            return Err(Error::OperationFailed(format!(
                "metadata for {fingerprint} still present after removal"
            )));
        }
        Ok(())
    }

    /// Close the backend connection; it reconnects on next use.
    pub fn close(&self) -> Result<()> {
        self.backend()?.close()
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.root)?)
    }

    /// Tip of the log branch, or `None` before the first write.
    pub fn current_revision(&self) -> Result<Option<Revision>> {
        let repo = self.repo()?;
        let reference = format!("refs/heads/{}", self.branch);
        let result = match repo.find_reference(&reference) {
            Ok(reference) => Ok(Some(reference.peel_to_commit()?.id().to_string())),
            Err(err) if err.code() == ErrorCode::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        };
        result
    }

    /// Fingerprints whose metadata file differs between `from` and `to`.
    ///
    /// With no `from`, or a `from` that is not an ancestor of `to` (history
    /// rewritten), every key present at `to` is returned.
    pub fn changed_keys(&self, from: Option<&str>, to: &str) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let to_commit = repo.revparse_single(to)?.peel_to_commit()?;
        let to_tree = to_commit.tree()?;

        let from_tree = match from {
            Some(from) if from == to => return Ok(Vec::new()),
            Some(from) => match self.ancestor_tree(&repo, from, &to_commit)? {
                Some(tree) => Some(tree),
                None => {
                    warn!(from, to, "sync cursor is not an ancestor of the log tip; full rescan");
                    None
                }
            },
            None => None,
        };

        let diff = repo.diff_tree_to_tree(from_tree.as_ref(), Some(&to_tree), None)?;
        let mut keys = BTreeSet::new();
        for delta in diff.deltas() {
            let path = delta.new_file().path().or_else(|| delta.old_file().path());
            if let Some(fingerprint) = path.and_then(protocol::fingerprint_from_path) {
                keys.insert(fingerprint);
            }
        }
        Ok(keys.into_iter().collect())
    }

    fn ancestor_tree<'r>(
        &self,
        repo: &'r Repository,
        from: &str,
        to_commit: &git2::Commit<'r>,
    ) -> Result<Option<git2::Tree<'r>>> {
        let from_commit = match repo.revparse_single(from).and_then(|obj| obj.peel_to_commit()) {
            Ok(commit) => commit,
            Err(err) => {
                debug!(from, error = %err, "cursor revision not found");
                return Ok(None);
            }
        };
        if from_commit.id() != to_commit.id()
            && !repo.graph_descendant_of(to_commit.id(), from_commit.id())?
        {
            return Ok(None);
        }
        Ok(Some(from_commit.tree()?))
    }

    /// Digest of the key's stored metadata, computed from its raw bytes.
    ///
    /// Pending journal content wins over the committed branch blob. Both
    /// are git blob ids, so the digest is stable once the journal is
    /// committed. `None` if the key has never been stored.
    pub fn content_hash(&self, fingerprint: &str) -> Result<Option<String>> {
        let path = protocol::metadata_path_for(fingerprint);
        let repo = self.repo()?;

        let journal = repo
            .path()
            .join("annex")
            .join("journal")
            .join(protocol::journal_name(&path));
        if journal.exists() {
            let content = fs::read(&journal)?;
            return Ok(Some(hasher::blob_digest(&content)?));
        }

        let reference = format!("refs/heads/{}", self.branch);
        let tree = match repo.find_reference(&reference) {
            Ok(reference) => reference.peel_to_tree()?,
            Err(err) if err.code() == ErrorCode::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let result = match tree.get_path(Path::new(&path)) {
            Ok(entry) => Ok(Some(entry.id().to_string())),
            Err(err) if err.code() == ErrorCode::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        };
        result
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteMode {
    Overwrite,
    IfAbsent,
}
