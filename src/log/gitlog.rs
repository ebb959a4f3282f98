//! In-process metadata backend that commits straight to the log branch.
//!
//! Speaks the same batch protocol and uses the same file layout as the
//! git-annex backend, but stores each metadata file as append-only JSON
//! lines:
//!
//! ```text
//! {"at":"2024-01-01T00:00:00.000000000Z","fields":{"status":["\"PENDING\""]}}
//! ```
//!
//! Later lines override earlier ones field by field; an empty value list
//! removes the field. Every effective write is one commit on the branch,
//! serialized across processes by `<git dir>/sak/log.lock`.

use std::path::{Path, PathBuf};

use chrono::Utc;
use git2::{Commit, Oid, Repository, Signature, Tree};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::lock::FileLock;
use crate::log::protocol::{metadata_path, BatchRequest, BatchResponse, MetadataBackend};
use crate::log::record::{format_time, FieldMap, FIELD_LAST_CHANGED};

const BLOB_MODE: i32 = 0o100644;
const TREE_MODE: i32 = 0o040000;
const COMMIT_NAME: &str = "sak";
const COMMIT_EMAIL: &str = "sak@localhost";

#[derive(Debug, Serialize, Deserialize)]
struct LogLine {
    at: String,
    fields: FieldMap,
}

/// Current state of one metadata file.
#[derive(Debug, Default)]
struct FoldedFile {
    fields: FieldMap,
    last_changed: Option<String>,
}

fn fold(content: &str) -> Result<FoldedFile> {
    let mut folded = FoldedFile::default();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let entry: LogLine = serde_json::from_str(line)?;
        for (name, values) in entry.fields {
            if values.is_empty() {
                folded.fields.remove(&name);
            } else {
                folded.fields.insert(name, values);
            }
        }
        folded.last_changed = Some(entry.at);
    }
    Ok(folded)
}

/// Backend writing metadata commits with libgit2.
pub struct GitLog {
    root: PathBuf,
    branch: String,
}

impl GitLog {
    pub fn new(root: impl Into<PathBuf>, branch: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            branch: branch.into(),
        }
    }

    fn branch_ref(&self) -> String {
        format!("refs/heads/{}", self.branch)
    }

    fn open(&self) -> Result<Repository> {
        Ok(Repository::open(&self.root)?)
    }

    fn lock_path(repo: &Repository) -> PathBuf {
        repo.path().join("sak").join("log.lock")
    }

    fn tip<'r>(&self, repo: &'r Repository) -> Result<Option<Commit<'r>>> {
        match repo.find_reference(&self.branch_ref()) {
            Ok(reference) => Ok(Some(reference.peel_to_commit()?)),
            Err(err) if err.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn read_file(repo: &Repository, tip: Option<&Commit<'_>>, path: &str) -> Result<String> {
        let Some(commit) = tip else {
            return Ok(String::new());
        };
        let tree = commit.tree()?;
        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(err) if err.code() == git2::ErrorCode::NotFound => return Ok(String::new()),
            Err(err) => return Err(err.into()),
        };
        let blob = repo.find_blob(entry.id())?;
        Ok(String::from_utf8_lossy(blob.content()).into_owned())
    }

    fn append(&self, key: &str, fields: FieldMap) -> Result<FoldedFile> {
        let repo = self.open()?;
        let _lock = FileLock::acquire_blocking(Self::lock_path(&repo))?;

        let tip = self.tip(&repo)?;
        let path = metadata_path(key);
        let mut content = Self::read_file(&repo, tip.as_ref(), &path)?;

        if fields.is_empty() {
            return fold(&content);
        }

        let line = LogLine {
            at: format_time(&Utc::now()),
            fields,
        };
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&serde_json::to_string(&line)?);
        content.push('\n');

        let blob = repo.blob(content.as_bytes())?;
        let base = match tip.as_ref() {
            Some(commit) => Some(commit.tree()?),
            None => None,
        };
        let parts: Vec<&str> = path.split('/').collect();
        let tree_id = write_path(&repo, base.as_ref(), &parts, blob)?;
        let tree = repo.find_tree(tree_id)?;

        let signature = Signature::now(COMMIT_NAME, COMMIT_EMAIL)?;
        let parents: Vec<&Commit<'_>> = tip.iter().collect();
        let commit = repo.commit(
            Some(&self.branch_ref()),
            &signature,
            &signature,
            "update",
            &tree,
            &parents,
        )?;
        debug!(%commit, key, "committed metadata update");

        fold(&content)
    }
}

/// Return the id of `base` with `parts` (a slash-split path) pointing at
/// `blob`, creating intermediate trees as needed.
fn write_path(repo: &Repository, base: Option<&Tree<'_>>, parts: &[&str], blob: Oid) -> Result<Oid> {
    let (head, rest) = parts
        .split_first()
        .ok_or_else(|| Error::InvalidArgument("empty metadata path".to_string()))?;

    let mut builder = repo.treebuilder(base)?;
    if rest.is_empty() {
        builder.insert(*head, blob, BLOB_MODE)?;
    } else {
        let child = match base.and_then(|tree| tree.get_name(head)) {
            Some(entry) => Some(repo.find_tree(entry.id())?),
            None => None,
        };
        let child_id = write_path(repo, child.as_ref(), rest, blob)?;
        builder.insert(*head, child_id, TREE_MODE)?;
    }
    Ok(builder.write()?)
}

impl MetadataBackend for GitLog {
    fn exchange(&mut self, request: &BatchRequest) -> Result<BatchResponse> {
        let folded = self.append(&request.key, request.fields.clone())?;
        let mut fields = folded.fields;
        if !fields.is_empty() {
            if let Some(at) = folded.last_changed {
                fields.insert(FIELD_LAST_CHANGED.to_string(), vec![at]);
            }
        }
        Ok(BatchResponse {
            key: Some(request.key.clone()),
            fields,
            success: true,
            error_messages: Vec::new(),
        })
    }

    fn remove_all(&mut self, key: &str) -> Result<()> {
        let current = self.append(key, FieldMap::new())?;
        if current.fields.is_empty() {
            return Ok(());
        }
        let cleared: FieldMap = current
            .fields
            .into_keys()
            .map(|name| (name, Vec::new()))
            .collect();
        self.append(key, cleared)?;
        Ok(())
    }
}
