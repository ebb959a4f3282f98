#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use git2::Repository;
use sak::config::{Config, LogBackendKind};
use sak::hasher::TaskKey;
use sak::log::record::{FieldMap, RecordUpdate};
use sak::log::{GitLog, MetadataBackend, TaskStatus};
use sak::log::protocol::BatchRequest;
use sak::{CaptureRegistry, ColumnDef, Context, Namespace, RunContext, Storage, TaskKind, TaskParams};
use serde::{Deserialize, Serialize};
use std::io::Write;
use tempfile::TempDir;

pub const STORAGE: &str = "main";
pub const BRANCH: &str = "git-annex";

pub struct TestStore {
    dir: TempDir,
    context: Context,
}

impl TestStore {
    /// Fresh git repository with a storage on the in-process log backend.
    pub fn init() -> Self {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let repo = Repository::init(dir.path()).expect("init repo");
        let mut cfg = repo.config().expect("repo config");
        cfg.set_str("user.name", "sak-test").expect("user.name");
        cfg.set_str("user.email", "sak-test@example.com").expect("user.email");

        let mut context = Context::new(CaptureRegistry::new());
        context
            .open_storage_with(STORAGE, dir.path(), git_config())
            .expect("open storage");
        Self { dir, context }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    pub fn storage(&self) -> Arc<Storage> {
        self.context.storage(STORAGE).expect("storage")
    }

    pub fn register_echo(&mut self) -> (Arc<Namespace<EchoKind>>, Arc<AtomicUsize>) {
        self.register_counting_echo(None)
    }

    pub fn register_counting_echo(
        &mut self,
        delay: Option<Duration>,
    ) -> (Arc<Namespace<EchoKind>>, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let namespace = self
            .context
            .register_namespace(STORAGE, EchoKind::counting(Arc::clone(&runs), delay))
            .expect("register echo");
        (namespace, runs)
    }

    /// Open a second, independent view of the same storage root.
    pub fn reopen(&self) -> Context {
        let mut context = Context::new(CaptureRegistry::new());
        context
            .open_storage_with(STORAGE, self.path(), git_config())
            .expect("reopen storage");
        context
    }

    /// Write a PENDING entry straight to the log, bypassing the index.
    pub fn write_log_key(&self, namespace: &str, params: &Echo) -> String {
        let key = TaskKey::from_params(params).expect("fingerprint");
        let fingerprint = key.fingerprint().to_string();
        let update = RecordUpdate::new()
            .fingerprint(fingerprint.as_str())
            .namespace(namespace)
            .key_data(key.into_data())
            .status(TaskStatus::Pending);
        self.storage()
            .log()
            .set(&fingerprint, &update, None)
            .expect("write log key");
        fingerprint
    }

    /// Write raw protocol fields for `fingerprint`, valid or not.
    pub fn write_raw_fields(&self, fingerprint: &str, pairs: &[(&str, &str)]) {
        let mut fields = FieldMap::new();
        for (name, value) in pairs {
            fields.insert(name.to_string(), vec![value.to_string()]);
        }
        let mut log = GitLog::new(self.path(), BRANCH);
        let response = log
            .exchange(&BatchRequest::write(fingerprint, fields))
            .expect("raw write");
        assert!(response.success);
    }

    /// Point tools that read `.sak.toml` (the CLI) at the same log.
    pub fn write_config(&self) {
        let contents = format!("[log]\nbackend = \"git\"\nbranch = \"{BRANCH}\"\n");
        std::fs::write(self.path().join(sak::config::CONFIG_FILE), contents).expect("write config");
    }

    pub fn index_path(&self) -> std::path::PathBuf {
        self.storage().index().path().to_path_buf()
    }
}

pub fn git_config() -> Config {
    let mut config = Config::default();
    config.log.backend = LogBackendKind::Git;
    config.log.branch = BRANCH.to_string();
    config.sync.batch_size = 4;
    config
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Echo {
    pub a: i64,
    pub b: String,
}

impl Echo {
    pub fn new(a: i64, b: &str) -> Self {
        Self { a, b: b.to_string() }
    }
}

impl TaskParams for Echo {
    fn columns() -> Vec<ColumnDef> {
        vec![ColumnDef::integer("a"), ColumnDef::text("b")]
    }
}

/// Echoes its parameters. Run args `fail` and `panic` make it misbehave.
pub struct EchoKind {
    runs: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

impl EchoKind {
    pub fn new() -> Self {
        Self::counting(Arc::new(AtomicUsize::new(0)), None)
    }

    pub fn counting(runs: Arc<AtomicUsize>, delay: Option<Duration>) -> Self {
        Self { runs, delay }
    }
}

impl TaskKind for EchoKind {
    type Params = Echo;

    fn name(&self) -> &str {
        "echo"
    }

    fn run(&self, params: &Echo, ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        writeln!(ctx, "echo {} {}", params.a, params.b)?;
        if ctx.arg::<bool>("panic")?.unwrap_or(false) {
            panic!("echo panicked on {}", params.a);
        }
        if ctx.arg::<bool>("fail")?.unwrap_or(false) {
            bail!("echo refused {}", params.a);
        }
        Ok(())
    }
}

/// A second kind with an incompatible parameter shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
}

impl TaskParams for Label {
    fn columns() -> Vec<ColumnDef> {
        vec![ColumnDef::text("name")]
    }
}

pub struct LabelKind;

impl TaskKind for LabelKind {
    type Params = Label;

    fn name(&self) -> &str {
        "label"
    }

    fn run(&self, params: &Label, ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
        writeln!(ctx, "label {}", params.name)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tagged {
    pub name: String,
    #[serde(serialize_with = "sak::hasher::sorted_set")]
    pub tags: HashSet<String>,
}

impl TaskParams for Tagged {
    fn columns() -> Vec<ColumnDef> {
        vec![ColumnDef::text("name"), ColumnDef::json("tags")]
    }
}

pub struct TaggedKind;

impl TaskKind for TaggedKind {
    type Params = Tagged;

    fn name(&self) -> &str {
        "tagged"
    }

    fn run(&self, params: &Tagged, ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
        writeln!(ctx, "tagged {} ({} tags)", params.name, params.tags.len())?;
        Ok(())
    }
}
