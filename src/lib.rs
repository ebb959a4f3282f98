//! sak - content-addressed task memoization cache
//!
//! A task is identified by the fingerprint of its parameters. Its lifecycle
//! (PENDING, then SUCCESS or FAIL) and result metadata live in an
//! append-only, git-versioned metadata log; a SQL index mirrors the log for
//! fast queries and can always be rebuilt from it. A task that succeeded is
//! never run again unless forced.
//!
//! # Module Organization
//!
//! - `hasher`: canonical, order-independent parameter fingerprints
//! - `log`: metadata log driver and its batch backends
//! - `index`: SQL mirror (master table plus one satellite table per kind)
//! - `namespace`: task kinds, typed parameters and gap repair
//! - `storage`: one log plus its index, incremental sync
//! - `task`: per-task locking and the run state machine
//! - `capture`: per-thread capture of task output
//! - `context`: explicit registry of storages and namespaces
//! - `config`: configuration loading from `.sak.toml`
//! - `lock`: file locking and atomic writes
//! - `cli`, `output`: the `sak` maintenance binary
//!
//! # Example
//!
//! ```no_run
//! use sak::{ColumnDef, Context, RunContext, TaskKind, TaskParams};
//! use serde::{Deserialize, Serialize};
//! use std::io::Write;
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct Resize {
//!     path: String,
//!     width: i64,
//! }
//!
//! impl TaskParams for Resize {
//!     fn columns() -> Vec<ColumnDef> {
//!         vec![ColumnDef::text("path"), ColumnDef::integer("width")]
//!     }
//! }
//!
//! struct ResizeKind;
//!
//! impl TaskKind for ResizeKind {
//!     type Params = Resize;
//!
//!     fn name(&self) -> &str {
//!         "resize"
//!     }
//!
//!     fn run(&self, params: &Resize, ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
//!         writeln!(ctx, "resizing {} to {}", params.path, params.width)?;
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> sak::Result<()> {
//! let mut context = Context::new(Default::default());
//! context.open_storage("main", "/data/sak")?;
//! let resize = context.register_namespace("main", ResizeKind)?;
//!
//! let mut task = resize.task(Resize { path: "a.png".into(), width: 640 })?;
//! task.run(Default::default())?;
//! context.sync("main")?;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod hasher;
pub mod index;
pub mod lock;
pub mod log;
pub mod namespace;
pub mod output;
pub mod storage;
pub mod task;

pub use capture::CaptureRegistry;
pub use context::Context;
pub use error::{Error, Result};
pub use hasher::{CanonicalHash, TaskKey};
pub use index::{ColumnDef, ColumnType};
pub use log::{TaskRecord, TaskStatus};
pub use namespace::{Namespace, NamespaceHandle, TaskKind, TaskParams};
pub use storage::{Storage, SyncReport};
pub use task::{RunContext, RunOptions, RunOutcome, Task};
