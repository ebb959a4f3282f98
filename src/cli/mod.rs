//! Command-line interface for sak
//!
//! This module defines the CLI structure using clap derive macros. The
//! binary registers no namespaces, so every command works on raw log keys
//! and index rows.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::capture::CaptureRegistry;
use crate::config;
use crate::error::{Error, Result};
use crate::output::OutputOptions;
use crate::storage::Storage;

mod key;
mod status;

/// Name the CLI registers its single storage under
const STORAGE_NAME: &str = "default";

/// sak - content-addressed task memoization cache
///
/// Inspect and maintain a task store: a git-versioned metadata log and the
/// SQL index mirroring it.
#[derive(Parser, Debug)]
#[command(name = "sak")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Storage root (defaults to $HOME/sak)
    #[arg(long, global = true, env = "SAK_ROOT")]
    pub root: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show sync cursor, log tip and per-namespace row counts
    Status,

    /// Show the log record of a task
    Show {
        /// Task fingerprint
        fingerprint: String,
    },

    /// List tasks whose log entry changed between two revisions
    Changed {
        /// Start revision (defaults to the sync cursor; full scan if unset)
        #[arg(long)]
        from: Option<String>,

        /// End revision (defaults to the log tip)
        #[arg(long)]
        to: Option<String>,
    },

    /// Remove a task from the log and the index
    Drop {
        /// Task fingerprint
        fingerprint: String,
    },

    /// Clear the sync cursor so the next sync replays the whole log
    Rebuild,
}

impl Cli {
    /// Execute the CLI command
    pub fn run(self, capture: CaptureRegistry) -> Result<()> {
        let output = OutputOptions {
            json: self.json,
            quiet: self.quiet,
        };
        let storage = open_storage(self.root, capture)?;

        let result = match self.command {
            Commands::Status => status::run_status(&storage, output),
            Commands::Show { fingerprint } => key::run_show(&storage, &fingerprint, output),
            Commands::Changed { from, to } => key::run_changed(
                &storage,
                key::ChangedOptions { from, to },
                output,
            ),
            Commands::Drop { fingerprint } => key::run_drop(&storage, &fingerprint, output),
            Commands::Rebuild => status::run_rebuild(&storage, output),
        };
        storage.close()?;
        result
    }
}

fn open_storage(root: Option<PathBuf>, capture: CaptureRegistry) -> Result<Storage> {
    let root = match root {
        Some(root) => root,
        None => config::default_root()?,
    };
    if !root.join(".git").exists() {
        return Err(Error::StorageNotFound(root.display().to_string()));
    }
    Storage::open(STORAGE_NAME, root, capture)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["sak", "show", "abc", "--json", "--root", "/tmp/x"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/x")));
        assert!(matches!(cli.command, Commands::Show { fingerprint } if fingerprint == "abc"));
    }

    #[test]
    fn changed_revisions_are_optional() {
        let cli = Cli::try_parse_from(["sak", "changed", "--from", "r1"]).unwrap();
        match cli.command {
            Commands::Changed { from, to } => {
                assert_eq!(from.as_deref(), Some("r1"));
                assert_eq!(to, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn missing_root_is_storage_not_found() {
        let temp = tempfile::TempDir::new().unwrap();
        let err = open_storage(Some(temp.path().join("nope")), CaptureRegistry::new()).unwrap_err();
        assert!(matches!(err, Error::StorageNotFound(_)));
    }
}
