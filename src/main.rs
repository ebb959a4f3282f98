//! sak - content-addressed task memoization cache
//!
//! Maintenance CLI over a task store: inspect log records, list changed
//! keys, drop tasks and reset the index sync cursor.

use clap::Parser;
use sak::capture::CaptureRegistry;
use sak::cli::Cli;
use sak::output::{emit_error, infer_command_name_from_args};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() {
    // Tracing is opt-in via RUST_LOG.
    // Keep startup robust in CI/robot envs: ignore invalid/huge filters.
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|raw| {
            let raw = raw.trim();
            if raw.is_empty() || raw.len() > 4096 {
                return None;
            }
            EnvFilter::try_new(raw).ok()
        })
        .unwrap_or_else(|| EnvFilter::new("off"));

    let capture = CaptureRegistry::new();
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .with(capture.layer())
        .init();

    let command = infer_command_name_from_args();
    let cli = Cli::parse();
    let json = cli.json;
    if let Err(err) = cli.run(capture) {
        let _ = emit_error(&command, &err, json);
        std::process::exit(err.exit_code());
    }
}
