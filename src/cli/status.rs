//! sak status and rebuild commands

use crate::error::Result;
use crate::output::{emit_success, HumanOutput, OutputOptions};
use crate::storage::Storage;

fn short(revision: Option<&str>) -> String {
    match revision {
        Some(revision) => revision.chars().take(12).collect(),
        None => "none".to_string(),
    }
}

pub fn run_status(storage: &Storage, output: OutputOptions) -> Result<()> {
    let status = storage.status()?;

    let mut human = HumanOutput::new(format!("sak status: {}", status.root.display()));
    human.push_summary("log branch", status.branch.clone());
    human.push_summary("log tip", short(status.current_revision.as_deref()));
    human.push_summary("synced to", short(status.last_synced.as_deref()));
    human.push_summary(
        "index",
        if status.index_present { "present" } else { "missing" },
    );
    for entry in &status.namespaces {
        human.push_detail(format!("{}: {} task(s)", entry.namespace, entry.tasks));
    }

    if !status.index_present {
        human.push_warning("index not built yet");
    } else if status.current_revision.is_some() && status.current_revision != status.last_synced {
        human.push_warning("index is behind the log");
        human.push_next_step("sync from an application with its namespaces registered");
    }

    emit_success(output, "status", &status, Some(&human))
}

#[derive(serde::Serialize)]
struct RebuildReport {
    cleared: bool,
}

pub fn run_rebuild(storage: &Storage, output: OutputOptions) -> Result<()> {
    storage.rebuild()?;

    let mut human = HumanOutput::new("sak rebuild: sync cursor cleared");
    human.push_next_step("the next sync replays the whole log");
    emit_success(output, "rebuild", &RebuildReport { cleared: true }, Some(&human))
}
