//! sak show, changed and drop commands

use serde::Serialize;

use crate::error::{Error, Result};
use crate::log::TaskRecord;
use crate::output::{emit_success, HumanOutput, OutputOptions};
use crate::storage::Storage;

#[derive(Serialize)]
struct ShowReport<'a> {
    fingerprint: &'a str,
    content_hash: Option<String>,
    record: TaskRecord,
}

pub fn run_show(storage: &Storage, fingerprint: &str, output: OutputOptions) -> Result<()> {
    let record = storage.log().get(fingerprint)?;
    if record.is_empty() {
        return Err(Error::TaskNotFound(fingerprint.to_string()));
    }
    let content_hash = storage.log().content_hash(fingerprint)?;

    let mut human = HumanOutput::new(format!("sak show: {fingerprint}"));
    human.push_summary("namespace", record.namespace.clone().unwrap_or_default());
    human.push_summary("status", record.effective_status().to_string());
    if let Some(start) = record.start_time {
        human.push_summary("started", start.to_rfc3339());
    }
    if let Some(end) = record.end_time {
        human.push_summary("ended", end.to_rfc3339());
    }
    if let Some(key_data) = &record.key_data {
        for (name, value) in key_data {
            human.push_detail(format!("{name} = {value}"));
        }
    }
    if let Some(text) = record.log_text.as_deref().filter(|text| !text.is_empty()) {
        let lines = text.lines().count();
        human.push_summary("log", format!("{lines} line(s)"));
    }

    let report = ShowReport {
        fingerprint,
        content_hash,
        record,
    };
    emit_success(output, "show", &report, Some(&human))
}

pub struct ChangedOptions {
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Serialize)]
struct ChangedReport {
    from: Option<String>,
    to: Option<String>,
    keys: Vec<String>,
}

pub fn run_changed(storage: &Storage, options: ChangedOptions, output: OutputOptions) -> Result<()> {
    let from = match options.from {
        Some(from) => Some(from),
        None => storage.last_synced_revision()?,
    };
    let to = match options.to {
        Some(to) => Some(to),
        None => storage.log().current_revision()?,
    };
    let keys = match to.as_deref() {
        Some(to) => storage.log().changed_keys(from.as_deref(), to)?,
        None => Vec::new(),
    };

    let mut human = HumanOutput::new(format!("sak changed: {} key(s)", keys.len()));
    for key in &keys {
        human.push_detail(key.clone());
    }

    emit_success(output, "changed", &ChangedReport { from, to, keys }, Some(&human))
}

#[derive(Serialize)]
struct DropReport<'a> {
    fingerprint: &'a str,
    dropped: bool,
}

pub fn run_drop(storage: &Storage, fingerprint: &str, output: OutputOptions) -> Result<()> {
    storage.drop_key(fingerprint)?;

    let human = HumanOutput::new(format!("sak drop: {fingerprint} removed"));
    let report = DropReport {
        fingerprint,
        dropped: true,
    };
    emit_success(output, "drop", &report, Some(&human))
}
