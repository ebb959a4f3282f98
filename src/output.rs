//! Output rendering for the sak CLI.
//!
//! Every command produces a serializable report plus an optional
//! [`HumanOutput`]. With `--json` the report goes to stdout inside a
//! versioned envelope; otherwise the human form is printed.

use serde::Serialize;
use serde_json::Value;

use crate::error::{exit_codes, Error, Result};

pub const SCHEMA_VERSION: &str = "sak.v1";

#[derive(Debug, Clone, Copy)]
pub struct OutputOptions {
    pub json: bool,
    pub quiet: bool,
}

/// Plain-text rendering of a command's result.
#[derive(Debug, Clone, Default)]
pub struct HumanOutput {
    header: String,
    summary: Vec<(String, String)>,
    details: Vec<String>,
    warnings: Vec<String>,
    next_steps: Vec<String>,
}

impl HumanOutput {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            ..Self::default()
        }
    }

    pub fn push_summary(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.summary.push((key.into(), value.into()));
    }

    pub fn push_detail(&mut self, value: impl Into<String>) {
        self.details.push(value.into());
    }

    pub fn push_warning(&mut self, value: impl Into<String>) {
        self.warnings.push(value.into());
    }

    pub fn push_next_step(&mut self, value: impl Into<String>) {
        self.next_steps.push(value.into());
    }

    /// Header, aligned summary, indented details, then warnings and hints.
    pub fn render(&self) -> String {
        let mut out = vec![self.header.clone()];

        let width = self.summary.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
        for (key, value) in &self.summary {
            out.push(format!("  {key:<width$}  {value}").trim_end().to_string());
        }
        if !self.details.is_empty() {
            out.push(String::new());
            out.extend(self.details.iter().map(|detail| format!("    {detail}")));
        }
        out.extend(self.warnings.iter().map(|warning| format!("warning: {warning}")));
        out.extend(self.next_steps.iter().map(|step| format!("next: {step}")));

        out.join("\n")
    }
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum Outcome<'a, T: Serialize> {
    Data(&'a T),
    Error(ErrorBody),
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    code: i32,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    schema_version: &'static str,
    command: &'a str,
    status: &'static str,
    #[serde(flatten)]
    outcome: Outcome<'a, T>,
    #[serde(skip_serializing_if = "is_empty")]
    warnings: &'a [String],
    #[serde(skip_serializing_if = "is_empty")]
    next_steps: &'a [String],
}

fn is_empty(items: &&[String]) -> bool {
    items.is_empty()
}

fn print_envelope<T: Serialize>(envelope: &Envelope<'_, T>) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(envelope)?);
    Ok(())
}

pub fn emit_success<T: Serialize>(
    options: OutputOptions,
    command: &str,
    data: &T,
    human: Option<&HumanOutput>,
) -> Result<()> {
    if options.json {
        return print_envelope(&Envelope {
            schema_version: SCHEMA_VERSION,
            command,
            status: "success",
            outcome: Outcome::Data(data),
            warnings: human.map(|h| h.warnings.as_slice()).unwrap_or_default(),
            next_steps: human.map(|h| h.next_steps.as_slice()).unwrap_or_default(),
        });
    }

    if let Some(human) = human.filter(|_| !options.quiet) {
        println!("{}", human.render());
    }
    Ok(())
}

pub fn emit_error(command: &str, err: &Error, json: bool) -> Result<()> {
    let next_steps = error_next_steps(err);
    if json {
        return print_envelope::<()>(&Envelope {
            schema_version: SCHEMA_VERSION,
            command,
            status: "error",
            outcome: Outcome::Error(ErrorBody {
                message: err.to_string(),
                code: err.exit_code(),
                kind: error_kind(err),
                details: err.details(),
            }),
            warnings: &[],
            next_steps: &next_steps,
        });
    }

    eprintln!("error: {err}");
    if let Some(step) = next_steps.first() {
        eprintln!("hint: {step}");
    }
    Ok(())
}

/// Best-effort command name for error envelopes, read before clap parses.
pub fn infer_command_name_from_args() -> String {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--root" {
            args.next();
        } else if !arg.starts_with('-') {
            return arg;
        }
    }
    "sak".to_string()
}

fn error_kind(err: &Error) -> &'static str {
    if err.exit_code() == exit_codes::USER_ERROR {
        "user_error"
    } else {
        "operation_failed"
    }
}

fn error_next_steps(err: &Error) -> Vec<String> {
    match err {
        Error::InvalidConfig(_) => vec!["fix .sak.toml then retry".to_string()],
        Error::StorageNotFound(_) => vec!["pass --root or set SAK_ROOT".to_string()],
        Error::TaskNotFound(_) => vec!["sak changed".to_string()],
        Error::CorruptRecord { fingerprint, .. } => vec![format!("sak drop {fingerprint}")],
        Error::TransientStore(_) | Error::LockFailed(_) => vec!["retry the command".to_string()],
        Error::ConsistencyGap { .. } => vec!["sak rebuild".to_string()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_output_aligns_summary() {
        let mut human = HumanOutput::new("sak status: /data");
        human.push_summary("log branch", "git-annex");
        human.push_summary("index", "present");
        human.push_detail("echo: 3 task(s)");
        human.push_warning("index is behind the log");

        let text = human.render();
        assert_eq!(
            text,
            "sak status: /data\n  log branch  git-annex\n  index       present\n\n    echo: 3 task(s)\nwarning: index is behind the log"
        );
    }

    #[test]
    fn envelope_flattens_outcome() {
        let data = serde_json::json!({"keys": 2});
        let envelope = Envelope {
            schema_version: SCHEMA_VERSION,
            command: "changed",
            status: "success",
            outcome: Outcome::Data(&data),
            warnings: &[],
            next_steps: &[],
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["data"]["keys"], 2);
        assert!(value.get("warnings").is_none());
    }

    #[test]
    fn errors_map_to_kind_and_hint() {
        assert_eq!(error_kind(&Error::TaskNotFound("x".into())), "user_error");
        assert_eq!(error_kind(&Error::TransientStore("x".into())), "operation_failed");
        assert_eq!(
            error_next_steps(&Error::corrupt("abc", "bad")),
            vec!["sak drop abc".to_string()]
        );
    }
}
