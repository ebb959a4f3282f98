//! `git annex metadata --batch` subprocess backend.
//!
//! One long-lived child process serves every request, which avoids paying
//! the git-annex startup cost per call. When the child has exited or a pipe
//! breaks, it is restarted and the request is retried once.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::log::protocol::{BatchRequest, BatchResponse, MetadataBackend};

const BATCH_ARGS: [&str; 5] = ["annex", "metadata", "--json", "--batch", "--fast"];

struct BatchProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl BatchProcess {
    fn spawn(command: &str, root: &Path) -> Result<Self> {
        let mut child = Command::new(command)
            .args(BATCH_ARGS)
            .current_dir(root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                Error::TransientStore(format!("failed to start {command} annex metadata: {err}"))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::TransientStore("annex metadata stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::TransientStore("annex metadata stdout unavailable".to_string()))?;

        debug!(pid = child.id(), root = %root.display(), "started annex metadata batch");
        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn round_trip(&mut self, line: &str) -> Result<String> {
        let transient = |err: std::io::Error| Error::TransientStore(format!("annex batch pipe: {err}"));

        self.stdin.write_all(line.as_bytes()).map_err(transient)?;
        self.stdin.write_all(b"\n").map_err(transient)?;
        self.stdin.flush().map_err(transient)?;

        let mut response = String::new();
        let read = self.stdout.read_line(&mut response).map_err(transient)?;
        if read == 0 {
            return Err(Error::TransientStore(
                "annex metadata batch closed its output".to_string(),
            ));
        }
        Ok(response)
    }

    fn shutdown(mut self) -> Result<()> {
        drop(self.stdin);
        self.child.wait()?;
        Ok(())
    }
}

/// Backend driving `git annex metadata --json --batch --fast`.
pub struct AnnexBatch {
    root: PathBuf,
    command: String,
    process: Option<BatchProcess>,
}

impl AnnexBatch {
    pub fn new(root: impl Into<PathBuf>, command: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            command: command.into(),
            process: None,
        }
    }

    fn process(&mut self) -> Result<&mut BatchProcess> {
        let alive = match self.process.as_mut() {
            Some(process) => process.is_alive(),
            None => false,
        };
        if !alive {
            if self.process.take().is_some() {
                warn!("annex metadata batch exited; restarting");
            }
            self.process = Some(BatchProcess::spawn(&self.command, &self.root)?);
        }
        self.process
            .as_mut()
            .ok_or_else(|| Error::TransientStore("annex metadata batch not running".to_string()))
    }

    fn try_exchange(&mut self, line: &str) -> Result<String> {
        let result = self.process()?.round_trip(line);
        if result.is_err() {
            if let Some(mut process) = self.process.take() {
                let _ = process.child.kill();
                let _ = process.child.wait();
            }
        }
        result
    }
}

impl MetadataBackend for AnnexBatch {
    fn exchange(&mut self, request: &BatchRequest) -> Result<BatchResponse> {
        let line = serde_json::to_string(request)?;
        let raw = match self.try_exchange(&line) {
            Ok(raw) => raw,
            Err(err) if err.is_transient() => {
                warn!(error = %err, key = %request.key, "retrying annex metadata request");
                self.try_exchange(&line)?
            }
            Err(err) => return Err(err),
        };

        let response: BatchResponse = serde_json::from_str(raw.trim_end())?;
        if !response.success {
            return Err(Error::OperationFailed(format!(
                "annex metadata rejected {}: {}",
                request.key,
                response.error_messages.join("; ")
            )));
        }
        Ok(response)
    }

    fn remove_all(&mut self, key: &str) -> Result<()> {
        let output = Command::new(&self.command)
            .args(["annex", "metadata", "--json", "--key", key, "--remove-all"])
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|err| Error::TransientStore(format!("failed to run annex metadata: {err}")))?;

        if !output.status.success() {
            return Err(Error::OperationFailed(format!(
                "annex metadata --remove-all failed for {key} ({})",
                output.status
            )));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        match self.process.take() {
            Some(process) => process.shutdown(),
            None => Ok(()),
        }
    }
}

impl Drop for AnnexBatch {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
