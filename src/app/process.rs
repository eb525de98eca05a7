//! Post-download command execution
//!
//! A transfer may carry a `post-download-command` metadata entry: a JSON
//! array whose first element is the program and the rest its arguments.
//! Every `$file` token is replaced with the final local path. The process
//! is spawned once the file is verified and its exit is reported back to
//! the manager loop as an engine message.

use std::path::Path;
use std::process::Stdio;

use serde_json::Value;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::engine::EngineSender;
use crate::app::transfer::{Metadata, TransferId};
use crate::constants::metadata;
use crate::errors::{ProcessFailure, TransferError, TransferResult};

/// Program and arguments taken from transfer metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostCommand {
    args: Vec<String>,
}

impl PostCommand {
    /// Read the command from metadata
    ///
    /// Returns `None` when no command is configured. Non-string array
    /// entries are rendered as JSON text.
    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        let value = metadata.get(metadata::COMMAND)?;
        let args = match value {
            Value::Array(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            Value::String(s) => s.split_whitespace().map(str::to_string).collect(),
            _ => Vec::new(),
        };
        Some(Self { args })
    }

    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Program and arguments with the file placeholder substituted
    pub fn substitute(&self, path: &Path) -> Vec<String> {
        let path = path.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace(metadata::FILE_PLACEHOLDER, &path))
            .collect()
    }
}

/// How a finished command ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Error describing an unsuccessful run
    pub fn into_error(self) -> TransferError {
        let (failure, message) = match self.exit_code {
            Some(code) => (
                ProcessFailure::NonZeroExit,
                format!("process exited with code {}", code),
            ),
            None => (ProcessFailure::Crashed, "process crashed".to_string()),
        };
        TransferError::Process {
            failure,
            exit_code: self.exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
            message,
        }
    }
}

/// Owning handle of a running post-download command
///
/// Dropping the handle kills the process; no exit message is sent then.
#[derive(Debug)]
pub struct ProcessHandle {
    task: JoinHandle<()>,
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn the command for a finished file
///
/// Spawn failures are returned synchronously; the exit of a started process
/// arrives later as an engine message addressed to `transfer`.
pub fn spawn_post_command(
    command: &PostCommand,
    path: &Path,
    transfer: TransferId,
    sender: EngineSender,
) -> TransferResult<ProcessHandle> {
    let mut args = command.substitute(path).into_iter();
    let program = args.next().ok_or_else(|| TransferError::Process {
        failure: ProcessFailure::FailedToStart,
        exit_code: None,
        stdout: String::new(),
        stderr: String::new(),
        message: "empty post-download command".to_string(),
    })?;
    let args: Vec<String> = args.collect();

    info!("Running post-download command {} {:?}", program, args);
    let child = Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| TransferError::Process {
            failure: ProcessFailure::FailedToStart,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            message: format!("{}: {}", program, e),
        })?;

    let task = tokio::spawn(async move {
        let outcome = match child.wait_with_output().await {
            Ok(output) => ProcessOutcome {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            },
            Err(e) => {
                warn!("Failed waiting for post-download command: {}", e);
                ProcessOutcome {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: e.to_string(),
                }
            }
        };
        debug!("Post-download command exited with {:?}", outcome.exit_code);
        sender.process_exited(transfer, outcome).await;
    });

    Ok(ProcessHandle { task })
}
