//! Host side handle to a worker child process.

use anyhow::{Context as _, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

/// How to launch a worker binary.
///
/// Worker construction parameters go into `args`; parameters the host wants
/// to deliver to the worker's `load` hook go into `load` and travel in the
/// handshake frame.
#[derive(Clone, Debug)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub load: Value,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            load: Value::Null,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn load_params(mut self, load: Value) -> Self {
        self.load = load;
        self
    }
}

pub(crate) struct WorkerProcess {
    pub child: Child,
    pub stdin: BufWriter<ChildStdin>,
    pub stdout: BufReader<ChildStdout>,
}

/// Spawns a worker with piped stdio. The pipes are the transport; the
/// worker's stderr stays attached to the host's for logging.
pub(crate) fn spawn(command: &WorkerCommand) -> Result<WorkerProcess> {
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn worker {:?}", command.program))?;
    let stdin = child.stdin.take().context("worker stdin is not piped")?;
    let stdout = child.stdout.take().context("worker stdout is not piped")?;
    tracing::debug!(program = ?command.program, pid = ?child.id(), "spawned worker");
    Ok(WorkerProcess {
        child,
        stdin: BufWriter::new(stdin),
        stdout: BufReader::new(stdout),
    })
}
