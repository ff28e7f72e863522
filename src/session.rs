/// Spawning the supervised command with both output streams piped back to us.
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

/// A freshly started build command and the read ends of its output pipes.
///
/// The pipe ends are registered with tokio, so reads never block the loop.
#[derive(Debug)]
pub struct SpawnedChild {
    pub pid: i32,
    pub child: Child,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Errors that can occur while starting the supervised command.
#[derive(Debug)]
pub enum SpawnError {
    /// The command could not be started (not found, not executable, fork failure).
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// The child started but one of its output pipes is missing.
    Pipe { stream: &'static str },
    /// The child has no pid, meaning it was already reaped.
    Pid,
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::Spawn { command, source } => {
                write!(f, "failed to spawn {command}: {source}")
            }
            SpawnError::Pipe { stream } => write!(f, "failed to set up {stream} pipe"),
            SpawnError::Pid => write!(f, "spawned process has no pid"),
        }
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpawnError::Spawn { source, .. } => Some(source),
            SpawnError::Pipe { .. } | SpawnError::Pid => None,
        }
    }
}

/// Start `command` with `args`, located through `PATH` and run without a shell.
///
/// stdin is inherited; stdout and stderr go to pipes owned by the caller.
/// The child is not killed when its handle is dropped: tearing down the tree
/// is the escalator's job.
pub fn spawn(command: &str, args: &[String]) -> Result<SpawnedChild, SpawnError> {
    tracing::info!(command, args = ?args, "spawning build command");

    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false)
        .spawn()
        .map_err(|e| SpawnError::Spawn {
            command: command.to_string(),
            source: e,
        })?;

    let stdout = child
        .stdout
        .take()
        .ok_or(SpawnError::Pipe { stream: "stdout" })?;
    let stderr = child
        .stderr
        .take()
        .ok_or(SpawnError::Pipe { stream: "stderr" })?;
    let pid = child.id().ok_or(SpawnError::Pid)? as i32;

    tracing::debug!(pid, "build command started");
    Ok(SpawnedChild {
        pid,
        child,
        stdout,
        stderr,
    })
}
