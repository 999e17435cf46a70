//! External filter processes
//!
//! A filter is a shell command wired as a byte transform for one relay
//! direction: the worker writes the payload into the command's stdin and a
//! pump task forwards whatever the command prints on stdout to the
//! destination socket. Exited children are reaped by a background task so a
//! worker never blocks on `wait`.

use crate::config::CHUNK_SIZE;
use crate::error::FilterError;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const SHELL: &str = "/bin/sh";

/// A running filter command with both of its pipes
#[derive(Debug)]
pub struct FilterProcess {
    command: String,
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl FilterProcess {
    /// Spawn `command` through the shell with piped stdin and stdout.
    ///
    /// Failure is reported to the caller only; it never takes down anything
    /// beyond the connection that asked for the filter.
    pub fn start(command: &str) -> Result<Self, FilterError> {
        let mut child = Command::new(SHELL)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| FilterError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or_else(|| FilterError::MissingPipe {
            command: command.to_string(),
            pipe: "stdin",
        })?;
        let stdout = child.stdout.take().ok_or_else(|| FilterError::MissingPipe {
            command: command.to_string(),
            pipe: "stdout",
        })?;

        debug!(command = %command, pid = ?child.id(), "Started filter process");

        Ok(Self {
            command: command.to_string(),
            child,
            stdin,
            stdout,
        })
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Split into the write channel, the read channel and the child handle
    pub fn into_parts(self) -> (ChildStdin, ChildStdout, FilterChild) {
        let child = FilterChild {
            command: self.command,
            child: self.child,
        };
        (self.stdin, self.stdout, child)
    }
}

/// The process half of a filter, kept only to be reaped
#[derive(Debug)]
pub struct FilterChild {
    command: String,
    child: Child,
}

impl FilterChild {
    /// Hand the child to a background reaper.
    ///
    /// The reaper waits up to `grace` for the filter to exit on its own (its
    /// stdin should already be closed), then kills it. The exit status is
    /// returned through the join handle.
    pub fn reap(self, grace: Duration) -> JoinHandle<Option<ExitStatus>> {
        let FilterChild { command, mut child } = self;
        tokio::spawn(async move {
            let status = match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    debug!(command = %command, "Filter still running after {:?}, killing", grace);
                    if let Err(e) = child.start_kill() {
                        warn!(command = %command, "Failed to kill filter: {}", e);
                    }
                    child.wait().await
                }
            };

            match status {
                Ok(status) => {
                    debug!(command = %command, %status, "Filter process exited");
                    Some(status)
                }
                Err(e) => {
                    warn!(command = %command, "Failed to reap filter process: {}", e);
                    None
                }
            }
        })
    }
}

/// Copy a filter's output into the destination until either side is done.
///
/// Returns the number of bytes forwarded. The destination is shut down for
/// writing once the filter's output ends.
pub async fn pump<R, W>(mut output: R, mut destination: W) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = output.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        destination.write_all(&buffer[..n]).await?;
        total += n as u64;
    }

    let _ = destination.shutdown().await;
    Ok(total)
}
