use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::time::{timeout, Duration};

use super::error::{PeerError, Result};
use super::peer::Peer;
use crate::config::PeerConfig;

impl Peer {
    /// Bind a peer to this process's stdin/stdout
    pub fn stdio(config: PeerConfig) -> Self {
        log::debug!("Creating peer on stdio");
        Self::new(tokio::io::stdin(), tokio::io::stdout(), config)
    }

    /// Spawn `command` with piped stdio and talk to it.
    ///
    /// The child's stderr is forwarded line by line to the log.
    pub fn spawn<S: AsRef<str>>(command: &str, args: &[S], config: PeerConfig) -> Result<(Self, Child)> {
        let args: Vec<&str> = args.iter().map(|arg| arg.as_ref()).collect();
        log::debug!("Spawning process: {} {:?}", command, args);

        let mut child = Command::new(command)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let peer = Self::from_child(&mut child, config)?;
        Ok((peer, child))
    }

    /// Take the piped stdin/stdout (and stderr, if piped) of an already spawned child
    pub fn from_child(child: &mut Child, config: PeerConfig) -> Result<Self> {
        let stdin = child.stdin.take().ok_or_else(|| {
            PeerError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "Child process stdin not available",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            PeerError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "Child process stdout not available",
            ))
        })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }

        Ok(Self::new(stdout, stdin, config))
    }
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    log::warn!("Child stderr: {}", trimmed);
                }
            }
            Ok(None) => {
                log::debug!("Child stderr EOF");
                break;
            }
            Err(e) => {
                log::debug!("Error reading stderr: {}", e);
                break;
            }
        }
    }
}

/// Wait up to `grace` for the child to exit, then kill it.
///
/// Returns the exit status when the child exited on its own.
pub async fn stop_child(child: &mut Child, grace: Duration) -> Result<Option<ExitStatus>> {
    match timeout(grace, child.wait()).await {
        Ok(status) => {
            let status = status?;
            log::debug!("Process exited with status: {:?}", status);
            Ok(Some(status))
        }
        Err(_) => {
            log::warn!("Process didn't exit gracefully, killing");
            child.kill().await?;
            Ok(None)
        }
    }
}
