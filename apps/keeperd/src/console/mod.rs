//! Bridge to the bedrock_server process: owns its stdio, drains a command
//! channel into stdin, and republishes output lines and player presence
//! transitions on broadcast channels.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

const PLAYER_CONNECTED_MARKER: &str = "Player connected:";
const PLAYER_DISCONNECTED_MARKER: &str = "Player disconnected:";

/// A player presence transition observed on the server console. Identity is
/// opaque to the backup core; only the transition matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

/// Cheap cloneable handle for submitting console commands. Fire-and-forget:
/// commands are queued for the stdin writer task and delivery failures are
/// logged, never surfaced.
#[derive(Clone)]
pub struct ConsoleHandle {
    cmd_tx: mpsc::UnboundedSender<String>,
}

impl ConsoleHandle {
    pub(crate) fn new(cmd_tx: mpsc::UnboundedSender<String>) -> Self {
        Self { cmd_tx }
    }

    pub fn execute_command(&self, command: &str) {
        debug!(command, "submitting console command");
        if self.cmd_tx.send(command.to_string()).is_err() {
            warn!("console command channel closed, dropping {command:?}");
        }
    }
}

pub struct Console {
    child: Child,
    cmd_tx: mpsc::UnboundedSender<String>,
    line_tx: broadcast::Sender<String>,
    connection_tx: broadcast::Sender<ConnectionEvent>,
}

impl Console {
    /// Spawn the server executable with piped stdio rooted at `server_root`
    /// and start the writer/reader tasks.
    pub fn spawn(server_root: &Path, program: &str) -> Result<Console> {
        let mut child = Command::new(program)
            .current_dir(server_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn server process {program}"))?;

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<String>();
        let (line_tx, _) = broadcast::channel(1024);
        let (connection_tx, _) = broadcast::channel(64);

        let mut stdin = child.stdin.take().context("server stdin not piped")?;
        tokio::spawn(async move {
            while let Some(command) = cmd_rx.recv().await {
                if stdin.write_all(command.as_bytes()).await.is_err()
                    || stdin.write_all(b"\n").await.is_err()
                {
                    warn!("server stdin closed, stopping command writer");
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        if let Some(stdout) = child.stdout.take() {
            let lines_tx = line_tx.clone();
            let connections = connection_tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    println!("{line}");
                    if let Some(event) = classify_connection(&line) {
                        let _ = connections.send(event);
                    }
                    let _ = lines_tx.send(line);
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    eprintln!("{line}");
                }
            });
        }

        Ok(Console {
            child,
            cmd_tx,
            line_tx,
            connection_tx,
        })
    }

    pub fn handle(&self) -> ConsoleHandle {
        ConsoleHandle::new(self.cmd_tx.clone())
    }

    pub fn subscribe_lines(&self) -> broadcast::Receiver<String> {
        self.line_tx.subscribe()
    }

    pub fn subscribe_connections(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection_tx.subscribe()
    }

    /// Wait for the server process to exit.
    pub async fn wait(mut self) -> Result<std::process::ExitStatus> {
        self.child
            .wait()
            .await
            .context("Failed to wait for server process")
    }
}

fn classify_connection(line: &str) -> Option<ConnectionEvent> {
    if line.contains(PLAYER_CONNECTED_MARKER) {
        Some(ConnectionEvent::Connected)
    } else if line.contains(PLAYER_DISCONNECTED_MARKER) {
        Some(ConnectionEvent::Disconnected)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_presence_transitions() {
        assert_eq!(
            classify_connection("[INFO] Player connected: Steve, xuid: 2535400000000000"),
            Some(ConnectionEvent::Connected)
        );
        assert_eq!(
            classify_connection("[INFO] Player disconnected: Steve, xuid: 2535400000000000"),
            Some(ConnectionEvent::Disconnected)
        );
    }

    #[test]
    fn ignores_unrelated_lines() {
        assert_eq!(classify_connection("Server started."), None);
        assert_eq!(classify_connection("Saving..."), None);
    }
}
