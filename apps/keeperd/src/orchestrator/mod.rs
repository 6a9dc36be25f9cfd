//! The backup orchestration state machine.
//!
//! A backup cycle is hold -> copy -> resume: ask the host to quiesce world
//! writes (`save hold`), poll until it reports the snapshot ready
//! (`save query` / "Data saved"), copy and reconcile the world files into a
//! staging directory, archive them, then re-enable writes (`save resume`).
//! Every step after the hold is driven by host console output, not by the
//! caller. The one hard safety rule: whatever happens during the copy phase,
//! the host is never left holding the save barrier.

mod matcher;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use keeper_staging as staging;
use tokio::sync::{Mutex, broadcast};
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, info, warn};

use crate::config::BackupSettings;
use crate::console::{ConnectionEvent, ConsoleHandle};
use matcher::{HostResponse, SnapshotFile};

const CMD_SAVE_HOLD: &str = "save hold";
const CMD_SAVE_RESUME: &str = "save resume";
const CMD_SAVE_QUERY: &str = "save query";

const TEMP_DIR: &str = "temp";
const WORLDS_DIR: &str = "worlds";
const BACKUPS_DIR: &str = "backups";

const RESUME_RETRY_LIMIT: u32 = 3;
const RESUME_RETRY_DELAY: Duration = Duration::from_millis(1000);
const FINISHED_STATUS_DELAY: Duration = Duration::from_millis(2000);

type SharedState = Arc<Mutex<OrchestratorState>>;

#[derive(Debug, Default)]
struct OrchestratorState {
    /// Players currently connected. Saturating on disconnect; never negative.
    active_connections: u32,
    /// Activity occurred since the last completed cycle; overrides the
    /// no-activity skip policy and is set again when a cycle fails.
    pending_backup: bool,
    /// Consecutive busy responses for the current hold attempt.
    resume_retry: u32,
    /// Completion instant of the last successful copy phase.
    last_backup: Option<Instant>,
    /// Staging directory of the in-progress cycle, removed at cycle end.
    staging_dir: Option<PathBuf>,
    /// Single-in-flight-cycle guard, test-and-set at copy-phase entry.
    cycle_in_flight: bool,
}

/// Owns all backup state and the event-driven control logic. Cloning yields
/// another handle onto the same state; detached tasks (event dispatch, the
/// periodic timer, delayed one-shots, the copy phase) each hold one.
#[derive(Clone)]
pub struct BackupOrchestrator {
    console: ConsoleHandle,
    settings: Arc<BackupSettings>,
    server_root: PathBuf,
    world_name: String,
    state: SharedState,
}

impl BackupOrchestrator {
    /// Resolve the world name, clear leftover staging from an unclean
    /// shutdown, wire up the event streams, arm the periodic timer, and
    /// optionally run an immediate backup. Call once per process.
    pub async fn init(
        console: ConsoleHandle,
        lines: broadcast::Receiver<String>,
        connections: broadcast::Receiver<ConnectionEvent>,
        settings: BackupSettings,
        server_root: PathBuf,
    ) -> Result<BackupOrchestrator> {
        let world_name = staging::resolve_world_name(&server_root).await;
        info!(world = %world_name, root = %server_root.display(), "initializing backup orchestrator");

        if !settings.test_only {
            if let Err(err) = staging::remove_tree(&server_root.join(TEMP_DIR)).await {
                warn!("failed to clear leftover staging root: {err:#}");
            }
        }

        let orchestrator = BackupOrchestrator {
            console,
            settings: Arc::new(settings),
            server_root,
            world_name,
            state: SharedState::default(),
        };

        orchestrator.spawn_event_tasks(lines, connections);

        if let Some(minutes) = orchestrator.settings.interval.filter(|minutes| *minutes > 0) {
            orchestrator.spawn_interval_timer(minutes);
        }

        if orchestrator.settings.backup_on_start {
            orchestrator.state.lock().await.pending_backup = true;
            orchestrator.backup().await;
        }

        orchestrator.display_status("Initialized").await;
        Ok(orchestrator)
    }

    /// Entry point for all backup requests: manual, timer-driven, or
    /// activity-driven. Applies the spacing and activity policies, then
    /// submits `save hold` and returns; the rest of the cycle is driven by
    /// host responses.
    pub async fn backup(&self) {
        {
            let state = self.state.lock().await;

            if let Some(minutes) = self.settings.min_interval_between_backups {
                if let Some(last) = state.last_backup {
                    let elapsed = last.elapsed();
                    if elapsed < Duration::from_secs(minutes * 60) {
                        debug!(
                            elapsed_secs = elapsed.as_secs(),
                            "skipping backup, last cycle too recent"
                        );
                        return;
                    }
                }
            }

            if self.settings.skip_if_no_activity
                && state.active_connections == 0
                && !state.pending_backup
            {
                debug!("skipping backup, no activity since last cycle");
                return;
            }
        }

        self.console.execute_command(CMD_SAVE_HOLD);
    }

    fn spawn_event_tasks(
        &self,
        mut lines: broadcast::Receiver<String>,
        mut connections: broadcast::Receiver<ConnectionEvent>,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match lines.recv().await {
                    Ok(line) => this.handle_console_line(&line).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "console line stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match connections.recv().await {
                    Ok(event) => this.handle_connection_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "connection stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Periodic backup attempts for the lifetime of the process. There is no
    /// stop operation; the task dies with the runtime.
    fn spawn_interval_timer(&self, minutes: u64) {
        let this = self.clone();
        let period = Duration::from_secs(minutes * 60);
        info!(minutes, "arming periodic backup timer");
        tokio::spawn(async move {
            loop {
                sleep(period).await;
                debug!("periodic backup timer fired");
                this.backup().await;
            }
        });
    }

    async fn handle_console_line(&self, line: &str) {
        for response in matcher::classify(line) {
            match response {
                HostResponse::SaveBusy => self.handle_save_busy().await,
                HostResponse::SaveStarted => self.console.execute_command(CMD_SAVE_QUERY),
                HostResponse::SnapshotReady { files } => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.run_copy_phase(files).await;
                    });
                }
                HostResponse::SaveResumed => {
                    self.state.lock().await.resume_retry = 0;
                }
            }
        }
    }

    /// Bounded retry for a host that reports a save already in progress:
    /// resume it after a fixed delay and flag the backup for a later attempt.
    /// At the retry ceiling the stall is abandoned and the counter reset.
    async fn handle_save_busy(&self) {
        let mut state = self.state.lock().await;
        state.resume_retry += 1;
        if state.resume_retry < RESUME_RETRY_LIMIT {
            drop(state);
            let this = self.clone();
            tokio::spawn(async move {
                sleep(RESUME_RETRY_DELAY).await;
                this.console.execute_command(CMD_SAVE_RESUME);
                this.state.lock().await.pending_backup = true;
            });
        } else {
            warn!("save barrier still busy after {RESUME_RETRY_LIMIT} attempts, giving up");
            state.resume_retry = 0;
        }
    }

    async fn handle_connection_event(&self, event: ConnectionEvent) {
        let run_backup = {
            let mut state = self.state.lock().await;
            state.pending_backup = true;
            match event {
                ConnectionEvent::Connected => {
                    state.active_connections += 1;
                    self.settings.backup_on_player_connected
                }
                ConnectionEvent::Disconnected => {
                    state.active_connections = state.active_connections.saturating_sub(1);
                    self.settings.backup_on_player_disconnected
                }
            }
        };

        if run_backup {
            self.backup().await;
        }
    }

    /// The copy phase: stage, reconcile, archive, clean up, resume. Spawned
    /// per snapshot notification; duplicates arriving while a cycle is
    /// running are dropped by the in-flight guard.
    async fn run_copy_phase(&self, files: Vec<SnapshotFile>) {
        if self.settings.test_only {
            self.console.execute_command(CMD_SAVE_RESUME);
            return;
        }

        {
            let mut state = self.state.lock().await;
            if state.cycle_in_flight {
                warn!("snapshot reported while a copy phase is still running, ignoring");
                return;
            }
            state.cycle_in_flight = true;
            state.pending_backup = false;
        }

        self.display_status("Starting...").await;

        let result = self.stage_and_archive(&files).await;

        let staging_dir = self.state.lock().await.staging_dir.take();
        if let Some(dir) = staging_dir {
            if let Err(err) = staging::remove_tree(&dir).await {
                warn!("failed to remove staging directory {}: {err:#}", dir.display());
            }
        }

        {
            let mut state = self.state.lock().await;
            state.cycle_in_flight = false;
            match &result {
                Ok(_) => state.last_backup = Some(Instant::now()),
                Err(_) => state.pending_backup = true,
            }
        }

        // The host must never be left holding the save barrier.
        self.console.execute_command(CMD_SAVE_RESUME);

        match result {
            Ok(artifact) => {
                info!("backup finished: {}", artifact.display());
                let this = self.clone();
                tokio::spawn(async move {
                    sleep(FINISHED_STATUS_DELAY).await;
                    this.display_status("Finished!").await;
                });
            }
            Err(err) => warn!("backup cycle failed: {err:#}"),
        }
    }

    async fn stage_and_archive(&self, files: &[SnapshotFile]) -> Result<PathBuf> {
        let staging_dir = staging::create_staging_dir(
            &self.server_root.join(TEMP_DIR),
            &self.world_name,
            self.settings.staging_name.as_deref(),
        )
        .await?;
        self.state.lock().await.staging_dir = Some(staging_dir.clone());

        let source = self.server_root.join(WORLDS_DIR).join(&self.world_name);
        staging::copy_world(&source, &staging_dir.join(&self.world_name)).await?;

        for file in files {
            staging::truncate_file(&staging_dir.join(&file.relative_path), file.length).await?;
        }

        staging::archive_world(
            &staging_dir,
            &self.world_name,
            &self.server_root.join(BACKUPS_DIR),
        )
        .await
    }

    /// Broadcast a status word to connected players. With nobody connected
    /// this is a silent no-op; statuses are never queued.
    async fn display_status(&self, message: &str) {
        if self.state.lock().await.active_connections == 0 {
            return;
        }
        self.console.execute_command(&format!(
            r#"tellraw @a {{"rawtext": [{{"text": "§lBackup"}},{{"text": "§r {message}"}}]}}"#
        ));
    }
}
