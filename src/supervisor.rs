use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use chrono::Utc;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{Config, ConfigError, ConfigPatch, ConfigStore, DataDir};
use crate::session::Status;
use crate::signals::{FileSignals, Signal, SignalChannel};
use crate::snapshot::{Snapshot, SnapshotStore};

const START_GRACE: Duration = Duration::from_millis(500);
const STOP_TIMEOUT: Duration = Duration::from_secs(8);
const EXIT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("launching worker {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("worker exited immediately ({status})")]
    ExitedImmediately { status: ExitStatus },
    #[error("worker is not running")]
    NotRunning,
    #[error("signalling worker: {0}")]
    Signal(#[source] io::Error),
    #[error("waiting for worker: {0}")]
    Wait(#[source] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartMode {
    Fresh,
    Resume,
}

#[derive(Debug, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    AlreadyRunning,
}

#[derive(Debug, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Exited(ExitStatus),
    Killed(ExitStatus),
}

/// How to launch the worker process.
#[derive(Clone, Debug)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    /// This executable's own `worker` subcommand.
    pub fn current_exe(data_dir: &DataDir) -> io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: vec!["worker".into(), "--data-dir".into(), data_dir.root().into()],
        })
    }

    fn command(&self, mode: StartMode) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if mode == StartMode::Resume {
            cmd.arg("--resume");
        }
        // the worker keeps its own log file
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        cmd
    }
}

/// Owns at most one worker child and reconciles what the snapshot claims
/// against whether that child is alive.
pub struct Supervisor {
    data_dir: DataDir,
    command: WorkerCommand,
    signals: FileSignals,
    snapshots: SnapshotStore,
    configs: ConfigStore,
    child: Option<Child>,
    start_grace: Duration,
    stop_timeout: Duration,
}

impl Supervisor {
    pub fn new(data_dir: DataDir, command: WorkerCommand) -> Self {
        Self {
            signals: FileSignals::new(data_dir.clone()),
            snapshots: SnapshotStore::new(data_dir.snapshot_path()),
            configs: ConfigStore::new(data_dir.config_path()),
            data_dir,
            command,
            child: None,
            start_grace: START_GRACE,
            stop_timeout: STOP_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, start_grace: Duration, stop_timeout: Duration) -> Self {
        self.start_grace = start_grace;
        self.stop_timeout = stop_timeout;
        self
    }

    /// Liveness of the child; a child found exited is reaped and forgotten.
    pub fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                info!(%status, "Worker exited");
                self.child = None;
                false
            }
            Err(e) => {
                warn!(?e, "Could not query worker status");
                self.child = None;
                false
            }
        }
    }

    pub fn start(&mut self, mode: StartMode) -> Result<StartOutcome, SupervisorError> {
        if self.is_running() {
            return Ok(StartOutcome::AlreadyRunning);
        }
        // refuse to launch against a config the worker would reject
        self.configs.load()?;
        std::fs::create_dir_all(self.data_dir.root())
            .map_err(|source| SupervisorError::Spawn { program: self.command.program.clone(), source })?;
        self.signals.clear_all();

        let mut child = self
            .command
            .command(mode)
            .spawn()
            .map_err(|source| SupervisorError::Spawn { program: self.command.program.clone(), source })?;
        let pid = child.id();

        std::thread::sleep(self.start_grace);
        match child.try_wait() {
            Ok(Some(status)) => {
                warn!(%status, "Worker exited during start");
                return Err(SupervisorError::ExitedImmediately { status });
            }
            Ok(None) => {}
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SupervisorError::Wait(e));
            }
        }

        info!(pid, ?mode, "Worker started");
        self.child = Some(child);
        Ok(StartOutcome::Started { pid })
    }

    /// Graceful termination, then a forced kill after the stop timeout.
    /// The child handle is dropped whatever happens.
    pub fn stop(&mut self) -> Result<StopOutcome, SupervisorError> {
        let Some(mut child) = self.child.take() else {
            return Ok(StopOutcome::NotRunning);
        };
        if let Some(status) = child.try_wait().map_err(SupervisorError::Wait)? {
            info!(%status, "Worker had already exited");
            return Ok(StopOutcome::Exited(status));
        }

        match request_termination(&child) {
            Ok(()) => {
                let deadline = Instant::now() + self.stop_timeout;
                while Instant::now() < deadline {
                    match child.try_wait() {
                        Ok(Some(status)) => {
                            info!(%status, "Worker stopped");
                            return Ok(StopOutcome::Exited(status));
                        }
                        Ok(None) => std::thread::sleep(EXIT_POLL),
                        Err(e) => {
                            warn!(?e, "Could not query worker status while stopping");
                            break;
                        }
                    }
                }
                warn!(timeout_secs = self.stop_timeout.as_secs_f64(), "Worker did not exit in time, killing it");
            }
            Err(e) => warn!(?e, "Graceful stop failed, killing worker"),
        }

        if let Err(e) = child.kill() {
            // it may have exited between the last poll and the kill
            warn!(?e, "Killing worker failed");
        }
        let status = child.wait().map_err(SupervisorError::Wait)?;
        Ok(StopOutcome::Killed(status))
    }

    pub fn pause(&mut self) -> Result<(), SupervisorError> {
        self.raise(Signal::Pause)
    }

    pub fn resume(&mut self) -> Result<(), SupervisorError> {
        self.raise(Signal::Resume)
    }

    fn raise(&mut self, signal: Signal) -> Result<(), SupervisorError> {
        if !self.is_running() {
            return Err(SupervisorError::NotRunning);
        }
        self.signals.raise(signal).map_err(SupervisorError::Signal)?;
        info!(?signal, "Signal sent to worker");
        Ok(())
    }

    /// The latest snapshot with its status corrected against liveness.
    /// A correction is written back so the next reader agrees.
    pub fn report(&mut self) -> Snapshot {
        let running = self.is_running();
        let mut snapshot = match self.snapshots.load() {
            Some(snapshot) => snapshot,
            None => {
                let mut empty = Snapshot::empty(&self.configs.load().unwrap_or_default());
                if running {
                    empty.status = Status::Running;
                }
                empty
            }
        };

        snapshot.worker_running = running;
        if snapshot.status.is_active() && !running {
            info!(reported = ?snapshot.status, "Worker is gone, marking session stopped");
            snapshot.status = Status::Stopped;
            self.snapshots.save(&snapshot);
        }
        snapshot
    }

    /// Stop the worker and start over from an empty snapshot.
    pub fn reset(&mut self) -> Result<StopOutcome, SupervisorError> {
        let outcome = self.stop()?;
        let config = self.configs.load()?;
        self.snapshots.save(&Snapshot::empty(&config));
        self.signals.clear_all();
        info!("Session reset");
        Ok(outcome)
    }

    pub fn clear_errors(&mut self) -> bool {
        match self.snapshots.load() {
            Some(mut snapshot) => {
                snapshot.errors.clear();
                snapshot.last_update = Some(Utc::now());
                self.snapshots.save(&snapshot)
            }
            None => true,
        }
    }

    pub fn clear_logs(&self) -> io::Result<()> {
        match std::fs::remove_file(self.data_dir.log_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn can_resume(&self) -> bool {
        self.snapshots.load().is_some_and(|s| s.has_progress())
    }

    pub fn config(&self) -> Result<Config, SupervisorError> {
        Ok(self.configs.load()?)
    }

    pub fn save_config(&self, patch: &ConfigPatch) -> Result<Config, SupervisorError> {
        let config = self.configs.apply(patch)?;
        info!("Configuration updated");
        Ok(config)
    }
}

#[cfg(unix)]
fn request_termination(child: &Child) -> io::Result<()> {
    use nix::sys::signal::{kill, Signal as OsSignal};
    use nix::unistd::Pid;

    kill(Pid::from_raw(child.id() as i32), OsSignal::SIGTERM).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn request_termination(_child: &Child) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "no graceful termination on this platform"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str) -> WorkerCommand {
        WorkerCommand {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    fn supervisor(dir: &std::path::Path, script: &str) -> Supervisor {
        Supervisor::new(DataDir::new(dir), shell(script))
            .with_timeouts(Duration::from_millis(300), Duration::from_secs(3))
    }

    #[test]
    fn report_corrects_stale_running_status_and_persists_it() {
        let dir = tempfile::tempdir().unwrap();
        let data = DataDir::new(dir.path());
        let store = SnapshotStore::new(data.snapshot_path());
        store.save(&Snapshot { status: Status::Running, total_gb: 3.0, ..Snapshot::default() });

        let mut sup = supervisor(dir.path(), "exit 0");
        let report = sup.report();
        assert_eq!(report.status, Status::Stopped);
        assert!(!report.worker_running);
        assert_eq!(report.total_gb, 3.0);

        assert_eq!(store.load().unwrap().status, Status::Stopped);
    }

    #[test]
    fn report_without_snapshot_is_empty_and_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), "exit 0");
        let report = sup.report();
        assert_eq!(report.status, Status::Stopped);
        assert_eq!(report.data_cap_gb, Config::default().data_cap_gb);
    }

    #[test]
    fn pause_requires_a_worker() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), "exit 0");
        assert!(matches!(sup.pause(), Err(SupervisorError::NotRunning)));
        assert!(!dir.path().join("pause.signal").exists());
    }

    #[test]
    fn can_resume_needs_progress() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), "exit 0");
        assert!(!sup.can_resume());

        let store = SnapshotStore::new(dir.path().join("data.json"));
        store.save(&Snapshot::default());
        assert!(!sup.can_resume());
        store.save(&Snapshot { session_duration: 120, ..Snapshot::default() });
        assert!(sup.can_resume());
    }

    #[test]
    fn clear_errors_keeps_everything_else() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("data.json"));
        let mut snap = Snapshot { total_gb: 7.5, ..Snapshot::default() };
        snap.errors.push(crate::session::ErrorEvent {
            timestamp: Utc::now(),
            message: "timeout".into(),
            target: "http://a".into(),
        });
        store.save(&snap);

        let mut sup = supervisor(dir.path(), "exit 0");
        assert!(sup.clear_errors());
        let after = store.load().unwrap();
        assert!(after.errors.is_empty());
        assert_eq!(after.total_gb, 7.5);
    }

    #[test]
    fn invalid_config_blocks_start() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.json"), r#"{"expected_speed_mbps": -1}"#).unwrap();
        let mut sup = supervisor(dir.path(), "sleep 30");
        assert!(matches!(sup.start(StartMode::Fresh), Err(SupervisorError::Config(_))));
        assert!(!sup.is_running());
    }

    #[cfg(unix)]
    #[test]
    fn start_is_idempotent_and_stop_is_graceful() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pause.signal"), b"").unwrap();
        let mut sup = supervisor(dir.path(), "sleep 30");

        assert!(matches!(sup.start(StartMode::Fresh), Ok(StartOutcome::Started { .. })));
        assert!(!dir.path().join("pause.signal").exists());
        assert_eq!(sup.start(StartMode::Fresh).unwrap(), StartOutcome::AlreadyRunning);
        assert!(sup.is_running());

        sup.pause().unwrap();
        assert!(dir.path().join("pause.signal").exists());

        assert!(matches!(sup.stop().unwrap(), StopOutcome::Exited(_)));
        assert!(!sup.is_running());
        assert_eq!(sup.stop().unwrap(), StopOutcome::NotRunning);
    }

    #[cfg(unix)]
    #[test]
    fn immediate_exit_is_a_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = supervisor(dir.path(), "exit 3");
        let err = sup.start(StartMode::Resume).unwrap_err();
        assert!(matches!(err, SupervisorError::ExitedImmediately { .. }));
        assert!(!sup.is_running());
    }

    #[cfg(unix)]
    #[test]
    fn stop_escalates_when_term_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut sup = Supervisor::new(DataDir::new(dir.path()), shell("trap '' TERM; sleep 30"))
            .with_timeouts(Duration::from_millis(150), Duration::from_millis(300));
        sup.start(StartMode::Fresh).unwrap();

        let started = Instant::now();
        assert!(matches!(sup.stop().unwrap(), StopOutcome::Killed(_)));
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(!sup.is_running());
    }

    #[cfg(unix)]
    #[test]
    fn report_marks_live_worker_running() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("data.json"));
        store.save(&Snapshot { status: Status::Paused, ..Snapshot::default() });

        let mut sup = supervisor(dir.path(), "sleep 30");
        sup.start(StartMode::Fresh).unwrap();
        let report = sup.report();
        assert_eq!(report.status, Status::Paused);
        assert!(report.worker_running);
        sup.stop().unwrap();

        assert_eq!(sup.report().status, Status::Stopped);
    }
}
