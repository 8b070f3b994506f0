use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigStore, DataDir, MAX_UPDATE_INTERVAL_SECS};
use crate::meter::{measure, HttpTransfer, Transfer, MAX_BYTES_PER_ATTEMPT};
use crate::session::{SessionState, Status};
use crate::signals::{FileSignals, Signal, SignalChannel};
use crate::snapshot::{Snapshot, SnapshotStore};

const PAUSED_LOG_EVERY: u64 = 30;
const MILESTONE_GB: f64 = 10.0;
const PAUSE_PEEK_INTERVAL: Duration = Duration::from_millis(250);
const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct LoopTiming {
    /// Pause between transfers, even successful ones.
    pub iteration_delay: Duration,
    pub paused_tick: Duration,
}

impl Default for LoopTiming {
    fn default() -> Self {
        Self {
            iteration_delay: Duration::from_millis(100),
            paused_tick: Duration::from_secs(1),
        }
    }
}

/// Run state owned by the loop: the stop flag set from the OS handler plus
/// the pause flag driven by the signal channel.
pub struct SessionControl {
    stop: Arc<AtomicBool>,
    paused: bool,
    signals: Box<dyn SignalChannel>,
    last_peek: Option<Instant>,
}

impl SessionControl {
    pub fn new(stop: Arc<AtomicBool>, signals: Box<dyn SignalChannel>) -> Self {
        Self { stop, paused: false, signals, last_peek: None }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Consume pending pause/resume requests. Duplicates are no-ops.
    pub fn poll_signals(&mut self) {
        let pause = self.signals.take(Signal::Pause);
        let resume = self.signals.take(Signal::Resume);
        if pause && !self.paused {
            self.paused = true;
            info!("Measurement paused");
        }
        if resume && self.paused {
            self.paused = false;
            info!("Measurement resumed");
        }
    }

    /// Checked between transfer chunks. The pause marker is only peeked at
    /// so the next `poll_signals` still sees it.
    pub fn interrupted(&mut self) -> bool {
        if self.stop_requested() {
            return true;
        }
        let due = self.last_peek.map_or(true, |t| t.elapsed() >= PAUSE_PEEK_INTERVAL);
        if due {
            self.last_peek = Some(Instant::now());
            return self.signals.is_raised(Signal::Pause);
        }
        false
    }

    /// Sleep for `total`, waking early on stop.
    fn idle(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.stop_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

/// Logs each new 10 GB step once the data cap has been reached.
struct CapMilestones {
    cap_gb: f64,
    last_logged: u64,
}

impl CapMilestones {
    fn new(cap_gb: f64) -> Self {
        Self { cap_gb, last_logged: 0 }
    }

    fn check(&mut self, total_gb: f64) -> Option<u64> {
        if total_gb < self.cap_gb {
            return None;
        }
        let milestone = ((total_gb / MILESTONE_GB).floor() * MILESTONE_GB) as u64;
        if milestone <= self.last_logged {
            return None;
        }
        self.last_logged = milestone;
        info!(total_gb, cap_gb = self.cap_gb, "Data usage is past the cap");
        Some(milestone)
    }
}

/// Gap between snapshot saves, clamped to what a `Duration` can hold.
fn save_interval(seconds: f64) -> Duration {
    let bounded = seconds.clamp(0.0, MAX_UPDATE_INTERVAL_SECS);
    if bounded != seconds {
        warn!(update_interval_seconds = seconds, "Save interval out of range, clamping");
    }
    Duration::try_from_secs_f64(bounded).unwrap_or(Duration::ZERO)
}

/// Drive transfers until stop is requested, then write the final snapshot.
pub fn run_loop<T: Transfer + ?Sized>(
    transfer: &T,
    config: &Config,
    state: &mut SessionState,
    store: &SnapshotStore,
    control: &mut SessionControl,
    timing: &LoopTiming,
) {
    let save_every = save_interval(config.update_interval_seconds);
    let mut last_save = Instant::now();
    let mut rotation = 0usize;
    let mut idle_ticks = 0u64;
    let mut milestones = CapMilestones::new(config.data_cap_gb);

    info!(
        targets = config.test_urls.len(),
        total_gb = state.total_gb(),
        "Entering measurement loop"
    );

    while !control.stop_requested() {
        control.poll_signals();

        if control.is_paused() {
            if idle_ticks % PAUSED_LOG_EVERY == 0 {
                info!("Paused, waiting for resume");
            }
            idle_ticks += 1;
            control.idle(timing.paused_tick);
            if last_save.elapsed() >= save_every {
                store.save(&Snapshot::capture(state, config, Status::Paused, Utc::now()));
                last_save = Instant::now();
            }
            continue;
        }
        idle_ticks = 0;

        milestones.check(state.total_gb());

        let Some(target) = config.test_urls.get(rotation % config.test_urls.len().max(1)) else {
            warn!("No measurement targets configured");
            break;
        };
        rotation = rotation.wrapping_add(1);

        debug!(url = %target, "Starting transfer");
        let m = measure(transfer, target, MAX_BYTES_PER_ATTEMPT, &mut || control.interrupted());
        let now = Utc::now();
        match &m.error {
            Some(e) => {
                warn!(url = %target, error = %e, "Transfer failed");
                state.record_error(e.clone(), target.clone(), now);
            }
            None if m.bytes > 0 => {
                let speed = m.speed_mbps();
                state.record_transfer(m.bytes, speed, now);
                info!(
                    speed_mbps = speed,
                    mib = m.bytes as f64 / (1024.0 * 1024.0),
                    total_gb = state.total_gb(),
                    "Transfer complete"
                );
            }
            None => warn!(url = %target, "No data received"),
        }

        if last_save.elapsed() >= save_every {
            store.save(&Snapshot::capture(state, config, Status::Running, now));
            last_save = Instant::now();
            debug!(session_secs = state.elapsed_secs(now), "Snapshot written");
        }

        control.idle(timing.iteration_delay);
    }

    store.save(&Snapshot::capture(state, config, Status::Stopped, Utc::now()));
    info!(total_gb = state.total_gb(), "Measurement loop stopped");
}

/// Entry point of the `worker` subcommand.
pub fn run_worker(data_dir: DataDir, resume: bool) -> Result<()> {
    std::fs::create_dir_all(data_dir.root())
        .with_context(|| format!("Creating data directory {}", data_dir.root().display()))?;
    let config = ConfigStore::new(data_dir.config_path()).load()?;
    let store = SnapshotStore::new(data_dir.snapshot_path());

    let now = Utc::now();
    let previous = if resume { store.load() } else { None };
    let mut state = match previous {
        Some(previous) => {
            info!(
                total_gb = previous.total_gb,
                session_secs = previous.session_duration,
                "Resuming previous session"
            );
            SessionState::resume(&previous, &config, now)
        }
        None => {
            if resume {
                info!("No previous session found, starting fresh");
            } else {
                info!("Starting fresh session");
            }
            SessionState::fresh(&config, now)
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        let _ = ctrlc::set_handler(move || {
            stop.store(true, Ordering::Relaxed);
        });
    }

    let transfer = HttpTransfer::new().context("Building HTTP client")?;
    let mut control = SessionControl::new(stop, Box::new(FileSignals::new(data_dir)));
    run_loop(&transfer, &config, &mut state, &store, &mut control, &LoopTiming::default());
    Ok(())
}
