use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cli::CtlCommand;
use crate::config::ConfigPatch;
use crate::supervisor::{StartMode, StartOutcome, StopOutcome, Supervisor};

const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_POLL: Duration = Duration::from_millis(500);

/// One line of JSON from a controller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlRequest {
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config: Option<ConfigPatch>,
    },
    ResumeSession,
    Stop,
    Pause,
    Resume,
    Stats,
    Config,
    SaveConfig {
        config: ConfigPatch,
    },
    Reset,
    ClearErrors,
    ClearLogs,
    CanResume,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ControlResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self { ok: true, message: Some(message.into()), data: None }
    }

    fn data(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self { ok: true, message: None, data: Some(value) },
            Err(e) => Self::error(format!("encoding response: {e}")),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self { ok: false, message: Some(message.into()), data: None }
    }
}

impl TryFrom<CtlCommand> for ControlRequest {
    type Error = anyhow::Error;

    fn try_from(cmd: CtlCommand) -> Result<Self> {
        let patch = |raw: &str| ConfigPatch::from_json(raw).context("Parsing --config JSON");
        Ok(match cmd {
            CtlCommand::Start { config } => ControlRequest::Start {
                config: config.as_deref().map(patch).transpose()?,
            },
            CtlCommand::ResumeSession => ControlRequest::ResumeSession,
            CtlCommand::Stop => ControlRequest::Stop,
            CtlCommand::Pause => ControlRequest::Pause,
            CtlCommand::Resume => ControlRequest::Resume,
            CtlCommand::Stats => ControlRequest::Stats,
            CtlCommand::Config => ControlRequest::Config,
            CtlCommand::SaveConfig { config } => ControlRequest::SaveConfig { config: patch(&config)? },
            CtlCommand::Reset => ControlRequest::Reset,
            CtlCommand::ClearErrors => ControlRequest::ClearErrors,
            CtlCommand::ClearLogs => ControlRequest::ClearLogs,
            CtlCommand::CanResume => ControlRequest::CanResume,
        })
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `None` while someone else holds the lock.
pub(crate) fn try_lock<T>(mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match mutex.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

fn started(result: Result<StartOutcome, crate::supervisor::SupervisorError>) -> ControlResponse {
    match result {
        Ok(StartOutcome::Started { pid }) => ControlResponse::ok(format!("Worker started (pid {pid})")),
        Ok(StartOutcome::AlreadyRunning) => ControlResponse::ok("Worker already running"),
        Err(e) => ControlResponse::error(e.to_string()),
    }
}

fn stopped(outcome: &StopOutcome) -> &'static str {
    match outcome {
        StopOutcome::NotRunning => "Worker was not running",
        StopOutcome::Exited(_) => "Worker stopped",
        StopOutcome::Killed(_) => "Worker did not stop in time and was killed",
    }
}

pub fn handle(supervisor: &mut Supervisor, request: ControlRequest) -> ControlResponse {
    debug!(?request, "Control request");
    match request {
        ControlRequest::Start { config } => {
            if let Some(patch) = config.filter(|p| !p.is_empty()) {
                if let Err(e) = supervisor.save_config(&patch) {
                    return ControlResponse::error(e.to_string());
                }
            }
            started(supervisor.start(StartMode::Fresh))
        }
        ControlRequest::ResumeSession => started(supervisor.start(StartMode::Resume)),
        ControlRequest::Stop => match supervisor.stop() {
            Ok(outcome) => ControlResponse::ok(stopped(&outcome)),
            Err(e) => ControlResponse::error(e.to_string()),
        },
        ControlRequest::Pause => match supervisor.pause() {
            Ok(()) => ControlResponse::ok("Pause requested"),
            Err(e) => ControlResponse::error(e.to_string()),
        },
        ControlRequest::Resume => match supervisor.resume() {
            Ok(()) => ControlResponse::ok("Resume requested"),
            Err(e) => ControlResponse::error(e.to_string()),
        },
        ControlRequest::Stats => ControlResponse::data(supervisor.report()),
        ControlRequest::Config => match supervisor.config() {
            Ok(config) => ControlResponse::data(config),
            Err(e) => ControlResponse::error(e.to_string()),
        },
        ControlRequest::SaveConfig { config } => match supervisor.save_config(&config) {
            Ok(saved) => ControlResponse::data(saved),
            Err(e) => ControlResponse::error(e.to_string()),
        },
        ControlRequest::Reset => match supervisor.reset() {
            Ok(_) => ControlResponse::ok("Session reset"),
            Err(e) => ControlResponse::error(e.to_string()),
        },
        ControlRequest::ClearErrors => {
            if supervisor.clear_errors() {
                ControlResponse::ok("Errors cleared")
            } else {
                ControlResponse::error("Could not write snapshot")
            }
        }
        ControlRequest::ClearLogs => match supervisor.clear_logs() {
            Ok(()) => ControlResponse::ok("Logs cleared"),
            Err(e) => ControlResponse::error(format!("clearing logs: {e}")),
        },
        ControlRequest::CanResume => ControlResponse::data(serde_json::json!({
            "can_resume": supervisor.can_resume(),
        })),
    }
}

/// Answer one connection, one JSON line per request, until the peer hangs up.
fn serve_connection(stream: TcpStream, addr: SocketAddr, supervisor: Arc<Mutex<Supervisor>>, stop: Arc<AtomicBool>) {
    if let Err(e) = stream.set_read_timeout(Some(READ_POLL)) {
        warn!(?e, %addr, "Failed to set read timeout on control connection");
    }
    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(e) => {
            warn!(?e, %addr, "Cloning control stream failed");
            return;
        }
    };
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    while !stop.load(Ordering::Relaxed) {
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                let raw = line.trim();
                if !raw.is_empty() {
                    let response = match serde_json::from_str::<ControlRequest>(raw) {
                        Ok(request) => handle(&mut lock(&supervisor), request),
                        Err(e) => ControlResponse::error(format!("invalid request: {e}")),
                    };
                    let mut out = match serde_json::to_vec(&response) {
                        Ok(out) => out,
                        Err(e) => {
                            warn!(?e, "Encoding control response failed");
                            break;
                        }
                    };
                    out.push(b'\n');
                    if let Err(e) = writer.write_all(&out) {
                        warn!(?e, %addr, "Control write error");
                        break;
                    }
                }
                line.clear();
            }
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {}
            Err(e) => {
                warn!(?e, %addr, "Control read error");
                break;
            }
        }
    }
    debug!(%addr, "Control connection closed");
}

/// Accept controllers until `stop` is set.
pub fn run_control_listener(listener: TcpListener, supervisor: Arc<Mutex<Supervisor>>, stop: Arc<AtomicBool>) -> Result<()> {
    listener
        .set_nonblocking(true)
        .context("Setting control listener non-blocking mode")?;
    while !stop.load(Ordering::Relaxed) {
        let (stream, addr) = match listener.accept() {
            Ok(conn) => conn,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(e) => {
                warn!(?e, "Control accept failed");
                continue;
            }
        };
        if let Err(e) = stream.set_nonblocking(false) {
            warn!(?e, %addr, "Failed to make control stream blocking");
            continue;
        }
        info!(%addr, "Controller connected");
        let supervisor = Arc::clone(&supervisor);
        let stop = stop.clone();
        thread::spawn(move || serve_connection(stream, addr, supervisor, stop));
    }
    Ok(())
}

/// Send one request and wait for its answer.
pub fn request(addr: SocketAddr, request: &ControlRequest) -> Result<ControlResponse> {
    let mut stream = TcpStream::connect_timeout(&addr, Duration::from_secs(5))
        .with_context(|| format!("Connecting to control port {addr}"))?;
    stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
    let mut body = serde_json::to_vec(request)?;
    body.push(b'\n');
    stream.write_all(&body).context("Sending control request")?;

    let mut line = String::new();
    BufReader::new(stream)
        .read_line(&mut line)
        .context("Reading control response")?;
    if line.trim().is_empty() {
        bail!("Supervisor closed the connection without answering");
    }
    serde_json::from_str(line.trim()).context("Decoding control response")
}

/// Entry point of the `ctl` subcommand.
pub fn run_ctl(addr: SocketAddr, command: CtlCommand) -> Result<()> {
    let req = ControlRequest::try_from(command)?;
    let response = request(addr, &req)?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if !response.ok {
        bail!(response.message.unwrap_or_else(|| "request failed".to_string()));
    }
    Ok(())
}
