use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use crossbeam_channel as channel;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cli::Serve;
use crate::config::DataDir;
use crate::net::control::{lock, run_control_listener, try_lock};
use crate::snapshot::Snapshot;
use crate::state::ObserverSet;
use crate::supervisor::{StartOutcome, Supervisor, WorkerCommand};
#[cfg(feature = "mdns")]
use libmdns as _mdns;

/// Frames an observer may hold before it counts as too slow.
const OBSERVER_QUEUE: usize = 8;
const PUSH_INTERVAL: Duration = Duration::from_secs(2);

/// What observers receive, one JSON object per line.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ObserverMessage {
    Snapshot(Box<Snapshot>),
}

pub fn encode_frame(snapshot: Snapshot) -> Result<Bytes, serde_json::Error> {
    let mut buf = serde_json::to_vec(&ObserverMessage::Snapshot(Box::new(snapshot)))?;
    buf.push(b'\n');
    Ok(Bytes::from(buf))
}

/// Observer frames built from the supervisor's reconciled report. While a
/// start or stop holds the supervisor, the last frame is served instead.
struct FrameSource {
    supervisor: Arc<Mutex<Supervisor>>,
    last: Mutex<Option<Bytes>>,
}

impl FrameSource {
    fn new(supervisor: Arc<Mutex<Supervisor>>) -> Self {
        Self { supervisor, last: Mutex::new(None) }
    }

    fn current(&self) -> Option<Bytes> {
        let snapshot = match try_lock(&self.supervisor) {
            Some(mut supervisor) => supervisor.report(),
            None => {
                if let Some(frame) = lock(&self.last).clone() {
                    return Some(frame);
                }
                lock(&self.supervisor).report()
            }
        };
        match encode_frame(snapshot) {
            Ok(frame) => {
                *lock(&self.last) = Some(frame.clone());
                Some(frame)
            }
            Err(e) => {
                warn!(?e, "Encoding snapshot for observers failed");
                None
            }
        }
    }
}

pub fn run_serve(serve: Serve) -> Result<()> {
    let stop_flag = Arc::new(AtomicBool::new(false));
    {
        let stop = stop_flag.clone();
        let _ = ctrlc::set_handler(move || {
            stop.store(true, Ordering::Relaxed);
        });
    }

    let data_dir = DataDir::new(&serve.data_dir);
    std::fs::create_dir_all(data_dir.root())
        .with_context(|| format!("Creating data directory {}", data_dir.root().display()))?;
    let command = WorkerCommand::current_exe(&data_dir).context("Locating worker executable")?;

    let observers = TcpListener::bind(serve.host)
        .with_context(|| format!("Binding observer listener at {}", serve.host))?;
    let control = TcpListener::bind(serve.control)
        .with_context(|| format!("Binding control listener at {}", serve.control))?;

    let mut supervisor = Supervisor::new(data_dir, command);
    if let Some(mode) = serve.autostart {
        match supervisor.start(mode).context("Starting worker")? {
            StartOutcome::Started { pid } => info!(pid, ?mode, "Worker autostarted"),
            StartOutcome::AlreadyRunning => {}
        }
    }

    run_serve_with_shutdown(observers, control, supervisor, PUSH_INTERVAL, stop_flag)
}

pub(crate) fn run_serve_with_shutdown(
    listener: TcpListener,
    control: TcpListener,
    supervisor: Supervisor,
    push_interval: Duration,
    stop_flag: Arc<AtomicBool>,
) -> Result<()> {
    let host = listener.local_addr().context("Reading observer listener address")?;
    let control_addr = control.local_addr().context("Reading control listener address")?;
    info!(%host, control = %control_addr, "Starting capwatch supervisor");

    let supervisor = Arc::new(Mutex::new(supervisor));
    let frames = Arc::new(FrameSource::new(Arc::clone(&supervisor)));
    let observers = Arc::new(ObserverSet::new());

    let control_handle = {
        let supervisor = Arc::clone(&supervisor);
        let stop = stop_flag.clone();
        thread::spawn(move || run_control_listener(control, supervisor, stop))
    };

    // Periodic push: one reconciled snapshot to every observer
    let broadcaster = {
        let frames = Arc::clone(&frames);
        let observers = Arc::clone(&observers);
        let stop = stop_flag.clone();
        thread::spawn(move || {
            let mut next = Instant::now() + push_interval;
            while !stop.load(Ordering::Relaxed) {
                if Instant::now() < next {
                    thread::sleep(Duration::from_millis(50));
                    continue;
                }
                next += push_interval;
                if observers.is_empty() {
                    continue;
                }
                if let Some(frame) = frames.current() {
                    let summary = observers.push(&frame);
                    if summary.dropped() > 0 {
                        info!(
                            delivered = summary.delivered,
                            slow = summary.slow,
                            gone = summary.gone,
                            dropped_total = observers.dropped_total(),
                            "Push dropped observers"
                        );
                    } else {
                        debug!(delivered = summary.delivered, "Snapshot pushed");
                    }
                }
            }
        })
    };

    listener
        .set_nonblocking(true)
        .context("Setting observer listener non-blocking mode")?;

    // mDNS/Bonjour advertisement of the observer feed, optional via feature flag
    #[cfg(feature = "mdns")]
    let _mdns_guard: Option<(_mdns::Responder, _mdns::Service)> = match _mdns::Responder::new() {
        Ok(responder) => {
            let txt: [&str; 1] = ["provider=capwatch"];
            let service = responder.register("_capwatch._tcp".to_string(), "capwatch".to_string(), host.port(), &txt);
            Some((responder, service))
        }
        Err(e) => {
            warn!(error = ?e, "mDNS responder init failed; continuing without mDNS");
            None
        }
    };

    loop {
        if stop_flag.load(Ordering::Relaxed) {
            break;
        }
        let (stream, addr) = match listener.accept() {
            Ok(conn) => conn,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // avoid busy loop
                thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(e) => {
                warn!(?e, "Accept failed");
                continue;
            }
        };
        if let Err(e) = stream.set_nonblocking(false) {
            warn!(?e, %addr, "Failed to make observer stream blocking");
            continue;
        }
        let mut stream_reader = match stream.try_clone() {
            Ok(s) => s,
            Err(e) => {
                warn!(?e, %addr, "Cloning observer stream failed");
                continue;
            }
        };
        let mut stream_writer = stream;
        if let Err(e) = stream_writer.set_nodelay(true) {
            warn!(?e, %addr, "Failed to set TCP_NODELAY on observer");
        }
        if let Err(e) = stream_reader.set_read_timeout(Some(Duration::from_millis(500))) {
            warn!(?e, %addr, "Failed to set read timeout on observer");
        }
        info!(%addr, "Observer connected");

        let (to_tcp_tx, to_tcp_rx) = channel::bounded::<Bytes>(OBSERVER_QUEUE);
        observers.join(addr, to_tcp_tx, frames.current());

        // Observer reader: only watches for hang-up, input is ignored
        let stop_conn = stop_flag.clone();
        let tcp_reader = thread::spawn(move || {
            let mut buffer = [0u8; 512];
            while !stop_conn.load(Ordering::Relaxed) {
                match stream_reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {}
                    Err(e) => {
                        debug!(?e, %addr, "Observer read error");
                        break;
                    }
                }
            }
        });

        // Observer writer: queued frames -> TCP
        let stop_conn = stop_flag.clone();
        let tcp_writer = thread::spawn(move || {
            while !stop_conn.load(Ordering::Relaxed) {
                match to_tcp_rx.recv_timeout(Duration::from_millis(200)) {
                    Ok(frame) => {
                        if let Err(e) = stream_writer.write_all(&frame) {
                            warn!(?e, %addr, "Observer write error");
                            break;
                        }
                    }
                    Err(channel::RecvTimeoutError::Timeout) => {}
                    Err(channel::RecvTimeoutError::Disconnected) => break,
                }
            }
            // unblock the reader if we quit first
            let _ = stream_writer.shutdown(std::net::Shutdown::Both);
        });

        let observers_remove = Arc::clone(&observers);
        thread::spawn(move || {
            let _ = tcp_reader.join();
            // dropping the sender lets the writer exit
            observers_remove.leave(&addr);
            let _ = tcp_writer.join();
            info!(%addr, "Observer disconnected");
        });
    }

    // Shutdown
    info!("Shutting down");
    let _ = broadcaster.join();
    match control_handle.join() {
        Ok(Err(e)) => warn!(?e, "Control listener error on shutdown"),
        Ok(Ok(())) => {}
        Err(_) => warn!("Control listener panicked"),
    }
    match lock(&supervisor).stop() {
        Ok(outcome) => info!(?outcome, "Worker stopped on shutdown"),
        Err(e) => warn!(?e, "Stopping worker on shutdown failed"),
    }
    observers.dispose();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_supervisor_serves_the_last_frame() {
        let dir = tempfile::tempdir().unwrap();
        let command = WorkerCommand { program: "true".into(), args: Vec::new() };
        let supervisor = Arc::new(Mutex::new(Supervisor::new(DataDir::new(dir.path()), command)));
        let frames = FrameSource::new(Arc::clone(&supervisor));
        let first = frames.current().unwrap();

        // stands in for a stop waiting out its timeout
        let held = lock(&supervisor);
        let started = Instant::now();
        assert_eq!(frames.current(), Some(first));
        assert!(started.elapsed() < Duration::from_secs(1));
        drop(held);
    }
}

#[cfg(all(test, unix))]
mod itests {
    use super::*;
    use crate::net::control::{request, ControlRequest};
    use crate::session::Status;
    use std::io::{BufRead, BufReader};
    use std::net::{SocketAddr, TcpStream};
    use std::thread::JoinHandle;

    struct Running {
        host: SocketAddr,
        control: SocketAddr,
        stop: Arc<AtomicBool>,
        handle: JoinHandle<Result<()>>,
    }

    fn spawn_server(dir: &std::path::Path, push_interval: Duration) -> Running {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let control = TcpListener::bind("127.0.0.1:0").unwrap();
        let host = listener.local_addr().unwrap();
        let control_addr = control.local_addr().unwrap();
        let command = WorkerCommand { program: "sh".into(), args: vec!["-c".into(), "sleep 30".into()] };
        let supervisor =
            Supervisor::new(DataDir::new(dir), command).with_timeouts(Duration::from_millis(200), Duration::from_secs(3));
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let handle =
            thread::spawn(move || run_serve_with_shutdown(listener, control, supervisor, push_interval, stop_clone));
        Running { host, control: control_addr, stop, handle }
    }

    fn read_snapshot(reader: &mut BufReader<TcpStream>) -> Snapshot {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        match serde_json::from_str::<ObserverMessage>(&line).unwrap() {
            ObserverMessage::Snapshot(s) => *s,
        }
    }

    #[test]
    fn observer_gets_snapshot_on_connect_and_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let server = spawn_server(dir.path(), Duration::from_millis(150));

        let stream = TcpStream::connect(server.host).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut reader = BufReader::new(stream);

        let first = read_snapshot(&mut reader);
        assert_eq!(first.status, Status::Stopped);
        assert!(!first.worker_running);

        let started = request(server.control, &ControlRequest::Start { config: None }).unwrap();
        assert!(started.ok, "{started:?}");

        // a later push reflects the live worker
        let mut live = false;
        for _ in 0..20 {
            if read_snapshot(&mut reader).worker_running {
                live = true;
                break;
            }
        }
        assert!(live);

        server.stop.store(true, Ordering::Relaxed);
        server.handle.join().unwrap().unwrap();
    }

    #[test]
    fn one_dead_observer_does_not_stop_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let server = spawn_server(dir.path(), Duration::from_millis(100));

        let gone = TcpStream::connect(server.host).unwrap();
        let kept = TcpStream::connect(server.host).unwrap();
        kept.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut reader = BufReader::new(kept);
        read_snapshot(&mut reader);
        drop(gone);

        for _ in 0..3 {
            assert_eq!(read_snapshot(&mut reader).status, Status::Stopped);
        }

        server.stop.store(true, Ordering::Relaxed);
        server.handle.join().unwrap().unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn shutdown_stops_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let server = spawn_server(dir.path(), Duration::from_secs(2));
        let started = request(server.control, &ControlRequest::Start { config: None }).unwrap();
        let pid: u32 = started
            .message
            .as_deref()
            .and_then(|m| m.trim_end_matches(')').rsplit(' ').next())
            .and_then(|p| p.parse().ok())
            .unwrap();
        assert!(std::path::Path::new(&format!("/proc/{pid}")).exists());

        server.stop.store(true, Ordering::Relaxed);
        server.handle.join().unwrap().unwrap();

        assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
    }
}
