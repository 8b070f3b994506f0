use std::io::{BufRead, BufReader};
use std::net::{SocketAddr, TcpStream};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel as channel;
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Style},
    widgets::{Block, Borders, Gauge, List, ListItem, Paragraph, Sparkline},
    Terminal,
};

use crate::net::server::ObserverMessage;
use crate::session::Status;
use crate::snapshot::Snapshot;

enum FeedEvent {
    Snapshot(Box<Snapshot>),
    Connected,
    Disconnected,
}

/// `1h 02m 03s`, dropping leading zero units.
pub fn format_duration(secs: u64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

/// Sparkline bars in tenths of a megabit.
fn speed_series(snapshot: &Snapshot, width: usize) -> Vec<u64> {
    let skip = snapshot.data_points.len().saturating_sub(width);
    snapshot
        .data_points
        .iter()
        .skip(skip)
        .map(|p| (p.speed_mbps.max(0.0) * 10.0).round() as u64)
        .collect()
}

fn summary(snapshot: &Snapshot, connected: bool) -> String {
    let status = match (connected, snapshot.status) {
        (false, _) => "disconnected",
        (true, Status::Running) => "running",
        (true, Status::Paused) => "paused",
        (true, Status::Stopped) => "stopped",
    };
    let throttle = match (snapshot.throttle_detected, snapshot.baseline_speed) {
        (true, Some(b)) => format!("THROTTLED (baseline {b:.1} Mbps)"),
        (true, None) => "THROTTLED".to_string(),
        (false, Some(b)) => format!("normal (baseline {b:.1} Mbps)"),
        (false, None) => "establishing baseline".to_string(),
    };
    format!(
        "Status: {status}   Session: {}\nSpeed: {:.1} Mbps   Avg: {:.1}   Peak: {:.1}   Expected: {:.0}\nThrottle: {throttle}\nPerformance: {:.1}% close   {:.1}% below   {:.1}% above",
        format_duration(snapshot.session_duration),
        snapshot.speed_mbps,
        snapshot.avg_speed,
        snapshot.peak_speed,
        snapshot.expected_speed_mbps,
        snapshot.performance_stats.close_to_expected,
        snapshot.performance_stats.far_below_expected,
        snapshot.performance_stats.far_above_expected,
    )
}

fn spawn_feed(host: SocketAddr, stop: Arc<AtomicBool>) -> channel::Receiver<FeedEvent> {
    let (tx, rx) = channel::unbounded::<FeedEvent>();
    std::thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            let stream = match TcpStream::connect(host) {
                Ok(s) => s,
                Err(_) => {
                    std::thread::sleep(Duration::from_millis(800));
                    continue;
                }
            };
            let _ = stream.set_read_timeout(Some(Duration::from_millis(500)));
            let _ = tx.send(FeedEvent::Connected);
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            while !stop.load(Ordering::Relaxed) {
                match reader.read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        if let Ok(ObserverMessage::Snapshot(s)) = serde_json::from_str(line.trim()) {
                            let _ = tx.send(FeedEvent::Snapshot(s));
                        }
                        line.clear();
                    }
                    Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {}
                    Err(_) => break,
                }
            }
            let _ = tx.send(FeedEvent::Disconnected);
        }
    });
    rx
}

/// Entry point of the `watch` subcommand.
pub fn run_watch(host: SocketAddr) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let feed = spawn_feed(host, stop.clone());

    enable_raw_mode()?;
    let mut stdout = std::io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut latest = Snapshot::default();
    let mut connected = false;

    while !stop.load(Ordering::Relaxed) {
        while let Ok(ev) = feed.try_recv() {
            match ev {
                FeedEvent::Snapshot(s) => latest = *s,
                FeedEvent::Connected => connected = true,
                FeedEvent::Disconnected => connected = false,
            }
        }

        terminal.draw(|f| {
            let outer = Layout::default()
                .direction(Direction::Vertical)
                .constraints([
                    Constraint::Length(6), // Summary
                    Constraint::Length(3), // Data cap
                    Constraint::Length(8), // Speed chart
                    Constraint::Min(0),    // Errors
                    Constraint::Length(1), // Footer
                ].as_ref())
                .split(f.size());

            let header = Paragraph::new(summary(&latest, connected))
                .block(Block::default().title(format!("capwatch {host}")).borders(Borders::ALL));
            f.render_widget(header, outer[0]);

            let ratio = (latest.cap_percentage / 100.0).clamp(0.0, 1.0);
            let cap_color = if latest.cap_percentage >= 100.0 { Color::Red } else { Color::Green };
            let gauge = Gauge::default()
                .block(Block::default().title("Data cap").borders(Borders::ALL))
                .gauge_style(Style::default().fg(cap_color))
                .ratio(ratio)
                .label(format!(
                    "{:.3} GB of {:.0} GB ({:.1}%)",
                    latest.total_gb, latest.data_cap_gb, latest.cap_percentage
                ));
            f.render_widget(gauge, outer[1]);

            let series = speed_series(&latest, outer[2].width.saturating_sub(2) as usize);
            let chart = Sparkline::default()
                .block(Block::default().title("Speed (Mbps)").borders(Borders::ALL))
                .style(Style::default().fg(Color::Cyan))
                .data(&series);
            f.render_widget(chart, outer[2]);

            let items: Vec<ListItem> = latest
                .errors
                .iter()
                .rev()
                .map(|e| ListItem::new(format!("{} {}: {}", e.timestamp.format("%H:%M:%S"), e.target, e.message)))
                .collect();
            let errors = List::new(items).block(Block::default().title("Recent errors").borders(Borders::ALL));
            f.render_widget(errors, outer[3]);

            f.render_widget(Paragraph::new("q: quit"), outer[4]);
        })?;

        if event::poll(Duration::from_millis(200))? {
            if let Event::Key(key) = event::read()? {
                if key.code == KeyCode::Char('q')
                    || (key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL))
                {
                    stop.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{DataPoint, PerformanceCategory};
    use chrono::Utc;

    #[test]
    fn durations_read_naturally() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(59), "59s");
        assert_eq!(format_duration(61), "1m 01s");
        assert_eq!(format_duration(3723), "1h 02m 03s");
    }

    #[test]
    fn series_keeps_newest_points_that_fit() {
        let points = (0..10)
            .map(|i| DataPoint {
                timestamp: Utc::now(),
                speed_mbps: i as f64,
                total_gb: 0.0,
                performance_category: Some(PerformanceCategory::FarBelowExpected),
                expected_speed: 60.0,
            })
            .collect();
        let snapshot = Snapshot { data_points: points, ..Snapshot::default() };
        assert_eq!(speed_series(&snapshot, 3), vec![70, 80, 90]);
        assert_eq!(speed_series(&snapshot, 100).len(), 10);
    }

    #[test]
    fn summary_shows_throttle_verdict() {
        let snapshot = Snapshot {
            status: Status::Running,
            throttle_detected: true,
            baseline_speed: Some(95.0),
            ..Snapshot::default()
        };
        let text = summary(&snapshot, true);
        assert!(text.contains("Status: running"));
        assert!(text.contains("THROTTLED (baseline 95.0 Mbps)"));
        assert!(summary(&snapshot, false).contains("disconnected"));
    }
}
