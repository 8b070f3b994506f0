mod cli;
mod config;
mod meter;
mod net;
mod ring;
mod session;
mod signals;
mod snapshot;
mod state;
mod stats;
mod supervisor;
mod throttle;
mod ui;
mod worker;

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use tracing::error;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::config::{ConfigError, DataDir};
use crate::net::control::run_ctl;
use crate::net::server::run_serve;
use crate::supervisor::SupervisorError;
use crate::ui::watch::run_watch;
use crate::worker::run_worker;

/// stderr logging; with `log_file`, the same lines are appended there without colors.
fn init_tracing(default_level: &str, log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let file = log_file.and_then(|path| {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!("warning: cannot open log file {}: {e}", path.display());
                None
            }
        }
    });

    match file {
        Some(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(false)
            .with_writer(std::io::stderr.and(Arc::new(file)))
            .try_init()
            .ok(),
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
            .ok(),
    };
}

fn main() {
    let cli = Cli::parse();
    let result: Result<()> = match cli.command {
        Some(Commands::Worker(worker)) => {
            let data_dir = DataDir::new(worker.data_dir);
            init_tracing("info", Some(data_dir.log_path().as_path()));
            run_worker(data_dir, worker.resume)
        }
        Some(Commands::Serve(serve)) => {
            init_tracing("info", None);
            run_serve(serve)
        }
        Some(Commands::Ctl(ctl)) => {
            init_tracing("warn", None);
            run_ctl(ctl.control, ctl.command)
        }
        Some(Commands::Watch { host }) => {
            // keep log lines off the dashboard
            init_tracing("error", None);
            run_watch(host)
        }
        None => {
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(err) = result {
        // Map to stable exit codes
        let code = exit_code_for_error(&err);
        error!(code, "{err:#}");
        eprintln!("error: {err:?}");
        std::process::exit(code);
    }
}

pub(crate) fn exit_code_for_error(err: &anyhow::Error) -> i32 {
    // 2: configuration, 3: worker start failure, 4: bind failure, 1: other
    for cause in err.chain() {
        if cause.is::<ConfigError>() {
            return 2;
        }
        if let Some(sup) = cause.downcast_ref::<SupervisorError>() {
            return match sup {
                SupervisorError::Config(_) => 2,
                SupervisorError::Spawn { .. } | SupervisorError::ExitedImmediately { .. } => 3,
                _ => 1,
            };
        }
        if let Some(ioe) = cause.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind::*;
            return match ioe.kind() {
                AddrInUse | AddrNotAvailable | PermissionDenied => 4,
                _ => 1,
            };
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn exit_code_config_error() {
        let err = anyhow::Error::from(ConfigError::Invalid { field: "data_cap_gb", reason: "bad".into() });
        assert_eq!(exit_code_for_error(&err), 2);

        let wrapped = Err::<(), _>(SupervisorError::Config(ConfigError::Invalid {
            field: "test_urls",
            reason: "empty".into(),
        }))
        .context("Starting worker")
        .unwrap_err();
        assert_eq!(exit_code_for_error(&wrapped), 2);
    }

    #[test]
    fn exit_code_worker_start_failure() {
        let err = Err::<(), _>(SupervisorError::Spawn {
            program: "missing".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })
        .context("Starting worker")
        .unwrap_err();
        assert_eq!(exit_code_for_error(&err), 3);
    }

    #[test]
    fn exit_code_bind_like_io_error() {
        let err = Err::<(), _>(std::io::Error::from(std::io::ErrorKind::AddrInUse))
            .context("Binding observer listener at 127.0.0.1:5757")
            .unwrap_err();
        assert_eq!(exit_code_for_error(&err), 4);
    }

    #[test]
    fn exit_code_other() {
        let err = anyhow::anyhow!("other");
        assert_eq!(exit_code_for_error(&err), 1);
    }
}
