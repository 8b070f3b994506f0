use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::supervisor::StartMode;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the measurement loop in the foreground
    Worker(Worker),
    /// Supervise a worker and publish live snapshots
    Serve(Serve),
    /// Send one command to a running supervisor
    Ctl(Ctl),
    /// Live terminal dashboard fed by a supervisor
    Watch {
        /// Observer feed address
        #[arg(long, default_value = "127.0.0.1:5757")]
        host: SocketAddr,
    },
}

#[derive(Parser, Clone, Debug)]
pub struct Worker {
    /// Continue the session recorded in the data directory
    #[arg(long)]
    pub resume: bool,

    /// Directory holding config, snapshot, log and signal files
    #[arg(long, default_value = "capwatch-data")]
    pub data_dir: PathBuf,
}

#[derive(Parser, Clone, Debug)]
pub struct Serve {
    /// Directory holding config, snapshot, log and signal files
    #[arg(long, default_value = "capwatch-data")]
    pub data_dir: PathBuf,

    /// Observer feed listen address
    #[arg(long, default_value = "127.0.0.1:5757")]
    pub host: SocketAddr,

    /// Control listen address
    #[arg(long, default_value = "127.0.0.1:5758")]
    pub control: SocketAddr,

    /// Start a worker as soon as the supervisor is up
    #[arg(long, value_enum)]
    pub autostart: Option<StartMode>,
}

#[derive(Parser, Clone, Debug)]
pub struct Ctl {
    /// Supervisor control address
    #[arg(long, default_value = "127.0.0.1:5758")]
    pub control: SocketAddr,

    #[command(subcommand)]
    pub command: CtlCommand,
}

#[derive(Subcommand, Clone, Debug, PartialEq)]
pub enum CtlCommand {
    /// Start a fresh session
    Start {
        /// JSON settings to apply first, e.g. '{"data_cap_gb": 500}'
        #[arg(long)]
        config: Option<String>,
    },
    /// Continue the previous session
    ResumeSession,
    Stop,
    Pause,
    Resume,
    /// Current reconciled snapshot
    Stats,
    /// Current settings
    Config,
    /// Update settings
    SaveConfig {
        /// JSON object with the fields to change
        config: String,
    },
    /// Stop the worker and zero the snapshot
    Reset,
    ClearErrors,
    ClearLogs,
    /// Whether a previous session has progress to continue
    CanResume,
}
