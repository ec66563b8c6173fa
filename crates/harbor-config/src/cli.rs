//! Command-line argument parsing for Harbor hosts.

use std::path::PathBuf;

use clap::Parser;

use crate::{Config, DriveMode};

/// Harbor command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "harbor", about = "Harbor network service")]
pub struct CliArgs {
    /// Service name.
    #[arg(long)]
    pub name: Option<String>,

    /// Target ticks per second.
    #[arg(long)]
    pub fps: Option<u32>,

    /// Transport I/O worker threads.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Pump the service from the host loop instead of its own thread.
    #[arg(long)]
    pub external_drive: bool,

    /// Listen address.
    #[arg(long)]
    pub address: Option<String>,

    /// Listen port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Stop after this many seconds (runs until killed when absent).
    #[arg(long)]
    pub run_secs: Option<u64>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref name) = args.name {
            self.service.name = name.clone();
        }
        if let Some(fps) = args.fps {
            self.service.fps = fps;
        }
        if let Some(workers) = args.workers {
            self.service.worker_count = workers;
        }
        if args.external_drive {
            self.service.drive_mode = DriveMode::ExternalDrive;
        }
        if let Some(ref addr) = args.address {
            self.network.listen_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.network.port = port;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
