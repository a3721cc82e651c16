//! gpsstatsd: publishes gpsd receiver status to an MQTT topic
//!
//! Start-up order: configuration, logging, pid file, privilege drop, then the
//! event loop. Any failure before the loop starts exits non-zero.

mod config;
mod error;
mod event_loop;
mod logging;
mod pidfile;
mod privileges;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use gpsstats_driver::Orchestrator;
use tracing::{error, info};

use crate::config::{Config, ConfigProvider, DEFAULT_CONFIG_PATH};
use crate::error::DaemonError;
use crate::event_loop::MioHost;
use crate::pidfile::PidFile;

/// Bridges a gpsd receiver to an MQTT broker
#[derive(Parser, Debug)]
#[command(name = "gpsstatsd", version)]
#[command(about = "Publish GNSS receiver status from gpsd to MQTT", long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Debug logging (overrides RUST_LOG)
    #[arg(short = 'd', long)]
    debug: bool,

    /// Log to stderr instead of the log file
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Pid file
    ///
    /// Default: $XDG_RUNTIME_DIR/gpsstatsd.pid, or the temp dir
    #[arg(short = 'p', long = "pidfile")]
    pid_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let pid_path = args.pid_file.clone().unwrap_or_else(pidfile::default_path);
    let log_dir = pid_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);

    let _logging = match logging::init_logging(args.debug, args.foreground, &log_dir) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{}", DaemonError::Logging(e));
            return ExitCode::FAILURE;
        },
    };

    match run(&args, pid_path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            if !args.foreground {
                eprintln!("gpsstatsd: {}", e);
            }
            ExitCode::FAILURE
        },
    }
}

fn run(args: &Args, pid_path: PathBuf) -> Result<(), DaemonError> {
    info!("gpsstatsd {} starting", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&args.config)?;
    info!("Configuration loaded from {}", args.config.display());

    let pid_file = PidFile::acquire(&pid_path).map_err(|source| DaemonError::PidFile {
        path: pid_path.clone(),
        source,
    })?;
    info!("Pid file {}", pid_file.path().display());

    privileges::drop_privileges(&config.daemon)?;

    let provider = ConfigProvider::new(args.config.clone(), config);
    let mut orchestrator = Orchestrator::new(provider)?;
    let mut host = MioHost::new()?;
    host.run(&mut orchestrator)?;

    orchestrator.dump_stats();
    drop(pid_file);
    info!("gpsstatsd stopped");
    Ok(())
}
