//! Host process for the gateway engine.
//!
//! Loads a TOML configuration, opens a [`gateway_core::GatewayEngine`]
//! against its configured log directory, and runs the liveness-timer loop
//! until `SIGINT`/`SIGTERM`. Wire transport is an out-of-scope collaborator
//! here too: this binary proves the engine starts, recovers, and shuts down
//! cleanly; a real deployment wires a `Carrier` implementation in front of
//! it.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use config::DaemonConfig;
use gateway_core::GatewayEngine;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gateway-daemon")]
#[command(about = "FIX/FIXP session gateway engine host process")]
#[command(version)]
struct Args {
    /// Configuration file path (TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write an example configuration file and exit.
    GenConfig {
        #[arg(short, long, default_value = "gateway.toml")]
        output: PathBuf,
    },
    /// Validate a configuration file without starting the engine.
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Release);
}

fn install_signal_handlers() {
    // SAFETY: handle_signal only touches a single AtomicBool, which is
    // async-signal-safe; this mirrors the minimal signal-driven shutdown
    // flag pattern used by the other host binaries in this workspace.
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    if let Some(cmd) = args.command {
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
        };
    }

    let daemon_config = match args.config.as_deref() {
        Some(path) => match DaemonConfig::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("failed to load {path:?}: {e}");
                return ExitCode::from(2);
            }
        },
        None => DaemonConfig::default(),
    };

    let gateway_config = daemon_config.to_gateway_config();
    if let Err(e) = gateway_config.validate() {
        tracing::error!("invalid configuration: {e}");
        return ExitCode::from(2);
    }

    let engine = match GatewayEngine::open(gateway_config) {
        Ok(e) => e,
        Err(e) => {
            tracing::error!("failed to start engine: {e}");
            return ExitCode::from(1);
        }
    };

    install_signal_handlers();
    tracing::info!("gateway-daemon started");

    let heartbeat = Duration::from_secs(daemon_config.heartbeat_interval_secs.max(1));
    while !SHUTDOWN_REQUESTED.load(Ordering::Acquire) {
        for (session_id, actions) in engine.fix_timer_tick() {
            tracing::debug!(session_id, actions = actions.len(), "fix timer tick");
        }
        for (session_id, actions) in engine.fixp_timer_tick() {
            tracing::debug!(session_id, actions = actions.len(), "fixp timer tick");
        }
        std::thread::sleep(heartbeat.min(Duration::from_millis(200)));
    }

    tracing::info!("shutdown requested, draining");
    if daemon_config.flush_on_shutdown {
        if let Err(e) = engine.flush() {
            tracing::warn!("flush on shutdown failed: {e}");
            return ExitCode::from(1);
        }
    }
    ExitCode::SUCCESS
}

fn cmd_gen_config(output: PathBuf) -> ExitCode {
    let config = DaemonConfig::default();
    let text = match toml::to_string_pretty(&config) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!("failed to render config: {e}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = std::fs::write(&output, text) {
        tracing::error!("failed to write {output:?}: {e}");
        return ExitCode::from(1);
    }
    println!("wrote {}", output.display());
    ExitCode::SUCCESS
}

fn cmd_validate(path: PathBuf) -> ExitCode {
    let daemon_config = match DaemonConfig::from_file(&path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{path:?}: {e}");
            return ExitCode::from(2);
        }
    };
    match daemon_config.to_gateway_config().validate() {
        Ok(()) => {
            println!("{}: OK", path.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{path:?}: {e}");
            ExitCode::from(2)
        }
    }
}
