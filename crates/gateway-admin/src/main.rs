//! Offline admin CLI over a gateway's on-disk state: the operations exposed
//! through [`gateway_core::AdminApi`], reachable by operating directly on
//! the index and recording-coordinator files without a running daemon.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use gateway_core::{AdminApi, GatewayConfig, GatewayEngine};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gateway-admin")]
#[command(about = "Offline admin CLI for the FIX/FIXP session gateway")]
#[command(version)]
struct Args {
    /// Directory holding the gateway's sequence-number index, replay
    /// indexes, and recording coordinator state.
    #[arg(short, long)]
    log_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List every session the registry has a durable record of.
    ListSessions,
    /// Reset a session's sequence numbers back to zero.
    ResetSequenceNumber { session_id: u64 },
    /// Wipe all sequence-number and replay index state, backing it up first.
    ResetSessionIds {
        #[arg(short, long)]
        backup_dir: PathBuf,
    },
    /// Advance each recording's reachable start position.
    PruneArchive,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::new("info")).with_target(false).init();
    let args = Args::parse();

    let config = GatewayConfig::builder().log_file_dir(args.log_dir.clone()).build();
    let engine = match GatewayEngine::open(config) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("failed to open {:?}: {e}", args.log_dir);
            return ExitCode::from(1);
        }
    };

    let result = match args.command {
        Commands::ListSessions => {
            for s in engine.all_sessions() {
                println!("{:>6}  bound={:<5}  key={:?}", s.session_id, s.bound, s.key);
            }
            Ok(())
        }
        Commands::ResetSequenceNumber { session_id } => engine.reset_sequence_number(session_id).map_err(|e| e.to_string()),
        Commands::ResetSessionIds { backup_dir } => engine.reset_session_ids(&backup_dir).map_err(|e| e.to_string()),
        Commands::PruneArchive => match engine.prune_archive() {
            Ok(pruned) => {
                for (recording_id, start_position) in pruned {
                    println!("recording {recording_id}: start_position -> {start_position}");
                }
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::from(1)
        }
    }
}
