//! The admin command dispatcher.
//!
//! A single `NDS` entry point with four subcommands. SNAPSHOT and FLUSH
//! reply when the background child finishes, so the dispatcher hands the
//! caller a receiver instead of an answer; CLEARSTATS and PRELOAD reply
//! immediately. The `service` callback is the caller's event-loop dispatch,
//! invoked by long preload walks so other clients keep getting served.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::store::flush::flush_command;
use crate::store::snapshot::snapshot_command;
use crate::store::SpillStore;

/// A finished command reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok,
    Error(String),
}

/// What the dispatcher hands back: an answer now, or a channel the answer
/// arrives on when the background operation completes.
#[derive(Debug)]
pub enum Reply {
    Now(Response),
    Deferred(oneshot::Receiver<Response>),
}

/// A parsed admin subcommand.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NdsCommand {
    Snapshot,
    Flush,
    ClearStats,
    Preload,
}

impl NdsCommand {
    /// Parses an argument vector. Subcommands are case-insensitive and all
    /// take zero arguments.
    pub fn parse(argv: &[&str]) -> Result<Self> {
        let Some(sub) = argv.first() else {
            return Err(Error::BadSubcommand(String::new()));
        };
        let cmd = match sub.to_ascii_lowercase().as_str() {
            "snapshot" => NdsCommand::Snapshot,
            "flush" => NdsCommand::Flush,
            "clearstats" => NdsCommand::ClearStats,
            "preload" => NdsCommand::Preload,
            _ => return Err(Error::BadSubcommand(sub.to_string())),
        };
        if argv.len() != 1 {
            return Err(Error::BadArity(sub.to_string()));
        }
        Ok(cmd)
    }
}

/// Dispatches an `NDS` admin command.
pub fn nds_command(
    store: &Arc<SpillStore>,
    argv: &[&str],
    service: &mut dyn FnMut() -> Result<()>,
) -> Reply {
    let cmd = match NdsCommand::parse(argv) {
        Ok(cmd) => cmd,
        Err(e) => return Reply::Now(Response::Error(e.to_string())),
    };

    match cmd {
        NdsCommand::Snapshot => {
            tracing::info!("NDS SNAPSHOT requested");
            snapshot_command(store)
        }
        NdsCommand::Flush => {
            tracing::info!("NDS FLUSH requested");
            flush_command(store)
        }
        NdsCommand::ClearStats => {
            tracing::info!("NDS CLEARSTATS requested");
            store.stats().clear_cache_stats();
            Reply::Now(Response::Ok)
        }
        NdsCommand::Preload => {
            tracing::info!("NDS PRELOAD requested");
            match store.preload(service) {
                Ok(()) => Reply::Now(Response::Ok),
                Err(e) => Reply::Now(Response::Error(e.to_string())),
            }
        }
    }
}
