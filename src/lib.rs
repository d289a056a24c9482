//! A Raft consensus core: a replicated log kept consistent across a small,
//! static cluster despite leader failure, message loss, reordering and
//! duplication.
//!
//! The interesting parts are [`log::Log::append_entries`] (the only
//! operation that ever shortens a log), the pure role-transition table in
//! [`role`], and the single [`state::RaftState::handle`] entry point that
//! maps one incoming message to zero or more outgoing messages. Everything
//! else — framing, timers, sockets — is plumbing around that core and lives
//! in [`server`] and [`tcp`].

#[macro_use]
extern crate slog;
#[macro_use]
extern crate serde_derive;

pub mod codec;
pub mod config;
pub mod election;
pub mod error;
pub mod log;
pub mod logger;
pub mod progress;
pub mod role;
pub mod rpc;
pub mod server;
pub mod state;
pub mod storage;
pub mod tcp;

use std::path::Path;

use crate::error::Result;

/// Load configuration from `config_path`, restore durable state from the
/// configured snapshot file and run a single node until shutdown.
/// `id_override` replaces the configured node id, so several nodes can
/// share one config file.
pub async fn run<P: AsRef<Path>>(
    config_path: P,
    id_override: Option<config::NodeId>,
    shutdown: (
        tokio::sync::broadcast::Sender<()>,
        tokio::sync::broadcast::Receiver<()>,
    ),
) -> Result<()> {
    let config = config::RaftConfig::load(config_path, id_override)?;
    let logger = logger::get_root_logger().new(o!("id" => config.id));
    let storage = Box::new(storage::FileStorage::new(&config.state_file));
    let server = server::RaftServer::new(config, logger);
    server.run(storage, shutdown).await
}
