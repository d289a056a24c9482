//! The server shell: one actor owning the state, fed by a single queue.
//!
//! Three things put messages on that queue — the TCP accept loop, the
//! retry/response traffic of the handler itself, and the cycle timer. The
//! handler task is the only one that ever touches [`RaftState`]; timer and
//! sockets communicate with it exclusively through messages.

use std::collections::HashMap;
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;
use slog::Logger;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

use crate::config::{NodeId, RaftConfig};
use crate::error::{RaftError, Result};
use crate::role::Role;
use crate::rpc::Message;
use crate::state::RaftState;
use crate::storage::Storage;
use crate::tcp;

pub struct RaftServer {
    config: RaftConfig,
    logger: Logger,
}

impl RaftServer {
    pub fn new(config: RaftConfig, logger: Logger) -> RaftServer {
        RaftServer { config, logger }
    }

    /// Run until the shutdown channel fires. Binds the listener, spawns
    /// the per-peer writers and pumps the handler loop.
    pub async fn run(
        self,
        storage: Box<dyn Storage>,
        shutdown: (broadcast::Sender<()>, broadcast::Receiver<()>),
    ) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = shutdown;

        let listener = TcpListener::bind(&self.config.listen_addr()?).await?;
        info!(self.logger, "listening"; "addr" => self.config.listen_addr()?);

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (accept, accept_handle) = tcp::receive_task(
            self.logger.new(o!("task" => "accept")),
            listener,
            in_tx,
            shutdown_tx.subscribe(),
        )
        .remote_handle();
        tokio::spawn(accept);

        let mut peers = HashMap::new();
        let mut writer_handles = Vec::new();
        for node in self.config.nodes.iter().filter(|n| n.id != self.config.id) {
            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (writer, handle) = tcp::send_task(
                self.logger.new(o!("task" => "writer", "peer" => node.id)),
                node.addr(),
                out_rx,
                shutdown_tx.subscribe(),
            )
            .remote_handle();
            tokio::spawn(writer);
            peers.insert(node.id, out_tx);
            writer_handles.push(handle);
        }

        let state = RaftState::new(self.config.clone(), storage, self.logger.clone())?;
        let (pump, pump_handle) = pump(
            self.logger.new(o!("task" => "handler")),
            self.config,
            state,
            in_rx,
            peers,
            shutdown_rx,
        )
        .remote_handle();
        tokio::spawn(pump);

        let (_, _, _) = tokio::try_join!(
            accept_handle,
            pump_handle,
            futures::future::try_join_all(writer_handles).map(|r| r.map(|_| ())),
        )?;
        Ok(())
    }
}

/// The handler loop. Owns the state; everything else is queues.
async fn pump(
    logger: Logger,
    config: RaftConfig,
    mut state: RaftState,
    mut in_rx: mpsc::UnboundedReceiver<Message>,
    peers: HashMap<NodeId, mpsc::UnboundedSender<Message>>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    // One fixed-cadence cycle. Traffic does not reset the timer; instead a
    // suppressing message disables the role change for the cycle it
    // arrived in.
    let mut suppress = false;
    let mut deadline = Instant::now() + cycle_interval(&config, state.role());

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            maybe = in_rx.recv() => {
                let message = match maybe {
                    Some(message) => message,
                    None => break,
                };
                if state.suppresses_timeout(&message) {
                    suppress = true;
                }
                deliver(&logger, &mut state, &peers, message);
            }

            _ = tokio::time::sleep_until(deadline) => {
                if !suppress {
                    let message = state.on_timeout();
                    deliver(&logger, &mut state, &peers, message);
                }
                suppress = false;
                deadline = Instant::now() + cycle_interval(&config, state.role());
            }
        }
    }

    Ok(())
}

/// Route one message: to ourselves through the handler (internal messages
/// and their follow-ups), to a peer through its writer queue.
fn deliver(
    logger: &Logger,
    state: &mut RaftState,
    peers: &HashMap<NodeId, mpsc::UnboundedSender<Message>>,
    message: Message,
) {
    let mut queue = vec![message];

    while let Some(message) = queue.pop() {
        if message.target() == state.id() {
            match state.handle(message) {
                Ok(outgoing) => queue.extend(outgoing),
                // A bad message never takes the actor down.
                Err(RaftError::NotLeader) => {
                    warn!(logger, "client append rejected, not the leader")
                }
                Err(err) => warn!(logger, "dropping message"; "error" => err.to_string()),
            }
        } else if let Some(out_tx) = peers.get(&message.target()) {
            let _ = out_tx.send(message);
        } else {
            warn!(logger, "no route to target"; "target" => message.target());
        }
    }
}

/// Leaders tick on the fixed heartbeat interval; everyone else draws a
/// fresh election timeout from [T, 2T] each cycle.
fn cycle_interval(config: &RaftConfig, role: Role) -> Duration {
    match role {
        Role::Leader => Duration::from_millis(config.heartbeat_millis),
        Role::Follower | Role::Candidate => {
            let base = config.election_timeout_millis;
            Duration::from_millis(rand::thread_rng().gen_range(base..=2 * base))
        }
    }
}
