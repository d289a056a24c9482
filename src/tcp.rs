//! Framed TCP plumbing. One accept loop feeds every inbound connection
//! into the handler's queue; one writer task per peer drains an outbound
//! queue, reconnecting as needed. Neither side touches consensus state.

use futures::SinkExt;
use slog::Logger;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::Result;
use crate::rpc::{Message, WireCodec};

/// Accept connections and pump their decoded messages into `in_tx` until
/// shutdown.
pub async fn receive_task(
    logger: Logger,
    listener: TcpListener,
    in_tx: mpsc::UnboundedSender<Message>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(logger, "accept failed"; "error" => err.to_string());
                        continue;
                    }
                };
                let logger = logger.new(o!("peer" => addr.to_string()));
                let peer_in_tx = in_tx.clone();
                tokio::spawn(async move {
                    debug!(logger, "connected");
                    if let Err(err) = stream_messages(stream, peer_in_tx).await {
                        // Malformed input lands here too: the framing
                        // cannot resynchronize mid-stream, so the
                        // connection is dropped and the peer redials.
                        warn!(logger, "connection closed"; "error" => err.to_string());
                    }
                });
            }
        }
    }

    Ok(())
}

async fn stream_messages(stream: TcpStream, in_tx: mpsc::UnboundedSender<Message>) -> Result<()> {
    let mut frames = FramedRead::new(stream, WireCodec);
    while let Some(message) = frames.try_next().await? {
        if in_tx.send(message).is_err() {
            break; // handler is gone; shutting down
        }
    }
    Ok(())
}

/// Drain `out_rx` toward one peer, dialing lazily. A send that fails drops
/// the message and the connection; consensus retries on its own schedule,
/// so nothing is buffered here.
pub async fn send_task(
    logger: Logger,
    addr: String,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut writer: Option<FramedWrite<TcpStream, WireCodec>> = None;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,

            maybe = out_rx.recv() => {
                let message = match maybe {
                    Some(message) => message,
                    None => break,
                };

                if writer.is_none() {
                    match TcpStream::connect(&addr).await {
                        Ok(stream) => writer = Some(FramedWrite::new(stream, WireCodec)),
                        Err(err) => {
                            debug!(logger, "peer unreachable"; "error" => err.to_string());
                            continue;
                        }
                    }
                }

                if let Some(frames) = writer.as_mut() {
                    if let Err(err) = frames.send(message).await {
                        debug!(logger, "send failed, dropping connection"; "error" => err.to_string());
                        writer = None;
                    }
                }
            }
        }
    }

    Ok(())
}
