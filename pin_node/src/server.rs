//! The allocator listener.
//!
//! A connection is held unauthenticated until it sends a valid `AUTH`.
//! Everything else received before that is dropped. After
//! [`AUTH_TIMEOUT`] the connection is closed, and if the remote has not
//! hung up [`TERMINATE_GRACE`] later it is dropped outright.

use crate::allocator::Allocator;
use crate::connection::{read_loop, spawn_writer};
use futures::{SinkExt, Stream, StreamExt};
use pin_core::{PeerId, now_millis};
use pin_protocol::{AUTH_TIMEOUT, ClusterSecret, Envelope, Message, TERMINATE_GRACE, framed};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::LinesCodecError;
use tracing::{debug, info, warn};

pub async fn serve(listener: TcpListener, node: Arc<Allocator>, secret: ClusterSecret) -> anyhow::Result<()> {
    info!("listening on {}", listener.local_addr()?);
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("accept failed: {err}");
                continue;
            }
        };
        let node = node.clone();
        let secret = secret.clone();
        tokio::spawn(async move {
            debug!(%addr, "accepted connection");
            handle_inbound(node, secret, stream).await;
            debug!(%addr, "connection closed");
        });
    }
}

pub async fn handle_inbound<T>(node: Arc<Allocator>, secret: ClusterSecret, io: T)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sink, mut stream) = framed(io).split();

    let (peer, discovery) = match timeout(AUTH_TIMEOUT, wait_for_auth(&mut stream, &secret)).await {
        Ok(Some(auth)) => auth,
        Ok(None) => return,
        Err(_) => {
            debug!("authentication timed out, closing");
            let _ = sink.close().await;
            let drain = async { while stream.next().await.is_some() {} };
            if timeout(TERMINATE_GRACE, drain).await.is_err() {
                debug!("terminating unauthenticated connection");
            }
            return;
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    match node.auth_success().await {
        Ok(success) => {
            let _ = tx.send(Envelope::new(Message::AuthSuccess(success), now_millis()));
        }
        Err(err) => {
            warn!(peer = %peer.fmt_short(), "failed to build auth reply: {err:#}");
            return;
        }
    }
    spawn_writer(sink, rx);
    let connection = node.peers().insert(peer.clone(), tx, discovery);
    info!(peer = %peer.fmt_short(), "peer authenticated");

    read_loop(&node, &peer, &mut stream).await;

    node.peers().remove(&peer, connection);
    info!(peer = %peer.fmt_short(), "peer disconnected");
}

/// Reads until a valid `AUTH` arrives. Returns `None` if the connection
/// ends first.
async fn wait_for_auth<S>(stream: &mut S, secret: &ClusterSecret) -> Option<(PeerId, Option<String>)>
where
    S: Stream<Item = Result<String, LinesCodecError>> + Unpin,
{
    while let Some(line) = stream.next().await {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                debug!("read failed before authentication: {err}");
                return None;
            }
        };
        match Envelope::from_line(&line) {
            Ok(Envelope {
                message: Message::Auth(auth),
                ..
            }) => {
                if !secret.verify(&auth.secret) {
                    debug!("ignoring authentication with wrong secret");
                    continue;
                }
                match PeerId::parse(&auth.peer_id) {
                    Ok(peer) => return Some((peer, auth.discovery)),
                    Err(err) => debug!("ignoring authentication with bad peer id: {err}"),
                }
            }
            Ok(envelope) => {
                debug!(kind = envelope.message.kind(), "dropping message before authentication")
            }
            Err(err) => debug!("dropping malformed message before authentication: {err}"),
        }
    }
    None
}
