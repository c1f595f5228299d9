//! Per-connection plumbing shared by the listener and the dialer.

use crate::allocator::Allocator;
use futures::{Sink, SinkExt, Stream, StreamExt};
use pin_core::{PeerId, now_millis};
use pin_protocol::Envelope;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::LinesCodecError;
use tracing::{debug, warn};

/// Drains `rx` into `sink` until every sender is gone, then closes the sink.
pub(crate) fn spawn_writer<S>(mut sink: S, mut rx: mpsc::UnboundedReceiver<Envelope>) -> JoinHandle<()>
where
    S: Sink<String, Error = LinesCodecError> + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let line = match envelope.to_line() {
                Ok(line) => line,
                Err(err) => {
                    warn!(kind = envelope.message.kind(), "failed to encode message: {err}");
                    continue;
                }
            };
            if let Err(err) = sink.send(line).await {
                debug!("write failed: {err}");
                break;
            }
        }
        let _ = sink.close().await;
    })
}

/// Hands every message from an authenticated peer to the allocator, in
/// order, until the connection ends.
pub(crate) async fn read_loop<S>(node: &Arc<Allocator>, peer: &PeerId, stream: &mut S)
where
    S: Stream<Item = Result<String, LinesCodecError>> + Unpin,
{
    while let Some(line) = stream.next().await {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!(peer = %peer.fmt_short(), "read failed: {err}");
                break;
            }
        };
        let envelope = match Envelope::from_line(&line) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(peer = %peer.fmt_short(), "dropping malformed message: {err}");
                continue;
            }
        };
        let kind = envelope.message.kind();
        if let Err(err) = node
            .handle_socket_msg(envelope.message, peer, now_millis())
            .await
        {
            warn!(peer = %peer.fmt_short(), kind, "failed to handle message: {err:#}");
        }
    }
}
