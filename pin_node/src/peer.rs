//! The peer role: dial an allocator, authenticate, report capacity.

use crate::allocator::Allocator;
use crate::capacity::CapacitySource;
use crate::connection::{read_loop, spawn_writer};
use anyhow::{Context, Result};
use futures::{SinkExt, Stream, StreamExt};
use pin_core::now_millis;
use pin_protocol::{AUTH_TIMEOUT, Auth, AuthSuccess, ClusterSecret, Envelope, Message, SyncReq, framed};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at, sleep, timeout};
use tokio_util::codec::LinesCodecError;
use tracing::{debug, info, warn};

pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct PeerOptions {
    /// Address of the bootstrap allocator.
    pub discovery: String,
    pub secret: ClusterSecret,
    pub capacity: CapacitySource,
    pub report_interval: Option<Duration>,
}

/// Keeps a session with the bootstrap allocator open, reconnecting after
/// [`RECONNECT_BACKOFF`] whenever it ends.
pub async fn run_peer(node: Arc<Allocator>, options: PeerOptions) {
    loop {
        match TcpStream::connect(&options.discovery).await {
            Ok(stream) => {
                if let Err(err) = run_session(&node, &options, stream).await {
                    warn!(addr = %options.discovery, "session ended: {err:#}");
                }
            }
            Err(err) => warn!(addr = %options.discovery, "failed to connect: {err}"),
        }
        sleep(RECONNECT_BACKOFF).await;
    }
}

/// Runs one session over `io` until the allocator hangs up.
pub async fn run_session<T>(node: &Arc<Allocator>, options: &PeerOptions, io: T) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sink, mut stream) = framed(io).split();

    let auth = Auth {
        secret: options.secret.expose().to_owned(),
        peer_id: node.own_id().to_string(),
        discovery: node.advertise().map(str::to_owned),
    };
    sink.send(Envelope::new(Message::Auth(auth), now_millis()).to_line()?)
        .await?;
    let success = timeout(AUTH_TIMEOUT, wait_for_auth_success(&mut stream))
        .await
        .context("allocator did not accept authentication")?
        .context("connection closed during authentication")?;

    let allocator = success.peer_id.clone();
    let (tx, rx) = mpsc::unbounded_channel();
    spawn_writer(sink, rx);
    let connection = node
        .peers()
        .insert(allocator.clone(), tx, Some(options.discovery.clone()));
    node.learn_discovery_peers(&success.discovery_peers);
    info!(allocator = %allocator.fmt_short(), "authenticated");

    match options.capacity.measure().await {
        Ok(info) => {
            node.peers()
                .send(&allocator, Envelope::new(Message::PeerInfo(info), now_millis()));
        }
        Err(err) => warn!("failed to measure capacity: {err}"),
    }
    if let Err(err) = sync_if_behind(node, &success).await {
        warn!("failed to request sync: {err:#}");
    }

    let reporter = options.report_interval.map(|every| {
        let node = node.clone();
        let capacity = options.capacity.clone();
        tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + every, every);
            loop {
                ticks.tick().await;
                let result = match capacity.measure().await {
                    Ok(info) => node.report_capacity(info, now_millis()).await,
                    Err(err) => Err(err.into()),
                };
                if let Err(err) = result {
                    warn!("capacity report failed: {err:#}");
                }
            }
        })
    });

    read_loop(node, &allocator, &mut stream).await;

    if let Some(reporter) = reporter {
        reporter.abort();
    }
    node.peers().remove(&allocator, connection);
    info!(allocator = %allocator.fmt_short(), "disconnected");
    Ok(())
}

async fn sync_if_behind(node: &Arc<Allocator>, success: &AuthSuccess) -> Result<()> {
    let ledger = node.ledger();
    if success.last_pin > ledger.latest_pin().await?
        || success.last_unpin > ledger.latest_unpin().await?
    {
        node.send_sync_req(&success.peer_id, SyncReq::default(), now_millis())
            .await?;
    }
    Ok(())
}

async fn wait_for_auth_success<S>(stream: &mut S) -> Option<AuthSuccess>
where
    S: Stream<Item = Result<String, LinesCodecError>> + Unpin,
{
    while let Some(Ok(line)) = stream.next().await {
        match Envelope::from_line(&line) {
            Ok(Envelope {
                message: Message::AuthSuccess(success),
                ..
            }) => return Some(success),
            Ok(envelope) => debug!(kind = envelope.message.kind(), "dropping message before auth reply"),
            Err(err) => debug!("dropping malformed message: {err}"),
        }
    }
    None
}
