//! Wire protocol between pin cluster nodes.
//!
//! Nodes talk over one persistent duplex channel per pair. Every frame is a
//! UTF-8 JSON [`Envelope`] on its own line; the `type` field selects one of
//! the closed set of [`Message`] kinds.
//!
//! A connection is unauthenticated until the dialing side sends
//! [`Message::Auth`] with the shared [`ClusterSecret`]. Anything else that
//! arrives before that is dropped.

mod auth;
mod envelope;
mod message;

pub use auth::ClusterSecret;
pub use envelope::{Channel, Envelope, MAX_LINE_LENGTH, framed};
pub use message::{
    Auth, AuthSuccess, DiscoveryPeer, GossipAlloc, Message, PeerInfo, PinAllocation,
    PinAssignment, PinEvent, PinRemove, SyncReq, SyncResp,
};

use std::time::Duration;

/// Maximum number of pins, and separately of unpins, in one `SYNC_RESP`.
pub const SYNC_PAGE_SIZE: usize = 50;

/// An unauthenticated connection is closed after this long.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period between closing an unauthenticated connection and
/// terminating it.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(3);

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    /// Malformed JSON, an unknown `type`, or a field that fails to parse,
    /// including peer ids that are not valid Ed25519 keys.
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
}
