use pin_core::{PeerId, Pin, PinMetadata, Timestamp};
use serde::{Deserialize, Serialize};

/// Every message kind nodes exchange.
///
/// On the wire each message is the `type`/`data` pair of an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Auth(Auth),
    AuthSuccess(AuthSuccess),
    PeerInfo(PeerInfo),
    PinNew(PinEvent),
    PinCompleted(PinEvent),
    PinFailed(PinEvent),
    PinRemovePeer(PinEvent),
    PinRemove(PinRemove),
    PinAllocation(PinAllocation),
    MsgGossipAlloc(GossipAlloc),
    SyncReq(SyncReq),
    SyncResp(SyncResp),
}

impl Message {
    /// The wire name of this message kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Auth(_) => "AUTH",
            Message::AuthSuccess(_) => "AUTH_SUCCESS",
            Message::PeerInfo(_) => "PEER_INFO",
            Message::PinNew(_) => "PIN_NEW",
            Message::PinCompleted(_) => "PIN_COMPLETED",
            Message::PinFailed(_) => "PIN_FAILED",
            Message::PinRemovePeer(_) => "PIN_REMOVE_PEER",
            Message::PinRemove(_) => "PIN_REMOVE",
            Message::PinAllocation(_) => "PIN_ALLOCATION",
            Message::MsgGossipAlloc(_) => "MSG_GOSSIP_ALLOC",
            Message::SyncReq(_) => "SYNC_REQ",
            Message::SyncResp(_) => "SYNC_RESP",
        }
    }
}

/// First message on every connection.
///
/// `peer_id` stays a plain string here; the receiver validates it so a
/// malformed address can be told apart from a malformed envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Auth {
    pub secret: String,
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery: Option<String>,
}

/// An allocator-capable node and the address it can be dialed on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryPeer {
    pub peer_id: PeerId,
    pub discovery: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSuccess {
    #[serde(default)]
    pub discovery_peers: Vec<DiscoveryPeer>,
    /// The id of the node that accepted the connection.
    pub peer_id: PeerId,
    #[serde(default)]
    pub last_pin: Option<Timestamp>,
    #[serde(default)]
    pub last_unpin: Option<Timestamp>,
}

/// Disk capacity report.
///
/// Without `peer_id` the report describes the sender. With it, the report
/// was forwarded on behalf of that peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    #[serde(rename = "totalSpaceMB")]
    pub total_space_mb: u64,
    #[serde(rename = "freeSpaceMB")]
    pub free_space_mb: u64,
    #[serde(rename = "peerId", default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<PeerId>,
}

impl PeerInfo {
    pub fn new(total_space_mb: u64, free_space_mb: u64) -> Self {
        Self {
            total_space_mb,
            free_space_mb,
            peer_id: None,
        }
    }

    pub fn forwarded_for(mut self, peer_id: PeerId) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    /// Free space as a percentage of total space.
    pub fn free_percent(&self) -> f64 {
        if self.total_space_mb == 0 {
            return 0.0;
        }
        100.0 * self.free_space_mb as f64 / self.total_space_mb as f64
    }
}

/// Payload shared by the peer-originated lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<PeerId>,
    pub cid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PinMetadata>,
}

impl PinEvent {
    pub fn new(cid: impl Into<String>) -> Self {
        Self {
            peer_id: None,
            cid: cid.into(),
            size: None,
            metadata: None,
        }
    }

    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }

    pub fn with_metadata(mut self, metadata: PinMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn on_behalf_of(mut self, peer_id: PeerId) -> Self {
        self.peer_id = Some(peer_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinRemove {
    pub cid: String,
}

/// One pin handed to a peer, with enough of the record for a node with its
/// own ledger to materialize it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinAssignment {
    pub cid: String,
    pub allocated_at: Timestamp,
    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<PinMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub median_size: Option<u64>,
}

impl PinAssignment {
    pub fn for_pin(pin: &Pin, allocated_at: Timestamp) -> Self {
        Self {
            cid: pin.cid.clone(),
            allocated_at,
            created_at: pin.created_at,
            metadata: Some(pin.metadata.clone()),
            median_size: pin.median_size,
        }
    }
}

/// A batch of pins the allocator assigned to `peer_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinAllocation {
    pub peer_id: PeerId,
    pub allocations: Vec<PinAssignment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GossipAlloc {
    pub peer_id: PeerId,
    pub allocations: Vec<PinAssignment>,
    pub ts: Timestamp,
}

/// High-water marks of the requester. A cid marker continues a page that
/// ended inside a millisecond: records at exactly that timestamp are only
/// sent if their cid sorts after it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReq {
    #[serde(default)]
    pub last_pin: Timestamp,
    #[serde(default)]
    pub last_unpin: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pin_cid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_unpin_cid: Option<String>,
}

impl SyncReq {
    pub fn new(last_pin: Timestamp, last_unpin: Timestamp) -> Self {
        Self {
            last_pin,
            last_unpin,
            ..Self::default()
        }
    }
}

/// Up to [`crate::SYNC_PAGE_SIZE`] pin creations and deletions, each
/// ascending by its timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncResp {
    #[serde(default)]
    pub pins: Vec<Pin>,
    #[serde(default)]
    pub unpins: Vec<Pin>,
}
