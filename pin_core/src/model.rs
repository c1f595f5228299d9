//! Pin records as stored in the ledger.
//!
//! A [`Pin`] is keyed by its content identifier and tracks which peers were
//! asked to retain the content ([`PinAllocate`]), how many of them there are
//! and the best known estimate of the content's footprint.

use crate::PeerId;
use minicbor::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Unix time in milliseconds.
pub type Timestamp = i64;

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "lowercase")]
#[cbor(index_only)]
pub enum PinStatus {
    #[n(0)]
    New,
    #[n(1)]
    Queued,
    #[n(2)]
    Failed,
    #[n(3)]
    Unpinned,
    #[n(4)]
    Pinned,
    #[n(5)]
    Deleted,
}

impl PinStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PinStatus::New => "new",
            PinStatus::Queued => "queued",
            PinStatus::Failed => "failed",
            PinStatus::Unpinned => "unpinned",
            PinStatus::Pinned => "pinned",
            PinStatus::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for PinStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance of a pin. Opaque to the cluster, carried along for the
/// platform that created it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[cbor(map)]
pub struct PinMetadata {
    #[n(0)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[n(1)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permlink: Option<String>,
    #[n(2)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[n(3)]
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// One peer's assignment for a pin.
///
/// `pinned_at` is unset until the peer confirms it stored the content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[cbor(map)]
pub struct PinAllocate {
    #[n(0)]
    pub id: PeerId,
    #[n(1)]
    pub allocated_at: Timestamp,
    #[n(2)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned_at: Option<Timestamp>,
    #[n(3)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_size: Option<u64>,
}

impl PinAllocate {
    pub fn new(id: PeerId, allocated_at: Timestamp) -> Self {
        Self {
            id,
            allocated_at,
            pinned_at: None,
            reported_size: None,
        }
    }

    /// An allocation that is confirmed at the moment it is created.
    pub fn confirmed(id: PeerId, at: Timestamp, size: Option<u64>) -> Self {
        Self {
            id,
            allocated_at: at,
            pinned_at: Some(at),
            reported_size: size,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.pinned_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[cbor(map)]
pub struct Pin {
    #[n(0)]
    #[serde(rename = "_id")]
    pub cid: String,
    #[n(1)]
    pub status: PinStatus,
    #[n(2)]
    pub created_at: Timestamp,
    #[n(3)]
    pub last_updated: Timestamp,
    #[n(4)]
    #[serde(default)]
    pub metadata: PinMetadata,
    #[n(5)]
    #[serde(default)]
    pub allocations: Vec<PinAllocate>,
    #[n(6)]
    #[serde(rename = "allocationCount", default)]
    pub allocation_count: u32,
    #[n(7)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub median_size: Option<u64>,
    #[n(8)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl Pin {
    /// A freshly created pin with no allocations.
    pub fn new(cid: impl Into<String>, created_at: Timestamp) -> Self {
        Self {
            cid: cid.into(),
            status: PinStatus::New,
            created_at,
            last_updated: created_at,
            metadata: PinMetadata::default(),
            allocations: Vec::new(),
            allocation_count: 0,
            median_size: None,
            size: None,
        }
    }

    pub fn with_status(mut self, status: PinStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_metadata(mut self, metadata: PinMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.status == PinStatus::Deleted
    }

    pub fn allocation(&self, peer: &PeerId) -> Option<&PinAllocate> {
        self.allocations.iter().find(|a| &a.id == peer)
    }

    pub fn is_allocated_to(&self, peer: &PeerId) -> bool {
        self.allocation(peer).is_some()
    }

    /// Median of every `reported_size` known across the allocations.
    pub fn compute_median_size(&self) -> Option<u64> {
        median(self.allocations.iter().filter_map(|a| a.reported_size))
    }
}

/// Median of a set of sizes; the floor of the mean of the middle pair when
/// the count is even.
pub fn median(sizes: impl IntoIterator<Item = u64>) -> Option<u64> {
    let mut sizes: Vec<u64> = sizes.into_iter().collect();
    if sizes.is_empty() {
        return None;
    }
    sizes.sort_unstable();
    let mid = sizes.len() / 2;
    if sizes.len() % 2 == 1 {
        Some(sizes[mid])
    } else {
        let (a, b) = (sizes[mid - 1], sizes[mid]);
        Some(a / 2 + b / 2 + (a % 2 + b % 2) / 2)
    }
}
