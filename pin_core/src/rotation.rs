//! Clock-indexed allocator rotation.
//!
//! There is no election. Every node sorts the ids it knows about and picks
//! the entry at `clock_minute % len`. Nodes that share a peer-list snapshot
//! and agree on the minute pick the same allocator; otherwise they may
//! briefly disagree, which the idempotent ledger updates tolerate.

use crate::{PeerId, Timestamp};
use std::collections::BTreeSet;

const MINUTE_MS: Timestamp = 60_000;

/// Unix epoch minute for a millisecond timestamp.
pub fn clock_minute(now: Timestamp) -> u64 {
    now.div_euclid(MINUTE_MS) as u64
}

/// Returns the allocator for the given minute, or `None` if there are no
/// candidates at all.
///
/// `own_id` is added to the candidate set when this node may allocate.
pub fn current_allocator<'a>(
    known: impl IntoIterator<Item = &'a PeerId>,
    own_id: Option<&'a PeerId>,
    minute: u64,
) -> Option<PeerId> {
    let candidates: BTreeSet<&PeerId> = known.into_iter().chain(own_id).collect();
    if candidates.is_empty() {
        return None;
    }
    let index = (minute % candidates.len() as u64) as usize;
    candidates.into_iter().nth(index).cloned()
}
