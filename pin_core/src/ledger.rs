//! The pin ledger: a multi-writer document store of [`Pin`] records.
//!
//! Several nodes may believe at the same time that they are responsible for
//! allocating, and they may share one store. Every mutation therefore goes
//! through [`Ledger::update`], which checks a list of [`PinCondition`]s and
//! applies a list of [`PinMutation`]s as one atomic step. Pushing an
//! allocation and bumping the allocation counter are a single mutation, so
//! `allocation_count == allocations.len()` can never be torn by a concurrent
//! writer.
//!
//! Backends only have to provide atomicity per record. The matching, sorting
//! and mutation rules live here so every backend behaves identically.

use crate::{PeerId, Pin, PinAllocate, PinStatus, Timestamp};
use anyhow::Result;
use async_trait::async_trait;
use std::cmp::Ordering;

/// A predicate over a single pin record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinCondition {
    StatusIs(PinStatus),
    StatusIsNot(PinStatus),
    HasAllocation(PeerId),
    LacksAllocation(PeerId),
    /// The peer has an allocation that it has not confirmed yet.
    AllocationUnconfirmed(PeerId),
    /// The peer has an allocation missing `pinned_at` or `reported_size`.
    AllocationIncomplete(PeerId),
    /// `median_size` is unknown or strictly below the given byte count.
    MedianSizeBelow(u64),
    CreatedAfter(Timestamp),
    UpdatedAfter(Timestamp),
    /// `(created_at, cid)` sorts strictly after the given pair.
    CreatedAfterKey(Timestamp, String),
    /// `(last_updated, cid)` sorts strictly after the given pair.
    UpdatedAfterKey(Timestamp, String),
}

impl PinCondition {
    pub fn matches(&self, pin: &Pin) -> bool {
        match self {
            PinCondition::StatusIs(status) => pin.status == *status,
            PinCondition::StatusIsNot(status) => pin.status != *status,
            PinCondition::HasAllocation(peer) => pin.is_allocated_to(peer),
            PinCondition::LacksAllocation(peer) => !pin.is_allocated_to(peer),
            PinCondition::AllocationUnconfirmed(peer) => pin
                .allocation(peer)
                .is_some_and(|a| a.pinned_at.is_none()),
            PinCondition::AllocationIncomplete(peer) => pin
                .allocation(peer)
                .is_some_and(|a| a.pinned_at.is_none() || a.reported_size.is_none()),
            PinCondition::MedianSizeBelow(bytes) => pin.median_size.is_none_or(|m| m < *bytes),
            PinCondition::CreatedAfter(ts) => pin.created_at > *ts,
            PinCondition::UpdatedAfter(ts) => pin.last_updated > *ts,
            PinCondition::CreatedAfterKey(ts, cid) => {
                (pin.created_at, pin.cid.as_str()) > (*ts, cid.as_str())
            }
            PinCondition::UpdatedAfterKey(ts, cid) => {
                (pin.last_updated, pin.cid.as_str()) > (*ts, cid.as_str())
            }
        }
    }
}

/// A single change applied by [`Ledger::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinMutation {
    /// Appends the allocation and increments `allocation_count`. A second
    /// allocation for the same peer is ignored.
    PushAllocation(PinAllocate),
    /// Removes the peer's allocation and decrements `allocation_count`.
    PullAllocation(PeerId),
    /// Marks the peer's allocation as stored with the given size.
    ConfirmAllocation {
        peer: PeerId,
        pinned_at: Timestamp,
        size: Option<u64>,
    },
    ClearAllocations,
    SetStatus(PinStatus),
    /// Sets `last_updated`.
    Touch(Timestamp),
    RecomputeMedianSize,
}

impl PinMutation {
    pub fn apply(&self, pin: &mut Pin) {
        match self {
            PinMutation::PushAllocation(allocation) => {
                if !pin.is_allocated_to(&allocation.id) {
                    pin.allocations.push(allocation.clone());
                    pin.allocation_count += 1;
                }
            }
            PinMutation::PullAllocation(peer) => {
                let before = pin.allocations.len();
                pin.allocations.retain(|a| &a.id != peer);
                if pin.allocations.len() < before {
                    pin.allocation_count = pin.allocation_count.saturating_sub(1);
                }
            }
            PinMutation::ConfirmAllocation {
                peer,
                pinned_at,
                size,
            } => {
                if let Some(allocation) = pin.allocations.iter_mut().find(|a| &a.id == peer) {
                    allocation.pinned_at = Some(*pinned_at);
                    if size.is_some() {
                        allocation.reported_size = *size;
                    }
                }
            }
            PinMutation::ClearAllocations => {
                pin.allocations.clear();
                pin.allocation_count = 0;
            }
            PinMutation::SetStatus(status) => pin.status = *status,
            PinMutation::Touch(ts) => pin.last_updated = *ts,
            PinMutation::RecomputeMedianSize => pin.median_size = pin.compute_median_size(),
        }
    }
}

/// Match-then-mutate request for one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinUpdate {
    pub conditions: Vec<PinCondition>,
    pub mutations: Vec<PinMutation>,
}

impl PinUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, condition: PinCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn then(mut self, mutation: PinMutation) -> Self {
        self.mutations.push(mutation);
        self
    }

    pub fn matches(&self, pin: &Pin) -> bool {
        self.conditions.iter().all(|c| c.matches(pin))
    }

    /// Applies the update to `pin` if it matches. Returns whether it did.
    pub fn apply(&self, pin: &mut Pin) -> bool {
        if !self.matches(pin) {
            return false;
        }
        for mutation in &self.mutations {
            mutation.apply(pin);
        }
        true
    }
}

/// Sort keys for [`PinQuery`]. Earlier keys take precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinSort {
    AllocationCountAsc,
    CreatedAtAsc,
    CreatedAtDesc,
    LastUpdatedAsc,
}

impl PinSort {
    fn compare(&self, a: &Pin, b: &Pin) -> Ordering {
        match self {
            PinSort::AllocationCountAsc => a.allocation_count.cmp(&b.allocation_count),
            PinSort::CreatedAtAsc => a.created_at.cmp(&b.created_at),
            PinSort::CreatedAtDesc => b.created_at.cmp(&a.created_at),
            PinSort::LastUpdatedAsc => a.last_updated.cmp(&b.last_updated),
        }
    }
}

/// Filter, sort and limit over the whole ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PinQuery {
    pub conditions: Vec<PinCondition>,
    pub sort: Vec<PinSort>,
    pub limit: Option<usize>,
}

impl PinQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, condition: PinCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn sort_by(mut self, key: PinSort) -> Self {
        self.sort.push(key);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, pin: &Pin) -> bool {
        self.conditions.iter().all(|c| c.matches(pin))
    }

    /// Orders two records by the sort keys, falling back to the cid so
    /// results are deterministic.
    pub fn compare(&self, a: &Pin, b: &Pin) -> Ordering {
        self.sort
            .iter()
            .map(|key| key.compare(a, b))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| a.cid.cmp(&b.cid))
    }

    /// Runs the query over an iterator of records. Backends without an
    /// index of their own use this after loading candidates.
    pub fn select(&self, pins: impl IntoIterator<Item = Pin>) -> Vec<Pin> {
        let mut selected: Vec<Pin> = pins.into_iter().filter(|p| self.matches(p)).collect();
        selected.sort_by(|a, b| self.compare(a, b));
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

/// Whether [`Ledger::create`] may write `incoming` over `existing`.
///
/// Live records are never overwritten. A deleted record is replaced only by
/// a pin created after the deletion, which keeps stale sync data from
/// resurrecting removed content.
pub fn may_create_over(existing: Option<&Pin>, incoming: &Pin) -> bool {
    match existing {
        None => true,
        Some(existing) => existing.is_deleted() && incoming.created_at > existing.last_updated,
    }
}

/// Storage collaborator for pin records.
///
/// Implementations must make [`Ledger::update`] and [`Ledger::create`]
/// atomic with respect to other writers of the same record.
#[async_trait]
pub trait Ledger: std::fmt::Debug + Send + Sync {
    async fn get(&self, cid: &str) -> Result<Option<Pin>>;

    async fn find(&self, query: &PinQuery) -> Result<Vec<Pin>>;

    /// Applies `update` if the record exists and all conditions hold.
    ///
    /// Returns the updated record, or `None` if nothing matched.
    async fn update(&self, cid: &str, update: &PinUpdate) -> Result<Option<Pin>>;

    /// Inserts `pin` unless a record already exists. A deleted record is
    /// replaced when [`may_create_over`] allows it. Returns whether `pin`
    /// was written.
    async fn create(&self, pin: Pin) -> Result<bool>;

    /// Newest `created_at` among pins that are not deleted.
    async fn latest_pin(&self) -> Result<Option<Timestamp>> {
        let query = PinQuery::new()
            .when(PinCondition::StatusIsNot(PinStatus::Deleted))
            .sort_by(PinSort::CreatedAtDesc)
            .limit(1);
        Ok(self.find(&query).await?.first().map(|p| p.created_at))
    }

    /// Newest `last_updated` among deleted pins.
    async fn latest_unpin(&self) -> Result<Option<Timestamp>> {
        let query = PinQuery::new().when(PinCondition::StatusIs(PinStatus::Deleted));
        Ok(self
            .find(&query)
            .await?
            .iter()
            .map(|p| p.last_updated)
            .max())
    }
}

#[async_trait]
impl<L: Ledger + ?Sized> Ledger for std::sync::Arc<L> {
    async fn get(&self, cid: &str) -> Result<Option<Pin>> {
        (**self).get(cid).await
    }

    async fn find(&self, query: &PinQuery) -> Result<Vec<Pin>> {
        (**self).find(query).await
    }

    async fn update(&self, cid: &str, update: &PinUpdate) -> Result<Option<Pin>> {
        (**self).update(cid, update).await
    }

    async fn create(&self, pin: Pin) -> Result<bool> {
        (**self).create(pin).await
    }

    async fn latest_pin(&self) -> Result<Option<Timestamp>> {
        (**self).latest_pin().await
    }

    async fn latest_unpin(&self) -> Result<Option<Timestamp>> {
        (**self).latest_unpin().await
    }
}
