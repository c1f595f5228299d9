//! The allocation engine.
//!
//! Every node runs one [`Allocator`]. Which node actually hands out work for
//! a capacity report is decided per report by [`Allocator::current_allocator`];
//! all other message handling is the same on every node. Handlers are
//! idempotent transitions keyed by cid and only ever touch the ledger through
//! conditional updates, so several nodes that briefly believe they are the
//! allocator cannot corrupt a record.

use crate::executor::{ExecutorError, PinExecutor};
use crate::peers::PeerTable;
use anyhow::Result;
use dashmap::DashMap;
use pin_core::{
    Ledger, PeerId, Pin, PinAllocate, PinCondition, PinMutation, PinQuery, PinSort, PinStatus,
    PinUpdate, Timestamp, clock_minute, now_millis, rotation,
};
use pin_protocol::{
    AuthSuccess, DiscoveryPeer, Envelope, GossipAlloc, Message, PeerInfo, PinAllocation,
    PinAssignment, PinEvent, PinRemove, SYNC_PAGE_SIZE, SyncReq, SyncResp,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Peers with this share of free space or less get no new work.
pub const MIN_FREE_PERCENT: f64 = 20.0;

/// Most pins handed out for one capacity report.
pub const MAX_BATCH: usize = 10;

const BYTES_PER_MB: f64 = 1_048_576.0;

/// Bytes a peer can take on while keeping [`MIN_FREE_PERCENT`] free.
pub fn free_margin_bytes(info: &PeerInfo) -> u64 {
    let total = info.total_space_mb as f64;
    let free = info.free_space_mb as f64;
    ((free - total * MIN_FREE_PERCENT / 100.0) * BYTES_PER_MB).max(0.0) as u64
}

#[derive(Debug)]
pub struct Allocator {
    own_id: PeerId,
    advertise: Option<String>,
    ledger: Arc<dyn Ledger>,
    peers: PeerTable,
    /// Allocator-capable nodes learned from `AUTH_SUCCESS`.
    discovery_peers: DashMap<PeerId, String>,
    executor: Option<Arc<dyn PinExecutor>>,
}

impl Allocator {
    pub fn new(own_id: PeerId, ledger: Arc<dyn Ledger>) -> Self {
        Self {
            own_id,
            advertise: None,
            ledger,
            peers: PeerTable::new(),
            discovery_peers: DashMap::new(),
            executor: None,
        }
    }

    /// Announces `addr` to other nodes, which makes this node a rotation
    /// candidate.
    pub fn with_advertise(mut self, addr: Option<String>) -> Self {
        self.advertise = addr;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn PinExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn own_id(&self) -> &PeerId {
        &self.own_id
    }

    pub fn advertise(&self) -> Option<&str> {
        self.advertise.as_deref()
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn learn_discovery_peers(&self, peers: &[DiscoveryPeer]) {
        for peer in peers.iter().filter(|p| p.peer_id != self.own_id) {
            self.discovery_peers
                .insert(peer.peer_id.clone(), peer.discovery.clone());
        }
    }

    /// Every allocator-capable node this node knows of, itself included
    /// when it advertises an address.
    pub fn discovery_peers(&self) -> Vec<DiscoveryPeer> {
        let mut known: BTreeMap<PeerId, String> = self
            .discovery_peers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        for peer in self.peers.allocator_capable() {
            known.insert(peer.peer_id, peer.discovery);
        }
        if let Some(addr) = &self.advertise {
            known.insert(self.own_id.clone(), addr.clone());
        }
        known
            .into_iter()
            .map(|(peer_id, discovery)| DiscoveryPeer { peer_id, discovery })
            .collect()
    }

    pub fn current_allocator(&self, now: Timestamp) -> Option<PeerId> {
        let candidates: Vec<PeerId> = self
            .discovery_peers()
            .into_iter()
            .map(|p| p.peer_id)
            .collect();
        rotation::current_allocator(&candidates, None, clock_minute(now))
    }

    pub async fn auth_success(&self) -> Result<AuthSuccess> {
        Ok(AuthSuccess {
            discovery_peers: self.discovery_peers(),
            peer_id: self.own_id.clone(),
            last_pin: self.ledger.latest_pin().await?,
            last_unpin: self.ledger.latest_unpin().await?,
        })
    }

    /// Queues `message` for every connected peer.
    pub fn broadcast(&self, message: Message, now: Timestamp) -> usize {
        self.peers.broadcast(&Envelope::new(message, now), &[])
    }

    /// Asks `to` for everything newer than this node's ledger, or newer than
    /// `floor` where that is at least as far ahead.
    pub async fn send_sync_req(&self, to: &PeerId, floor: SyncReq, now: Timestamp) -> Result<bool> {
        let (last_pin, last_pin_cid) = ahead_of(
            self.ledger.latest_pin().await?,
            floor.last_pin,
            floor.last_pin_cid,
        );
        let (last_unpin, last_unpin_cid) = ahead_of(
            self.ledger.latest_unpin().await?,
            floor.last_unpin,
            floor.last_unpin_cid,
        );
        let req = SyncReq {
            last_pin,
            last_unpin,
            last_pin_cid,
            last_unpin_cid,
        };
        debug!(peer = %to.fmt_short(), last_pin = req.last_pin, last_unpin = req.last_unpin, "requesting sync");
        Ok(self.peers.send(to, Envelope::new(Message::SyncReq(req), now)))
    }

    /// Dispatches one message received from the authenticated peer `from`.
    pub async fn handle_socket_msg(
        self: &Arc<Self>,
        message: Message,
        from: &PeerId,
        now: Timestamp,
    ) -> Result<()> {
        match message {
            Message::Auth(_) | Message::AuthSuccess(_) => {
                debug!(peer = %from.fmt_short(), "ignoring handshake on open channel");
            }
            Message::PeerInfo(info) => match info.peer_id.clone() {
                Some(target) => {
                    self.allocate(&target, &info, from, now).await?;
                }
                None => {
                    self.request_allocations(info, from, now).await?;
                }
            },
            Message::PinNew(event) => self.pin_new(event, from, now).await?,
            Message::PinCompleted(event) => {
                let peer = event.peer_id.unwrap_or_else(|| from.clone());
                self.complete_pin(&event.cid, &peer, event.size, now).await?;
            }
            Message::PinFailed(event) => {
                let peer = event.peer_id.unwrap_or_else(|| from.clone());
                self.fail_pin(&event.cid, &peer, now).await?;
            }
            Message::PinRemovePeer(event) => {
                let peer = event.peer_id.unwrap_or_else(|| from.clone());
                self.remove_peer(&event.cid, &peer, now).await?;
            }
            Message::PinRemove(PinRemove { cid }) => {
                self.remove_pin(&cid, now, true).await?;
            }
            Message::PinAllocation(batch) => self.pin_allocation(batch, now).await?,
            Message::MsgGossipAlloc(gossip) => {
                self.apply_allocations(&gossip.peer_id, &gossip.allocations, PinStatus::New, now)
                    .await?;
            }
            Message::SyncReq(req) => {
                let resp = self.sync_page(req).await?;
                debug!(peer = %from.fmt_short(), pins = resp.pins.len(), unpins = resp.unpins.len(), "answering sync");
                self.peers
                    .send(from, Envelope::new(Message::SyncResp(resp), now));
            }
            Message::SyncResp(resp) => self.apply_sync(resp, from, now).await?,
        }
        Ok(())
    }

    /// Handles a capacity report that `reporter` sent about itself.
    ///
    /// If another node is the current allocator and is connected, the report
    /// is forwarded there and `None` is returned. Otherwise this node
    /// allocates and returns the batch it handed out.
    pub async fn request_allocations(
        self: &Arc<Self>,
        info: PeerInfo,
        reporter: &PeerId,
        now: Timestamp,
    ) -> Result<Option<PinAllocation>> {
        if let Some(allocator) = self.current_allocator(now)
            && allocator != self.own_id
        {
            let forwarded = Message::PeerInfo(info.clone().forwarded_for(reporter.clone()));
            if self.peers.send(&allocator, Envelope::new(forwarded, now)) {
                debug!(peer = %reporter.fmt_short(), allocator = %allocator.fmt_short(), "forwarded capacity report");
                return Ok(None);
            }
            debug!(allocator = %allocator.fmt_short(), "current allocator not connected, allocating here");
        }
        self.allocate(reporter, &info, reporter, now).await
    }

    /// Reports this node's own capacity to whoever allocates right now.
    pub async fn report_capacity(self: &Arc<Self>, info: PeerInfo, now: Timestamp) -> Result<()> {
        let own_id = self.own_id.clone();
        let allocator = self.current_allocator(now);
        if allocator.as_ref() == Some(&own_id) {
            self.allocate(&own_id, &info, &own_id, now).await?;
            return Ok(());
        }

        let envelope = Envelope::new(Message::PeerInfo(info), now);
        if let Some(allocator) = &allocator
            && self.peers.send(allocator, envelope.clone())
        {
            return Ok(());
        }
        let reached = self
            .peers
            .allocator_capable()
            .into_iter()
            .any(|peer| self.peers.send(&peer.peer_id, envelope.clone()));
        if !reached {
            debug!("no allocator reachable for capacity report");
        }
        Ok(())
    }

    /// Hands out up to [`MAX_BATCH`] pins to `target` if its report leaves
    /// enough headroom. `via` is the channel the report arrived on.
    pub async fn allocate(
        self: &Arc<Self>,
        target: &PeerId,
        info: &PeerInfo,
        via: &PeerId,
        now: Timestamp,
    ) -> Result<Option<PinAllocation>> {
        if info.free_percent() <= MIN_FREE_PERCENT {
            debug!(peer = %target.fmt_short(), free = info.free_space_mb, total = info.total_space_mb, "not enough free space");
            return Ok(None);
        }

        let query = PinQuery::new()
            .when(PinCondition::LacksAllocation(target.clone()))
            .when(PinCondition::MedianSizeBelow(free_margin_bytes(info)))
            .when(PinCondition::StatusIsNot(PinStatus::Deleted))
            .sort_by(PinSort::AllocationCountAsc)
            .sort_by(PinSort::CreatedAtDesc)
            .limit(MAX_BATCH);
        let push = PinUpdate::new()
            .when(PinCondition::LacksAllocation(target.clone()))
            .when(PinCondition::StatusIsNot(PinStatus::Deleted))
            .then(PinMutation::PushAllocation(PinAllocate::new(target.clone(), now)))
            .then(PinMutation::Touch(now));

        let mut allocations = Vec::new();
        for pin in self.ledger.find(&query).await? {
            // another allocator may have won the race since the query ran
            if let Some(pin) = self.ledger.update(&pin.cid, &push).await? {
                allocations.push(PinAssignment::for_pin(&pin, now));
            }
        }
        if allocations.is_empty() {
            debug!(peer = %target.fmt_short(), "nothing to allocate");
            return Ok(None);
        }

        info!(peer = %target.fmt_short(), count = allocations.len(), "allocated pins");
        let batch = PinAllocation {
            peer_id: target.clone(),
            allocations,
        };
        self.deliver(&batch, via, now);
        Ok(Some(batch))
    }

    fn deliver(self: &Arc<Self>, batch: &PinAllocation, via: &PeerId, now: Timestamp) {
        let target = &batch.peer_id;
        let mut skip = vec![target];

        if *target == self.own_id {
            self.execute(batch.allocations.iter().map(|a| a.cid.clone()).collect());
        } else {
            let envelope = Envelope::new(Message::PinAllocation(batch.clone()), now);
            if !self.peers.send(target, envelope.clone()) {
                if via != target && self.peers.send(via, envelope) {
                    debug!(peer = %target.fmt_short(), via = %via.fmt_short(), "allocation sent for relay");
                    skip.push(via);
                } else {
                    warn!(peer = %target.fmt_short(), "allocation target unreachable");
                }
            }
        }

        let gossip = GossipAlloc {
            peer_id: target.clone(),
            allocations: batch.allocations.clone(),
            ts: now,
        };
        self.peers
            .broadcast(&Envelope::new(Message::MsgGossipAlloc(gossip), now), &skip);
    }

    async fn pin_new(self: &Arc<Self>, event: PinEvent, from: &PeerId, now: Timestamp) -> Result<()> {
        let peer = event.peer_id.unwrap_or_else(|| from.clone());
        let pin = Pin::new(&event.cid, now)
            .with_status(PinStatus::Pinned)
            .with_metadata(event.metadata.unwrap_or_default())
            .with_size(event.size);
        if self.ledger.create(pin).await? {
            info!(cid = %event.cid, peer = %peer.fmt_short(), "new pin");
        }
        self.complete_pin(&event.cid, &peer, event.size, now).await?;
        Ok(())
    }

    /// Records that `peer` stored `cid`.
    ///
    /// An allocation that is missing its confirmation or size gets both; a
    /// peer without an allocation gets a confirmed one. Anything else is a
    /// duplicate. When another writer changes the record between the two
    /// attempts, both are retried against the new state.
    pub async fn complete_pin(
        &self,
        cid: &str,
        peer: &PeerId,
        size: Option<u64>,
        now: Timestamp,
    ) -> Result<Option<Pin>> {
        let incomplete = PinCondition::AllocationIncomplete(peer.clone());
        let absent = PinCondition::LacksAllocation(peer.clone());
        let confirm = PinUpdate::new()
            .when(incomplete.clone())
            .when(PinCondition::StatusIsNot(PinStatus::Deleted))
            .then(PinMutation::ConfirmAllocation {
                peer: peer.clone(),
                pinned_at: now,
                size,
            })
            .then(PinMutation::RecomputeMedianSize)
            .then(PinMutation::SetStatus(PinStatus::Pinned))
            .then(PinMutation::Touch(now));
        let insert = PinUpdate::new()
            .when(absent.clone())
            .when(PinCondition::StatusIsNot(PinStatus::Deleted))
            .then(PinMutation::PushAllocation(PinAllocate::confirmed(
                peer.clone(),
                now,
                size,
            )))
            .then(PinMutation::RecomputeMedianSize)
            .then(PinMutation::SetStatus(PinStatus::Pinned))
            .then(PinMutation::Touch(now));

        loop {
            if let Some(pin) = self.ledger.update(cid, &confirm).await? {
                return Ok(Some(pin));
            }
            if let Some(pin) = self.ledger.update(cid, &insert).await? {
                return Ok(Some(pin));
            }
            let settled = match self.ledger.get(cid).await? {
                None => true,
                Some(pin) => pin.is_deleted() || !(incomplete.matches(&pin) || absent.matches(&pin)),
            };
            if settled {
                debug!(%cid, peer = %peer.fmt_short(), "ignoring duplicate or stale completion");
                return Ok(None);
            }
            debug!(%cid, peer = %peer.fmt_short(), "record changed during completion, retrying");
        }
    }

    /// Drops `peer`'s allocation of `cid` unless it already confirmed it.
    pub async fn fail_pin(&self, cid: &str, peer: &PeerId, now: Timestamp) -> Result<Option<Pin>> {
        let update = PinUpdate::new()
            .when(PinCondition::AllocationUnconfirmed(peer.clone()))
            .when(PinCondition::StatusIsNot(PinStatus::Deleted))
            .then(PinMutation::PullAllocation(peer.clone()))
            .then(PinMutation::Touch(now));
        let updated = self.ledger.update(cid, &update).await?;
        match &updated {
            Some(_) => info!(%cid, peer = %peer.fmt_short(), "pin failed, allocation released"),
            None => debug!(%cid, peer = %peer.fmt_short(), "ignoring stale failure"),
        }
        Ok(updated)
    }

    pub async fn remove_peer(&self, cid: &str, peer: &PeerId, now: Timestamp) -> Result<Option<Pin>> {
        let update = PinUpdate::new()
            .when(PinCondition::HasAllocation(peer.clone()))
            .then(PinMutation::PullAllocation(peer.clone()))
            .then(PinMutation::RecomputeMedianSize)
            .then(PinMutation::Touch(now));
        self.ledger.update(cid, &update).await
    }

    /// Marks `cid` deleted and clears its allocations. Removals that did
    /// not arrive from the network are announced to every connected peer.
    pub async fn remove_pin(
        self: &Arc<Self>,
        cid: &str,
        ts: Timestamp,
        received_from_network: bool,
    ) -> Result<bool> {
        let held = self
            .ledger
            .get(cid)
            .await?
            .is_some_and(|pin| pin.is_allocated_to(&self.own_id));
        let update = PinUpdate::new()
            .when(PinCondition::StatusIsNot(PinStatus::Deleted))
            .then(PinMutation::SetStatus(PinStatus::Deleted))
            .then(PinMutation::ClearAllocations)
            .then(PinMutation::Touch(ts));
        let removed = self.ledger.update(cid, &update).await?.is_some();

        if removed {
            info!(%cid, "pin removed");
            if held {
                self.release(cid);
            }
        }
        if !received_from_network {
            self.broadcast(Message::PinRemove(PinRemove { cid: cid.to_owned() }), ts);
        }
        Ok(removed)
    }

    async fn pin_allocation(self: &Arc<Self>, batch: PinAllocation, now: Timestamp) -> Result<()> {
        if batch.peer_id == self.own_id {
            let pins = self
                .apply_allocations(&self.own_id, &batch.allocations, PinStatus::Queued, now)
                .await?;
            let cids: Vec<String> = pins
                .into_iter()
                .filter(|pin| {
                    !pin.is_deleted()
                        && pin
                            .allocation(&self.own_id)
                            .is_some_and(|a| !a.is_confirmed())
                })
                .map(|pin| pin.cid)
                .collect();
            info!(count = cids.len(), "received allocation");
            self.execute(cids);
            return Ok(());
        }

        self.apply_allocations(&batch.peer_id, &batch.allocations, PinStatus::New, now)
            .await?;
        let target = batch.peer_id.clone();
        if self
            .peers
            .send(&target, Envelope::new(Message::PinAllocation(batch), now))
        {
            debug!(peer = %target.fmt_short(), "relayed allocation");
        } else {
            debug!(peer = %target.fmt_short(), "allocation target not connected");
        }
        Ok(())
    }

    /// Materializes unknown pins and records `peer`'s allocation on each.
    /// Returns the resulting records.
    async fn apply_allocations(
        &self,
        peer: &PeerId,
        assignments: &[PinAssignment],
        status: PinStatus,
        now: Timestamp,
    ) -> Result<Vec<Pin>> {
        let mut pins = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let mut pin = Pin::new(&assignment.cid, assignment.created_at)
                .with_status(status)
                .with_metadata(assignment.metadata.clone().unwrap_or_default());
            pin.median_size = assignment.median_size;
            self.ledger.create(pin).await?;

            let push = PinUpdate::new()
                .when(PinCondition::LacksAllocation(peer.clone()))
                .when(PinCondition::StatusIsNot(PinStatus::Deleted))
                .then(PinMutation::PushAllocation(PinAllocate::new(
                    peer.clone(),
                    assignment.allocated_at,
                )))
                .then(PinMutation::Touch(now));
            let current = match self.ledger.update(&assignment.cid, &push).await? {
                Some(pin) => Some(pin),
                None => self.ledger.get(&assignment.cid).await?,
            };
            pins.extend(current);
        }
        Ok(pins)
    }

    /// One page of pins created after `last_pin` and deletions after
    /// `last_unpin`, each ascending.
    pub async fn sync_page(&self, req: SyncReq) -> Result<SyncResp> {
        let pins = PinQuery::new()
            .when(match req.last_pin_cid {
                Some(cid) => PinCondition::CreatedAfterKey(req.last_pin, cid),
                None => PinCondition::CreatedAfter(req.last_pin),
            })
            .when(PinCondition::StatusIsNot(PinStatus::Deleted))
            .sort_by(PinSort::CreatedAtAsc)
            .limit(SYNC_PAGE_SIZE);
        let unpins = PinQuery::new()
            .when(PinCondition::StatusIs(PinStatus::Deleted))
            .when(match req.last_unpin_cid {
                Some(cid) => PinCondition::UpdatedAfterKey(req.last_unpin, cid),
                None => PinCondition::UpdatedAfter(req.last_unpin),
            })
            .sort_by(PinSort::LastUpdatedAsc)
            .limit(SYNC_PAGE_SIZE);
        Ok(SyncResp {
            pins: self.ledger.find(&pins).await?,
            unpins: self.ledger.find(&unpins).await?,
        })
    }

    async fn apply_sync(self: &Arc<Self>, resp: SyncResp, from: &PeerId, now: Timestamp) -> Result<()> {
        let full = resp.pins.len() >= SYNC_PAGE_SIZE || resp.unpins.len() >= SYNC_PAGE_SIZE;
        // pages are ordered by (timestamp, cid), so the last key continues
        // the next page even when many records share one millisecond
        let last_pin = resp.pins.iter().map(|p| (p.created_at, &p.cid)).max();
        let last_unpin = resp.unpins.iter().map(|p| (p.last_updated, &p.cid)).max();
        let floor = SyncReq {
            last_pin: last_pin.map_or(0, |(ts, _)| ts),
            last_unpin: last_unpin.map_or(0, |(ts, _)| ts),
            last_pin_cid: last_pin.map(|(_, cid)| cid.clone()),
            last_unpin_cid: last_unpin.map(|(_, cid)| cid.clone()),
        };

        let mut created = 0;
        for pin in resp.pins {
            if self.ledger.create(pin).await? {
                created += 1;
            }
        }
        let mut removed = 0;
        for unpin in resp.unpins {
            let (cid, ts) = (unpin.cid.clone(), unpin.last_updated);
            if self.ledger.create(unpin).await? || self.remove_pin(&cid, ts, true).await? {
                removed += 1;
            }
        }
        info!(peer = %from.fmt_short(), created, removed, "applied sync page");

        if full {
            self.send_sync_req(from, floor, now).await?;
        }
        Ok(())
    }

    /// Pins each cid through the executor in its own task and reports the
    /// outcome to the cluster.
    fn execute(self: &Arc<Self>, cids: Vec<String>) {
        let Some(executor) = self.executor.clone() else {
            return;
        };
        for cid in cids {
            let node = self.clone();
            let executor = executor.clone();
            tokio::spawn(async move {
                let result = executor.pin(&cid).await;
                if let Err(err) = node.report_pin_result(&cid, result).await {
                    warn!(%cid, "failed to record pin result: {err:#}");
                }
            });
        }
    }

    async fn report_pin_result(
        &self,
        cid: &str,
        result: Result<u64, ExecutorError>,
    ) -> Result<()> {
        let now = now_millis();
        let own_id = self.own_id.clone();
        let message = match result {
            Ok(size) => {
                info!(%cid, size, "pinned");
                self.complete_pin(cid, &own_id, Some(size), now).await?;
                Message::PinCompleted(PinEvent::new(cid).with_size(Some(size)).on_behalf_of(own_id))
            }
            Err(err) => {
                warn!(%cid, "pin failed: {err}");
                self.fail_pin(cid, &own_id, now).await?;
                Message::PinFailed(PinEvent::new(cid).on_behalf_of(own_id))
            }
        };
        self.broadcast(message, now);
        Ok(())
    }

    fn release(&self, cid: &str) {
        let Some(executor) = self.executor.clone() else {
            return;
        };
        let cid = cid.to_owned();
        tokio::spawn(async move {
            match executor.unpin(&cid).await {
                Ok(()) => info!(%cid, "unpinned"),
                Err(err) => warn!(%cid, "unpin failed: {err}"),
            }
        });
    }
}

/// Picks the further of the local high-water mark and `floor`. A floor at
/// the same timestamp wins because its cid narrows the next page.
fn ahead_of(
    local: Option<Timestamp>,
    floor: Timestamp,
    floor_cid: Option<String>,
) -> (Timestamp, Option<String>) {
    match local {
        Some(local) if local > floor => (local, None),
        _ => (floor, floor_cid),
    }
}
