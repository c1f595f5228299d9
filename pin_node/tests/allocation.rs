//! Drives the allocator through in-process channels.
//!
//! Each "connected peer" is an mpsc receiver registered in the allocator's
//! peer table, so the tests see exactly what would be written to the wire.
//!
//! To run: `cargo test -p pin_node --test allocation`

use anyhow::Result;
use async_trait::async_trait;
use pin_core::testutil::peer;
use pin_core::{
    Ledger, PeerId, Pin, PinAllocate, PinMutation, PinQuery, PinStatus, PinUpdate,
};
use pin_ledger_memory::MemoryLedger;
use pin_node::Allocator;
use pin_node::executor::{ExecutorError, PinExecutor};
use pin_protocol::{
    Envelope, GossipAlloc, Message, PeerInfo, PinAllocation, PinAssignment, PinEvent, PinRemove,
    SyncReq,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

const NOW: i64 = 1_700_000_000_000;

/// An allocator-capable node that is the only rotation candidate.
fn allocator() -> (Arc<Allocator>, Arc<MemoryLedger>) {
    let ledger = Arc::new(MemoryLedger::new());
    let node = Allocator::new(peer(1), ledger.clone()).with_advertise(Some("127.0.0.1:4100".into()));
    (Arc::new(node), ledger)
}

fn connect(node: &Allocator, id: PeerId, discovery: Option<&str>) -> UnboundedReceiver<Envelope> {
    let (tx, rx) = unbounded_channel();
    node.peers().insert(id, tx, discovery.map(str::to_owned));
    rx
}

fn drain(rx: &mut UnboundedReceiver<Envelope>) -> Vec<Message> {
    std::iter::from_fn(|| rx.try_recv().ok())
        .map(|envelope| envelope.message)
        .collect()
}

async fn fetch(ledger: &MemoryLedger, cid: &str) -> Pin {
    ledger.get(cid).await.unwrap().expect("pin exists")
}

fn assert_counts_consistent(pin: &Pin) {
    assert_eq!(pin.allocation_count as usize, pin.allocations.len(), "{}", pin.cid);
    let mut ids: Vec<&PeerId> = pin.allocations.iter().map(|a| &a.id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), pin.allocations.len(), "duplicate allocation on {}", pin.cid);
}

#[tokio::test]
async fn allocates_unassigned_pins_and_gossips_the_batch() -> Result<()> {
    let (node, ledger) = allocator();
    ledger.create(Pin::new("a", 1_000)).await?;
    ledger.create(Pin::new("b", 2_000)).await?;
    ledger.create(Pin::new("c", 3_000)).await?;
    let mut a = connect(&node, peer(10), None);
    let mut b = connect(&node, peer(11), None);
    let mut c = connect(&node, peer(12), None);

    node.handle_socket_msg(Message::PeerInfo(PeerInfo::new(1000, 250)), &peer(10), NOW)
        .await?;

    let received = drain(&mut a);
    assert_eq!(received.len(), 1);
    let Message::PinAllocation(batch) = &received[0] else {
        panic!("expected PIN_ALLOCATION, got {}", received[0].kind());
    };
    assert_eq!(batch.peer_id, peer(10));
    let cids: Vec<&str> = batch.allocations.iter().map(|a| a.cid.as_str()).collect();
    assert_eq!(cids, ["c", "b", "a"]);

    for cid in ["a", "b", "c"] {
        let pin = fetch(&ledger, cid).await;
        assert_eq!(pin.allocation_count, 1);
        assert!(pin.is_allocated_to(&peer(10)));
        assert_eq!(pin.last_updated, NOW);
    }

    for rx in [&mut b, &mut c] {
        let gossip = drain(rx);
        assert_eq!(
            gossip,
            vec![Message::MsgGossipAlloc(GossipAlloc {
                peer_id: peer(10),
                allocations: batch.allocations.clone(),
                ts: NOW,
            })]
        );
    }
    Ok(())
}

#[tokio::test]
async fn low_free_space_gets_nothing() -> Result<()> {
    let (node, ledger) = allocator();
    ledger.create(Pin::new("a", 1_000)).await?;
    let mut a = connect(&node, peer(10), None);
    let mut b = connect(&node, peer(11), None);

    let batch = node
        .request_allocations(PeerInfo::new(1000, 150), &peer(10), NOW)
        .await?;
    assert!(batch.is_none());
    // exactly 20% free is still too little
    node.handle_socket_msg(Message::PeerInfo(PeerInfo::new(1000, 200)), &peer(10), NOW)
        .await?;

    assert!(drain(&mut a).is_empty());
    assert!(drain(&mut b).is_empty());
    assert_eq!(fetch(&ledger, "a").await, Pin::new("a", 1_000));
    Ok(())
}

#[tokio::test]
async fn skips_pins_larger_than_the_free_margin() -> Result<()> {
    let (node, ledger) = allocator();
    let mib = 1_048_576;
    for (cid, median) in [("big", Some(60 * mib)), ("small", Some(10 * mib)), ("unknown", None)] {
        let mut pin = Pin::new(cid, 1_000);
        pin.median_size = median;
        ledger.create(pin).await?;
    }
    let _a = connect(&node, peer(10), None);

    // margin is (250 - 200) MiB
    let batch = node
        .request_allocations(PeerInfo::new(1000, 250), &peer(10), NOW)
        .await?
        .expect("something fits");
    let mut cids: Vec<&str> = batch.allocations.iter().map(|a| a.cid.as_str()).collect();
    cids.sort();
    assert_eq!(cids, ["small", "unknown"]);
    assert_eq!(fetch(&ledger, "big").await.allocation_count, 0);
    Ok(())
}

#[tokio::test]
async fn prefers_least_allocated_then_newest_and_caps_the_batch() -> Result<()> {
    let (node, ledger) = allocator();
    for n in 0..9 {
        ledger.create(Pin::new(format!("fresh-{n}"), 1_000 + n)).await?;
    }
    for n in 0..3 {
        let mut pin = Pin::new(format!("held-{n}"), 5_000 + n);
        pin.allocations.push(PinAllocate::new(peer(20), 1));
        pin.allocation_count = 1;
        ledger.create(pin).await?;
    }
    ledger
        .create(Pin::new("gone", 9_000).with_status(PinStatus::Deleted))
        .await?;
    let _a = connect(&node, peer(10), None);

    let batch = node
        .request_allocations(PeerInfo::new(1000, 900), &peer(10), NOW)
        .await?
        .expect("batch");
    let cids: Vec<&str> = batch.allocations.iter().map(|a| a.cid.as_str()).collect();
    assert_eq!(cids.len(), 10);
    assert_eq!(cids[0], "fresh-8");
    assert_eq!(cids[8], "fresh-0");
    assert_eq!(cids[9], "held-2");
    assert!(!cids.contains(&"gone"));

    let held = fetch(&ledger, "held-2").await;
    assert_eq!(held.allocation_count, 2);
    assert_counts_consistent(&held);

    // a second report only picks up what is left
    let again = node
        .request_allocations(PeerInfo::new(1000, 900), &peer(10), NOW + 1)
        .await?
        .expect("batch");
    let cids: Vec<&str> = again.allocations.iter().map(|a| a.cid.as_str()).collect();
    assert_eq!(cids, ["held-1", "held-0"]);
    Ok(())
}

#[tokio::test]
async fn sync_returns_a_page_of_each_in_ascending_order() -> Result<()> {
    let (node, ledger) = allocator();
    for n in 0..5 {
        ledger.create(Pin::new(format!("old-{n}"), 500 + n)).await?;
    }
    for n in 1..=60 {
        ledger.create(Pin::new(format!("new-{n}"), 1_000 + n)).await?;
    }
    for n in 1..=55 {
        let mut gone = Pin::new(format!("gone-{n}"), 100).with_status(PinStatus::Deleted);
        gone.last_updated = 2_000 + n;
        ledger.create(gone).await?;
    }
    let mut gone = Pin::new("gone-early", 100).with_status(PinStatus::Deleted);
    gone.last_updated = 900;
    ledger.create(gone).await?;
    let mut a = connect(&node, peer(10), None);

    node.handle_socket_msg(
        Message::SyncReq(SyncReq::new(1_000, 1_000)),
        &peer(10),
        NOW,
    )
    .await?;

    let received = drain(&mut a);
    let [Message::SyncResp(resp)] = received.as_slice() else {
        panic!("expected one SYNC_RESP");
    };
    assert_eq!(resp.pins.len(), 50);
    assert_eq!(resp.unpins.len(), 50);
    assert!(resp.pins.windows(2).all(|w| w[0].created_at < w[1].created_at));
    assert_eq!(resp.pins[0].created_at, 1_001);
    assert!(resp.pins.iter().all(|p| !p.is_deleted()));
    assert!(resp.unpins.windows(2).all(|w| w[0].last_updated < w[1].last_updated));
    assert_eq!(resp.unpins[0].last_updated, 2_001);
    assert!(resp.unpins.iter().all(|p| p.is_deleted()));
    Ok(())
}

#[tokio::test]
async fn applying_a_full_sync_page_asks_for_more() -> Result<()> {
    let (source, source_ledger) = allocator();
    for n in 1..=60 {
        source_ledger.create(Pin::new(format!("p-{n}"), 1_000 + n)).await?;
    }
    let page = source.sync_page(SyncReq::default()).await?;

    let ledger = Arc::new(MemoryLedger::new());
    ledger.create(Pin::new("doomed", 10)).await?;
    let node = Arc::new(Allocator::new(peer(2), ledger.clone()));
    let mut upstream = connect(&node, peer(1), Some("127.0.0.1:4100"));

    let mut removal = Pin::new("doomed", 10).with_status(PinStatus::Deleted);
    removal.last_updated = 3_000;
    let mut resp = page.clone();
    resp.unpins.push(removal);
    node.handle_socket_msg(Message::SyncResp(resp), &peer(1), NOW)
        .await?;

    assert_eq!(ledger.len(), 51);
    let doomed = fetch(&ledger, "doomed").await;
    assert!(doomed.is_deleted());
    assert_eq!(doomed.last_updated, 3_000);

    // removals from the network are not announced again
    let received = drain(&mut upstream);
    assert_eq!(
        received,
        vec![Message::SyncReq(SyncReq {
            last_pin: 1_050,
            last_unpin: 3_000,
            last_pin_cid: Some("p-50".into()),
            last_unpin_cid: Some("doomed".into()),
        })]
    );
    Ok(())
}

#[tokio::test]
async fn sync_pages_through_pins_sharing_a_millisecond() -> Result<()> {
    let (source, source_ledger) = allocator();
    for n in 0..70 {
        source_ledger.create(Pin::new(format!("p-{n:02}"), 1_000)).await?;
    }

    let ledger = Arc::new(MemoryLedger::new());
    let node = Arc::new(Allocator::new(peer(2), ledger.clone()));
    let mut upstream = connect(&node, peer(1), Some("127.0.0.1:4100"));

    let first = source.sync_page(SyncReq::default()).await?;
    assert_eq!(first.pins.len(), 50);
    node.handle_socket_msg(Message::SyncResp(first), &peer(1), NOW)
        .await?;

    let sent: [Message; 1] = drain(&mut upstream).try_into().expect("one message");
    let [Message::SyncReq(next)] = sent else {
        panic!("expected SYNC_REQ");
    };
    assert_eq!(next.last_pin, 1_000);
    assert_eq!(next.last_pin_cid.as_deref(), Some("p-49"));

    let second = source.sync_page(next).await?;
    assert_eq!(second.pins.len(), 20);
    assert_eq!(second.pins[0].cid, "p-50");
    node.handle_socket_msg(Message::SyncResp(second), &peer(1), NOW)
        .await?;

    assert_eq!(ledger.len(), 70);
    assert!(drain(&mut upstream).is_empty(), "a short page ends the catch-up");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pin_new_records_both_peers() -> Result<()> {
    let (node, ledger) = allocator();
    let event = PinEvent::new("fresh").with_size(Some(100));

    let (p2, p3) = (peer(2), peer(3));
    let (first, second) = tokio::join!(
        node.handle_socket_msg(Message::PinNew(event.clone()), &p2, NOW),
        node.handle_socket_msg(Message::PinNew(event.clone()), &p3, NOW + 1),
    );
    first?;
    second?;

    let pin = fetch(&ledger, "fresh").await;
    assert_eq!(pin.allocations.len(), 2);
    assert_eq!(pin.status, PinStatus::Pinned);
    assert!(pin.allocations.iter().all(|a| a.is_confirmed()));
    assert_eq!(pin.median_size, Some(100));
    assert_counts_consistent(&pin);
    Ok(())
}

/// Lets another writer push an unconfirmed allocation right after the
/// first update attempt on the record.
#[derive(Debug)]
struct InterleavingLedger {
    inner: MemoryLedger,
    competing: PeerId,
    fired: AtomicBool,
}

#[async_trait]
impl Ledger for InterleavingLedger {
    async fn get(&self, cid: &str) -> Result<Option<Pin>> {
        self.inner.get(cid).await
    }

    async fn find(&self, query: &PinQuery) -> Result<Vec<Pin>> {
        self.inner.find(query).await
    }

    async fn update(&self, cid: &str, update: &PinUpdate) -> Result<Option<Pin>> {
        let result = self.inner.update(cid, update).await?;
        if !self.fired.swap(true, Ordering::SeqCst) {
            let push = PinUpdate::new()
                .then(PinMutation::PushAllocation(PinAllocate::new(self.competing.clone(), NOW)));
            self.inner.update(cid, &push).await?;
        }
        Ok(result)
    }

    async fn create(&self, pin: Pin) -> Result<bool> {
        self.inner.create(pin).await
    }
}

#[tokio::test]
async fn completion_survives_a_concurrent_allocation() -> Result<()> {
    let ledger = Arc::new(InterleavingLedger {
        inner: MemoryLedger::new(),
        competing: peer(10),
        fired: AtomicBool::new(false),
    });
    ledger.inner.create(Pin::new("x", 1_000)).await?;
    let node = Allocator::new(peer(1), ledger.clone());

    let pin = node
        .complete_pin("x", &peer(10), Some(100), NOW)
        .await?
        .expect("completion applied");

    let allocation = pin.allocation(&peer(10)).expect("allocation");
    assert_eq!(allocation.pinned_at, Some(NOW));
    assert_eq!(allocation.reported_size, Some(100));
    assert_eq!(pin.median_size, Some(100));
    assert_eq!(pin.status, PinStatus::Pinned);
    assert_counts_consistent(&pin);
    Ok(())
}

#[tokio::test]
async fn completion_confirms_and_tracks_the_median() -> Result<()> {
    let (node, ledger) = allocator();
    let mut pin = Pin::new("x", 1_000);
    for n in 2..=5 {
        pin.allocations.push(PinAllocate::new(peer(n), 1_500));
    }
    pin.allocation_count = 4;
    ledger.create(pin).await?;

    for (n, size) in [(2, 10), (3, 20), (4, 40)] {
        let event = PinEvent::new("x").with_size(Some(size));
        node.handle_socket_msg(Message::PinCompleted(event), &peer(n), NOW)
            .await?;
    }
    let three = fetch(&ledger, "x").await;
    assert_eq!(three.median_size, Some(20));
    assert_eq!(three.status, PinStatus::Pinned);

    node.handle_socket_msg(
        Message::PinCompleted(PinEvent::new("x").with_size(Some(30))),
        &peer(5),
        NOW,
    )
    .await?;
    assert_eq!(fetch(&ledger, "x").await.median_size, Some(25));

    // a repeat is a duplicate and changes nothing
    let before = fetch(&ledger, "x").await;
    let repeat = node
        .complete_pin("x", &peer(2), Some(999), NOW + 5)
        .await?;
    assert!(repeat.is_none());
    assert_eq!(fetch(&ledger, "x").await, before);
    assert_counts_consistent(&before);
    Ok(())
}

#[tokio::test]
async fn failure_releases_only_unconfirmed_allocations() -> Result<()> {
    let (node, ledger) = allocator();
    let mut pin = Pin::new("x", 1_000);
    pin.allocations.push(PinAllocate::new(peer(2), 1_500));
    pin.allocations.push(PinAllocate::confirmed(peer(3), 1_500, Some(7)));
    pin.allocation_count = 2;
    ledger.create(pin).await?;

    node.handle_socket_msg(Message::PinFailed(PinEvent::new("x")), &peer(3), NOW)
        .await?;
    node.handle_socket_msg(Message::PinFailed(PinEvent::new("x")), &peer(2), NOW)
        .await?;
    node.handle_socket_msg(Message::PinFailed(PinEvent::new("x")), &peer(2), NOW)
        .await?;

    let pin = fetch(&ledger, "x").await;
    assert_eq!(pin.allocations.len(), 1);
    assert!(pin.is_allocated_to(&peer(3)));
    assert_counts_consistent(&pin);

    node.handle_socket_msg(
        Message::PinRemovePeer(PinEvent::new("x").on_behalf_of(peer(3))),
        &peer(9),
        NOW,
    )
    .await?;
    let pin = fetch(&ledger, "x").await;
    assert!(pin.allocations.is_empty());
    assert_eq!(pin.median_size, None);
    assert_counts_consistent(&pin);
    Ok(())
}

#[tokio::test]
async fn events_after_removal_do_nothing() -> Result<()> {
    let (node, ledger) = allocator();
    let mut pin = Pin::new("x", 1_000);
    pin.allocations.push(PinAllocate::new(peer(2), 1_500));
    pin.allocations.push(PinAllocate::new(peer(3), 1_500));
    pin.allocation_count = 2;
    ledger.create(pin).await?;
    let mut a = connect(&node, peer(2), None);

    assert!(node.remove_pin("x", NOW, false).await?);
    assert_eq!(
        drain(&mut a),
        vec![Message::PinRemove(PinRemove { cid: "x".into() })]
    );

    node.handle_socket_msg(
        Message::PinCompleted(PinEvent::new("x").with_size(Some(5))),
        &peer(2),
        NOW + 1,
    )
    .await?;
    node.handle_socket_msg(Message::PinFailed(PinEvent::new("x")), &peer(3), NOW + 1)
        .await?;
    node.handle_socket_msg(Message::PinRemove(PinRemove { cid: "x".into() }), &peer(2), NOW + 2)
        .await?;

    let pin = fetch(&ledger, "x").await;
    assert!(pin.is_deleted());
    assert!(pin.allocations.is_empty());
    assert_eq!(pin.allocation_count, 0);
    assert_eq!(pin.last_updated, NOW);
    assert!(drain(&mut a).is_empty(), "network removals are not re-broadcast");
    Ok(())
}

#[tokio::test]
async fn pin_new_after_removal_recreates_the_pin() -> Result<()> {
    let (node, ledger) = allocator();
    node.handle_socket_msg(Message::PinNew(PinEvent::new("x")), &peer(2), NOW)
        .await?;
    node.remove_pin("x", NOW + 10, false).await?;

    node.handle_socket_msg(
        Message::PinNew(PinEvent::new("x").with_size(Some(64))),
        &peer(3),
        NOW + 20,
    )
    .await?;

    let pin = fetch(&ledger, "x").await;
    assert_eq!(pin.status, PinStatus::Pinned);
    assert_eq!(pin.created_at, NOW + 20);
    assert_eq!(pin.allocations.len(), 1);
    assert!(pin.is_allocated_to(&peer(3)));
    assert_eq!(pin.size, Some(64));
    Ok(())
}

#[tokio::test]
async fn forwards_reports_to_the_current_allocator() -> Result<()> {
    let (node, ledger) = allocator();
    ledger.create(Pin::new("a", 1_000)).await?;
    let mut other = connect(&node, peer(2), Some("127.0.0.1:4200"));
    let mut reporter = connect(&node, peer(10), None);

    let now = (0..2)
        .map(|minute| NOW + minute * 60_000)
        .find(|now| node.current_allocator(*now) == Some(peer(2)))
        .expect("both candidates take a turn");

    let batch = node
        .request_allocations(PeerInfo::new(1000, 500), &peer(10), now)
        .await?;
    assert!(batch.is_none());
    assert_eq!(
        drain(&mut other),
        vec![Message::PeerInfo(PeerInfo::new(1000, 500).forwarded_for(peer(10)))]
    );
    assert!(drain(&mut reporter).is_empty());
    assert_eq!(fetch(&ledger, "a").await.allocation_count, 0);
    Ok(())
}

#[tokio::test]
async fn allocates_locally_when_the_current_allocator_is_unreachable() -> Result<()> {
    let (node, ledger) = allocator();
    ledger.create(Pin::new("a", 1_000)).await?;
    node.learn_discovery_peers(&[pin_protocol::DiscoveryPeer {
        peer_id: peer(2),
        discovery: "127.0.0.1:4200".into(),
    }]);
    let _reporter = connect(&node, peer(10), None);

    for minute in 0..2 {
        node.request_allocations(PeerInfo::new(1000, 500), &peer(10), NOW + minute * 60_000)
            .await?;
    }
    let pin = fetch(&ledger, "a").await;
    assert!(pin.is_allocated_to(&peer(10)));
    assert_counts_consistent(&pin);
    Ok(())
}

#[tokio::test]
async fn forwarded_report_for_an_unconnected_peer_goes_back_for_relay() -> Result<()> {
    let (node, ledger) = allocator();
    ledger.create(Pin::new("a", 1_000)).await?;
    let mut forwarder = connect(&node, peer(2), Some("127.0.0.1:4200"));
    let mut bystander = connect(&node, peer(3), None);

    let report = PeerInfo::new(1000, 500).forwarded_for(peer(10));
    node.handle_socket_msg(Message::PeerInfo(report), &peer(2), NOW)
        .await?;

    let received = drain(&mut forwarder);
    let [Message::PinAllocation(batch)] = received.as_slice() else {
        panic!("forwarder should only get the batch to relay");
    };
    assert_eq!(batch.peer_id, peer(10));
    assert!(matches!(
        drain(&mut bystander).as_slice(),
        [Message::MsgGossipAlloc(g)] if g.peer_id == peer(10)
    ));
    Ok(())
}

#[tokio::test]
async fn relays_allocations_and_materializes_gossip() -> Result<()> {
    let ledger = Arc::new(MemoryLedger::new());
    let node = Arc::new(Allocator::new(peer(2), ledger.clone()));
    let mut target = connect(&node, peer(10), None);

    let assignment = PinAssignment {
        cid: "a".into(),
        allocated_at: NOW,
        created_at: 1_000,
        metadata: None,
        median_size: Some(8),
    };
    let batch = PinAllocation {
        peer_id: peer(10),
        allocations: vec![assignment.clone()],
    };
    node.handle_socket_msg(Message::PinAllocation(batch.clone()), &peer(1), NOW)
        .await?;
    assert_eq!(drain(&mut target), vec![Message::PinAllocation(batch)]);

    let gossip = GossipAlloc {
        peer_id: peer(11),
        allocations: vec![assignment],
        ts: NOW,
    };
    for _ in 0..2 {
        node.handle_socket_msg(Message::MsgGossipAlloc(gossip.clone()), &peer(1), NOW)
            .await?;
    }

    let pin = fetch(&ledger, "a").await;
    assert_eq!(pin.created_at, 1_000);
    assert_eq!(pin.median_size, Some(8));
    assert!(pin.is_allocated_to(&peer(10)));
    assert!(pin.is_allocated_to(&peer(11)));
    assert_counts_consistent(&pin);
    assert!(drain(&mut target).is_empty(), "gossip is never re-sent");
    Ok(())
}

#[derive(Debug, Default)]
struct RecordingExecutor {
    unpinned: Mutex<Vec<String>>,
}

#[async_trait]
impl PinExecutor for RecordingExecutor {
    async fn pin(&self, cid: &str) -> Result<u64, ExecutorError> {
        if cid.starts_with("bad") {
            return Err(ExecutorError::HttpFailWithBody(500, "no providers".into()));
        }
        Ok(42)
    }

    async fn unpin(&self, cid: &str) -> Result<(), ExecutorError> {
        self.unpinned.lock().unwrap().push(cid.to_owned());
        Ok(())
    }
}

async fn next_message(rx: &mut UnboundedReceiver<Envelope>) -> Message {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("message in time")
        .expect("channel open")
        .message
}

#[tokio::test]
async fn own_allocations_are_pinned_and_reported() -> Result<()> {
    let ledger = Arc::new(MemoryLedger::new());
    let executor = Arc::new(RecordingExecutor::default());
    let node = Arc::new(Allocator::new(peer(10), ledger.clone()).with_executor(executor.clone()));
    let mut upstream = connect(&node, peer(1), Some("127.0.0.1:4100"));

    let assignment = |cid: &str| PinAssignment {
        cid: cid.into(),
        allocated_at: NOW,
        created_at: 1_000,
        metadata: None,
        median_size: None,
    };
    let batch = PinAllocation {
        peer_id: peer(10),
        allocations: vec![assignment("good"), assignment("bad")],
    };
    node.handle_socket_msg(Message::PinAllocation(batch), &peer(1), NOW)
        .await?;
    assert_eq!(fetch(&ledger, "good").await.status, PinStatus::Queued);

    let mut reports = vec![next_message(&mut upstream).await, next_message(&mut upstream).await];
    reports.sort_by_key(|m| m.kind());
    assert_eq!(
        reports,
        vec![
            Message::PinCompleted(PinEvent::new("good").with_size(Some(42)).on_behalf_of(peer(10))),
            Message::PinFailed(PinEvent::new("bad").on_behalf_of(peer(10))),
        ]
    );

    let good = fetch(&ledger, "good").await;
    assert_eq!(good.status, PinStatus::Pinned);
    assert_eq!(good.allocation(&peer(10)).and_then(|a| a.reported_size), Some(42));
    assert!(fetch(&ledger, "bad").await.allocations.is_empty());

    node.handle_socket_msg(Message::PinRemove(PinRemove { cid: "good".into() }), &peer(1), NOW + 1)
        .await?;
    tokio::time::timeout(Duration::from_secs(5), async {
        while executor.unpinned.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
    })
    .await?;
    assert_eq!(*executor.unpinned.lock().unwrap(), ["good"]);
    Ok(())
}
