//! Conformance suite for `Ledger` implementations.
//!
//! # Usage
//!
//! In your ledger crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! pin_core = { workspace = true, features = ["testutil"] }
//! ```
//!
//! In your test file:
//!
//! ```ignore
//! use pin_core::testutil::LedgerTests;
//!
//! #[tokio::test]
//! async fn test_my_ledger() {
//!     let ledger = MyLedger::new(...);
//!     LedgerTests::new(&ledger).run_all().await.unwrap();
//! }
//! ```

use crate::ledger::{Ledger, PinCondition, PinMutation, PinQuery, PinSort, PinUpdate};
use crate::{PeerId, Pin, PinAllocate, PinStatus};
use anyhow::{Context, Result, ensure};
use futures::future::join_all;

/// Test suite for `Ledger` implementations.
///
/// Every test uses its own cids, so the suite can run against a ledger that
/// already holds data, but it expects to be the only writer while it runs.
pub struct LedgerTests<'a, L> {
    ledger: &'a L,
}

/// Deterministic peer id for tests.
pub fn peer(n: u8) -> PeerId {
    PeerId::from_secret_key(&[n; 32])
}

impl<'a, L: Ledger> LedgerTests<'a, L> {
    pub fn new(ledger: &'a L) -> Self {
        Self { ledger }
    }

    /// Run all tests.
    pub async fn run_all(&self) -> Result<()> {
        self.test_create_and_get().await?;
        self.test_conditional_update().await?;
        self.test_concurrent_pushes().await?;
        self.test_find_sort_limit().await?;
        self.test_recreate_after_delete().await?;
        self.test_latest_markers().await?;
        Ok(())
    }

    pub async fn test_create_and_get(&self) -> Result<()> {
        let pin = Pin::new("t-create", 100).with_size(Some(5));
        ensure!(self.ledger.create(pin.clone()).await?, "first create must write");
        ensure!(
            !self.ledger.create(Pin::new("t-create", 200)).await?,
            "create must not overwrite a live record"
        );
        ensure!(self.ledger.get("t-create").await? == Some(pin), "get returns stored pin");
        ensure!(self.ledger.get("t-missing").await?.is_none(), "unknown cid");
        Ok(())
    }

    pub async fn test_conditional_update(&self) -> Result<()> {
        self.ledger.create(Pin::new("t-update", 1)).await?;
        let push = PinUpdate::new()
            .when(PinCondition::LacksAllocation(peer(1)))
            .then(PinMutation::PushAllocation(PinAllocate::new(peer(1), 2)))
            .then(PinMutation::Touch(2));

        let updated = self.ledger.update("t-update", &push).await?;
        ensure!(
            updated.as_ref().map(|p| p.allocation_count) == Some(1),
            "push increments the counter"
        );
        ensure!(
            self.ledger.update("t-update", &push).await?.is_none(),
            "failed condition leaves the record alone"
        );
        ensure!(
            self.ledger.update("t-nowhere", &push).await?.is_none(),
            "update never creates records"
        );

        let stored = self.ledger.get("t-update").await?.context("record exists")?;
        ensure!(stored.allocations.len() == 1 && stored.last_updated == 2, "stored state");
        Ok(())
    }

    /// Many writers pushing distinct peers at once must not lose updates.
    pub async fn test_concurrent_pushes(&self) -> Result<()> {
        self.ledger.create(Pin::new("t-race", 1)).await?;
        let writes = (1..=16u8).map(|n| async move {
            let update = PinUpdate::new()
                .when(PinCondition::LacksAllocation(peer(n)))
                .then(PinMutation::PushAllocation(PinAllocate::new(peer(n), 5)));
            self.ledger.update("t-race", &update).await
        });
        for result in join_all(writes).await {
            ensure!(result?.is_some(), "every distinct push applies");
        }

        let pin = self.ledger.get("t-race").await?.context("record exists")?;
        ensure!(pin.allocations.len() == 16, "no lost allocations");
        ensure!(pin.allocation_count == 16, "counter matches allocations");
        Ok(())
    }

    pub async fn test_find_sort_limit(&self) -> Result<()> {
        let mut busy = Pin::new("t-find-busy", 5_000);
        busy.allocations.push(PinAllocate::new(peer(1), 1));
        busy.allocation_count = 1;
        self.ledger.create(busy).await?;
        self.ledger.create(Pin::new("t-find-old", 3_000)).await?;
        self.ledger.create(Pin::new("t-find-new", 4_000)).await?;
        self.ledger
            .create(Pin::new("t-find-gone", 4_500).with_status(PinStatus::Deleted))
            .await?;

        let query = PinQuery::new()
            .when(PinCondition::CreatedAfter(2_999))
            .when(PinCondition::StatusIsNot(PinStatus::Deleted))
            .sort_by(PinSort::AllocationCountAsc)
            .sort_by(PinSort::CreatedAtDesc)
            .limit(3);
        let cids: Vec<String> = self
            .ledger
            .find(&query)
            .await?
            .into_iter()
            .map(|p| p.cid)
            .filter(|cid| cid.starts_with("t-find"))
            .collect();
        ensure!(
            cids == ["t-find-new", "t-find-old", "t-find-busy"],
            "unexpected order: {cids:?}"
        );
        Ok(())
    }

    pub async fn test_recreate_after_delete(&self) -> Result<()> {
        self.ledger.create(Pin::new("t-revive", 10)).await?;
        let delete = PinUpdate::new()
            .when(PinCondition::StatusIsNot(PinStatus::Deleted))
            .then(PinMutation::SetStatus(PinStatus::Deleted))
            .then(PinMutation::ClearAllocations)
            .then(PinMutation::Touch(20));
        ensure!(self.ledger.update("t-revive", &delete).await?.is_some(), "delete");

        ensure!(
            !self.ledger.create(Pin::new("t-revive", 15)).await?,
            "older pin must not resurrect a deletion"
        );
        ensure!(
            self.ledger.create(Pin::new("t-revive", 25)).await?,
            "newer pin re-creates a deleted record"
        );
        let pin = self.ledger.get("t-revive").await?.context("record exists")?;
        ensure!(pin.status == PinStatus::New && pin.created_at == 25, "re-created");
        Ok(())
    }

    pub async fn test_latest_markers(&self) -> Result<()> {
        self.ledger.create(Pin::new("t-latest", 9_000_000)).await?;
        self.ledger
            .create(Pin::new("t-latest-gone", 1).with_status(PinStatus::Deleted))
            .await?;
        let touch = PinUpdate::new().then(PinMutation::Touch(9_000_001));
        self.ledger.update("t-latest-gone", &touch).await?;

        ensure!(self.ledger.latest_pin().await? >= Some(9_000_000), "latest pin");
        ensure!(self.ledger.latest_unpin().await? >= Some(9_000_001), "latest unpin");
        Ok(())
    }
}
