use anyhow::Result;
use dashmap::{DashMap, mapref::entry::Entry};
use pin_core::{
    Ledger, Pin, PinQuery, PinUpdate,
    ledger::may_create_over,
};

/// Ledger that keeps every record in process memory.
///
/// Each record lives in a DashMap shard; holding the shard's write guard
/// for the whole match-then-mutate step is what makes updates atomic.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    pins: DashMap<String, Pin>,
}

impl MemoryLedger {
    /// Creates a new, empty `MemoryLedger`.
    pub fn new() -> Self {
        Self {
            pins: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}

#[async_trait::async_trait]
impl Ledger for MemoryLedger {
    async fn get(&self, cid: &str) -> Result<Option<Pin>> {
        Ok(self.pins.get(cid).map(|pin| pin.clone()))
    }

    async fn find(&self, query: &PinQuery) -> Result<Vec<Pin>> {
        let candidates: Vec<Pin> = self
            .pins
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        Ok(query.select(candidates))
    }

    async fn update(&self, cid: &str, update: &PinUpdate) -> Result<Option<Pin>> {
        let Some(mut pin) = self.pins.get_mut(cid) else {
            return Ok(None);
        };
        if update.apply(&mut pin) {
            Ok(Some(pin.clone()))
        } else {
            Ok(None)
        }
    }

    async fn create(&self, pin: Pin) -> Result<bool> {
        match self.pins.entry(pin.cid.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(pin);
                Ok(true)
            }
            Entry::Occupied(mut entry) => {
                if may_create_over(Some(entry.get()), &pin) {
                    entry.insert(pin);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }
}
