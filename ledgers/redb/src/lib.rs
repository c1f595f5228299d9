//! RedbLedger - A persistent pin ledger backed by redb.
//!
//! Records are stored as CBOR under their cid. redb serializes write
//! transactions, so running each match-then-mutate step inside a single
//! write transaction makes it atomic across every task sharing the handle.

use anyhow::{Context, anyhow};
use pin_core::{Ledger, Pin, PinQuery, PinUpdate, ledger::may_create_over};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use std::{path::Path, sync::Arc};

const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("pins");

#[derive(Clone)]
pub struct RedbLedger {
    db: Arc<Database>,
}

impl RedbLedger {
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create ledger directory {path:?}"))?;
        let db = Database::create(path.join("ledger.redb"))?;

        // Create the table up front so a first read on a fresh database
        // does not fail with a missing table.
        {
            let write_txn = db.begin_write()?;
            {
                let _ = write_txn.open_table(TABLE)?;
            }
            write_txn.commit()?;
        }

        Ok(Self { db: Arc::new(db) })
    }
}

impl std::fmt::Debug for RedbLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbLedger").finish()
    }
}

fn decode(bytes: &[u8]) -> anyhow::Result<Pin> {
    minicbor::decode(bytes).map_err(|e| anyhow!("CBOR decode failed: {e}"))
}

fn encode(pin: &Pin) -> anyhow::Result<Vec<u8>> {
    minicbor::to_vec(pin).map_err(|e| anyhow!("CBOR encode failed: {e}"))
}

#[async_trait::async_trait]
impl Ledger for RedbLedger {
    async fn get(&self, cid: &str) -> anyhow::Result<Option<Pin>> {
        let db = self.db.clone();
        let cid = cid.to_owned();

        tokio::task::spawn_blocking(move || -> anyhow::Result<Option<Pin>> {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(TABLE)?;
            table
                .get(cid.as_str())?
                .map(|guard| decode(guard.value()))
                .transpose()
        })
        .await
        .map_err(|e| anyhow!("redb read task failed: {}", e))?
    }

    async fn find(&self, query: &PinQuery) -> anyhow::Result<Vec<Pin>> {
        let db = self.db.clone();
        let query = query.clone();

        tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<Pin>> {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(TABLE)?;
            let mut candidates = Vec::new();
            for entry in table.iter()? {
                let (_, value) = entry?;
                let pin = decode(value.value())?;
                if query.matches(&pin) {
                    candidates.push(pin);
                }
            }
            Ok(query.select(candidates))
        })
        .await
        .map_err(|e| anyhow!("redb read task failed: {}", e))?
    }

    async fn update(&self, cid: &str, update: &PinUpdate) -> anyhow::Result<Option<Pin>> {
        let db = self.db.clone();
        let cid = cid.to_owned();
        let update = update.clone();

        tokio::task::spawn_blocking(move || -> anyhow::Result<Option<Pin>> {
            let write_txn = db.begin_write()?;
            let updated = {
                let mut table = write_txn.open_table(TABLE)?;
                let existing = table
                    .get(cid.as_str())?
                    .map(|guard| decode(guard.value()))
                    .transpose()?;

                match existing {
                    Some(mut pin) => {
                        if update.apply(&mut pin) {
                            table.insert(cid.as_str(), encode(&pin)?.as_slice())?;
                            Some(pin)
                        } else {
                            None
                        }
                    }
                    None => None,
                }
            };
            if updated.is_some() {
                write_txn.commit()?;
            } else {
                write_txn.abort()?;
            }
            Ok(updated)
        })
        .await
        .map_err(|e| anyhow!("redb write task failed: {}", e))?
    }

    async fn create(&self, pin: Pin) -> anyhow::Result<bool> {
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
            let write_txn = db.begin_write()?;
            let written = {
                let mut table = write_txn.open_table(TABLE)?;
                let existing = table
                    .get(pin.cid.as_str())?
                    .map(|guard| decode(guard.value()))
                    .transpose()?;

                if may_create_over(existing.as_ref(), &pin) {
                    table.insert(pin.cid.as_str(), encode(&pin)?.as_slice())?;
                    true
                } else {
                    false
                }
            };
            write_txn.commit()?;
            Ok(written)
        })
        .await
        .map_err(|e| anyhow!("redb write task failed: {}", e))?
    }
}
