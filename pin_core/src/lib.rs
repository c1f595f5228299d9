//! Core pin cluster types and traits.
//!
//! This crate defines the shared types and traits used by all pin cluster
//! crates.
//!
//! ## Ledger records (persisted and on the wire)
//!
//! - Pins and their per-peer allocations (`model::Pin`, `model::PinAllocate`)
//! - Node addresses (`peer_id::PeerId`)
//!
//! These types appear verbatim in sync responses and in every ledger
//! backend; changes to them are protocol changes.
//!
//! ## Coordination helpers
//!
//! - The `Ledger` trait with its match-then-mutate update language
//!   (`ledger::PinUpdate`, `ledger::PinQuery`); implementations live in
//!   `pin_ledger_memory` and `pin_ledger_redb`
//! - Clock-indexed allocator rotation (`rotation`)

pub mod ledger;
pub mod model;
pub mod peer_id;
pub mod rotation;

// Test utilities (behind feature flag)
#[cfg(feature = "testutil")]
pub mod testutil;

pub use ledger::{Ledger, PinCondition, PinMutation, PinQuery, PinSort, PinUpdate};
pub use model::{Pin, PinAllocate, PinMetadata, PinStatus, Timestamp, median, now_millis};
pub use peer_id::{PeerId, PeerIdError};
pub use rotation::{clock_minute, current_allocator};
