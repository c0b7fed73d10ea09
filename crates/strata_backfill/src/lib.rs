//! Backfill source for the Strata replicated key-range store.
//!
//! When a replica joins or falls behind, an up-to-date peer streams the
//! missing portion of a key range to it: authoritative items where the
//! catching-up side is stale, compact empty-range markers where it is not,
//! and per-sub-range version metainfo so the receiver converges to the
//! sender's version. This crate is the sending half of that protocol.
//!
//! - [`backfiller::Backfiller`] accepts sink registrations and spawns one
//!   [`backfiller::Client`] per sink.
//! - [`store::StoreView`] is the contract the underlying store fulfils.
//! - [`mailbox::MailboxManager`] carries the wire messages in [`proto`].
//! - [`region`], [`version`], and [`item`] hold the data model.

pub mod backfiller;
pub mod fifo;
pub mod item;
pub mod mailbox;
pub mod proto;
pub mod region;
pub mod signal;
pub mod store;
pub mod throttle;
pub mod version;

pub use backfiller::{BackfillConfig, Backfiller, Client, ITEM_CHUNK_SIZE, ITEM_PIPELINE_SIZE};
pub use region::{KeyRange, Region, RegionMap, RightBound};
pub use store::{Flow, ItemConsumer, PreItemProducer, Produced, StoreView};
pub use version::{Timestamp, Version};
