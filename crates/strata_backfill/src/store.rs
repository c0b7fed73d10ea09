//! Store-view contract the backfill source drives.
//!
//! The store walks a key range left to right, pulling hints about what the
//! sink already holds from a `PreItemProducer` and pushing authoritative
//! records into an `ItemConsumer`. Both sides steer the walk with `Flow`:
//! `Abort` hands control back to the caller and is not a failure.

use async_trait::async_trait;

use crate::item::{Item, PreItem};
use crate::region::{Region, RegionMap, RightBound};
use crate::signal::Drain;
use crate::version::{Timestamp, Version};

/// Cooperative continue/yield signal shared by the backfill callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Abort,
}

/// One step of the pre-item stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Produced {
    /// The next hint in line. Consume it with `release_pre_item`.
    Hint(PreItem),
    /// No hints up to this edge; the store owns everything below it.
    Gap(RightBound),
    /// The buffer is exhausted with key space still uncovered; yield and
    /// retry once the sink has sent more.
    Starved,
}

/// Pull interface the store drives to learn what the sink already holds.
pub trait PreItemProducer {
    fn next_pre_item(&mut self) -> Produced;
    /// Acknowledge the hint most recently returned by `next_pre_item`.
    fn release_pre_item(&mut self);
}

/// Push interface receiving the store's authoritative records.
pub trait ItemConsumer {
    /// A record, with the version metainfo covering at least its span.
    fn on_item(&mut self, metainfo: &RegionMap<Version>, item: Item) -> Flow;
    /// The span up to `up_to` holds nothing the sink is missing.
    fn on_empty_range(&mut self, metainfo: &RegionMap<Version>, up_to: &RightBound) -> Flow;
}

/// Read access the backfill source needs from the underlying store.
#[async_trait]
pub trait StoreView: Send + Sync + 'static {
    /// Sample the version metainfo currently covering `region`.
    async fn metainfo(&self, region: &Region) -> anyhow::Result<RegionMap<Version>>;

    /// Traverse `start_point`'s domain left to right, alternating between
    /// `producer` hints and `consumer` emission.
    ///
    /// Returns `Flow::Continue` when the domain is exhausted and
    /// `Flow::Abort` when a callback asked to yield. The store may overshoot
    /// a consumer's byte budget by the one item that triggered the abort.
    /// Observing `drain` surfaces as an error, which callers treat as
    /// interruption.
    async fn send_backfill(
        &self,
        start_point: RegionMap<Timestamp>,
        producer: &mut (dyn PreItemProducer + Send),
        consumer: &mut (dyn ItemConsumer + Send),
        drain: &Drain,
    ) -> anyhow::Result<Flow>;
}
