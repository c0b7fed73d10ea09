//! Shared helpers for backfill integration tests: an in-memory store view
//! and a scripted sink driving the mailbox protocol.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::{sleep, timeout};

use strata_backfill::backfiller::{BackfillConfig, Backfiller, Client};
use strata_backfill::fifo::FifoSource;
use strata_backfill::item::{Item, ItemSeq, PreItem};
use strata_backfill::mailbox::{Mailbox, MailboxManager};
use strata_backfill::proto::{Message, SinkIntro, SourceIntro};
use strata_backfill::region::{KeyRange, Region, RegionMap, RightBound};
use strata_backfill::signal::Drain;
use strata_backfill::store::{Flow, ItemConsumer, PreItemProducer, Produced, StoreView};
use strata_backfill::version::{
    BranchBirth, BranchHistory, BranchHistoryManager, Timestamp, Version,
};

/// Upper bound for any await in a test.
pub const WAIT: Duration = Duration::from_secs(5);
/// How long to watch a mailbox when expecting silence.
pub const QUIET: Duration = Duration::from_millis(200);

pub fn key(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

pub fn bound(s: &str) -> RightBound {
    RightBound::Key(key(s))
}

pub fn value_of_size(n: usize) -> Bytes {
    Bytes::from(vec![b'x'; n])
}

pub fn whole_region() -> Region {
    Region::new(0, u64::MAX, KeyRange::universe())
}

/// A history with one branch born from zero over `region`, plus a live
/// version on it.
pub fn simple_history(region: &Region) -> (BranchHistory, Version) {
    let mut history = BranchHistory::new();
    history.record_branch(
        1,
        BranchBirth {
            region: region.clone(),
            initial_timestamp: Timestamp(0),
            origin: RegionMap::new(region.clone(), Version::zero()),
        },
    );
    (history, Version::new(1, Timestamp(5)))
}

/// In-memory `StoreView` over a sorted key/value map at a uniform version.
pub struct MemStore {
    metainfo: RegionMap<Version>,
    entries: BTreeMap<Bytes, Bytes>,
}

impl MemStore {
    pub fn new(region: Region, version: Version) -> Self {
        Self {
            metainfo: RegionMap::new(region, version),
            entries: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, k: &str, value: Bytes) {
        self.entries.insert(key(k), value);
    }

    /// Emit items for the un-hinted stretch `[cursor, to)`, tiling each
    /// item's range up to the next key. An empty stretch becomes a single
    /// empty-range marker.
    fn emit_stretch(
        &self,
        cursor: &Bytes,
        to: &RightBound,
        consumer: &mut (dyn ItemConsumer + Send),
    ) -> Flow {
        let stretch: Vec<(Bytes, Bytes)> = self
            .entries
            .range(cursor.clone()..)
            .take_while(|(k, _)| to.admits(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if stretch.is_empty() {
            return consumer.on_empty_range(&self.metainfo, to);
        }
        for (i, (k, v)) in stretch.iter().enumerate() {
            let right = stretch
                .get(i + 1)
                .map(|(next, _)| RightBound::Key(next.clone()))
                .unwrap_or_else(|| to.clone());
            let item = Item::new(KeyRange::new(k.clone(), right), k.clone(), Some(v.clone()));
            if let Flow::Abort = consumer.on_item(&self.metainfo, item) {
                return Flow::Abort;
            }
        }
        Flow::Continue
    }
}

#[async_trait]
impl StoreView for MemStore {
    async fn metainfo(&self, region: &Region) -> anyhow::Result<RegionMap<Version>> {
        Ok(self.metainfo.mask(region))
    }

    async fn send_backfill(
        &self,
        start_point: RegionMap<Timestamp>,
        producer: &mut (dyn PreItemProducer + Send),
        consumer: &mut (dyn ItemConsumer + Send),
        drain: &Drain,
    ) -> anyhow::Result<Flow> {
        let Some(domain) = start_point.domain() else {
            return Ok(Flow::Continue);
        };
        let right = domain.keys.right.clone();
        let mut cursor = domain.keys.left.clone();
        loop {
            if drain.is_pulsed() {
                bail!("backfill read interrupted");
            }
            tokio::task::yield_now().await;
            match producer.next_pre_item() {
                Produced::Hint(pre) => {
                    if pre.range.left > cursor {
                        let hint_start = RightBound::Key(pre.range.left.clone());
                        if let Flow::Abort = self.emit_stretch(&cursor, &hint_start, consumer) {
                            return Ok(Flow::Abort);
                        }
                    }
                    // The sink already holds the hinted span.
                    let flow = consumer.on_empty_range(&self.metainfo, &pre.range.right);
                    producer.release_pre_item();
                    match &pre.range.right {
                        RightBound::Key(k) => cursor = k.clone(),
                        RightBound::Unbounded => return Ok(Flow::Continue),
                    }
                    if let Flow::Abort = flow {
                        return Ok(Flow::Abort);
                    }
                }
                Produced::Gap(edge) => {
                    if let Flow::Abort = self.emit_stretch(&cursor, &edge, consumer) {
                        return Ok(Flow::Abort);
                    }
                    match &edge {
                        RightBound::Key(k) => cursor = k.clone(),
                        RightBound::Unbounded => return Ok(Flow::Continue),
                    }
                }
                Produced::Starved => return Ok(Flow::Abort),
            }
            if !right.admits(&cursor) {
                return Ok(Flow::Continue);
            }
        }
    }
}

/// A scripted backfillee: four inbound mailboxes plus the token source the
/// real sink would use.
pub struct SinkHarness {
    manager: Arc<MailboxManager>,
    intro_mailbox: Mailbox,
    items_mailbox: Mailbox,
    ack_pre_items_mailbox: Mailbox,
    ack_end_session_mailbox: Mailbox,
    fifo: FifoSource,
    source: Option<SourceIntro>,
}

impl SinkHarness {
    pub fn new(manager: &Arc<MailboxManager>) -> Self {
        Self {
            manager: manager.clone(),
            intro_mailbox: manager.register(),
            items_mailbox: manager.register(),
            ack_pre_items_mailbox: manager.register(),
            ack_end_session_mailbox: manager.register(),
            fifo: FifoSource::new(),
            source: None,
        }
    }

    pub fn intro(
        &self,
        initial_version: RegionMap<Version>,
        initial_version_history: BranchHistory,
    ) -> SinkIntro {
        SinkIntro {
            initial_version,
            initial_version_history,
            intro_addr: self.intro_mailbox.addr(),
            items_addr: self.items_mailbox.addr(),
            ack_pre_items_addr: self.ack_pre_items_mailbox.addr(),
            ack_end_session_addr: self.ack_end_session_mailbox.addr(),
        }
    }

    pub async fn recv_intro(&mut self) -> SourceIntro {
        let message = timeout(WAIT, self.intro_mailbox.recv())
            .await
            .expect("source intro within deadline")
            .expect("intro mailbox open");
        match message {
            Message::SourceIntro(source) => {
                self.source = Some(source.clone());
                source
            }
            other => panic!("expected source intro, got {}", other.kind()),
        }
    }

    fn source(&self) -> &SourceIntro {
        self.source.as_ref().expect("intro received first")
    }

    pub fn begin_session(&self, threshold: RightBound) {
        let token = self.fifo.enter_write();
        self.manager.send(
            self.source().begin_session_addr,
            Message::BeginSession { token, threshold },
        );
    }

    pub fn end_session(&self) {
        let token = self.fifo.enter_write();
        self.manager
            .send(self.source().end_session_addr, Message::EndSession { token });
    }

    pub fn send_pre_items(&self, chunk: ItemSeq<PreItem>) {
        let token = self.fifo.enter_write();
        self.manager.send(
            self.source().pre_items_addr,
            Message::PreItems { token, chunk },
        );
    }

    pub fn ack_items(&self, bytes: u64) {
        let token = self.fifo.enter_write();
        self.manager
            .send(self.source().ack_items_addr, Message::AckItems { token, bytes });
    }

    pub async fn recv_items(&mut self) -> (RegionMap<Version>, ItemSeq<Item>) {
        let message = timeout(WAIT, self.items_mailbox.recv())
            .await
            .expect("items message within deadline")
            .expect("items mailbox open");
        match message {
            Message::Items { metainfo, chunk, .. } => (metainfo, chunk),
            other => panic!("expected items, got {}", other.kind()),
        }
    }

    pub async fn expect_no_items(&mut self) {
        if let Ok(message) = timeout(QUIET, self.items_mailbox.recv()).await {
            panic!("unexpected message while expecting silence: {message:?}");
        }
    }

    pub async fn recv_ack_pre_items(&mut self) -> u64 {
        let message = timeout(WAIT, self.ack_pre_items_mailbox.recv())
            .await
            .expect("ack_pre_items within deadline")
            .expect("ack_pre_items mailbox open");
        match message {
            Message::AckPreItems { bytes_freed, .. } => bytes_freed,
            other => panic!("expected ack_pre_items, got {}", other.kind()),
        }
    }

    pub async fn recv_ack_end_session(&mut self) {
        let message = timeout(WAIT, self.ack_end_session_mailbox.recv())
            .await
            .expect("ack_end_session within deadline")
            .expect("ack_end_session mailbox open");
        match message {
            Message::AckEndSession { .. } => {}
            other => panic!("expected ack_end_session, got {}", other.kind()),
        }
    }

    pub async fn expect_no_ack_end_session(&mut self) {
        if let Ok(message) = timeout(QUIET, self.ack_end_session_mailbox.recv()).await {
            panic!("unexpected message while expecting silence: {message:?}");
        }
    }
}

/// A pre-items chunk covering `[left, right)` of the region: listed hints
/// are spans the sink already holds, everything else in the span is empty.
pub fn pre_chunk(
    region: &Region,
    left: RightBound,
    hints: Vec<KeyRange>,
    right: RightBound,
) -> ItemSeq<PreItem> {
    let mut chunk = ItemSeq::new(region.start_hash, region.end_hash, left);
    for hint in hints {
        chunk.push_back(PreItem::new(hint));
    }
    chunk.push_back_nothing(right);
    chunk
}

/// A hint-free pre-items chunk covering the whole region: the sink holds
/// nothing yet, and the source owns the entire span.
pub fn pre_chunk_all_empty(region: &Region) -> ItemSeq<PreItem> {
    pre_chunk(
        region,
        RightBound::Key(region.keys.left.clone()),
        Vec::new(),
        region.keys.right.clone(),
    )
}

/// Register `sink` with the backfiller and complete the intro exchange.
pub async fn connect(
    backfiller: &Backfiller,
    sink: &mut SinkHarness,
    initial_version: RegionMap<Version>,
    history: BranchHistory,
) -> Client {
    let client = backfiller
        .register(sink.intro(initial_version, history))
        .await
        .expect("registration succeeds");
    sink.recv_intro().await;
    client
}

/// Route backfill tracing into test output when `RUST_LOG` is set.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Build a backfiller over `store` with the given local history.
pub fn backfiller_over(
    manager: &Arc<MailboxManager>,
    local_history: BranchHistory,
    store: MemStore,
    config: BackfillConfig,
) -> Backfiller {
    init_tracing();
    Backfiller::new(
        manager.clone(),
        Arc::new(BranchHistoryManager::new(local_history)),
        Arc::new(store),
        config,
    )
    .expect("valid config")
}

/// Poll `cond` until it holds or the deadline passes.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition within deadline");
}
