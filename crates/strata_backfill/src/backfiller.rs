//! Backfill source: streams a key range's missing data to catching-up
//! replicas.
//!
//! One `Backfiller` serves a store. Each registered sink gets a `Client`
//! that owns the per-peer protocol state:
//! - the reconciled `common_version` floor (greatest timestamp the sink is
//!   known to hold, per sub-region)
//! - the buffered pre-item hints the sink sends ahead of the stream
//! - the flow-control window bounding bytes in flight
//! - at most one live `Session`, whose chunk pump drives the store
//!
//! Inbound handlers are serialized by the sink's write tokens; outbound
//! messages carry tokens from the source's own fifo source. A chunk commit
//! (resize window hold, advance threshold, send items, fold the shipped
//! metainfo into `common_version`, discard consumed hints, ack) runs
//! without a single await so cancellation can never observe half of it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, ensure, Context};
use bytes::Bytes;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::fifo::{FifoSink, FifoSlot, FifoSource, WriteToken};
use crate::item::{Item, ItemSeq, PreItem};
use crate::mailbox::{Mailbox, MailboxAddr, MailboxManager};
use crate::proto::{Message, SinkIntro, SourceIntro};
use crate::region::{KeyRange, Region, RegionMap, RightBound};
use crate::signal::Drain;
use crate::store::{Flow, ItemConsumer, PreItemProducer, Produced, StoreView};
use crate::throttle::{ByteThrottler, Reservation};
use crate::version::{find_common, BranchHistoryManager, BranchHistoryReader, CombinedHistory, Timestamp, Version};

/// Default window capacity: bytes in flight before acks are required.
pub const ITEM_PIPELINE_SIZE: u64 = 4 * 1024 * 1024;
/// Default per-iteration reservation and target items-message size.
pub const ITEM_CHUNK_SIZE: u64 = 100 * 1024;

/// Tuning for one backfill source.
#[derive(Clone, Copy, Debug)]
pub struct BackfillConfig {
    /// Flow-control window capacity.
    pub item_pipeline_size: u64,
    /// Nominal chunk reservation; the store may overshoot by one item.
    pub item_chunk_size: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            item_pipeline_size: ITEM_PIPELINE_SIZE,
            item_chunk_size: ITEM_CHUNK_SIZE,
        }
    }
}

impl BackfillConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.item_chunk_size > 0, "item_chunk_size must be non-zero");
        ensure!(
            self.item_pipeline_size >= 2 * self.item_chunk_size,
            "item_pipeline_size {} must be at least twice item_chunk_size {}",
            self.item_pipeline_size,
            self.item_chunk_size,
        );
        Ok(())
    }
}

/// Per-client counters.
#[derive(Debug, Default)]
pub struct BackfillStats {
    chunks_sent: AtomicU64,
    item_bytes_sent: AtomicU64,
    pre_item_bytes_acked: AtomicU64,
    sessions_started: AtomicU64,
    sessions_finished: AtomicU64,
}

/// Point-in-time view of `BackfillStats`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackfillStatsSnapshot {
    pub chunks_sent: u64,
    pub item_bytes_sent: u64,
    pub pre_item_bytes_acked: u64,
    pub sessions_started: u64,
    pub sessions_finished: u64,
}

impl BackfillStats {
    pub fn snapshot(&self) -> BackfillStatsSnapshot {
        BackfillStatsSnapshot {
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            item_bytes_sent: self.item_bytes_sent.load(Ordering::Relaxed),
            pre_item_bytes_acked: self.pre_item_bytes_acked.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_finished: self.sessions_finished.load(Ordering::Relaxed),
        }
    }
}

/// Factory accepting sink registrations for one store.
pub struct Backfiller {
    mailbox_manager: Arc<MailboxManager>,
    branch_history: Arc<BranchHistoryManager>,
    store: Arc<dyn StoreView>,
    config: BackfillConfig,
}

impl Backfiller {
    pub fn new(
        mailbox_manager: Arc<MailboxManager>,
        branch_history: Arc<BranchHistoryManager>,
        store: Arc<dyn StoreView>,
        config: BackfillConfig,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            mailbox_manager,
            branch_history,
            store,
            config,
        })
    }

    /// Registration endpoint: build the per-sink client, reply with a
    /// `SourceIntro` on the sink's intro mailbox, and hand the client back
    /// to the caller, who owns its lifetime.
    pub async fn register(&self, intro: SinkIntro) -> anyhow::Result<Client> {
        Client::start(
            self.mailbox_manager.clone(),
            self.branch_history.clone(),
            self.store.clone(),
            self.config,
            intro,
        )
        .await
    }
}

/// Compute the greatest timestamp both replicas are known to share, per
/// sub-region, from their version maps and the combined branch history.
fn reconcile_common_version(
    region: &Region,
    ours: &RegionMap<Version>,
    theirs: &RegionMap<Version>,
    history: &dyn BranchHistoryReader,
) -> anyhow::Result<RegionMap<Timestamp>> {
    let mut pairs = Vec::new();
    for (our_region, our_version) in ours.iter() {
        for (overlap, their_version) in theirs.mask(&our_region).iter() {
            for (sub_region, common) in
                find_common(history, *our_version, *their_version, &overlap)?.iter()
            {
                pairs.push((sub_region.keys, common.timestamp));
            }
        }
    }
    Ok(RegionMap::from_parts(
        region.start_hash,
        region.end_hash,
        pairs,
    ))
}

struct PeerAddrs {
    items: MailboxAddr,
    ack_pre_items: MailboxAddr,
    ack_end_session: MailboxAddr,
}

struct ClientState {
    common_version: RegionMap<Timestamp>,
    pre_items: ItemSeq<PreItem>,
    /// Bytes sent and not yet acknowledged by the sink. Survives sessions:
    /// ending a session does not un-send its chunks.
    in_flight: Reservation,
    session: Option<Session>,
}

struct ClientShared {
    mailbox_manager: Arc<MailboxManager>,
    store: Arc<dyn StoreView>,
    config: BackfillConfig,
    peer: PeerAddrs,
    full_region: Region,
    fifo_source: FifoSource,
    fifo_sink: FifoSink,
    throttler: ByteThrottler,
    drain: Drain,
    stats: Arc<BackfillStats>,
    state: Mutex<ClientState>,
}

impl ClientShared {
    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Stamp a fresh source token and deliver.
    fn post(&self, addr: MailboxAddr, build: impl FnOnce(WriteToken) -> Message) {
        let token = self.fifo_source.enter_write();
        self.mailbox_manager.send(addr, build(token));
    }

    /// Take the handler's turn in the lane. Returns `None` when the client
    /// is draining: messages already queued behind a fatal violation or a
    /// shutdown are dropped, not processed.
    async fn admit(&self, token: WriteToken) -> Option<FifoSlot<'_>> {
        let slot = self.fifo_sink.exit_write(token).await;
        if self.drain.is_pulsed() {
            tracing::debug!("dropping message for a draining backfill client");
            return None;
        }
        Some(slot)
    }

    async fn on_pre_items(&self, token: WriteToken, chunk: ItemSeq<PreItem>) -> anyhow::Result<()> {
        let Some(_slot) = self.admit(token).await else {
            return Ok(());
        };
        let mut state = self.lock_state();
        ensure!(
            chunk.left_edge() == state.pre_items.right_edge(),
            "pre-items chunk starting at {:?} is not adjacent to the buffered domain ending at {:?}",
            chunk.left_edge(),
            state.pre_items.right_edge(),
        );
        state.pre_items.concat(chunk);
        if let Some(session) = &state.session {
            session.notify_pre_items();
        }
        Ok(())
    }

    async fn on_end_session(&self, token: WriteToken) -> anyhow::Result<()> {
        let Some(_slot) = self.admit(token).await else {
            return Ok(());
        };
        let session = self
            .lock_state()
            .session
            .take()
            .context("end_session without an active session")?;
        // Cancelling the pump restores any hints a half-built chunk
        // consumed; only then is the ack allowed out.
        session.shutdown().await;
        self.post(self.peer.ack_end_session, |token| Message::AckEndSession { token });
        Ok(())
    }

    async fn on_ack_items(&self, token: WriteToken, bytes: u64) -> anyhow::Result<()> {
        let Some(_slot) = self.admit(token).await else {
            return Ok(());
        };
        let mut state = self.lock_state();
        ensure!(
            bytes <= state.in_flight.bytes(),
            "ack_items for {bytes} bytes exceeds the {} bytes in flight",
            state.in_flight.bytes(),
        );
        state.in_flight.shrink(bytes);
        Ok(())
    }
}

async fn handle_message(shared: &Arc<ClientShared>, message: Message) -> anyhow::Result<()> {
    match message {
        Message::PreItems { token, chunk } => shared.on_pre_items(token, chunk).await,
        Message::BeginSession { token, threshold } => {
            on_begin_session(shared, token, threshold).await
        }
        Message::EndSession { token } => shared.on_end_session(token).await,
        Message::AckItems { token, bytes } => shared.on_ack_items(token, bytes).await,
        other => bail!(
            "unexpected {} message on a backfill source mailbox",
            other.kind()
        ),
    }
}

async fn on_begin_session(
    shared: &Arc<ClientShared>,
    token: WriteToken,
    threshold: RightBound,
) -> anyhow::Result<()> {
    let Some(_slot) = shared.admit(token).await else {
        return Ok(());
    };
    let mut state = shared.lock_state();
    ensure!(
        state.session.is_none(),
        "begin_session while a session is already active"
    );
    ensure!(
        threshold >= RightBound::Key(shared.full_region.keys.left.clone()),
        "begin_session threshold {:?} lies before the negotiated region",
        threshold,
    );
    // Every key must be backfilled at least once: the sink may not skip
    // past keys the source has not been told it holds.
    ensure!(
        &threshold <= state.pre_items.left_edge(),
        "begin_session threshold {:?} skips past unannounced keys at {:?}",
        threshold,
        state.pre_items.left_edge(),
    );
    shared.stats.sessions_started.fetch_add(1, Ordering::Relaxed);
    state.session = Some(Session::spawn(shared.clone(), threshold));
    Ok(())
}

/// One registered sink's session owner. Dropping it aborts everything;
/// `shutdown` is the orderly path.
pub struct Client {
    shared: Arc<ClientShared>,
    dispatchers: Vec<JoinHandle<()>>,
}

impl Client {
    async fn start(
        mailbox_manager: Arc<MailboxManager>,
        branch_history: Arc<BranchHistoryManager>,
        store: Arc<dyn StoreView>,
        config: BackfillConfig,
        intro: SinkIntro,
    ) -> anyhow::Result<Client> {
        let full_region = intro
            .initial_version
            .domain()
            .context("sink intro carries an empty initial version")?;

        let our_version = store.metainfo(&full_region).await?;
        let common_version = {
            let local_history = branch_history.read();
            let combined = CombinedHistory::new(&local_history, &intro.initial_version_history);
            reconcile_common_version(
                &full_region,
                &our_version,
                &intro.initial_version,
                &combined,
            )?
        };

        let pre_items_mailbox = mailbox_manager.register();
        let begin_session_mailbox = mailbox_manager.register();
        let end_session_mailbox = mailbox_manager.register();
        let ack_items_mailbox = mailbox_manager.register();
        let reply = SourceIntro {
            common_version: common_version.clone(),
            pre_items_addr: pre_items_mailbox.addr(),
            begin_session_addr: begin_session_mailbox.addr(),
            end_session_addr: end_session_mailbox.addr(),
            ack_items_addr: ack_items_mailbox.addr(),
        };

        let throttler = ByteThrottler::new(config.item_pipeline_size);
        let pre_items = ItemSeq::new(
            full_region.start_hash,
            full_region.end_hash,
            RightBound::Key(full_region.keys.left.clone()),
        );
        let shared = Arc::new(ClientShared {
            mailbox_manager,
            store,
            config,
            peer: PeerAddrs {
                items: intro.items_addr,
                ack_pre_items: intro.ack_pre_items_addr,
                ack_end_session: intro.ack_end_session_addr,
            },
            full_region,
            fifo_source: FifoSource::new(),
            fifo_sink: FifoSink::new(),
            state: Mutex::new(ClientState {
                common_version,
                pre_items,
                in_flight: throttler.hold(),
                session: None,
            }),
            throttler,
            drain: Drain::new(),
            stats: Arc::new(BackfillStats::default()),
        });

        let dispatchers = vec![
            spawn_dispatcher(shared.clone(), pre_items_mailbox),
            spawn_dispatcher(shared.clone(), begin_session_mailbox),
            spawn_dispatcher(shared.clone(), end_session_mailbox),
            spawn_dispatcher(shared.clone(), ack_items_mailbox),
        ];

        shared
            .mailbox_manager
            .send(intro.intro_addr, Message::SourceIntro(reply));
        tracing::debug!(region = ?shared.full_region, "backfill client registered");

        Ok(Client {
            shared,
            dispatchers,
        })
    }

    pub fn full_region(&self) -> &Region {
        &self.shared.full_region
    }

    /// Snapshot of the per-sub-region floor the sink is known to hold.
    pub fn common_version(&self) -> RegionMap<Timestamp> {
        self.shared.lock_state().common_version.clone()
    }

    /// Bytes sent and not yet acknowledged.
    pub fn in_flight_bytes(&self) -> u64 {
        self.shared.lock_state().in_flight.bytes()
    }

    pub fn stats(&self) -> BackfillStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Orderly teardown: cancel the session at its next interruptible
    /// point, then stop the mailbox dispatchers.
    pub async fn shutdown(mut self) {
        self.shared.drain.pulse();
        let session = self.shared.lock_state().session.take();
        if let Some(session) = session {
            session.shutdown().await;
        }
        for task in self.dispatchers.drain(..) {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.drain.pulse();
        if let Some(session) = self.shared.lock_state().session.take() {
            session.abort();
        }
        for task in &self.dispatchers {
            task.abort();
        }
    }
}

fn spawn_dispatcher(shared: Arc<ClientShared>, mut mailbox: Mailbox) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = shared.drain.pulsed() => break,
                received = mailbox.recv() => match received {
                    Some(message) => message,
                    None => break,
                },
            };
            let outcome = tokio::select! {
                _ = shared.drain.pulsed() => break,
                outcome = handle_message(&shared, message) => outcome,
            };
            if let Err(err) = outcome {
                tracing::error!(error = ?err, "backfill protocol violation; aborting client");
                shared.drain.pulse();
                if let Some(session) = shared.lock_state().session.take() {
                    session.abort();
                }
                break;
            }
        }
    })
}

struct SessionCtx {
    drain: Drain,
    hint_wakeup: Notify,
    /// Set by the producer when the hint buffer runs dry; the pump parks on
    /// `hint_wakeup` until `on_pre_items` feeds it. Written under the
    /// client state lock.
    parked: AtomicBool,
}

/// One begin-session/end-session envelope hosting one pump task.
struct Session {
    ctx: Arc<SessionCtx>,
    task: JoinHandle<()>,
}

impl Session {
    fn spawn(shared: Arc<ClientShared>, threshold: RightBound) -> Session {
        let ctx = Arc::new(SessionCtx {
            drain: Drain::new(),
            hint_wakeup: Notify::new(),
            parked: AtomicBool::new(false),
        });
        let task = tokio::spawn(run_pump(shared, ctx.clone(), threshold));
        Session { ctx, task }
    }

    fn notify_pre_items(&self) {
        if self.ctx.parked.load(Ordering::Acquire) {
            self.ctx.hint_wakeup.notify_one();
        }
    }

    /// Pulse the session drain and wait for the pump to unwind. The pump
    /// has no await inside a chunk commit, so this never splits one.
    async fn shutdown(self) {
        self.ctx.drain.pulse();
        if let Err(err) = self.task.await {
            if err.is_panic() {
                tracing::error!("backfill pump task panicked");
            }
        }
    }

    fn abort(&self) {
        self.ctx.drain.pulse();
        self.task.abort();
    }
}

/// Feeds buffered sink hints to the store. Consumed hints move into a temp
/// buffer; dropping the producer splices them back so a chunk that never
/// ships leaves the buffer exactly as it found it.
struct PumpProducer<'a> {
    shared: &'a ClientShared,
    ctx: &'a SessionCtx,
    temp: ItemSeq<PreItem>,
}

impl<'a> PumpProducer<'a> {
    fn new(shared: &'a ClientShared, ctx: &'a SessionCtx) -> Self {
        let left = shared.lock_state().pre_items.left_edge().clone();
        Self {
            shared,
            ctx,
            temp: ItemSeq::new(
                shared.full_region.start_hash,
                shared.full_region.end_hash,
                left,
            ),
        }
    }
}

impl PreItemProducer for PumpProducer<'_> {
    fn next_pre_item(&mut self) -> Produced {
        let mut state = self.shared.lock_state();
        if let Some(front) = state.pre_items.front() {
            return Produced::Hint(front.clone());
        }
        if !state.pre_items.is_empty_domain() {
            let edge = state.pre_items.right_edge().clone();
            state.pre_items.delete_to_key(&edge);
            self.temp.push_back_nothing(edge.clone());
            return Produced::Gap(edge);
        }
        self.ctx.parked.store(true, Ordering::Release);
        Produced::Starved
    }

    fn release_pre_item(&mut self) {
        let mut state = self.shared.lock_state();
        state.pre_items.pop_front_into(&mut self.temp);
    }
}

impl Drop for PumpProducer<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.lock_state();
        let placeholder = ItemSeq::new(
            self.shared.full_region.start_hash,
            self.shared.full_region.end_hash,
            RightBound::Key(Bytes::new()),
        );
        let live = std::mem::replace(&mut state.pre_items, placeholder);
        self.temp.concat(live);
        state.pre_items = std::mem::replace(
            &mut self.temp,
            ItemSeq::new(0, 0, RightBound::Key(Bytes::new())),
        );
    }
}

/// Accumulates one outgoing chunk and the metainfo covering it.
struct PumpConsumer {
    start_hash: u64,
    end_hash: u64,
    chunk: ItemSeq<Item>,
    metainfo: RegionMap<Version>,
    chunk_limit: u64,
}

impl PumpConsumer {
    fn new(region: &Region, threshold: RightBound, chunk_limit: u64) -> Self {
        Self {
            start_hash: region.start_hash,
            end_hash: region.end_hash,
            chunk: ItemSeq::new(region.start_hash, region.end_hash, threshold),
            metainfo: RegionMap::empty(region.start_hash, region.end_hash),
            chunk_limit,
        }
    }

    fn into_parts(self) -> (ItemSeq<Item>, RegionMap<Version>) {
        (self.chunk, self.metainfo)
    }
}

impl ItemConsumer for PumpConsumer {
    fn on_item(&mut self, metainfo: &RegionMap<Version>, item: Item) -> Flow {
        let RightBound::Key(mask_left) = self.chunk.right_edge().clone() else {
            return Flow::Abort;
        };
        let mask = Region::new(
            self.start_hash,
            self.end_hash,
            KeyRange::new(mask_left, item.range.right.clone()),
        );
        self.metainfo.concat(metainfo.mask(&mask));
        self.chunk.push_back(item);
        if self.chunk.mem_size() < self.chunk_limit {
            Flow::Continue
        } else {
            Flow::Abort
        }
    }

    fn on_empty_range(&mut self, metainfo: &RegionMap<Version>, up_to: &RightBound) -> Flow {
        if up_to <= self.chunk.right_edge() {
            return Flow::Continue;
        }
        let RightBound::Key(mask_left) = self.chunk.right_edge().clone() else {
            return Flow::Abort;
        };
        let mask = Region::new(
            self.start_hash,
            self.end_hash,
            KeyRange::new(mask_left, up_to.clone()),
        );
        self.metainfo.concat(metainfo.mask(&mask));
        self.chunk.push_back_nothing(up_to.clone());
        Flow::Continue
    }
}

async fn run_pump(shared: Arc<ClientShared>, ctx: Arc<SessionCtx>, mut threshold: RightBound) {
    tracing::debug!(threshold = ?threshold, "backfill pump started");
    let full_right = shared.full_region.keys.right.clone();
    while threshold != full_right {
        // Wait until the window has room for the chunk about to be built.
        let mut reservation = tokio::select! {
            _ = ctx.drain.pulsed() => return,
            reservation = shared.throttler.reserve(shared.config.item_chunk_size) => reservation,
        };

        // Everything from the threshold to the region edge still needs
        // backfilling.
        let RightBound::Key(sub_left) = threshold.clone() else {
            return;
        };
        let sub_region = Region::new(
            shared.full_region.start_hash,
            shared.full_region.end_hash,
            KeyRange::new(sub_left, full_right.clone()),
        );
        let start_point = shared.lock_state().common_version.mask(&sub_region);

        let mut consumer = PumpConsumer::new(
            &shared.full_region,
            threshold.clone(),
            shared.config.item_chunk_size,
        );
        let store_result = {
            let mut producer = PumpProducer::new(&shared, &ctx);
            tokio::select! {
                _ = ctx.drain.pulsed() => None,
                result = shared.store.send_backfill(
                    start_point,
                    &mut producer,
                    &mut consumer,
                    &ctx.drain,
                ) => Some(result),
            }
            // The producer drops here, splicing unconsumed hints back into
            // the live buffer.
        };
        match store_result {
            // Cancelled; the reservation drop releases the window budget.
            None => return,
            Some(Err(err)) => {
                tracing::warn!(error = ?err, "store backfill read failed; ending session");
                return;
            }
            Some(Ok(_)) => {}
        }
        let (chunk, metainfo) = consumer.into_parts();

        // Commit. From the resize to the pre-items ack this must stay
        // await-free: the sink's view and ours change together or not at
        // all.
        if chunk.left_edge() != chunk.right_edge() {
            let chunk_bytes = chunk.mem_size();
            let mut state = shared.lock_state();
            reservation.resize(chunk_bytes);
            reservation.transfer_into(&mut state.in_flight);
            threshold = chunk.right_edge().clone();
            shared.stats.chunks_sent.fetch_add(1, Ordering::Relaxed);
            shared
                .stats
                .item_bytes_sent
                .fetch_add(chunk_bytes, Ordering::Relaxed);
            let outgoing = metainfo.clone();
            shared.post(shared.peer.items, move |token| Message::Items {
                token,
                metainfo: outgoing,
                chunk,
            });
            state.common_version.update(metainfo.map(|v| v.timestamp));
            let before = state.pre_items.mem_size();
            state.pre_items.delete_to_key(&threshold);
            let freed = before - state.pre_items.mem_size();
            shared
                .stats
                .pre_item_bytes_acked
                .fetch_add(freed, Ordering::Relaxed);
            shared.post(shared.peer.ack_pre_items, |token| Message::AckPreItems {
                token,
                bytes_freed: freed,
            });
            tracing::debug!(
                chunk_bytes,
                freed_pre_item_bytes = freed,
                threshold = ?threshold,
                "sent backfill chunk"
            );
        }

        // The producer ran dry mid-iteration; hold here until the sink
        // sends more hints.
        if ctx.parked.load(Ordering::Acquire) {
            tokio::select! {
                _ = ctx.drain.pulsed() => return,
                _ = ctx.hint_wakeup.notified() => {}
            }
            ctx.parked.store(false, Ordering::Release);
        }
    }
    shared.stats.sessions_finished.fetch_add(1, Ordering::Relaxed);
    tracing::debug!("backfill pump finished");
}
