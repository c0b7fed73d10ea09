//! Flow-control and lifecycle scenarios: hint starvation, mid-stream
//! session teardown and resume, window back-pressure, and protocol
//! violations.

mod common;

use std::sync::Arc;

use common::*;
use strata_backfill::backfiller::BackfillConfig;
use strata_backfill::mailbox::MailboxManager;
use strata_backfill::region::{RegionMap, RightBound};
use strata_backfill::version::{BranchHistory, Version};

/// Window of two chunks so back-pressure bites early in tests.
fn tight_config() -> BackfillConfig {
    BackfillConfig {
        item_pipeline_size: 200 * 1024,
        item_chunk_size: 100 * 1024,
    }
}

#[tokio::test]
async fn pump_parks_until_hints_arrive() {
    let region = whole_region();
    let (history, version) = simple_history(&region);
    let mut store = MemStore::new(region.clone(), version);
    for k in ["a", "b", "c"] {
        store.insert(k, value_of_size(8));
    }
    let manager = Arc::new(MailboxManager::new());
    let backfiller = backfiller_over(&manager, history, store, BackfillConfig::default());
    let mut sink = SinkHarness::new(&manager);
    let client = connect(
        &backfiller,
        &mut sink,
        RegionMap::new(region.clone(), Version::zero()),
        BranchHistory::new(),
    )
    .await;

    // A session with no hints at all: the store's first pull starves and
    // the pump parks without sending anything.
    sink.begin_session(bound(""));
    sink.expect_no_items().await;
    assert_eq!(client.stats().chunks_sent, 0);

    // One covering chunk of hints wakes it and yields exactly one message.
    sink.send_pre_items(pre_chunk_all_empty(&region));
    let (_, chunk) = sink.recv_items().await;
    assert_eq!(chunk.entries().count(), 3);
    wait_until(|| client.stats().sessions_finished == 1).await;
    sink.expect_no_items().await;
}

#[tokio::test]
async fn end_session_rolls_back_and_resumes_cleanly() {
    let region = whole_region();
    let (history, version) = simple_history(&region);
    let mut store = MemStore::new(region.clone(), version);
    let keys: Vec<String> = (0..10).map(|i| format!("k{i}")).collect();
    for k in &keys {
        store.insert(k, value_of_size(20 * 1024));
    }
    let manager = Arc::new(MailboxManager::new());
    let backfiller = backfiller_over(&manager, history, store, tight_config());
    let mut sink = SinkHarness::new(&manager);
    let client = connect(
        &backfiller,
        &mut sink,
        RegionMap::new(region.clone(), Version::zero()),
        BranchHistory::new(),
    )
    .await;

    sink.begin_session(bound(""));
    sink.send_pre_items(pre_chunk_all_empty(&region));

    // One chunk fits the tight window; the pump then blocks on the window
    // with the rest of the range unsent.
    let (_, first) = sink.recv_items().await;
    assert_eq!(first.entries().count(), 5);
    sink.expect_no_items().await;

    // Tear the session down mid-stream. The ack only comes back once the
    // pump has unwound and restored any half-consumed state.
    sink.end_session();
    sink.recv_ack_end_session().await;
    let stats = client.stats();
    assert_eq!(stats.sessions_started, 1);
    assert_eq!(stats.sessions_finished, 0);
    // The shipped chunk is still in flight; cancelling did not forget it.
    assert_eq!(client.in_flight_bytes(), first.mem_size());

    // Resume exactly at the acknowledged boundary.
    sink.ack_items(first.mem_size());
    sink.begin_session(first.right_edge().clone());
    let (_, second) = sink.recv_items().await;
    assert_eq!(second.left_edge(), first.right_edge());
    assert_eq!(second.entries().count(), 5);
    assert_eq!(second.right_edge(), &RightBound::Unbounded);
    wait_until(|| client.stats().sessions_finished == 1).await;
    assert_eq!(
        client.common_version().lookup(b"zz"),
        Some(&version.timestamp)
    );
}

#[tokio::test]
async fn window_blocks_the_pump_until_acks_arrive() {
    let region = whole_region();
    let (history, version) = simple_history(&region);
    let mut store = MemStore::new(region.clone(), version);
    let keys: Vec<String> = (0..20).map(|i| format!("k{i:02}")).collect();
    for k in &keys {
        store.insert(k, value_of_size(20 * 1024));
    }
    let config = BackfillConfig {
        item_pipeline_size: 400 * 1024,
        item_chunk_size: 100 * 1024,
    };
    let manager = Arc::new(MailboxManager::new());
    let backfiller = backfiller_over(&manager, history, store, config);
    let mut sink = SinkHarness::new(&manager);
    let client = connect(
        &backfiller,
        &mut sink,
        RegionMap::new(region.clone(), Version::zero()),
        BranchHistory::new(),
    )
    .await;

    sink.begin_session(bound(""));
    sink.send_pre_items(pre_chunk_all_empty(&region));

    // Without acks the stream stalls once the window is full.
    let mut shipped = Vec::new();
    for _ in 0..3 {
        let (_, chunk) = sink.recv_items().await;
        let in_flight = client.in_flight_bytes();
        assert!(in_flight <= config.item_pipeline_size + config.item_chunk_size);
        shipped.push(chunk);
    }
    sink.expect_no_items().await;
    assert_eq!(client.stats().chunks_sent, 3);

    // Releasing one chunk's bytes admits exactly the next chunk.
    sink.ack_items(shipped[0].mem_size());
    let (_, fourth) = sink.recv_items().await;
    assert_eq!(fourth.left_edge(), shipped[2].right_edge());
    sink.expect_no_items().await;
}

#[tokio::test]
async fn ack_overrun_is_fatal() {
    let region = whole_region();
    let (history, version) = simple_history(&region);
    let mut store = MemStore::new(region.clone(), version);
    store.insert("a", value_of_size(8));
    let manager = Arc::new(MailboxManager::new());
    let backfiller = backfiller_over(&manager, history, store, BackfillConfig::default());
    let mut sink = SinkHarness::new(&manager);
    let client = connect(
        &backfiller,
        &mut sink,
        RegionMap::new(region.clone(), Version::zero()),
        BranchHistory::new(),
    )
    .await;

    sink.begin_session(bound(""));
    sink.send_pre_items(pre_chunk_all_empty(&region));
    let (_, chunk) = sink.recv_items().await;

    // Acknowledging more than is in flight tears the client down; the
    // end_session queued behind the violation is dropped unprocessed.
    sink.ack_items(chunk.mem_size() + 1);
    sink.end_session();
    sink.expect_no_ack_end_session().await;
    sink.expect_no_items().await;
    assert_eq!(client.in_flight_bytes(), chunk.mem_size());
}

#[tokio::test]
async fn non_adjacent_pre_items_are_fatal() {
    let region = whole_region();
    let (history, version) = simple_history(&region);
    let mut store = MemStore::new(region.clone(), version);
    store.insert("a", value_of_size(8));
    let manager = Arc::new(MailboxManager::new());
    let backfiller = backfiller_over(&manager, history, store, BackfillConfig::default());
    let mut sink = SinkHarness::new(&manager);
    let _client = connect(
        &backfiller,
        &mut sink,
        RegionMap::new(region.clone(), Version::zero()),
        BranchHistory::new(),
    )
    .await;

    // A hint chunk that skips ahead of the buffered domain is a protocol
    // violation; nothing streams afterwards.
    sink.send_pre_items(pre_chunk(
        &region,
        bound("m"),
        Vec::new(),
        RightBound::Unbounded,
    ));
    sink.begin_session(bound(""));
    sink.expect_no_items().await;
}

#[tokio::test]
async fn second_begin_session_is_fatal() {
    let region = whole_region();
    let (history, version) = simple_history(&region);
    let mut store = MemStore::new(region.clone(), version);
    store.insert("a", value_of_size(8));
    let manager = Arc::new(MailboxManager::new());
    let backfiller = backfiller_over(&manager, history, store, BackfillConfig::default());
    let mut sink = SinkHarness::new(&manager);
    let _client = connect(
        &backfiller,
        &mut sink,
        RegionMap::new(region.clone(), Version::zero()),
        BranchHistory::new(),
    )
    .await;

    sink.begin_session(bound(""));
    sink.begin_session(bound(""));
    // The violation kills the client before any hints can feed the pump.
    sink.send_pre_items(pre_chunk_all_empty(&region));
    sink.expect_no_items().await;
}
