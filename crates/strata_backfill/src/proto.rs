//! Wire messages exchanged between a backfill source and its sink.

use serde::{Deserialize, Serialize};

use crate::fifo::WriteToken;
use crate::item::{Item, ItemSeq, PreItem};
use crate::mailbox::MailboxAddr;
use crate::region::{RegionMap, RightBound};
use crate::version::{BranchHistory, Timestamp, Version};

/// First contact from a joining sink, consumed by the registrar.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SinkIntro {
    /// The sink's current version per sub-region; its domain is the region
    /// the session will cover.
    pub initial_version: RegionMap<Version>,
    /// Branch history backing `initial_version`.
    pub initial_version_history: BranchHistory,
    /// Where the source's `SourceIntro` reply goes.
    pub intro_addr: MailboxAddr,
    pub items_addr: MailboxAddr,
    pub ack_pre_items_addr: MailboxAddr,
    pub ack_end_session_addr: MailboxAddr,
}

/// Source reply carrying its mailbox addresses and the reconciled floor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceIntro {
    /// Greatest timestamp the sink is known to hold, per sub-region.
    pub common_version: RegionMap<Timestamp>,
    pub pre_items_addr: MailboxAddr,
    pub begin_session_addr: MailboxAddr,
    pub end_session_addr: MailboxAddr,
    pub ack_items_addr: MailboxAddr,
}

/// Everything that can land in a backfill mailbox.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Message {
    // Source -> sink.
    SourceIntro(SourceIntro),
    Items {
        token: WriteToken,
        metainfo: RegionMap<Version>,
        chunk: ItemSeq<Item>,
    },
    AckPreItems {
        token: WriteToken,
        bytes_freed: u64,
    },
    AckEndSession {
        token: WriteToken,
    },

    // Sink -> source.
    PreItems {
        token: WriteToken,
        chunk: ItemSeq<PreItem>,
    },
    BeginSession {
        token: WriteToken,
        threshold: RightBound,
    },
    EndSession {
        token: WriteToken,
    },
    AckItems {
        token: WriteToken,
        bytes: u64,
    },
}

impl Message {
    /// Short name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::SourceIntro(_) => "source_intro",
            Message::Items { .. } => "items",
            Message::AckPreItems { .. } => "ack_pre_items",
            Message::AckEndSession { .. } => "ack_end_session",
            Message::PreItems { .. } => "pre_items",
            Message::BeginSession { .. } => "begin_session",
            Message::EndSession { .. } => "end_session",
            Message::AckItems { .. } => "ack_items",
        }
    }
}
