//! Backfill items, sink hints, and the ordered sequences that carry them.
//!
//! An `ItemSeq` covers a contiguous span `[left, right)` of one shard's key
//! space. Entries tile the span from left to right; stretches without an
//! entry are explicit "nothing" (pushed via `push_back_nothing`) and mean
//! the span is covered but carries no record. The same sequence shape holds
//! outgoing chunks of `Item`s and the buffered `PreItem` hints a sink sends
//! ahead of the stream.

use std::collections::VecDeque;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::region::{KeyRange, RightBound};

/// Fixed accounting overhead per sequence entry.
const ENTRY_OVERHEAD: u64 = 16;

/// An entry that occupies a key range inside an `ItemSeq`.
pub trait SeqEntry {
    fn range(&self) -> &KeyRange;
    fn mem_size(&self) -> u64;
    /// Clip the entry's range on the left; used when a sequence is cut at a
    /// boundary that lands inside the entry.
    fn trim_left(&mut self, left: Bytes);
}

/// One authoritative backfill record covering a key range. `value: None` is
/// a tombstone for `key`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub range: KeyRange,
    pub key: Bytes,
    pub value: Option<Bytes>,
}

impl Item {
    pub fn new(range: KeyRange, key: impl Into<Bytes>, value: Option<Bytes>) -> Self {
        Self {
            range,
            key: key.into(),
            value,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

impl SeqEntry for Item {
    fn range(&self) -> &KeyRange {
        &self.range
    }

    fn mem_size(&self) -> u64 {
        let value_len = self.value.as_ref().map_or(0, |v| v.len() as u64);
        ENTRY_OVERHEAD + self.range.left.len() as u64 + self.key.len() as u64 + value_len
    }

    fn trim_left(&mut self, left: Bytes) {
        debug_assert!(self.range.right.admits(&left) || self.range.right == RightBound::Key(left.clone()));
        self.range.left = left;
    }
}

/// Sink-side hint that a key range is already held at the common version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreItem {
    pub range: KeyRange,
}

impl PreItem {
    pub fn new(range: KeyRange) -> Self {
        Self { range }
    }
}

impl SeqEntry for PreItem {
    fn range(&self) -> &KeyRange {
        &self.range
    }

    fn mem_size(&self) -> u64 {
        let right_len = match &self.range.right {
            RightBound::Key(key) => key.len() as u64,
            RightBound::Unbounded => 0,
        };
        ENTRY_OVERHEAD + self.range.left.len() as u64 + right_len
    }

    fn trim_left(&mut self, left: Bytes) {
        self.range.left = left;
    }
}

/// An ordered run of entries plus explicit empty stretches covering
/// `[left, right)` of one shard's key space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemSeq<E> {
    start_hash: u64,
    end_hash: u64,
    left: RightBound,
    right: RightBound,
    entries: VecDeque<E>,
    mem_size: u64,
}

impl<E: SeqEntry> ItemSeq<E> {
    /// An empty-domain sequence positioned at `left`.
    pub fn new(start_hash: u64, end_hash: u64, left: RightBound) -> Self {
        Self {
            start_hash,
            end_hash,
            right: left.clone(),
            left,
            entries: VecDeque::new(),
            mem_size: 0,
        }
    }

    pub fn start_hash(&self) -> u64 {
        self.start_hash
    }

    pub fn end_hash(&self) -> u64 {
        self.end_hash
    }

    /// Left edge of the covered span.
    pub fn left_edge(&self) -> &RightBound {
        &self.left
    }

    /// Right edge of the covered span.
    pub fn right_edge(&self) -> &RightBound {
        &self.right
    }

    /// No entries buffered; the span may still cover empty key space.
    pub fn is_empty_of_items(&self) -> bool {
        self.entries.is_empty()
    }

    /// Covers no key space at all.
    pub fn is_empty_domain(&self) -> bool {
        self.left == self.right
    }

    /// Total entry bytes buffered.
    pub fn mem_size(&self) -> u64 {
        self.mem_size
    }

    pub fn front(&self) -> Option<&E> {
        self.entries.front()
    }

    pub fn entries(&self) -> impl Iterator<Item = &E> {
        self.entries.iter()
    }

    /// Append an entry; its range must start at or beyond the right edge
    /// (space skipped over is implicitly empty).
    pub fn push_back(&mut self, entry: E) {
        debug_assert!(RightBound::Key(entry.range().left.clone()) >= self.right);
        self.mem_size += entry.mem_size();
        self.right = entry.range().right.clone();
        self.entries.push_back(entry);
    }

    /// Extend the covered span to `bound` without adding an entry.
    pub fn push_back_nothing(&mut self, bound: RightBound) {
        debug_assert!(bound >= self.right);
        self.right = bound;
    }

    /// Move the front entry into `other`, which must end where this
    /// sequence begins.
    pub fn pop_front_into(&mut self, other: &mut ItemSeq<E>) {
        debug_assert_eq!(*other.right_edge(), self.left);
        if let Some(entry) = self.entries.pop_front() {
            self.mem_size -= entry.mem_size();
            self.left = entry.range().right.clone();
            if self.left > self.right {
                self.right = self.left.clone();
            }
            other.push_back(entry);
        }
    }

    /// Drop coverage left of `bound`. An entry straddling the cut is
    /// trimmed, not dropped.
    pub fn delete_to_key(&mut self, bound: &RightBound) {
        if *bound <= self.left {
            return;
        }
        debug_assert!(*bound <= self.right);
        while let Some(front) = self.entries.front() {
            if front.range().right <= *bound {
                let entry = self.entries.pop_front();
                if let Some(entry) = entry {
                    self.mem_size -= entry.mem_size();
                }
                continue;
            }
            break;
        }
        if let RightBound::Key(cut) = bound {
            if let Some(front) = self.entries.front_mut() {
                if front.range().left < *cut {
                    self.mem_size -= front.mem_size();
                    front.trim_left(cut.clone());
                    self.mem_size += front.mem_size();
                }
            }
        }
        self.left = bound.clone();
        if self.right < self.left {
            self.right = self.left.clone();
        }
    }

    /// Append a sequence whose span starts at this sequence's right edge.
    pub fn concat(&mut self, other: ItemSeq<E>) {
        debug_assert_eq!(self.right, other.left);
        self.mem_size += other.mem_size;
        self.right = other.right;
        self.entries.extend(other.entries);
    }
}
