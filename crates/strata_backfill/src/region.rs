//! Shard regions and region-keyed maps.
//!
//! A region names a slice of the cluster key space: a hash interval (the
//! shard) plus a lexicographic key interval. Key ranges are end-exclusive;
//! the right bound admits a distinguished end-of-key-space value that sorts
//! above every key. `RegionMap` partitions a region into contiguous tagged
//! sub-regions and is the currency of version metainfo throughout the
//! backfill path.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Exclusive upper bound of a key range. `Unbounded` sorts above every key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RightBound {
    Key(Bytes),
    Unbounded,
}

impl RightBound {
    /// True when `key` lies strictly below this bound.
    pub fn admits(&self, key: &[u8]) -> bool {
        match self {
            RightBound::Key(bound) => key < bound.as_ref(),
            RightBound::Unbounded => true,
        }
    }
}

/// Half-open lexicographic key interval `[left, right)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub left: Bytes,
    pub right: RightBound,
}

impl KeyRange {
    pub fn new(left: impl Into<Bytes>, right: RightBound) -> Self {
        Self {
            left: left.into(),
            right,
        }
    }

    /// The whole key space, `["", unbounded)`.
    pub fn universe() -> Self {
        Self {
            left: Bytes::new(),
            right: RightBound::Unbounded,
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.right {
            RightBound::Key(right) => *right <= self.left,
            RightBound::Unbounded => false,
        }
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.left.as_ref() && self.right.admits(key)
    }

    /// Intersection of two ranges; the result may be empty.
    pub fn intersect(&self, other: &KeyRange) -> KeyRange {
        let left = if self.left >= other.left {
            self.left.clone()
        } else {
            other.left.clone()
        };
        let right = if self.right <= other.right {
            self.right.clone()
        } else {
            other.right.clone()
        };
        KeyRange { left, right }
    }
}

/// A shard slice: a hash interval plus a key interval. Hash intervals are
/// end-exclusive with `u64::MAX` standing in for the top of the ring.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub start_hash: u64,
    pub end_hash: u64,
    pub keys: KeyRange,
}

impl Region {
    pub fn new(start_hash: u64, end_hash: u64, keys: KeyRange) -> Self {
        Self {
            start_hash,
            end_hash,
            keys,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start_hash >= self.end_hash || self.keys.is_empty()
    }

    pub fn intersect(&self, other: &Region) -> Region {
        Region {
            start_hash: self.start_hash.max(other.start_hash),
            end_hash: self.end_hash.min(other.end_hash),
            keys: self.keys.intersect(&other.keys),
        }
    }
}

/// A partition of a region into contiguous tagged sub-regions.
///
/// All entries share the hash interval; entries are sorted by key-range left
/// edge, non-overlapping, and cover a contiguous span. An empty map covers
/// nothing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionMap<T> {
    start_hash: u64,
    end_hash: u64,
    entries: Vec<(KeyRange, T)>,
}

impl<T> RegionMap<T> {
    /// A map with a single entry covering `region`.
    pub fn new(region: Region, value: T) -> Self {
        Self {
            start_hash: region.start_hash,
            end_hash: region.end_hash,
            entries: vec![(region.keys, value)],
        }
    }

    /// A map covering nothing within the given hash interval.
    pub fn empty(start_hash: u64, end_hash: u64) -> Self {
        Self {
            start_hash,
            end_hash,
            entries: Vec::new(),
        }
    }

    /// Build from unordered entries; entries must tile a contiguous span.
    pub fn from_parts(start_hash: u64, end_hash: u64, mut entries: Vec<(KeyRange, T)>) -> Self {
        entries.retain(|(range, _)| !range.is_empty());
        entries.sort_by(|a, b| a.0.left.cmp(&b.0.left));
        Self {
            start_hash,
            end_hash,
            entries,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn start_hash(&self) -> u64 {
        self.start_hash
    }

    pub fn end_hash(&self) -> u64 {
        self.end_hash
    }

    /// The covered region, if any entry exists.
    pub fn domain(&self) -> Option<Region> {
        let first = self.entries.first()?;
        let last = self.entries.last()?;
        Some(Region {
            start_hash: self.start_hash,
            end_hash: self.end_hash,
            keys: KeyRange {
                left: first.0.left.clone(),
                right: last.0.right.clone(),
            },
        })
    }

    /// Right edge of the covered span, or `None` when empty.
    pub fn right_edge(&self) -> Option<&RightBound> {
        self.entries.last().map(|(range, _)| &range.right)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Region, &T)> {
        self.entries.iter().map(move |(range, value)| {
            (
                Region {
                    start_hash: self.start_hash,
                    end_hash: self.end_hash,
                    keys: range.clone(),
                },
                value,
            )
        })
    }

    /// Value tagged on the sub-region containing `key`.
    pub fn lookup(&self, key: &[u8]) -> Option<&T> {
        self.entries
            .iter()
            .find(|(range, _)| range.contains_key(key))
            .map(|(_, value)| value)
    }

    /// Pointwise transform preserving the partition.
    pub fn map<U>(&self, f: impl Fn(&T) -> U) -> RegionMap<U> {
        RegionMap {
            start_hash: self.start_hash,
            end_hash: self.end_hash,
            entries: self
                .entries
                .iter()
                .map(|(range, value)| (range.clone(), f(value)))
                .collect(),
        }
    }
}

impl<T: Clone> RegionMap<T> {
    /// Clip the map to `region`.
    pub fn mask(&self, region: &Region) -> RegionMap<T> {
        let start_hash = self.start_hash.max(region.start_hash);
        let end_hash = self.end_hash.min(region.end_hash);
        let mut entries = Vec::new();
        if start_hash < end_hash {
            for (range, value) in &self.entries {
                let clipped = range.intersect(&region.keys);
                if !clipped.is_empty() {
                    entries.push((clipped, value.clone()));
                }
            }
        }
        RegionMap {
            start_hash,
            end_hash,
            entries,
        }
    }

    /// Append a map whose domain starts at this map's right edge.
    pub fn concat(&mut self, other: RegionMap<T>) {
        if other.entries.is_empty() {
            return;
        }
        if self.entries.is_empty() {
            *self = other;
            return;
        }
        debug_assert_eq!(
            self.right_edge(),
            other.entries.first().map(|(r, _)| RightBound::Key(r.left.clone())).as_ref(),
        );
        self.entries.extend(other.entries);
    }

    /// Overwrite with `other` wherever the two domains overlap. `other`'s
    /// domain must be contiguous.
    pub fn update(&mut self, other: RegionMap<T>) {
        let Some(cut) = other.domain() else {
            return;
        };
        let mut rebuilt: Vec<(KeyRange, T)> = Vec::with_capacity(self.entries.len() + other.entries.len());
        for (range, value) in self.entries.drain(..) {
            // Piece left of the cut.
            let low = KeyRange {
                left: range.left.clone(),
                right: RightBound::Key(cut.keys.left.clone()).min(range.right.clone()),
            };
            if !low.is_empty() {
                rebuilt.push((low, value.clone()));
            }
            // Piece right of the cut.
            if let RightBound::Key(cut_right) = &cut.keys.right {
                let high = KeyRange {
                    left: range.left.clone().max(cut_right.clone()),
                    right: range.right.clone(),
                };
                if !high.is_empty() {
                    rebuilt.push((high, value));
                }
            }
        }
        rebuilt.extend(other.entries);
        rebuilt.sort_by(|a, b| a.0.left.cmp(&b.0.left));
        self.entries = rebuilt;
    }
}
