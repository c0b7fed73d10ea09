//! Version tags and the branch history DAG.
//!
//! Every write carries a `Version`: a branch identifier plus a totally
//! ordered timestamp along that branch. Branches are born from per-region
//! parent versions, recorded as birth certificates in a `BranchHistory`.
//! `find_common` resolves the greatest common ancestor of two versions per
//! sub-region, which is how the backfill source computes the floor it can
//! stream deltas from.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::region::{Region, RegionMap};

/// Monotonic logical timestamp, totally ordered across branches.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);
}

/// Identifier of a branch in the version history DAG.
pub type BranchId = u64;

/// The synthetic branch every history descends from.
pub const ROOT_BRANCH: BranchId = 0;

/// A point in the branch history: a branch plus a timestamp along it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub branch: BranchId,
    pub timestamp: Timestamp,
}

impl Version {
    pub fn new(branch: BranchId, timestamp: Timestamp) -> Self {
        Self { branch, timestamp }
    }

    /// The universal ancestor: the root branch before any write.
    pub fn zero() -> Self {
        Self {
            branch: ROOT_BRANCH,
            timestamp: Timestamp::ZERO,
        }
    }
}

/// Birth certificate linking a branch to its parent versions per sub-region.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BranchBirth {
    /// Region the branch was created over.
    pub region: Region,
    /// Timestamp at which the branch began issuing versions.
    pub initial_timestamp: Timestamp,
    /// Parent version for each sub-region at branch creation.
    pub origin: RegionMap<Version>,
}

/// Append-only set of branch birth certificates.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BranchHistory {
    branches: HashMap<BranchId, BranchBirth>,
}

impl BranchHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_branch(&mut self, branch: BranchId, birth: BranchBirth) {
        self.branches.insert(branch, birth);
    }

    pub fn branch_birth(&self, branch: BranchId) -> Option<&BranchBirth> {
        self.branches.get(&branch)
    }
}

/// Read access to branch metadata, possibly spanning several stores.
pub trait BranchHistoryReader {
    fn branch_birth(&self, branch: BranchId) -> Option<&BranchBirth>;
}

impl BranchHistoryReader for BranchHistory {
    fn branch_birth(&self, branch: BranchId) -> Option<&BranchBirth> {
        BranchHistory::branch_birth(self, branch)
    }
}

/// Local branch history store. Read-only while backfill sessions run.
#[derive(Debug, Default)]
pub struct BranchHistoryManager {
    inner: RwLock<BranchHistory>,
}

impl BranchHistoryManager {
    pub fn new(history: BranchHistory) -> Self {
        Self {
            inner: RwLock::new(history),
        }
    }

    pub fn record_branch(&self, branch: BranchId, birth: BranchBirth) {
        if let Ok(mut guard) = self.inner.write() {
            guard.record_branch(branch, birth);
        }
    }

    /// Snapshot the current history.
    pub fn read(&self) -> BranchHistory {
        self.inner
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

/// Layers a peer-supplied history over the local one; local wins on overlap.
pub struct CombinedHistory<'a> {
    local: &'a BranchHistory,
    remote: &'a BranchHistory,
}

impl<'a> CombinedHistory<'a> {
    pub fn new(local: &'a BranchHistory, remote: &'a BranchHistory) -> Self {
        Self { local, remote }
    }
}

impl BranchHistoryReader for CombinedHistory<'_> {
    fn branch_birth(&self, branch: BranchId) -> Option<&BranchBirth> {
        self.local
            .branch_birth(branch)
            .or_else(|| self.remote.branch_birth(branch))
    }
}

/// Per sub-region ancestry chain, newest entry first. Each element caps the
/// timestamp the chain passed through on that branch.
type Chain = Vec<(BranchId, Timestamp)>;

fn ancestry(
    reader: &dyn BranchHistoryReader,
    version: Version,
    region: Region,
    prefix: &Chain,
) -> anyhow::Result<Vec<(Region, Chain)>> {
    let mut chain = prefix.clone();
    chain.push((version.branch, version.timestamp));
    if version.branch == ROOT_BRANCH {
        return Ok(vec![(region, chain)]);
    }
    let birth = reader
        .branch_birth(version.branch)
        .with_context(|| format!("branch {} missing from combined history", version.branch))?;
    let mut out = Vec::new();
    for (sub_region, parent) in birth.origin.mask(&region).iter() {
        if sub_region.is_empty() {
            continue;
        }
        out.extend(ancestry(reader, *parent, sub_region, &chain)?);
    }
    Ok(out)
}

/// Greatest version both chains descend from. Histories are trees per
/// sub-region, so the newest branch shared by both chains is the divergence
/// point and the common timestamp is the smaller of the two caps.
fn chain_common(ours: &Chain, theirs: &Chain) -> Version {
    for (branch, our_cap) in ours {
        if let Some((_, their_cap)) = theirs.iter().find(|(b, _)| b == branch) {
            return Version::new(*branch, (*our_cap).min(*their_cap));
        }
    }
    Version::zero()
}

/// Resolve the greatest common ancestor of `v_local` and `v_remote` for every
/// sub-region of `region`.
pub fn find_common(
    reader: &dyn BranchHistoryReader,
    v_local: Version,
    v_remote: Version,
    region: &Region,
) -> anyhow::Result<RegionMap<Version>> {
    let mut pairs = Vec::new();
    for (local_region, local_chain) in ancestry(reader, v_local, region.clone(), &Vec::new())? {
        for (sub_region, remote_chain) in
            ancestry(reader, v_remote, local_region.clone(), &Vec::new())?
        {
            pairs.push((sub_region.keys, chain_common(&local_chain, &remote_chain)));
        }
    }
    Ok(RegionMap::from_parts(
        region.start_hash,
        region.end_hash,
        pairs,
    ))
}
