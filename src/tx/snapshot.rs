/// Open snapshots and the pages only they can still reach.
///
/// A commit that produces version `v` releases pages that every snapshot
/// older than `v` may still read. Those pages wait here until the oldest
/// open snapshot is at least `v`, then go back to the allocator.
use std::collections::{BTreeMap, VecDeque};

use crate::storage::PageId;

pub(crate) struct SnapshotRegistry {
    /// Version of the latest commit; new transactions read this one.
    version: u64,
    /// Open transactions per snapshot version.
    live: BTreeMap<u64, usize>,
    /// `(version, pages)` per commit, oldest first.
    pending: VecDeque<(u64, Vec<PageId>)>,
}

impl SnapshotRegistry {
    pub(crate) fn new(version: u64) -> Self {
        SnapshotRegistry {
            version,
            live: BTreeMap::new(),
            pending: VecDeque::new(),
        }
    }

    /// Pin the current version for a new transaction.
    pub(crate) fn register(&mut self) -> u64 {
        *self.live.entry(self.version).or_default() += 1;
        self.version
    }

    /// Unpin `version`. Returns pages nobody can reach any more.
    pub(crate) fn release(&mut self, version: u64) -> Vec<PageId> {
        match self.live.get_mut(&version) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.live.remove(&version);
            }
            None => panic!("BUG: snapshot {} released twice", version),
        }
        self.drain_unreachable()
    }

    /// Record a commit that moved the store to `version` and released
    /// `pages`. Returns pages nobody can reach any more.
    pub(crate) fn publish(&mut self, version: u64, pages: Vec<PageId>) -> Vec<PageId> {
        debug_assert!(version > self.version, "BUG: versions must increase");
        self.version = version;
        if !pages.is_empty() {
            self.pending.push_back((version, pages));
        }
        self.drain_unreachable()
    }

    /// Pages still waiting for old snapshots to close.
    pub(crate) fn pending_pages(&self) -> impl Iterator<Item = PageId> + '_ {
        self.pending.iter().flat_map(|(_, pages)| pages.iter().copied())
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.iter().map(|(_, pages)| pages.len()).sum()
    }

    fn drain_unreachable(&mut self) -> Vec<PageId> {
        let oldest = self.live.keys().next().copied().unwrap_or(self.version);
        let mut freed = Vec::new();
        while let Some((version, _)) = self.pending.front() {
            if *version > oldest {
                break;
            }
            if let Some((_, pages)) = self.pending.pop_front() {
                freed.extend(pages);
            }
        }
        freed
    }
}
