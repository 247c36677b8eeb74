//! Hardlink correlation for one session
//!
//! The tracker keeps one table per tree side, keyed by `(inode, device)`.
//! An inode moves from unseen, to partially seen (some links still expected),
//! to fully seen, at which point its entry is dropped. The tracker is owned
//! by the session that walks the trees and is reset between sessions.

use crate::index::Index;
use crate::record::Record;
use std::collections::HashMap;
use tracing::trace;

/// Which tree a record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeSide {
    /// The live source tree
    Source,
    /// The mirror, as described by a metadata snapshot or a live walk
    Mirror,
}

type InodeKey = (u64, u64);

#[derive(Debug, Clone)]
struct LinkEntry {
    first_index: Index,
    remaining: u64,
    peer: Option<InodeKey>,
}

/// Correlates hardlinked files to the first index each inode was seen at
#[derive(Debug, Default)]
pub struct HardlinkTracker {
    source: HashMap<InodeKey, LinkEntry>,
    mirror: HashMap<InodeKey, LinkEntry>,
}

impl HardlinkTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything
    pub fn reset(&mut self) {
        self.source.clear();
        self.mirror.clear();
    }

    fn table(&self, side: TreeSide) -> &HashMap<InodeKey, LinkEntry> {
        match side {
            TreeSide::Source => &self.source,
            TreeSide::Mirror => &self.mirror,
        }
    }

    fn table_mut(&mut self, side: TreeSide) -> &mut HashMap<InodeKey, LinkEntry> {
        match side {
            TreeSide::Source => &mut self.source,
            TreeSide::Mirror => &mut self.mirror,
        }
    }

    /// Number of inodes still waiting for links on `side`
    pub fn pending(&self, side: TreeSide) -> usize {
        self.table(side).len()
    }

    /// Account for `rec`
    ///
    /// Records that are not multiply-linked regular files are ignored. The
    /// first sighting of an inode stores its index and the number of links
    /// still expected; each later sighting decrements that number and the
    /// entry is evicted at zero.
    pub fn add_record(&mut self, side: TreeSide, rec: &Record, correlated_peer: Option<&Record>) {
        let Some(link) = rec.hardlink().filter(|l| l.nlink > 1) else {
            return;
        };
        let key = link.key();
        let peer_key = correlated_peer.and_then(Record::hardlink).map(|l| l.key());
        let table = self.table_mut(side);
        match table.get_mut(&key) {
            Some(entry) => {
                entry.remaining = entry.remaining.saturating_sub(1);
                if entry.peer.is_none() {
                    entry.peer = peer_key;
                }
                if entry.remaining == 0 {
                    trace!("All links of inode {:?} seen, first at {}", key, entry.first_index);
                    table.remove(&key);
                }
            }
            None => {
                table.insert(
                    key,
                    LinkEntry {
                        first_index: rec.index.clone(),
                        remaining: link.nlink - 1,
                        peer: peer_key,
                    },
                );
            }
        }
    }

    /// First index this record's inode was seen at, when that is not `rec` itself
    ///
    /// Must be asked before [`HardlinkTracker::add_record`] for the same record.
    pub fn resolve_link_target(&self, side: TreeSide, rec: &Record) -> Option<Index> {
        let link = rec.hardlink().filter(|l| l.nlink > 1)?;
        self.table(side)
            .get(&link.key())
            .filter(|entry| entry.first_index != rec.index)
            .map(|entry| entry.first_index.clone())
    }

    /// Whether two otherwise-equal records also agree on hardlink structure
    ///
    /// They disagree if their link counts differ, if they resolve to different
    /// first indexes, or if the source inode was already correlated with a
    /// different mirror inode.
    pub fn rorp_eq_hardlink_view(&self, src: &Record, dst: &Record) -> bool {
        let src_linked = src.is_hardlinked();
        let dst_linked = dst.is_hardlinked();
        if !src_linked && !dst_linked {
            return true;
        }
        let (Some(src_link), Some(dst_link)) = (src.hardlink(), dst.hardlink()) else {
            return false;
        };
        if src_link.nlink != dst_link.nlink {
            return false;
        }
        if self.resolve_link_target(TreeSide::Source, src) != self.resolve_link_target(TreeSide::Mirror, dst) {
            return false;
        }
        match self.source.get(&src_link.key()).and_then(|entry| entry.peer) {
            Some(peer) => peer == dst_link.key(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Attributes, HardlinkInfo, RecordKind};

    fn linked(name: &str, inode: u64, nlink: u64) -> Record {
        Record {
            index: Index::root().join(name),
            kind: RecordKind::Regular {
                size: 5,
                mtime: 1,
                sha256: None,
                link: Some(HardlinkInfo { inode, device: 1, nlink }),
            },
            attrs: Attributes::default(),
        }
    }

    #[test]
    fn test_state_machine() {
        let mut tracker = HardlinkTracker::new();
        let a = linked("a", 10, 3);
        let b = linked("b", 10, 3);
        let c = linked("c", 10, 3);

        assert_eq!(tracker.resolve_link_target(TreeSide::Source, &a), None);
        tracker.add_record(TreeSide::Source, &a, None);
        assert_eq!(tracker.pending(TreeSide::Source), 1);

        assert_eq!(tracker.resolve_link_target(TreeSide::Source, &b), Some(a.index.clone()));
        tracker.add_record(TreeSide::Source, &b, None);
        assert_eq!(tracker.resolve_link_target(TreeSide::Source, &c), Some(a.index.clone()));
        tracker.add_record(TreeSide::Source, &c, None);
        assert_eq!(tracker.pending(TreeSide::Source), 0);
        assert_eq!(tracker.pending(TreeSide::Mirror), 0);
    }

    #[test]
    fn test_single_links_ignored() {
        let mut tracker = HardlinkTracker::new();
        let solo = linked("solo", 5, 1);
        tracker.add_record(TreeSide::Source, &solo, None);
        assert_eq!(tracker.pending(TreeSide::Source), 0);
        assert!(tracker.rorp_eq_hardlink_view(&solo, &linked("solo", 99, 1)));
    }

    #[test]
    fn test_link_count_mismatch() {
        let tracker = HardlinkTracker::new();
        assert!(!tracker.rorp_eq_hardlink_view(&linked("a", 1, 2), &linked("a", 1, 3)));
        assert!(!tracker.rorp_eq_hardlink_view(&linked("a", 1, 2), &linked("a", 1, 1)));
    }

    #[test]
    fn test_target_mismatch() {
        let mut tracker = HardlinkTracker::new();
        // Source: a and c share an inode. Mirror: a and b shared one.
        tracker.add_record(TreeSide::Source, &linked("a", 1, 2), None);
        tracker.add_record(TreeSide::Mirror, &linked("a", 7, 2), None);
        tracker.add_record(TreeSide::Mirror, &linked("b", 7, 2), None);
        tracker.add_record(TreeSide::Mirror, &linked("c", 8, 2), None);

        let src_c = linked("c", 1, 2);
        let dst_c = linked("c", 8, 2);
        assert!(!tracker.rorp_eq_hardlink_view(&src_c, &dst_c));
    }

    #[test]
    fn test_matching_groups_agree() {
        let mut tracker = HardlinkTracker::new();
        let src_a = linked("a", 1, 2);
        let dst_a = linked("a", 1, 2);
        assert!(tracker.rorp_eq_hardlink_view(&src_a, &dst_a));
        tracker.add_record(TreeSide::Source, &src_a, Some(&dst_a));
        tracker.add_record(TreeSide::Mirror, &dst_a, Some(&src_a));

        let src_b = linked("b", 1, 2);
        let dst_b = linked("b", 1, 2);
        assert!(tracker.rorp_eq_hardlink_view(&src_b, &dst_b));
    }

    #[test]
    fn test_peer_correlation_mismatch() {
        let mut tracker = HardlinkTracker::new();
        let src_a = linked("a", 1, 3);
        tracker.add_record(TreeSide::Source, &src_a, Some(&linked("a", 50, 3)));
        tracker.add_record(TreeSide::Mirror, &linked("a", 60, 3), None);
        // Same first index on both sides, but the source was correlated with inode 50
        let src_b = linked("b", 1, 3);
        let dst_b = linked("b", 60, 3);
        assert!(!tracker.rorp_eq_hardlink_view(&src_b, &dst_b));
    }
}
