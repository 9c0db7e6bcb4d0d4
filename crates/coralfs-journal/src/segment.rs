//! Log segments and the segment index
//!
//! A segment is a contiguous offset range of the journal that expires as a
//! unit. Segments are addressed by their start offset everywhere: the
//! expiring/expired sets hold offsets, and events carry the offset of their
//! owning segment rather than a pointer back into the index.

use coralfs_common::IoPriority;
use std::collections::{BTreeMap, BTreeSet};

/// Kind of cache state a segment pins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheRefKind {
    Dirfrag,
    Inode,
    Dentry,
    OpenFile,
}

/// Opaque handle into the metadata cache that must be flushed before the
/// owning segment can expire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheRef {
    pub kind: CacheRefKind,
    pub id: u64,
}

/// Logical partition of the journal stream
#[derive(Debug, Clone)]
pub struct LogSegment {
    /// First byte of the stream assigned to this segment
    pub offset: u64,
    /// One past the last byte currently assigned; mutable while current
    pub end: u64,
    /// Events owned by this segment
    pub num_events: u64,
    /// Cache state pinned by this segment's events
    pub dirty_refs: Vec<CacheRef>,
}

impl LogSegment {
    pub fn new(offset: u64) -> Self {
        Self {
            offset,
            end: offset,
            num_events: 0,
            dirty_refs: Vec::new(),
        }
    }

    pub fn clear_dirty_refs(&mut self) {
        self.dirty_refs.clear();
    }
}

/// Work item queued when an expiry gather completes
#[derive(Debug, Clone, Copy)]
pub struct ExpiryCompletion {
    pub segment_offset: u64,
    pub prio: IoPriority,
}

/// Ordered map from start offset to segment, with expiry bookkeeping.
///
/// Invariants maintained here: keys equal each segment's `offset`; the
/// expiring and expired sets are disjoint subsets of the key set; event
/// counts in the two sets track the segments they contain.
#[derive(Debug, Default)]
pub struct SegmentIndex {
    segments: BTreeMap<u64, LogSegment>,
    expiring: BTreeSet<u64>,
    expired: BTreeSet<u64>,
    expiring_events: u64,
    expired_events: u64,
}

impl SegmentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new segment at `offset`; it becomes the current segment
    pub fn insert(&mut self, offset: u64) -> &mut LogSegment {
        debug_assert!(
            self.segments.keys().next_back().is_none_or(|k| *k < offset)
                || self.segments.contains_key(&offset),
            "segment offsets must be inserted in increasing order"
        );
        self.segments
            .entry(offset)
            .or_insert_with(|| LogSegment::new(offset))
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, offset: u64) -> Option<&LogSegment> {
        self.segments.get(&offset)
    }

    pub fn get_mut(&mut self, offset: u64) -> Option<&mut LogSegment> {
        self.segments.get_mut(&offset)
    }

    /// Offset of the current (newest) segment
    pub fn current_offset(&self) -> Option<u64> {
        self.segments.keys().next_back().copied()
    }

    pub fn current_mut(&mut self) -> Option<&mut LogSegment> {
        self.segments.values_mut().next_back()
    }

    /// Offset of the oldest segment
    pub fn oldest_offset(&self) -> Option<u64> {
        self.segments.keys().next().copied()
    }

    /// Ascending segment offsets
    pub fn offsets(&self) -> impl Iterator<Item = u64> + '_ {
        self.segments.keys().copied()
    }

    pub fn is_expiring(&self, offset: u64) -> bool {
        self.expiring.contains(&offset)
    }

    pub fn is_expired(&self, offset: u64) -> bool {
        self.expired.contains(&offset)
    }

    pub fn expiring_count(&self) -> usize {
        self.expiring.len()
    }

    pub fn expired_count(&self) -> usize {
        self.expired.len()
    }

    pub fn expiring_events(&self) -> u64 {
        self.expiring_events
    }

    pub fn expired_events(&self) -> u64 {
        self.expired_events
    }

    /// Segments not yet counted toward expiry
    pub fn live_count(&self) -> usize {
        self.segments.len() - self.expiring.len() - self.expired.len()
    }

    /// Move a segment into the expiring set
    pub fn mark_expiring(&mut self, offset: u64) {
        let seg = &self.segments[&offset];
        assert!(!self.expired.contains(&offset), "segment already expired");
        assert!(self.expiring.insert(offset), "segment already expiring");
        self.expiring_events += seg.num_events;
    }

    /// Take a segment back out of the expiring set (its gather finished)
    pub fn unmark_expiring(&mut self, offset: u64) {
        assert!(self.expiring.remove(&offset), "segment was not expiring");
        self.expiring_events -= self.segments[&offset].num_events;
    }

    /// Move a segment into the expired set
    pub fn mark_expired(&mut self, offset: u64) {
        let seg = &self.segments[&offset];
        assert!(!self.expiring.contains(&offset), "segment still expiring");
        assert!(self.expired.insert(offset), "segment already expired");
        self.expired_events += seg.num_events;
    }

    /// Remove and return the oldest segment, adjusting expiry bookkeeping
    pub fn remove_oldest(&mut self) -> Option<LogSegment> {
        let offset = self.oldest_offset()?;
        let seg = self.segments.remove(&offset)?;
        if self.expiring.remove(&offset) {
            self.expiring_events -= seg.num_events;
        }
        if self.expired.remove(&offset) {
            self.expired_events -= seg.num_events;
        }
        Some(seg)
    }

    /// Sum of per-segment event counts
    pub fn event_total(&self) -> u64 {
        self.segments.values().map(|s| s.num_events).sum()
    }
}
