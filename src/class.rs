//! The arena-class seam.  The core owns policy and the free indices;
//! everything that actually touches backing store (reserving,
//! committing, releasing) is dispatched through this trait, so the
//! core holds no knowledge of any concrete class.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::collections::BTreeMap;

use crate::arena::ArenaState;
use crate::config::ArenaArgs;
use crate::error::{Error, Result};
use crate::pool::PoolId;
use crate::pref::Placement;
use crate::range::Range;

/// Backing-store driver for an arena.  Methods receive the arena's
/// state so they can update chunks and commit accounting; the trait
/// object itself holds only class-private state.
pub trait ArenaClass: std::fmt::Debug {
    /// Normalizes configuration: fill in class defaults, drop hints
    /// that do not apply.
    fn normalize(&self, args: &mut ArenaArgs) {
        let _ = args;
    }

    /// Reserves the primary chunk and registers it with the state.
    /// The core indexes the chunk's free span afterwards.
    fn init(&mut self, state: &mut ArenaState, args: &ArenaArgs) -> Result<()>;

    /// Releases every chunk.  Called last, after the indices are torn
    /// down.
    fn finish(&mut self, state: &mut ArenaState);

    /// Total address space reserved.
    fn reserved(&self, state: &ArenaState) -> usize {
        state.chunks_reserved()
    }

    /// Releases up to `bytes` of spare committed memory; returns the
    /// amount actually released.
    fn purge_spare(&mut self, state: &mut ArenaState, bytes: usize) -> usize {
        let _ = (state, bytes);
        0
    }

    /// Adds a client-supplied chunk; returns its index.
    fn extend(&mut self, state: &mut ArenaState, base: usize, size: usize) -> Result<usize> {
        let _ = (state, base, size);
        Err(Error::Unimpl)
    }

    /// Reserves additional address space compatible with `pref`;
    /// returns the new chunk's index.  The core indexes its free span
    /// and retries placement.
    fn grow(&mut self, state: &mut ArenaState, pref: &Placement, size: usize) -> Result<usize> {
        let _ = (state, pref, size);
        Err(Error::Resource)
    }

    /// Releases backing store for a freed range whose pages have
    /// already left the free indices.  Clears the pages and settles
    /// commit accounting; may retain some of the range as spare.
    fn free(&mut self, state: &mut ArenaState, base: usize, size: usize, pool: PoolId);

    /// Commits `count` pages from `base_index` of chunk `chunk_index`
    /// and records `pool` as their owner.  Fails with `CommitLimit`
    /// without marking anything when the commit ceiling is too low.
    fn pages_mark_allocated(
        &mut self,
        state: &mut ArenaState,
        chunk_index: usize,
        base_index: usize,
        count: usize,
        pool: PoolId,
    ) -> Result<()>;

    /// Per-chunk hook, called after a chunk's tables are initialised.
    fn chunk_init(&mut self, state: &mut ArenaState, chunk_index: usize) {
        let _ = (state, chunk_index);
    }

    /// Per-chunk hook, called before a chunk is dropped.
    fn chunk_finish(&mut self, state: &mut ArenaState, chunk_index: usize) {
        let _ = (state, chunk_index);
    }

    /// Post-reclaim shrink; classes that cannot shrink do nothing.
    fn compact(&mut self, state: &mut ArenaState) {
        let _ = state;
    }

    /// Class-specific diagnostics.
    fn describe(&self, state: &ArenaState, stream: &mut dyn std::fmt::Write) -> std::fmt::Result {
        let _ = state;
        writeln!(stream, "  No class-specific description available.")
    }
}

/// Spare-commit bookkeeping shared by the in-tree classes: ranges that
/// stay committed after a free, so a later allocation in the same
/// place costs nothing.
#[derive(Debug, Default)]
pub struct SpareMap {
    ranges: BTreeMap<usize, usize>,
    total: usize,
}

impl SpareMap {
    pub fn new() -> SpareMap {
        Default::default()
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Spare ranges overlapping `range`.
    fn overlapping(&self, range: Range) -> Vec<Range> {
        self.ranges
            .range(..range.limit())
            .rev()
            .map(|(&b, &l)| Range::new(b, l))
            .take_while(|r| r.limit() > range.base())
            .map(|r| r.intersect(range))
            .filter(|r| !r.is_empty())
            .collect()
    }

    /// How many bytes of `range` are currently spare.
    pub fn probe(&self, range: Range) -> usize {
        self.overlapping(range).iter().map(|r| r.size()).sum()
    }

    /// Removes the spare cover of `range`.  Returns the spare byte
    /// count and the sub-ranges of `range` that were *not* spare (the
    /// parts that need fresh commitment).
    pub fn consume(&mut self, range: Range) -> (usize, Vec<Range>) {
        let mut spare = 0;
        let mut covered = self.overlapping(range);
        covered.sort();

        for ov in &covered {
            // Find the entry containing this overlap and split it.
            let (&b, &l) = self
                .ranges
                .range(..=ov.base())
                .next_back()
                .expect("overlap comes from an entry");
            self.ranges.remove(&b);
            if b < ov.base() {
                self.ranges.insert(b, ov.base());
            }
            if ov.limit() < l {
                self.ranges.insert(ov.limit(), l);
            }
            spare += ov.size();
        }
        self.total -= spare;

        // The fresh parts are the gaps between overlaps.
        let mut fresh = Vec::new();
        let mut at = range.base();
        for ov in &covered {
            if at < ov.base() {
                fresh.push(Range::new(at, ov.base()));
            }
            at = ov.limit();
        }
        if at < range.limit() {
            fresh.push(Range::new(at, range.limit()));
        }
        (spare, fresh)
    }

    /// Retains up to `room` bytes of `range` (from its low end) as
    /// spare, coalescing with neighbours.  Returns the retained size.
    #[ensures(ret <= room && ret <= range.size())]
    pub fn retain(&mut self, range: Range, room: usize) -> usize {
        let take = range.size().min(room);
        if take == 0 {
            return 0;
        }

        let mut base = range.base();
        let mut limit = range.base() + take;
        debug_assert_eq!(self.probe(Range::new(base, limit)), 0);

        // Merge with an abutting predecessor and successor.
        if let Some((&b, &l)) = self.ranges.range(..=base).next_back() {
            if l == base {
                self.ranges.remove(&b);
                base = b;
            }
        }
        if let Some(&succ_limit) = self.ranges.get(&limit) {
            self.ranges.remove(&limit);
            limit = succ_limit;
        }
        self.ranges.insert(base, limit);
        self.total += take;
        take
    }

    /// Removes up to `bytes` of spare, splitting the last range if
    /// needed, and returns what was removed.
    pub fn purge(&mut self, bytes: usize) -> Vec<Range> {
        let mut removed = Vec::new();
        let mut left = bytes.min(self.total);

        while left > 0 {
            let (&b, &l) = self.ranges.iter().next().expect("total says nonempty");
            let r = Range::new(b, l);
            self.ranges.remove(&b);

            if r.size() <= left {
                left -= r.size();
                self.total -= r.size();
                removed.push(r);
            } else {
                let cut = Range::from_size(b, left);
                self.ranges.insert(cut.limit(), l);
                self.total -= left;
                left = 0;
                removed.push(cut);
            }
        }
        removed
    }

    /// Drops every spare entry within `within` (chunk teardown);
    /// returns the byte count dropped.
    pub fn remove_within(&mut self, within: Range) -> usize {
        let victims: Vec<usize> = self
            .ranges
            .range(within.base()..within.limit())
            .map(|(&b, _)| b)
            .collect();

        let mut dropped = 0;
        for b in victims {
            let l = self.ranges.remove(&b).expect("listed above");
            debug_assert!(l <= within.limit(), "spare range crosses a chunk");
            dropped += l - b;
        }
        self.total -= dropped;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retain_coalesces() {
        let mut spare = SpareMap::new();

        assert_eq!(spare.retain(Range::new(0x1000, 0x2000), usize::MAX), 0x1000);
        assert_eq!(spare.retain(Range::new(0x2000, 0x3000), usize::MAX), 0x1000);
        assert_eq!(spare.total(), 0x2000);
        assert_eq!(spare.probe(Range::new(0, 0x10000)), 0x2000);

        // Coalesced into one entry: consuming the middle splits it.
        let (bytes, fresh) = spare.consume(Range::new(0x1800, 0x2800));
        assert_eq!(bytes, 0x1000);
        assert!(fresh.is_empty());
        assert_eq!(spare.total(), 0x1000);
    }

    #[test]
    fn retain_respects_room() {
        let mut spare = SpareMap::new();

        assert_eq!(spare.retain(Range::new(0x1000, 0x5000), 0x2000), 0x2000);
        assert_eq!(spare.probe(Range::new(0x1000, 0x3000)), 0x2000);
        assert_eq!(spare.probe(Range::new(0x3000, 0x5000)), 0);
    }

    #[test]
    fn consume_reports_fresh_gaps() {
        let mut spare = SpareMap::new();

        spare.retain(Range::new(0x1000, 0x2000), usize::MAX);
        spare.retain(Range::new(0x3000, 0x4000), usize::MAX);

        let (bytes, fresh) = spare.consume(Range::new(0x0000, 0x5000));
        assert_eq!(bytes, 0x2000);
        assert_eq!(
            fresh,
            vec![
                Range::new(0x0000, 0x1000),
                Range::new(0x2000, 0x3000),
                Range::new(0x4000, 0x5000)
            ]
        );
        assert_eq!(spare.total(), 0);
    }

    #[test]
    fn purge_splits_to_the_byte() {
        let mut spare = SpareMap::new();

        spare.retain(Range::new(0x1000, 0x3000), usize::MAX);
        let removed = spare.purge(0x1000);
        assert_eq!(removed, vec![Range::new(0x1000, 0x2000)]);
        assert_eq!(spare.total(), 0x1000);

        // Purging more than there is stops at empty.
        let removed = spare.purge(0x10000);
        assert_eq!(removed, vec![Range::new(0x2000, 0x3000)]);
        assert_eq!(spare.total(), 0);
    }
}
