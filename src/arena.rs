//! The arena core: it owns the chunks, the free-range indices, the
//! commit accounting, and the placement policy that decides *where*
//! an allocation lands.  Backing store is delegated to an
//! `ArenaClass`; policy decisions are concentrated here and nowhere
//! else.
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

use crate::block_pool::BlockPool;
use crate::chunk::{Chunk, Tract};
use crate::class::ArenaClass;
use crate::config::ArenaArgs;
use crate::control::ControlPool;
use crate::error::{Error, Result};
use crate::pool::{PoolId, POOL_BLOCKS, POOL_CONTROL, POOL_FIRST_CLIENT, POOL_RESERVOIR};
use crate::pref::Placement;
use crate::range::{align_down, align_up, Range};
use crate::range_set::{RangeSet, NODE_SIZE};
use crate::reservoir::Reservoir;
use crate::sys;
use crate::zone::{zone_of, ZoneSet, ZONE_COUNT};

/// Which free index a range lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IndexId {
    Free,
    Zone(usize),
}

/// Where a chosen range came from, so a failed commit can put it back.
#[derive(Clone, Copy, Debug)]
enum Origin {
    Ring,
    Zone(usize),
    Free { tail_moved: Option<(Range, usize)> },
}

/// Everything the arena owns apart from its class.  Class methods
/// receive `&mut ArenaState` so they can register chunks and settle
/// commit accounting.
pub struct ArenaState {
    alignment: usize,
    zone_shift: u32,

    committed: usize,
    commit_limit: usize,
    spare_committed: usize,
    spare_commit_limit: usize,

    /// Chunks, primary first.
    chunks: Vec<Chunk>,

    /// The canonical index of free address space.
    free_set: RangeSet,
    /// Sub-zone fragments carved out during allocation, one set per
    /// zone.
    zone_sets: Vec<RangeSet>,
    /// Single-tract free list per zone, threaded through page words.
    free_ring: [Option<usize>; ZONE_COUNT],
    /// Over-approximation: a zone in here has never had a placement
    /// allocation.  Only ever shrinks.
    free_zones: ZoneSet,

    /// Node storage for the range sets.  Never self-extends; fed one
    /// page at a time by the bootstrap allocator.
    block_pool: BlockPool,
    feed_pages: usize,

    reservoir: Reservoir,
    control: ControlPool,

    last_tract: Option<Tract>,
    pool_serial: u32,
}

impl ArenaState {
    fn new(args: &ArenaArgs) -> Result<ArenaState> {
        let alignment = if args.alignment == 0 {
            sys::page_size()
        } else {
            args.alignment
        };
        if !alignment.is_power_of_two() || alignment < sys::page_size() {
            return Err(Error::Memory);
        }
        // Zone stripes can't be smaller than pages.
        if (1usize << args.zone_shift) < alignment {
            return Err(Error::Memory);
        }

        let unit = align_up(args.mfs_unit_size.max(NODE_SIZE), std::mem::align_of::<usize>());
        let extend_by = if args.extend_by == 0 {
            4 * alignment
        } else {
            align_up(args.extend_by, alignment)
        };
        // The range-set pool must not recurse through the arena, so
        // `mfs_extend_self` is pinned off regardless of the args.
        let feed_pages = (args.mfs_extend_by / alignment).max(1);

        Ok(ArenaState {
            alignment,
            zone_shift: args.zone_shift,
            committed: 0,
            commit_limit: args.commit_limit,
            spare_committed: 0,
            spare_commit_limit: args.spare_commit_limit,
            chunks: Vec::new(),
            free_set: RangeSet::new(),
            zone_sets: (0..ZONE_COUNT).map(|_| RangeSet::new()).collect(),
            free_ring: [None; ZONE_COUNT],
            free_zones: ZoneSet::UNIV,
            block_pool: BlockPool::new(unit),
            feed_pages,
            reservoir: Reservoir::new(),
            control: ControlPool::new(extend_by),
            last_tract: None,
            pool_serial: POOL_FIRST_CLIENT,
        })
    }

    // Geometry and accounting, readable by classes and pools.

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn zone_shift(&self) -> u32 {
        self.zone_shift
    }

    pub fn committed(&self) -> usize {
        self.committed
    }

    pub fn commit_limit(&self) -> usize {
        self.commit_limit
    }

    pub fn spare_committed(&self) -> usize {
        self.spare_committed
    }

    pub fn spare_commit_limit(&self) -> usize {
        self.spare_commit_limit
    }

    /// Charges `fresh` bytes against the commit limit.
    pub fn commit_charge(&mut self, fresh: usize) -> Result<()> {
        match self.committed.checked_add(fresh) {
            Some(total) if total <= self.commit_limit => {
                self.committed = total;
                Ok(())
            }
            _ => Err(Error::CommitLimit),
        }
    }

    pub fn commit_release(&mut self, bytes: usize) {
        debug_assert!(bytes <= self.committed);
        self.committed -= bytes;
    }

    pub fn spare_add(&mut self, bytes: usize) {
        self.spare_committed += bytes;
        debug_assert!(self.spare_committed <= self.committed);
    }

    pub fn spare_remove(&mut self, bytes: usize) {
        debug_assert!(bytes <= self.spare_committed);
        self.spare_committed -= bytes;
    }

    // Chunk registry.

    pub fn add_chunk(&mut self, chunk: Chunk) -> usize {
        self.chunks.push(chunk);
        self.chunks.len() - 1
    }

    pub fn chunk(&self, index: usize) -> &Chunk {
        &self.chunks[index]
    }

    pub fn chunk_mut(&mut self, index: usize) -> &mut Chunk {
        &mut self.chunks[index]
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Drops a chunk descriptor.  The class releases the backing
    /// store; indices must no longer cover the chunk.
    pub fn remove_chunk(&mut self, index: usize) -> Chunk {
        self.chunks.remove(index)
    }

    pub fn chunks_reserved(&self) -> usize {
        self.chunks.iter().map(|c| c.reserved()).sum()
    }

    pub fn chunk_index_of(&self, addr: usize) -> Option<usize> {
        self.chunks.iter().position(|c| c.contains(addr))
    }

    pub fn overlaps_chunk(&self, range: Range) -> bool {
        self.chunks
            .iter()
            .any(|c| range.overlaps(Range::new(c.base(), c.limit())))
    }

    // Single-tract free rings.

    fn ring_push(&mut self, base: usize) {
        let z = zone_of(base, self.zone_shift);
        let ci = self
            .chunk_index_of(base)
            .expect("ring pages lie in a chunk");
        let idx = self.chunks[ci].index_of(base);
        let head = self.free_ring[z].unwrap_or(0);

        self.chunks[ci].set_page_word(idx, head);
        self.free_ring[z] = Some(base);
    }

    fn ring_next(&self, base: usize) -> Option<usize> {
        let ci = self.chunk_index_of(base).expect("ring pages lie in a chunk");
        let idx = self.chunks[ci].index_of(base);
        match self.chunks[ci].page_word(idx) {
            0 => None,
            next => Some(next),
        }
    }

    fn ring_pop(&mut self, zone: usize) -> Option<usize> {
        let base = self.free_ring[zone]?;
        self.free_ring[zone] = self.ring_next(base);
        Some(base)
    }

    /// Unlinks a specific page from its zone's ring, if present.
    fn ring_unlink(&mut self, base: usize) -> bool {
        let z = zone_of(base, self.zone_shift);
        let mut prev: Option<usize> = None;
        let mut cur = self.free_ring[z];

        while let Some(c) = cur {
            let next = self.ring_next(c);
            if c == base {
                match prev {
                    None => self.free_ring[z] = next,
                    Some(p) => {
                        let ci = self.chunk_index_of(p).expect("ring pages lie in a chunk");
                        let idx = self.chunks[ci].index_of(p);
                        self.chunks[ci].set_page_word(idx, next.unwrap_or(0));
                    }
                }
                return true;
            }
            prev = cur;
            cur = next;
        }
        false
    }

    fn ring_pages(&self, zone: usize) -> Vec<usize> {
        let mut pages = Vec::new();
        let mut cur = self.free_ring[zone];
        while let Some(c) = cur {
            pages.push(c);
            cur = self.ring_next(c);
        }
        pages
    }

    // Free-index surgery.

    fn set_insert(&mut self, target: IndexId, range: Range) -> Result<()> {
        match target {
            IndexId::Free => self.free_set.insert(&mut self.block_pool, range),
            IndexId::Zone(z) => self.zone_sets[z].insert(&mut self.block_pool, range),
        }
    }

    /// Allocates one page by scanning chunk bitmaps directly,
    /// bypassing every index.  Used to feed the block pool; may not
    /// use the range sets, because it runs while they are wedged.
    /// The primary chunk is favoured: pages allocated this way are
    /// never freed, and must not pin down chunks we may want to
    /// retire.
    fn alloc_page(&mut self, class: &mut dyn ArenaClass, pool: PoolId) -> Result<usize> {
        let mut last = Error::Resource;

        for ci in 0..self.chunks.len() {
            if let Some(idx) = self.chunks[ci].find_free_run(1) {
                match class.pages_mark_allocated(self, ci, idx, 1, pool) {
                    Ok(()) => return Ok(self.chunks[ci].page_base(idx)),
                    Err(e) => last = e,
                }
            }
        }
        Err(last)
    }

    /// Removes one page's range from whichever free index covers it.
    /// Call only with a freshly fed block pool: a split here must not
    /// fail.
    fn exclude_free_range(&mut self, range: Range) {
        if self.ring_unlink(range.base()) {
            return;
        }
        let z = zone_of(range.base(), self.zone_shift);
        if self.zone_sets[z].covers(range) {
            self.zone_sets[z]
                .delete(&mut self.block_pool, range)
                .expect("block pool was just fed");
            return;
        }
        if self.free_set.covers(range) {
            self.free_set
                .delete(&mut self.block_pool, range)
                .expect("block pool was just fed");
        }
        // Otherwise the page was not indexed, e.g. it sits inside a
        // span that is still being inserted.
    }

    /// Feeds the block pool with bootstrap pages and takes those pages
    /// out of the free indices.
    fn bootstrap_feed(&mut self, class: &mut dyn ArenaClass) -> Result<()> {
        for _ in 0..self.feed_pages {
            let page = self.alloc_page(class, POOL_BLOCKS)?;
            unsafe { self.block_pool.extend(page, self.alignment) };
            self.exclude_free_range(Range::from_size(page, self.alignment));
        }
        Ok(())
    }

    /// Inserts into a free index, resolving `Limit` with a bootstrap
    /// page.  The bootstrap page is excluded afterwards, whether it
    /// came from inside `range` (and was just re-indexed by the
    /// insert) or from anywhere else.
    fn index_insert(
        &mut self,
        class: &mut dyn ArenaClass,
        target: IndexId,
        range: Range,
    ) -> Result<()> {
        match self.set_insert(target, range) {
            Err(Error::Limit) => {
                let page = self.alloc_page(class, POOL_BLOCKS)?;
                unsafe { self.block_pool.extend(page, self.alignment) };
                self.set_insert(target, range)
                    .expect("block pool was just fed");
                self.exclude_free_range(Range::from_size(page, self.alignment));
                Ok(())
            }
            other => other,
        }
    }

    // Placement.

    /// Searches the indices for `size` bytes within `zones`: rings
    /// first (single pages), then the per-zone sets, then the global
    /// set restricted to the zones.  Consumes what it returns.
    fn alloc_from_indices(
        &mut self,
        class: &mut dyn ArenaClass,
        zones: ZoneSet,
        size: usize,
        high: bool,
    ) -> Result<(Range, Origin)> {
        if size == self.alignment {
            for z in 0..ZONE_COUNT {
                if zones.is_member(z) {
                    if let Some(base) = self.ring_pop(z) {
                        return Ok((Range::from_size(base, size), Origin::Ring));
                    }
                }
            }
        }

        for z in 0..ZONE_COUNT {
            if zones.is_member(z) {
                if let Some((chosen, _)) =
                    self.zone_sets[z].find_first(&mut self.block_pool, size, high)
                {
                    return Ok((chosen, Origin::Zone(z)));
                }
            }
        }

        let hit = loop {
            match self
                .free_set
                .find_in_zones(&mut self.block_pool, size, zones, self.zone_shift, high)
            {
                Ok(hit) => break hit,
                Err(Error::Limit) => self.bootstrap_feed(class)?,
                Err(e) => return Err(e),
            }
        };
        let (chosen, whole) = match hit {
            Some(found) => found,
            None => return Err(Error::Resource),
        };

        // Move the sub-zone tail, up to the next stripe boundary, into
        // its zone's set, so later same-zone allocations skip the
        // global search.
        let stripe = 1usize << self.zone_shift;
        let tail = if high {
            let tail_base = whole.base().max(align_down(chosen.base(), stripe));
            Range::new(tail_base, chosen.base())
        } else {
            let tail_limit = whole.limit().min(align_up(chosen.limit(), stripe));
            Range::new(chosen.limit(), tail_limit)
        };

        let mut tail_moved = None;
        if !tail.is_empty() {
            // The tail is the end of a remainder node, so this delete
            // never splits.
            self.free_set
                .delete(&mut self.block_pool, tail)
                .expect("trimming a range end never needs a new node");
            let z = zone_of(tail.base(), self.zone_shift);
            match self.index_insert(class, IndexId::Zone(z), tail) {
                Ok(()) => tail_moved = Some((tail, z)),
                Err(_) => {
                    // Couldn't index the tail in its zone; put it back
                    // where it came from.
                    self.free_set
                        .insert(&mut self.block_pool, tail)
                        .expect("the tail abuts its old neighbour");
                }
            }
        }

        Ok((chosen, Origin::Free { tail_moved }))
    }

    /// Returns a chosen range to the index it came from after a failed
    /// commit, pulling back any tail that was moved so the origin node
    /// is restored whole.
    fn rollback_chosen(&mut self, class: &mut dyn ArenaClass, chosen: Range, origin: Origin) {
        let restored = match origin {
            Origin::Ring => {
                self.ring_push(chosen.base());
                Ok(())
            }
            Origin::Zone(z) => self.index_insert(class, IndexId::Zone(z), chosen),
            Origin::Free { tail_moved } => {
                let mut whole = chosen;
                if let Some((tail, z)) = tail_moved {
                    let pulled = loop {
                        match self.zone_sets[z].delete(&mut self.block_pool, tail) {
                            Ok(()) => break true,
                            Err(Error::Limit) => {
                                if self.bootstrap_feed(class).is_err() {
                                    break false;
                                }
                            }
                            Err(_) => break false,
                        }
                    };
                    if pulled {
                        whole = if tail.limit() == chosen.base() {
                            Range::new(tail.base(), chosen.limit())
                        } else {
                            Range::new(chosen.base(), tail.limit())
                        };
                    }
                }
                self.index_insert(class, IndexId::Free, whole)
            }
        };

        if restored.is_err() {
            // Acknowledged leak: the address space stays reserved but
            // unindexed.  The indices themselves remain consistent.
            log::warn!(
                target: "plat",
                "rollback could not reindex {:?}; address space leaked",
                chosen
            );
        }
    }

    /// One full attempt: search the indices in `zones`, then commit
    /// through the class.  On commit failure the range goes back where
    /// it came from.
    fn alloc_area(
        &mut self,
        class: &mut dyn ArenaClass,
        zones: ZoneSet,
        size: usize,
        high: bool,
        pool: PoolId,
    ) -> Result<usize> {
        let (chosen, origin) = self.alloc_from_indices(class, zones, size, high)?;

        let ci = self
            .chunk_index_of(chosen.base())
            .expect("free ranges lie in a chunk");
        // Free-index ranges never span chunks: chunk metadata prefixes
        // keep the spans apart.
        debug_assert!(Range::new(self.chunks[ci].base(), self.chunks[ci].limit()).nests(chosen));
        let base_index = self.chunks[ci].index_of(chosen.base());
        let count = self.chunks[ci].size_to_pages(chosen.size());

        match class.pages_mark_allocated(self, ci, base_index, count, pool) {
            Ok(()) => {
                self.free_zones = self
                    .free_zones
                    .diff(ZoneSet::of_range(chosen, self.zone_shift));
                Ok(chosen.base())
            }
            Err(e) => {
                self.rollback_chosen(class, chosen, origin);
                Err(e)
            }
        }
    }

    /// The placement policy: the decisions about where to allocate
    /// live here and nowhere else.
    fn alloc_policy(
        &mut self,
        class: &mut dyn ArenaClass,
        pref: &Placement,
        size: usize,
        pool: PoolId,
    ) -> Result<usize> {
        // Don't attempt to allocate if doing so would definitely
        // exceed the commit limit.
        if self.spare_committed < size {
            let need = size - self.spare_committed;
            match self.committed.checked_add(need) {
                Some(total) if total <= self.commit_limit => {}
                _ => return Err(Error::CommitLimit),
            }
        }

        let mut last = Error::Resource;

        // Plan A: the requested zones.
        let zones = pref.zones;
        if !zones.is_empty() {
            match self.alloc_area(class, zones, size, pref.high, pool) {
                Ok(base) => return Ok(base),
                Err(e) => last = e,
            }
        }

        // Plan B: widen to free zones that aren't blacklisted.
        let more = zones.union(self.free_zones.diff(pref.avoid));
        if more != zones {
            match self.alloc_area(class, more, size, pref.high, pool) {
                Ok(base) => return Ok(base),
                Err(e) => last = e,
            }
        }

        // Plan C: grow the arena, then try A and B again.
        if !more.is_empty() {
            match class.grow(self, pref, size) {
                Ok(ci) => {
                    class.chunk_init(self, ci);
                    let span = self.chunks[ci].alloc_range();
                    if self.index_insert(class, IndexId::Free, span).is_ok() {
                        if !zones.is_empty() {
                            if let Ok(base) = self.alloc_area(class, zones, size, pref.high, pool) {
                                return Ok(base);
                            }
                        }
                        let more = zones.union(self.free_zones.diff(pref.avoid));
                        if more != zones {
                            match self.alloc_area(class, more, size, pref.high, pool) {
                                Ok(base) => return Ok(base),
                                Err(e) => last = e,
                            }
                        }
                    }
                }
                Err(_) => {} // fall through to Plan D
            }
        }

        // Plan D: every zone that isn't blacklisted.  This can mix
        // pools that wanted separation, slowing collection down.
        let even = more.union(ZoneSet::UNIV.diff(pref.avoid));
        if even != more {
            match self.alloc_area(class, even, size, pref.high, pool) {
                Ok(base) => return Ok(base),
                Err(e) => last = e,
            }
        }

        // Last resort: anywhere, blacklist included.  Retention from
        // ambiguous pointers into avoided zones is the accepted cost.
        match self.alloc_area(class, ZoneSet::UNIV, size, pref.high, pool) {
            Ok(base) => Ok(base),
            Err(e) => {
                last = e;
                Err(last)
            }
        }
    }

    /// The free path proper: index the range, self-healing a dry block
    /// pool by donating the first freed page to it, then release the
    /// backing store through the class.
    fn free_inner(&mut self, class: &mut dyn ArenaClass, base: usize, size: usize, pool: PoolId) {
        #[cfg(debug_assertions)]
        {
            let ci = self.chunk_index_of(base).expect("freed range lies in a chunk");
            let chunk = &self.chunks[ci];
            assert!(base + size <= chunk.limit(), "freed range crosses a chunk");
            let first = chunk.index_of(base);
            for i in first..first + size / self.alignment {
                assert_eq!(chunk.page_pool(i), Some(pool), "freed range not owned by pool");
            }
        }

        let mut base = base;
        let mut size = size;
        let stripe = 1usize << self.zone_shift;

        loop {
            if size == self.alignment {
                // Single tracts go on their zone's free ring; the ring
                // link lives in the page word, which survives the
                // class's clear.
                self.ring_push(base);
                break;
            }

            let range = Range::from_size(base, size);
            let single_stripe =
                align_down(base, stripe) == align_down(base + size - 1, stripe);
            let target = if single_stripe {
                IndexId::Zone(zone_of(base, self.zone_shift))
            } else {
                // Multi-zone frees go straight to the global set.
                IndexId::Free
            };

            match self.set_insert(target, range) {
                Ok(()) => break,
                Err(Error::Limit) => {
                    // The pool can't describe the free range.  Donate
                    // the first page of the range itself: re-own it as
                    // block storage and retry with the remainder.
                    let ci = self
                        .chunk_index_of(base)
                        .expect("freed range lies in a chunk");
                    let idx = self.chunks[ci].index_of(base);
                    self.chunks[ci].repool_pages(idx, 1, POOL_BLOCKS);
                    unsafe { self.block_pool.extend(base, self.alignment) };

                    base += self.alignment;
                    size -= self.alignment;
                    if size == 0 {
                        // The whole range became block storage; there
                        // is nothing left to release.
                        return;
                    }
                }
                Err(_) => unreachable!("range-set insert only fails with Limit"),
            }
        }

        class.free(self, base, size, pool);
        debug_assert!(self.spare_committed <= self.spare_commit_limit);
    }

    // Reservoir plumbing that needs page-table access.

    fn reservoir_is_full(&self) -> bool {
        self.reservoir.is_full()
    }

    fn reservoir_deficit(&self) -> usize {
        self.reservoir.deficit()
    }

    fn reservoir_note_fill(&mut self, range: Range) {
        self.reservoir.add(range);
    }

    fn repool_range(&mut self, range: Range, pool: PoolId) {
        let ci = self
            .chunk_index_of(range.base())
            .expect("reservoir ranges lie in a chunk");
        let idx = self.chunks[ci].index_of(range.base());
        let count = self.chunks[ci].size_to_pages(range.size());
        self.chunks[ci].repool_pages(idx, count, pool);
    }

    /// Deposits a prefix of a freed range, capped at the reservoir's
    /// deficit.  Returns the deposited size.
    fn reservoir_accept(&mut self, range: Range) -> usize {
        let take = self.reservoir.accept(range, self.alignment);
        if take > 0 {
            self.repool_range(Range::from_size(range.base(), take), POOL_RESERVOIR);
        }
        take
    }

    fn reservoir_withdraw(&mut self, size: usize, pool: PoolId) -> Option<usize> {
        let r = self.reservoir.withdraw(size)?;
        self.repool_range(r, pool);
        Some(r.base())
    }

    // Tract queries.

    fn tract_of(&self, addr: usize) -> Option<Tract> {
        let ci = self.chunk_index_of(addr)?;
        let chunk = &self.chunks[ci];
        let idx = chunk.index_of(addr);
        if idx < chunk.alloc_base() {
            return None;
        }
        chunk.tract_at(idx)
    }

    fn cache_tract(&mut self, base: usize) {
        self.last_tract = self.tract_of(base);
        debug_assert!(self.last_tract.is_some());
    }

    fn uncache_tract_if_intersects(&mut self, range: Range) {
        if let Some(t) = self.last_tract {
            if range.contains(t.base()) {
                self.last_tract = None;
            }
        }
    }

    /// Lowest allocated tract with base strictly above `addr`.
    fn next_tract(&self, addr: usize) -> Option<Tract> {
        let mut best: Option<Tract> = None;

        for chunk in &self.chunks {
            if chunk.limit() <= addr {
                continue;
            }
            let start = if addr < chunk.base() {
                chunk.alloc_base()
            } else {
                chunk.index_of(addr) + 1
            };
            if let Some(i) = chunk.next_allocated(start) {
                let t = chunk.tract_at(i).expect("next_allocated said so");
                if best.map(|b| t.base() < b.base()).unwrap_or(true) {
                    best = Some(t);
                }
            }
        }
        best
    }

    fn first_tract(&self) -> Option<Tract> {
        self.next_tract(0)
    }

    /// Removes every free-index entry within `span` (chunk retirement:
    /// free-index ranges never cross chunks, so all deletes are
    /// whole-node).
    fn evict_span(&mut self, span: Range) {
        for z in 0..ZONE_COUNT {
            for page in self.ring_pages(z) {
                if span.contains(page) {
                    self.ring_unlink(page);
                }
            }
            let victims: Vec<Range> = self.zone_sets[z]
                .ranges()
                .into_iter()
                .filter(|r| span.nests(*r))
                .collect();
            for r in victims {
                self.zone_sets[z]
                    .delete(&mut self.block_pool, r)
                    .expect("whole-node delete");
            }
        }
        let victims: Vec<Range> = self
            .free_set
            .ranges()
            .into_iter()
            .filter(|r| span.nests(*r))
            .collect();
        for r in victims {
            self.free_set
                .delete(&mut self.block_pool, r)
                .expect("whole-node delete");
        }
    }

    /// Retires every non-primary chunk with no live tracts.  Classes
    /// call this from `compact`; the chunk-finish hook releases the
    /// backing store.  Returns the number of chunks retired.
    pub fn sweep_empty_chunks(&mut self, class: &mut dyn ArenaClass) -> usize {
        let mut retired = 0;

        for ci in (1..self.chunks.len()).rev() {
            if !self.chunks[ci].fully_free() {
                continue;
            }
            let span = self.chunks[ci].alloc_range();
            self.evict_span(span);
            class.chunk_finish(self, ci);
            self.chunks.remove(ci);
            retired += 1;
        }
        retired
    }

    /// Walks every invariant the arena promises: the disjoint cover of
    /// each chunk, range-set structure, zone confinement, and commit
    /// accounting.
    pub fn check_rep(&self) {
        assert!(self.spare_committed <= self.committed);
        assert!(self.committed <= self.commit_limit);
        assert!(self.alignment >= sys::page_size());
        assert!((1usize << self.zone_shift) >= self.alignment);

        self.free_set.check_rep();
        for z in 0..ZONE_COUNT {
            self.zone_sets[z].check_rep();
            for r in self.zone_sets[z].ranges() {
                // Zone confinement: within one stripe of zone z.
                assert_eq!(zone_of(r.base(), self.zone_shift), z);
                assert_eq!(zone_of(r.limit() - 1, self.zone_shift), z);
                let stripe = 1usize << self.zone_shift;
                assert_eq!(
                    align_down(r.base(), stripe),
                    align_down(r.limit() - 1, stripe),
                    "zone-set range crosses a stripe"
                );
            }
        }

        // Ring pages are single free pages in their zone.
        let mut ring_pages = Vec::new();
        for z in 0..ZONE_COUNT {
            for page in self.ring_pages(z) {
                assert_eq!(zone_of(page, self.zone_shift), z);
                ring_pages.push(page);
            }
        }

        for chunk in &self.chunks {
            chunk.check_rep();

            // Disjoint cover: every allocatable page is in exactly one
            // of the bitmap, the global set, its zone's set, or a ring.
            for i in chunk.alloc_base()..chunk.pages() {
                let base = chunk.page_base(i);
                let page = Range::from_size(base, chunk.page_size());
                let z = zone_of(base, self.zone_shift);

                let mut owners = 0;
                if chunk.allocated(i) {
                    owners += 1;
                }
                if self.free_set.covers(page) {
                    owners += 1;
                }
                if self.zone_sets[z].covers(page) {
                    owners += 1;
                }
                if ring_pages.contains(&base) {
                    owners += 1;
                }
                assert_eq!(owners, 1, "page {:#x} has {} owners", base, owners);
            }
        }

        // A zone marked free has no placement-allocated ranges.
        for chunk in &self.chunks {
            for i in chunk.alloc_base()..chunk.pages() {
                if let Some(pool) = chunk.page_pool(i) {
                    if pool == POOL_BLOCKS {
                        continue; // bootstrap pages bypass the policy
                    }
                    let z = zone_of(chunk.page_base(i), self.zone_shift);
                    assert!(
                        !self.free_zones.is_member(z),
                        "zone {} is marked free but has allocations",
                        z
                    );
                }
            }
        }

        if let Some(t) = self.last_tract {
            let current = self.tract_of(t.base());
            assert_eq!(current, Some(t), "stale last-tract cache");
        }
    }

    fn make_pool(&mut self) -> PoolId {
        let id = PoolId::from_serial(self.pool_serial);
        self.pool_serial += 1;
        id
    }

    fn finish_indices(&mut self) {
        let ArenaState {
            zone_sets,
            free_set,
            block_pool,
            free_ring,
            ..
        } = self;
        for set in zone_sets.iter_mut() {
            set.finish(block_pool);
        }
        free_set.finish(block_pool);
        *free_ring = [None; ZONE_COUNT];
    }
}

impl std::fmt::Debug for ArenaState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ArenaState")
            .field("alignment", &self.alignment)
            .field("zone_shift", &self.zone_shift)
            .field("committed", &self.committed)
            .field("chunks", &self.chunks.len())
            .finish()
    }
}

/// An address-space arena: reserved regions subdivided into tracts and
/// served to pools under the zone-aware placement policy.
pub struct Arena {
    class: Box<dyn ArenaClass>,
    state: ArenaState,
    dead: bool,
}

impl Arena {
    /// Builds an arena over `class` with the given options.
    ///
    /// # Errors
    ///
    /// `Memory` for inconsistent configuration, or whatever the class
    /// reports when it cannot reserve the primary chunk.
    pub fn create(mut class: Box<dyn ArenaClass>, args: &ArenaArgs) -> Result<Arena> {
        let mut args = args.clone();
        class.normalize(&mut args);
        if !args.check() {
            return Err(Error::Memory);
        }

        let mut state = ArenaState::new(&args)?;
        class.init(&mut state, &args)?;

        if state.chunk_count() == 0 {
            class.finish(&mut state);
            return Err(Error::Memory);
        }
        class.chunk_init(&mut state, 0);

        // With the primary chunk in place, its free span seeds the
        // global index.  The very first insert bootstraps the block
        // pool from the chunk's own pages.
        let span = state.chunk(0).alloc_range();
        if let Err(e) = state.index_insert(class.as_mut(), IndexId::Free, span) {
            class.finish(&mut state);
            return Err(e);
        }

        Ok(Arena {
            class,
            state,
            dead: false,
        })
    }

    /// Tears the arena down: empties the reservoir, returns control
    /// spans, releases the indices, and lets the class drop its
    /// chunks.  Dropping the arena does the same.
    pub fn destroy(mut self) {
        self.finish_inner();
    }

    fn finish_inner(&mut self) {
        if self.dead {
            return;
        }
        self.dead = true;

        self.set_reservoir_limit(0);
        for span in self.state.control.drain_spans() {
            self.free(span.base(), span.size(), POOL_CONTROL);
        }

        let Arena { class, state, .. } = self;
        state.finish_indices();
        class.finish(state);
    }

    /// A fresh pool identity for a client of this arena.
    pub fn make_pool(&mut self) -> PoolId {
        self.state.make_pool()
    }

    pub fn alignment(&self) -> usize {
        self.state.alignment()
    }

    pub fn zone_shift(&self) -> u32 {
        self.state.zone_shift()
    }

    /// Total address space across all chunks.
    pub fn reserved(&self) -> usize {
        self.class.reserved(&self.state)
    }

    pub fn committed(&self) -> usize {
        self.state.committed()
    }

    pub fn spare_committed(&self) -> usize {
        self.state.spare_committed()
    }

    pub fn commit_limit(&self) -> usize {
        self.state.commit_limit()
    }

    pub fn spare_commit_limit(&self) -> usize {
        self.state.spare_commit_limit()
    }

    /// Memory the arena can still hand out without growing.
    pub fn available(&self) -> usize {
        let ceiling = self.reserved().min(self.state.commit_limit());
        ceiling - self.state.committed() + self.state.spare_committed()
    }

    /// Lowers or raises the commit ceiling.  Lowering below live
    /// commitment purges spare memory first and fails with `Fail` if
    /// that isn't enough.
    pub fn set_commit_limit(&mut self, limit: usize) -> Result<()> {
        let Arena { class, state, .. } = self;
        let committed = state.committed();

        let res = if limit < committed {
            if limit >= committed - state.spare_committed() {
                let excess = committed - limit;
                let _ = class.purge_spare(state, excess);
                debug_assert!(state.committed() <= limit);
                state.commit_limit = limit;
                Ok(())
            } else {
                Err(Error::Fail)
            }
        } else {
            state.commit_limit = limit;
            Ok(())
        };

        log::debug!(target: "plat", "CommitLimitSet limit={} ok={}", limit, res.is_ok());
        res
    }

    /// Caps retained spare memory, purging anything above the new cap.
    pub fn set_spare_commit_limit(&mut self, limit: usize) {
        let Arena { class, state, .. } = self;
        state.spare_commit_limit = limit;
        if state.spare_committed() > limit {
            let excess = state.spare_committed() - limit;
            let _ = class.purge_spare(state, excess);
        }
        log::debug!(target: "plat", "SpareCommitLimitSet limit={}", limit);
    }

    /// Resizes the reservoir.  Shrinking frees the excess back to the
    /// arena.
    pub fn set_reservoir_limit(&mut self, limit: usize) {
        self.state.reservoir.set_limit(limit);
        for r in self.state.reservoir.drain_to_limit() {
            self.free(r.base(), r.size(), POOL_RESERVOIR);
        }
    }

    pub fn reservoir_limit(&self) -> usize {
        self.state.reservoir.limit()
    }

    fn reservoir_ensure_full(&mut self) -> Result<()> {
        let grain = self.state.alignment();
        while self.state.reservoir_deficit() >= grain {
            let base = self.alloc(&Placement::default(), grain, POOL_RESERVOIR, false)?;
            self.state.reservoir_note_fill(Range::from_size(base, grain));
        }
        Ok(())
    }

    /// Allocates `size` bytes of tracts for `pool` under `pref`.
    ///
    /// Atomic: on failure the arena is unchanged.  With
    /// `reservoir_permit`, a failed placement may be served from the
    /// reservoir instead.
    ///
    /// # Errors
    ///
    /// `CommitLimit` when the commit gate rejects the request before
    /// anything is disturbed; `Resource` when every plan and the last
    /// resort come up empty.
    #[requires(size > 0)]
    #[requires(size % self.state.alignment() == 0)]
    pub fn alloc(
        &mut self,
        pref: &Placement,
        size: usize,
        pool: PoolId,
        reservoir_permit: bool,
    ) -> Result<usize> {
        // Keep the reservoir topped up before ordinary allocations.
        if pool != POOL_RESERVOIR {
            if let Err(e) = self.reservoir_ensure_full() {
                debug_assert!(e.is_alloc_failure());
                if !reservoir_permit {
                    log::debug!(target: "plat", "ArenaAllocFail size={} pool={}", size, pool.id());
                    return Err(e);
                }
            }
        }

        let placed = {
            let Arena { class, state, .. } = self;
            state.alloc_policy(class.as_mut(), pref, size, pool)
        };

        let base = match placed {
            Ok(base) => base,
            Err(e) => {
                let withdrawn = if reservoir_permit {
                    self.state.reservoir_withdraw(size, pool)
                } else {
                    None
                };
                match withdrawn {
                    Some(base) => base,
                    None => {
                        log::debug!(target: "plat", "ArenaAllocFail size={} pool={}", size, pool.id());
                        return Err(e);
                    }
                }
            }
        };

        self.state.cache_tract(base);
        log::debug!(target: "plat", "ArenaAlloc base={:#x} size={} pool={}", base, size, pool.id());
        Ok(base)
    }

    /// Returns `[base, base + size)`, which must belong to `pool`, to
    /// the arena.  Never fails: a wedged block pool is healed by
    /// donating part of the freed range itself.
    #[requires(size > 0)]
    #[requires(base % self.state.alignment() == 0)]
    #[requires(size % self.state.alignment() == 0)]
    pub fn free(&mut self, base: usize, size: usize, pool: PoolId) {
        let whole = Range::from_size(base, size);
        self.state.uncache_tract_if_intersects(whole);

        let mut base = base;
        let mut size = size;

        // An under-full reservoir takes a cut first, up to its
        // deficit.
        if pool != POOL_RESERVOIR && !self.state.reservoir_is_full() {
            let taken = self.state.reservoir_accept(Range::from_size(base, size));
            base += taken;
            size -= taken;
        }

        if size > 0 {
            let Arena { class, state, .. } = self;
            state.free_inner(class.as_mut(), base, size, pool);
        }

        log::debug!(
            target: "plat",
            "ArenaFree base={:#x} size={}",
            whole.base(),
            whole.size()
        );
    }

    /// Adds a client-supplied chunk (class permitting) and indexes its
    /// free span.
    pub fn extend(&mut self, base: usize, size: usize) -> Result<()> {
        let Arena { class, state, .. } = self;
        let ci = class.extend(state, base, size)?;
        class.chunk_init(state, ci);

        let span = state.chunk(ci).alloc_range();
        state.index_insert(class.as_mut(), IndexId::Free, span)?;

        log::debug!(target: "plat", "ArenaExtend base={:#x} size={}", base, size);
        Ok(())
    }

    /// Lets the class shrink the arena after a reclaim pass.
    pub fn compact(&mut self) {
        let Arena { class, state, .. } = self;
        class.compact(state);
    }

    /// True iff `addr` lies in a tract allocated to some pool.
    pub fn has_addr(&self, addr: usize) -> bool {
        self.state.tract_of(addr).is_some()
    }

    /// The base of the allocated tract containing `addr`.
    ///
    /// # Errors
    ///
    /// `Fail` when `addr` is not inside any allocated tract.
    pub fn addr_object(&self, addr: usize) -> Result<usize> {
        self.state.tract_of(addr).map(|t| t.base()).ok_or(Error::Fail)
    }

    /// The tract containing `addr`, if allocated.
    pub fn tract_of(&self, addr: usize) -> Option<Tract> {
        self.state.tract_of(addr)
    }

    /// The pool-opaque word of the tract at `base`.
    pub fn tract_word(&self, base: usize) -> Option<usize> {
        let ci = self.state.chunk_index_of(base)?;
        let chunk = self.state.chunk(ci);
        let idx = chunk.index_of(base);
        chunk.page_pool(idx)?;
        Some(chunk.page_word(idx))
    }

    /// Sets the pool-opaque word of the tract at `base`; false if no
    /// such tract.
    pub fn set_tract_word(&mut self, base: usize, word: usize) -> bool {
        let ci = match self.state.chunk_index_of(base) {
            Some(ci) => ci,
            None => return false,
        };
        let idx = self.state.chunk(ci).index_of(base);
        if self.state.chunk(ci).page_pool(idx).is_none() {
            return false;
        }
        self.state.chunk_mut(ci).set_page_word(idx, word);
        true
    }

    /// Lowest allocated tract, by address.
    pub fn first_tract(&self) -> Option<Tract> {
        self.state.first_tract()
    }

    /// Lowest allocated tract above `addr`.
    pub fn next_tract(&self, addr: usize) -> Option<Tract> {
        self.state.next_tract(addr)
    }

    /// Allocates a small block from the embedded control pool.
    pub fn control_alloc(&mut self, size: usize, reservoir_permit: bool) -> Result<usize> {
        let size = align_up(size.max(1), std::mem::align_of::<usize>());
        if let Some(base) = self.state.control.take(size) {
            return Ok(base);
        }

        let span_size = align_up(
            size.max(self.state.control.extend_by()),
            self.state.alignment(),
        );
        let base = self.alloc(
            &Placement::default(),
            span_size,
            POOL_CONTROL,
            reservoir_permit,
        )?;
        self.state.control.add_span(Range::from_size(base, span_size));
        Ok(self.state.control.take(size).expect("span was just added"))
    }

    /// Frees a block from `control_alloc`.  Fully-free spans flow back
    /// to the arena.
    pub fn control_free(&mut self, base: usize, size: usize) {
        let size = align_up(size.max(1), std::mem::align_of::<usize>());
        self.state.control.give(Range::from_size(base, size));
        for span in self.state.control.reclaim() {
            self.free(span.base(), span.size(), POOL_CONTROL);
        }
    }

    /// Writes the arena's vital signs to `out`.
    pub fn describe(&self, out: &mut dyn std::fmt::Write) -> std::fmt::Result {
        writeln!(out, "Arena {{")?;
        writeln!(
            out,
            "  reserved         {}  <-- total size of address-space reserved",
            self.reserved()
        )?;
        writeln!(
            out,
            "  committed        {}  <-- total bytes currently charged",
            self.state.committed()
        )?;
        writeln!(out, "  commitLimit      {}", self.state.commit_limit())?;
        writeln!(out, "  spareCommitted   {}", self.state.spare_committed())?;
        writeln!(out, "  spareCommitLimit {}", self.state.spare_commit_limit())?;
        writeln!(out, "  zoneShift {}", self.state.zone_shift())?;
        writeln!(out, "  alignment {}", self.state.alignment())?;
        self.class.describe(&self.state, out)?;
        writeln!(out, "}} Arena")
    }

    /// Writes the tract map: every allocated tract in address order,
    /// with gap lines between them.
    pub fn describe_tracts(&self, out: &mut dyn std::fmt::Write) -> std::fmt::Result {
        let mut cursor = self.state.first_tract();
        let mut old_limit = cursor.map(|t| t.base()).unwrap_or(0);

        while let Some(t) = cursor {
            if t.base() > old_limit {
                writeln!(
                    out,
                    "[{:#x}, {:#x}) {} ---",
                    old_limit,
                    t.base(),
                    t.base() - old_limit
                )?;
            }
            writeln!(
                out,
                "[{:#x}, {:#x}) {} pool {}",
                t.base(),
                t.limit(),
                t.limit() - t.base(),
                t.pool().id()
            )?;
            old_limit = t.limit();
            cursor = self.state.next_tract(t.base());
        }
        Ok(())
    }

    /// Asserts every arena invariant.  Expensive; meant for tests and
    /// debugging sessions.
    pub fn check_rep(&self) {
        self.state.check_rep();
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &ArenaState {
        &self.state
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.finish_inner();
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("class", &self.class)
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientArena;
    use proptest::collection::vec;
    use proptest::prelude::*;

    fn page() -> usize {
        sys::page_size().max(4096)
    }

    /// A client arena over `pages` pages, with `stripe_pages` pages
    /// per zone stripe.  The backing memory leaks; tests never return
    /// it to the OS.
    fn test_arena(pages: usize, stripe_pages: usize) -> Arena {
        let align = page();
        let bytes = pages * align + align;
        let mem = Box::leak(vec![0u8; bytes].into_boxed_slice());
        let args = ArenaArgs {
            alignment: align,
            zone_shift: align.trailing_zeros() + stripe_pages.trailing_zeros(),
            ..Default::default()
        };
        let class = unsafe { ClientArena::new(mem.as_mut_ptr(), bytes) };
        Arena::create(Box::new(class), &args).expect("arena should build")
    }

    /// Committed bytes, free bytes across every index, and the free
    /// zone set: the state the round-trip property compares.
    fn free_snapshot(arena: &Arena) -> (usize, usize, usize, ZoneSet) {
        let state = arena.state();
        let mut free = state.free_set.size();
        let mut rings = 0;
        for z in 0..ZONE_COUNT {
            free += state.zone_sets[z].size();
            rings += state.ring_pages(z).len();
        }
        (
            state.committed(),
            free + rings * state.alignment(),
            state.spare_committed(),
            state.free_zones,
        )
    }

    /// Every index range plus ring page, for exact state comparisons.
    fn index_snapshot(arena: &Arena) -> (Vec<Range>, Vec<Vec<Range>>, Vec<Vec<usize>>) {
        let state = arena.state();
        (
            state.free_set.ranges(),
            (0..ZONE_COUNT).map(|z| state.zone_sets[z].ranges()).collect(),
            (0..ZONE_COUNT).map(|z| state.ring_pages(z)).collect(),
        )
    }

    fn lowest_free_zone(arena: &Arena) -> usize {
        arena
            .state()
            .free_set
            .ranges()
            .first()
            .map(|r| zone_of(r.base(), arena.zone_shift()))
            .unwrap_or(0)
    }

    #[test]
    fn create_check_destroy() {
        let arena = test_arena(64, 4);

        arena.check_rep();
        assert!(arena.reserved() >= 64 * page());
        // Metadata and the bootstrap page are already charged.
        assert!(arena.committed() >= 2 * page());

        let mut out = String::new();
        arena.describe(&mut out).expect("describe should write");
        assert!(out.contains("Arena {"));
        assert!(out.contains("committed"));

        arena.destroy();
    }

    // Scenario: allocation lands in the preferred zone.
    #[test]
    fn alloc_honours_zone_preference() {
        let mut arena = test_arena(4096, 256);
        let pool = arena.make_pool();
        let z0 = lowest_free_zone(&arena);

        let base = arena
            .alloc(&Placement::in_zones(ZoneSet::single(z0)), page(), pool, false)
            .expect("zone has space");
        assert_eq!(zone_of(base, arena.zone_shift()), z0);
        assert!(arena.committed() >= page());
        arena.check_rep();

        // The memory is real: write through it.
        unsafe { std::ptr::write_bytes(base as *mut u8, 42, page()) };
    }

    // Scenario: once the preferred zone is exhausted, Plan B widens to
    // another free zone instead of failing.
    #[test]
    fn plan_b_widens_after_zone_exhaustion() {
        let mut arena = test_arena(64, 4);
        let pool = arena.make_pool();
        let z0 = lowest_free_zone(&arena);
        let pref = Placement::in_zones(ZoneSet::single(z0));

        let mut widened = None;
        for _ in 0..70 {
            let base = arena.alloc(&pref, page(), pool, false).expect("space remains");
            arena.check_rep();
            if zone_of(base, arena.zone_shift()) != z0 {
                widened = Some(base);
                break;
            }
        }

        let base = widened.expect("zone 0 must run out before the arena does");
        assert_ne!(zone_of(base, arena.zone_shift()), z0);
    }

    // Scenario: the commit gate fails before any index is disturbed.
    #[test]
    fn commit_limit_failure_is_atomic() {
        let mut arena = test_arena(64, 4);
        let pool = arena.make_pool();

        arena
            .alloc(&Placement::default(), page(), pool, false)
            .expect("should allocate");

        arena
            .set_commit_limit(arena.committed() + 2 * page())
            .expect("raising above committed always works");
        let before = free_snapshot(&arena);
        let indices = index_snapshot(&arena);

        assert_eq!(
            arena.alloc(&Placement::default(), 4 * page(), pool, false).err(),
            Some(Error::CommitLimit)
        );
        assert_eq!(free_snapshot(&arena), before);
        assert_eq!(index_snapshot(&arena), indices);
        arena.check_rep();
    }

    // Scenario: free then alloc of a single page reuses the same base
    // through the zone's free ring.
    #[test]
    fn single_page_free_reuses_the_ring() {
        let mut arena = test_arena(64, 4);
        let pool = arena.make_pool();
        let z0 = lowest_free_zone(&arena);
        let pref = Placement::in_zones(ZoneSet::single(z0));

        let base = arena.alloc(&pref, page(), pool, false).expect("space");
        arena.free(base, page(), pool);

        // The freed page sits on the ring, not in a range set.
        let z = zone_of(base, arena.zone_shift());
        assert!(arena.state().ring_pages(z).contains(&base));
        arena.check_rep();

        let again = arena.alloc(&pref, page(), pool, false).expect("space");
        assert_eq!(again, base);
        arena.check_rep();
    }

    // Scenario: fragmentation forces the block pool past its first
    // bootstrap page; the caller only ever observes success.
    #[test]
    fn block_pool_feeds_itself_transparently() {
        let mut arena = test_arena(1024, 4);
        let pool = arena.make_pool();
        let first_feed = arena.state().block_pool.total_blocks();

        let mut blocks = Vec::new();
        for _ in 0..300 {
            match arena.alloc(&Placement::default(), 2 * page(), pool, false) {
                Ok(base) => blocks.push(base),
                Err(_) => break,
            }
        }
        assert!(blocks.len() >= 250, "arena should hold most of these");

        // Freeing every other block creates hundreds of disjoint free
        // ranges: more nodes than one bootstrap page holds.
        for pair in blocks.chunks(2) {
            arena.free(pair[0], 2 * page(), pool);
        }
        arena.check_rep();
        assert!(
            arena.state().block_pool.total_blocks() > first_feed,
            "the block pool must have grown"
        );

        for pair in blocks.chunks(2) {
            if pair.len() == 2 {
                arena.free(pair[1], 2 * page(), pool);
            }
        }
        arena.check_rep();
    }

    // Scenario: a freed range crossing a zone boundary reappears in
    // the global set, and reallocation finds it at the same base.
    #[test]
    fn cross_zone_free_goes_to_the_global_set() {
        let mut arena = test_arena(64, 4);
        let pool = arena.make_pool();
        let size = 8 * page(); // two whole stripes: always crosses

        let base = arena
            .alloc(&Placement::default(), size, pool, false)
            .expect("space");
        arena.free(base, size, pool);

        let range = Range::from_size(base, size);
        assert!(arena.state().free_set.covers(range));
        for z in 0..ZONE_COUNT {
            assert!(!arena.state().zone_sets[z].covers(range));
        }

        let again = arena
            .alloc(&Placement::in_zones(ZoneSet::UNIV), size, pool, false)
            .expect("space");
        assert_eq!(again, base);
        arena.check_rep();
    }

    // Alloc/free round trip is a fixed point: the second cycle changes
    // nothing, and the first differs at most by bootstrap-page slack.
    #[test]
    fn alloc_free_round_trip_is_a_fixed_point() {
        let mut arena = test_arena(256, 4);
        let pool = arena.make_pool();
        let pref = Placement::in_zones(ZoneSet::UNIV);
        let initial = free_snapshot(&arena);

        for &size in &[page(), 3 * page(), 16 * page()] {
            let base = arena.alloc(&pref, size, pool, false).expect("space");
            arena.free(base, size, pool);
            let s1 = free_snapshot(&arena);

            let again = arena.alloc(&pref, size, pool, false).expect("space");
            assert_eq!(again, base, "the free must be findable again");
            arena.free(again, size, pool);
            let s2 = free_snapshot(&arena);

            assert_eq!(s1, s2, "second cycle must be a fixed point");
            arena.check_rep();
        }

        // Slack against the virgin arena: at most one bootstrap page
        // of committed bytes (spare retention accounts for the rest).
        let now = free_snapshot(&arena);
        assert!(now.0 - now.2 <= initial.0 - initial.2 + page());
        assert!(initial.1 - now.1 <= page());
    }

    // The blacklist steers allocations away while other zones have
    // space.
    #[test]
    fn blacklist_is_honoured_before_last_resort() {
        let mut arena = test_arena(64, 4);
        let pool = arena.make_pool();
        let z0 = lowest_free_zone(&arena);

        let base = arena
            .alloc(
                &Placement::default().avoiding(ZoneSet::single(z0)),
                page(),
                pool,
                false,
            )
            .expect("other zones have space");
        assert_ne!(zone_of(base, arena.zone_shift()), z0);
        arena.check_rep();
    }

    // High placement takes the top of the free space.
    #[test]
    fn high_preference_allocates_from_the_top() {
        let mut arena = test_arena(64, 4);
        let pool = arena.make_pool();

        // On a fresh arena a high request must land on the very top
        // page.
        let high = arena
            .alloc(&Placement::in_zones(ZoneSet::UNIV).high(), page(), pool, false)
            .expect("space");
        let top = arena.state().chunk(0).limit();
        assert_eq!(high + page(), top);

        let low = arena
            .alloc(&Placement::in_zones(ZoneSet::UNIV), page(), pool, false)
            .expect("space");
        assert!(low < high);
        arena.check_rep();
    }

    #[test]
    fn addr_queries_see_allocations() {
        let mut arena = test_arena(64, 4);
        let pool = arena.make_pool();

        let base = arena
            .alloc(&Placement::default(), 2 * page(), pool, false)
            .expect("space");
        assert!(arena.has_addr(base));
        assert!(arena.has_addr(base + page() + 17));
        assert_eq!(arena.addr_object(base + 10), Ok(base));
        assert_eq!(
            arena.addr_object(base + page() + 10),
            Ok(base + page())
        );

        let t = arena.tract_of(base).expect("allocated");
        assert_eq!(t.pool(), pool);
        assert!(arena.set_tract_word(base, 0xbeef));
        assert_eq!(arena.tract_word(base), Some(0xbeef));

        arena.free(base, 2 * page(), pool);
        assert!(!arena.has_addr(base));
        assert_eq!(arena.addr_object(base), Err(Error::Fail));
    }

    #[test]
    fn tract_walk_is_in_address_order() {
        let mut arena = test_arena(64, 4);
        let pool = arena.make_pool();

        let a = arena.alloc(&Placement::default(), page(), pool, false).unwrap();
        let b = arena.alloc(&Placement::default(), page(), pool, false).unwrap();

        let mut bases = Vec::new();
        let mut cursor = arena.first_tract();
        while let Some(t) = cursor {
            bases.push(t.base());
            cursor = arena.next_tract(t.base());
        }
        // The walk covers our tracts plus the arena's own (bootstrap
        // block-pool pages), strictly ascending.
        assert!(bases.windows(2).all(|w| w[0] < w[1]));
        assert!(bases.contains(&a) && bases.contains(&b));

        let mut out = String::new();
        arena.describe_tracts(&mut out).expect("should write");
        assert!(out.contains("pool"));
    }

    #[test]
    fn spare_commit_is_reused_and_purgeable() {
        let mut arena = test_arena(64, 4);
        let pool = arena.make_pool();
        let pref = Placement::in_zones(ZoneSet::UNIV);

        let base = arena.alloc(&pref, 4 * page(), pool, false).expect("space");
        let committed = arena.committed();
        arena.free(base, 4 * page(), pool);

        // The free retained the pages as spare: still committed.
        assert_eq!(arena.committed(), committed);
        assert_eq!(arena.spare_committed(), 4 * page());

        // Reallocating the same pages costs nothing new.
        let again = arena.alloc(&pref, 4 * page(), pool, false).expect("space");
        assert_eq!(again, base);
        assert_eq!(arena.committed(), committed);
        assert_eq!(arena.spare_committed(), 0);
        arena.check_rep();
    }

    #[test]
    fn commit_limit_setters() {
        let mut arena = test_arena(64, 4);
        let pool = arena.make_pool();

        let base = arena
            .alloc(&Placement::default(), 4 * page(), pool, false)
            .expect("space");
        arena.free(base, 4 * page(), pool);
        assert_eq!(arena.spare_committed(), 4 * page());

        // Purging spare is the last resort of a shrinking limit.
        let live = arena.committed() - arena.spare_committed();
        arena
            .set_commit_limit(live)
            .expect("spare can be purged to fit");
        assert_eq!(arena.spare_committed(), 0);
        assert!(arena.committed() <= live);

        // Below live commitment is a hard failure.
        assert_eq!(arena.set_commit_limit(live - page()), Err(Error::Fail));
        arena.set_commit_limit(usize::MAX).expect("raising is easy");

        arena.set_spare_commit_limit(0);
        let base = arena
            .alloc(&Placement::default(), page(), pool, false)
            .expect("space");
        let committed = arena.committed();
        arena.free(base, page(), pool);
        // No spare retention under a zero cap.
        assert_eq!(arena.spare_committed(), 0);
        assert_eq!(arena.committed(), committed - page());
        arena.check_rep();
    }

    #[test]
    fn available_accounts_for_limits() {
        let mut arena = test_arena(64, 4);

        let avail = arena.available();
        assert!(avail > 0 && avail <= arena.reserved());

        arena.set_commit_limit(arena.committed() + page()).unwrap();
        assert_eq!(arena.available(), page() + arena.spare_committed());
    }

    #[test]
    fn reservoir_serves_permit_holders() {
        let mut arena = test_arena(16, 4);
        let pool = arena.make_pool();

        arena.set_reservoir_limit(2 * page());

        // The next allocation tops the reservoir up first.
        arena
            .alloc(&Placement::default(), page(), pool, false)
            .expect("space");
        assert_eq!(arena.state().reservoir.held(), 2 * page());
        arena.check_rep();

        // Drain the arena dry.
        let mut drained = Vec::new();
        while let Ok(b) = arena.alloc(&Placement::default(), page(), pool, false) {
            drained.push(b);
        }

        // Without a permit: failure.  With one: the reservoir pays.
        assert!(arena.alloc(&Placement::default(), page(), pool, false).is_err());
        let emergency = arena
            .alloc(&Placement::default(), page(), pool, true)
            .expect("the reservoir has pages");
        assert_eq!(arena.tract_of(emergency).expect("allocated").pool(), pool);
        assert_eq!(arena.state().reservoir.held(), page());
        arena.check_rep();
    }

    #[test]
    fn underfull_reservoir_takes_from_frees() {
        let mut arena = test_arena(16, 4);
        let pool = arena.make_pool();

        // Fill the arena so the reservoir cannot top itself up.
        let mut held = Vec::new();
        while let Ok(b) = arena.alloc(&Placement::default(), page(), pool, false) {
            held.push(b);
        }
        arena.set_reservoir_limit(2 * page());

        // Frees are tithed until the reservoir is full.
        for b in held.drain(..3) {
            arena.free(b, page(), pool);
        }
        assert_eq!(arena.state().reservoir.held(), 2 * page());
        arena.check_rep();

        arena.set_reservoir_limit(0);
        assert_eq!(arena.state().reservoir.held(), 0);
        arena.check_rep();
    }

    #[test]
    fn control_pool_round_trips() {
        let mut arena = test_arena(64, 4);

        let a = arena.control_alloc(24, false).expect("small block");
        let b = arena.control_alloc(40, false).expect("small block");
        assert_ne!(a, b);

        // Control memory is writable client memory.
        unsafe {
            std::ptr::write_bytes(a as *mut u8, 0xa5, 24);
            std::ptr::write_bytes(b as *mut u8, 0x5a, 40);
            assert_eq!(std::ptr::read(a as *const u8), 0xa5);
        }

        arena.control_free(a, 24);
        arena.control_free(b, 40);
        // The span went back to the arena once it was all free.
        assert_eq!(arena.state().control.span_count(), 0);
        arena.check_rep();
    }

    #[test]
    fn extend_and_compact_round_trip() {
        let mut arena = test_arena(16, 4);
        let pool = arena.make_pool();

        // A second client region.
        let align = page();
        let bytes = 16 * align + align;
        let mem = Box::leak(vec![0u8; bytes].into_boxed_slice());
        arena
            .extend(mem.as_mut_ptr() as usize, bytes)
            .expect("chunk should fit");
        assert_eq!(arena.state().chunk_count(), 2);
        arena.check_rep();

        // Fill past the primary chunk so the extension gets used.
        let mut blocks = Vec::new();
        while let Ok(b) = arena.alloc(&Placement::default(), page(), pool, false) {
            blocks.push(b);
        }
        let second = arena.state().chunk(1).alloc_range();
        assert!(blocks.iter().any(|&b| second.contains(b)));

        for b in blocks {
            arena.free(b, page(), pool);
        }
        arena.check_rep();

        // With everything free again, compaction retires the
        // extension chunk but never the primary.
        arena.compact();
        assert_eq!(arena.state().chunk_count(), 1);
        arena.check_rep();
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        // Random alloc/free interleavings keep every invariant: the
        // disjoint cover, zone confinement, and commit accounting are
        // re-checked after each step.
        #[test]
        fn random_alloc_free_keeps_invariants(
            ops in vec((0..3usize, 1..6usize, 0..4u64), 1..40),
        ) {
            let mut arena = test_arena(256, 4);
            let pool = arena.make_pool();
            let mut live: Vec<(usize, usize)> = Vec::new();

            for (op, pages, zone_salt) in ops {
                match op {
                    0 => {
                        let pref = Placement::default();
                        if let Ok(base) = arena.alloc(&pref, pages * page(), pool, false) {
                            live.push((base, pages * page()));
                        }
                    }
                    1 => {
                        // A zone-steered allocation.
                        let z = (lowest_free_zone(&arena) as u64 + zone_salt) % 64;
                        let pref = Placement::in_zones(ZoneSet::single(z as usize));
                        if let Ok(base) = arena.alloc(&pref, pages * page(), pool, false) {
                            live.push((base, pages * page()));
                        }
                    }
                    _ => {
                        if let Some((base, size)) = live.pop() {
                            arena.free(base, size, pool);
                        }
                    }
                }
                arena.check_rep();
            }

            for (base, size) in live {
                arena.free(base, size, pool);
            }
            arena.check_rep();
        }

        // Plan A results stay inside the requested zones whenever the
        // request can be satisfied there at all.
        #[test]
        fn zone_preference_is_honoured_when_possible(extra in 0..3usize) {
            let mut arena = test_arena(64, 4);
            let pool = arena.make_pool();
            let z0 = lowest_free_zone(&arena);
            let zones = ZoneSet::single(z0).add((z0 + 1) % 64);

            let base = arena
                .alloc(&Placement::in_zones(zones), (1 + extra) * page(), pool, false)
                .expect("fresh arena has zone space");
            let got = ZoneSet::of_range(
                Range::from_size(base, (1 + extra) * page()),
                arena.zone_shift(),
            );
            prop_assert!(got.is_subset(zones));
        }
    }
}
