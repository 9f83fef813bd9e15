//! A coalescing range set: an ordered set of disjoint, non-adjacent
//! half-open ranges.  Inserting a range merges it with any touching
//! neighbours; deleting may split a range in two.
//!
//! The set is a bottom-up splay tree keyed by range base, with a
//! per-node `max_size` augmentation so searches can skip subtrees that
//! cannot satisfy a request.  Nodes live in raw memory handed out by a
//! `BlockPool`; the pool never extends itself, so any operation that
//! needs a fresh node can fail with `Limit`, always *before* the set
//! is mutated, which lets the arena feed the pool and retry.
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

use std::ptr::NonNull;

use crate::block_pool::BlockPool;
use crate::error::{Error, Result};
use crate::range::Range;
use crate::zone::{first_fit_in_zones, last_fit_in_zones, ZoneSet};

#[repr(C)]
struct Node {
    base: usize,
    limit: usize,
    /// Largest range length in this node's subtree.
    max_size: usize,
    left: *mut Node,
    right: *mut Node,
    parent: *mut Node,
}

/// The block pool unit must hold a node.
pub(crate) const NODE_SIZE: usize = std::mem::size_of::<Node>();

static_assertions::const_assert!(NODE_SIZE % std::mem::align_of::<Node>() == 0);

#[inline]
unsafe fn node_len(n: *mut Node) -> usize {
    (*n).limit - (*n).base
}

#[inline]
unsafe fn node_range(n: *mut Node) -> Range {
    Range::new((*n).base, (*n).limit)
}

/// Recomputes a node's augmentation from its children.
unsafe fn update(n: *mut Node) {
    let mut max = node_len(n);
    if !(*n).left.is_null() {
        max = max.max((*(*n).left).max_size);
    }
    if !(*n).right.is_null() {
        max = max.max((*(*n).right).max_size);
    }
    (*n).max_size = max;
}

unsafe fn subtree_min(mut n: *mut Node) -> *mut Node {
    while !(*n).left.is_null() {
        n = (*n).left;
    }
    n
}

/// In-order successor, via parent links.
unsafe fn next_node(n: *mut Node) -> *mut Node {
    if !(*n).right.is_null() {
        return subtree_min((*n).right);
    }

    let mut child = n;
    let mut p = (*n).parent;
    while !p.is_null() && (*p).right == child {
        child = p;
        p = (*p).parent;
    }
    p
}

pub(crate) struct RangeSet {
    root: *mut Node,
    nodes: usize,
    total: usize,
}

impl RangeSet {
    pub fn new() -> RangeSet {
        RangeSet {
            root: std::ptr::null_mut(),
            nodes: 0,
            total: 0,
        }
    }

    /// Number of ranges in the set.
    pub fn node_count(&self) -> usize {
        self.nodes
    }

    /// Total bytes covered by the set.
    pub fn size(&self) -> usize {
        self.total
    }

    /// Rotates `n` over its parent, maintaining augmentation.
    unsafe fn rotate_up(&mut self, n: *mut Node) {
        let p = (*n).parent;
        let g = (*p).parent;

        if (*p).left == n {
            (*p).left = (*n).right;
            if !(*n).right.is_null() {
                (*(*n).right).parent = p;
            }
            (*n).right = p;
        } else {
            (*p).right = (*n).left;
            if !(*n).left.is_null() {
                (*(*n).left).parent = p;
            }
            (*n).left = p;
        }
        (*p).parent = n;
        (*n).parent = g;

        if g.is_null() {
            self.root = n;
        } else if (*g).left == p {
            (*g).left = n;
        } else {
            (*g).right = n;
        }

        update(p);
        update(n);
    }

    /// Splays `n` to the root.  Rotations keep the augmentation exact.
    unsafe fn splay(&mut self, n: *mut Node) {
        while !(*n).parent.is_null() {
            let p = (*n).parent;
            let g = (*p).parent;

            if g.is_null() {
                self.rotate_up(n);
            } else if ((*g).left == p) == ((*p).left == n) {
                self.rotate_up(p);
                self.rotate_up(n);
            } else {
                self.rotate_up(n);
                self.rotate_up(n);
            }
        }
    }

    /// Recomputes augmentation from `n` to the root.
    unsafe fn fixup_to_root(&mut self, mut n: *mut Node) {
        while !n.is_null() {
            update(n);
            n = (*n).parent;
        }
    }

    /// The node containing `addr`, if any: `addr < base` goes left,
    /// `addr >= limit` goes right, anything else is containment.
    unsafe fn find_containing(&self, addr: usize) -> *mut Node {
        let mut cur = self.root;
        while !cur.is_null() {
            if addr < (*cur).base {
                cur = (*cur).left;
            } else if addr >= (*cur).limit {
                cur = (*cur).right;
            } else {
                return cur;
            }
        }
        std::ptr::null_mut()
    }

    /// Detaches a node with at most one child.
    unsafe fn splice(&mut self, n: *mut Node) {
        debug_assert!((*n).left.is_null() || (*n).right.is_null());

        let child = if !(*n).left.is_null() {
            (*n).left
        } else {
            (*n).right
        };
        let p = (*n).parent;

        if !child.is_null() {
            (*child).parent = p;
        }
        if p.is_null() {
            self.root = child;
        } else {
            if (*p).left == n {
                (*p).left = child;
            } else {
                (*p).right = child;
            }
            self.fixup_to_root(p);
        }
    }

    /// Removes `n` from the tree and returns the pointer whose memory
    /// is now free.  When `n` has two children its payload is replaced
    /// by its successor's and the successor's memory is freed instead.
    unsafe fn unlink(&mut self, n: *mut Node) -> *mut Node {
        if !(*n).left.is_null() && !(*n).right.is_null() {
            let s = subtree_min((*n).right);
            (*n).base = (*s).base;
            (*n).limit = (*s).limit;
            self.splice(s);
            return s;
        }
        self.splice(n);
        n
    }

    /// Inserts `range`, coalescing with any touching or overlapping
    /// neighbours.  Fails with `Limit`, before any mutation, when a
    /// fresh node is needed and the pool is dry.
    #[requires(!range.is_empty())]
    pub fn insert(&mut self, pool: &mut BlockPool, range: Range) -> Result<()> {
        unsafe {
            // Locate the neighbours of range.base: `lo` has the
            // greatest base <= range.base, `hi` the least base above.
            let mut lo: *mut Node = std::ptr::null_mut();
            let mut hi: *mut Node = std::ptr::null_mut();
            let mut attach: *mut Node = std::ptr::null_mut();

            let mut cur = self.root;
            while !cur.is_null() {
                attach = cur;
                if (*cur).base <= range.base() {
                    lo = cur;
                    cur = (*cur).right;
                } else {
                    hi = cur;
                    cur = (*cur).left;
                }
            }

            let (merge, old_len) = if !lo.is_null() && (*lo).limit >= range.base() {
                (lo, node_len(lo))
            } else if !hi.is_null() && range.limit() >= (*hi).base {
                let len = node_len(hi);
                (*hi).base = range.base();
                (hi, len)
            } else {
                // No touching neighbour: a fresh node.
                let n = pool.alloc()?.as_ptr() as *mut Node;
                n.write(Node {
                    base: range.base(),
                    limit: range.limit(),
                    max_size: range.size(),
                    left: std::ptr::null_mut(),
                    right: std::ptr::null_mut(),
                    parent: attach,
                });
                if attach.is_null() {
                    self.root = n;
                } else if range.base() < (*attach).base {
                    (*attach).left = n;
                } else {
                    (*attach).right = n;
                }
                self.nodes += 1;
                self.total += range.size();
                self.fixup_to_root(n);
                self.splay(n);
                return Ok(());
            };

            // Grow `merge` rightward, absorbing every node the grown
            // range touches.
            let mut new_limit = range.limit().max((*merge).limit);
            let mut absorbed = 0;
            loop {
                let nx = next_node(merge);
                if nx.is_null() || (*nx).base > new_limit {
                    break;
                }
                new_limit = new_limit.max((*nx).limit);
                absorbed += node_len(nx);
                let freed = self.unlink(nx);
                self.nodes -= 1;
                pool.free(NonNull::new_unchecked(freed as *mut u8));
            }
            (*merge).limit = new_limit;

            let new_len = node_len(merge);
            self.total += new_len;
            self.total -= old_len + absorbed;

            self.fixup_to_root(merge);
            self.splay(merge);
            Ok(())
        }
    }

    /// Removes `range` from the node `n` that covers it.  A middle
    /// split needs a fresh node and can fail with `Limit` before any
    /// mutation.
    unsafe fn delete_from_node(
        &mut self,
        pool: &mut BlockPool,
        n: *mut Node,
        range: Range,
    ) -> Result<()> {
        debug_assert!(node_range(n).nests(range));

        if (*n).base == range.base() && (*n).limit == range.limit() {
            let freed = self.unlink(n);
            self.nodes -= 1;
            pool.free(NonNull::new_unchecked(freed as *mut u8));
        } else if (*n).base == range.base() {
            (*n).base = range.limit();
            self.fixup_to_root(n);
        } else if (*n).limit == range.limit() {
            (*n).limit = range.base();
            self.fixup_to_root(n);
        } else {
            // Middle split: the high remainder needs its own node.
            let n2 = pool.alloc()?.as_ptr() as *mut Node;
            let old_limit = (*n).limit;

            (*n).limit = range.base();
            n2.write(Node {
                base: range.limit(),
                limit: old_limit,
                max_size: old_limit - range.limit(),
                left: std::ptr::null_mut(),
                right: (*n).right,
                parent: n,
            });
            if !(*n2).right.is_null() {
                (*(*n2).right).parent = n2;
            }
            (*n).right = n2;
            self.nodes += 1;
            update(n2);
            self.fixup_to_root(n);
        }

        self.total -= range.size();
        Ok(())
    }

    /// Deletes `range`, which must be fully covered by the set.
    /// `Fail` when it is not; `Limit` (atomically) when a split needs
    /// a node the pool cannot provide.
    #[requires(!range.is_empty())]
    pub fn delete(&mut self, pool: &mut BlockPool, range: Range) -> Result<()> {
        unsafe {
            let n = self.find_containing(range.base());
            if n.is_null() || (*n).limit < range.limit() {
                return Err(Error::Fail);
            }
            self.delete_from_node(pool, n, range)
        }
    }

    /// True iff `range` is fully covered by a single range of the set.
    pub fn covers(&self, range: Range) -> bool {
        unsafe {
            let n = self.find_containing(range.base());
            !n.is_null() && (*n).limit >= range.limit()
        }
    }

    /// Finds the leftmost (rightmost, when `high`) range at least
    /// `size` bytes long, consumes `size` bytes from its low (high)
    /// end, and returns the consumed sub-range and the whole original
    /// range.
    #[requires(size > 0)]
    pub fn find_first(
        &mut self,
        pool: &mut BlockPool,
        size: usize,
        high: bool,
    ) -> Option<(Range, Range)> {
        unsafe {
            if self.root.is_null() || (*self.root).max_size < size {
                return None;
            }

            let mut n = self.root;
            loop {
                let (fore, aft) = if high {
                    ((*n).right, (*n).left)
                } else {
                    ((*n).left, (*n).right)
                };
                if !fore.is_null() && (*fore).max_size >= size {
                    n = fore;
                    continue;
                }
                if node_len(n) >= size {
                    break;
                }
                n = aft;
                debug_assert!(!n.is_null());
            }

            let whole = node_range(n);
            let chosen = if high {
                Range::new(whole.limit() - size, whole.limit())
            } else {
                Range::from_size(whole.base(), size)
            };
            self.delete_from_node(pool, n, chosen)
                .expect("consuming a range end never needs a new node");
            Some((chosen, whole))
        }
    }

    /// Finds the leftmost (rightmost, when `high`) sub-range of `size`
    /// bytes lying entirely within `zones`, consumes it, and returns
    /// it with the whole range it came from.  `Limit` (atomically)
    /// when consuming it would split a range and the pool is dry.
    #[requires(size > 0)]
    pub fn find_in_zones(
        &mut self,
        pool: &mut BlockPool,
        size: usize,
        zones: ZoneSet,
        zone_shift: u32,
        high: bool,
    ) -> Result<Option<(Range, Range)>> {
        unsafe fn search(
            n: *mut Node,
            size: usize,
            zones: ZoneSet,
            zone_shift: u32,
            high: bool,
        ) -> Option<(*mut Node, Range)> {
            if n.is_null() || (*n).max_size < size {
                None
            } else {
                let (fore, aft) = if high {
                    ((*n).right, (*n).left)
                } else {
                    ((*n).left, (*n).right)
                };

                let hit = search(fore, size, zones, zone_shift, high);
                if hit.is_some() {
                    hit
                } else {
                    let fit = if node_len(n) >= size {
                        if high {
                            last_fit_in_zones(node_range(n), size, zones, zone_shift)
                        } else {
                            first_fit_in_zones(node_range(n), size, zones, zone_shift)
                        }
                    } else {
                        None
                    };
                    if let Some(sub) = fit {
                        Some((n, sub))
                    } else {
                        search(aft, size, zones, zone_shift, high)
                    }
                }
            }
        }

        unsafe {
            match search(self.root, size, zones, zone_shift, high) {
                None => Ok(None),
                Some((n, sub)) => {
                    let whole = node_range(n);
                    self.delete_from_node(pool, n, sub)?;
                    Ok(Some((sub, whole)))
                }
            }
        }
    }

    /// Applies `f` to every range, in address order.
    pub fn iter(&self, f: &mut dyn FnMut(Range)) {
        unsafe fn walk(n: *mut Node, f: &mut dyn FnMut(Range)) {
            if n.is_null() {
                return;
            }
            walk((*n).left, f);
            f(node_range(n));
            walk((*n).right, f);
        }

        unsafe { walk(self.root, f) }
    }

    /// All ranges, in address order.
    pub fn ranges(&self) -> Vec<Range> {
        let mut out = Vec::with_capacity(self.nodes);
        self.iter(&mut |r| out.push(r));
        out
    }

    /// Returns every node to the pool.  The set is empty afterwards.
    pub fn finish(&mut self, pool: &mut BlockPool) {
        unsafe fn free_subtree(pool: &mut BlockPool, n: *mut Node) {
            if n.is_null() {
                return;
            }
            free_subtree(pool, (*n).left);
            free_subtree(pool, (*n).right);
            pool.free(NonNull::new_unchecked(n as *mut u8));
        }

        unsafe { free_subtree(pool, self.root) };
        self.root = std::ptr::null_mut();
        self.nodes = 0;
        self.total = 0;
    }

    /// Asserts against structural invariants: ordering, non-adjacency,
    /// parent links, augmentation, and statistics.
    pub fn check_rep(&self) {
        unsafe fn walk(
            n: *mut Node,
            parent: *mut Node,
            prev_limit: &mut Option<usize>,
            nodes: &mut usize,
            total: &mut usize,
        ) {
            if n.is_null() {
                return;
            }
            assert_eq!((*n).parent, parent, "bad parent link");
            assert!((*n).base < (*n).limit, "empty node");

            walk((*n).left, n, prev_limit, nodes, total);

            if let Some(prev) = *prev_limit {
                assert!(prev < (*n).base, "adjacent or overlapping ranges");
            }
            *prev_limit = Some((*n).limit);
            *nodes += 1;
            *total += node_len(n);

            let mut max = node_len(n);
            if !(*n).left.is_null() {
                max = max.max((*(*n).left).max_size);
            }
            if !(*n).right.is_null() {
                max = max.max((*(*n).right).max_size);
            }
            assert_eq!((*n).max_size, max, "stale augmentation");

            walk((*n).right, n, prev_limit, nodes, total);
        }

        let mut prev_limit = None;
        let mut nodes = 0;
        let mut total = 0;
        unsafe { walk(self.root, std::ptr::null_mut(), &mut prev_limit, &mut nodes, &mut total) };
        assert_eq!(nodes, self.nodes, "node count out of sync");
        assert_eq!(total, self.total, "size statistic out of sync");
    }
}

impl std::fmt::Debug for RangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RangeSet")
            .field("nodes", &self.nodes)
            .field("total", &self.total)
            .finish()
    }
}
