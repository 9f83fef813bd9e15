//! The reservoir: an emergency cache of committed, pre-allocated
//! address space.  When normal allocation fails, a caller holding a
//! reservoir permit can be served from here.  Held ranges stay charged
//! against the commit limit and belong to the reservoir pool; the
//! arena fills, drains, and reassigns them; the reservoir itself is
//! pure bookkeeping.
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

use crate::range::Range;

#[derive(Debug, Default)]
pub(crate) struct Reservoir {
    limit: usize,
    held: usize,
    ranges: Vec<Range>,
}

impl Reservoir {
    pub fn new() -> Reservoir {
        Default::default()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn held(&self) -> usize {
        self.held
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }

    pub fn is_full(&self) -> bool {
        self.held >= self.limit
    }

    /// Bytes still wanted to reach the limit.
    pub fn deficit(&self) -> usize {
        self.limit.saturating_sub(self.held)
    }

    /// Accepts a prefix of `range`, capped at the deficit and rounded
    /// down to `grain`.  Returns the accepted size; deposits that
    /// would overfill the reservoir are clipped rather than swallowed.
    #[requires(range.size() % grain == 0)]
    #[ensures(ret % grain == 0 && ret <= range.size())]
    pub fn accept(&mut self, range: Range, grain: usize) -> usize {
        let take = self.deficit().min(range.size()) / grain * grain;

        if take > 0 {
            self.ranges.push(Range::from_size(range.base(), take));
            self.held += take;
        }
        take
    }

    /// Records a range the arena allocated on the reservoir's behalf.
    pub fn add(&mut self, range: Range) {
        self.held += range.size();
        self.ranges.push(range);
    }

    /// Takes `size` bytes from some held range, splitting it if
    /// necessary.
    pub fn withdraw(&mut self, size: usize) -> Option<Range> {
        let i = self.ranges.iter().position(|r| r.size() >= size)?;
        let r = self.ranges[i];
        let taken = Range::from_size(r.base(), size);

        if r.size() == size {
            self.ranges.swap_remove(i);
        } else {
            self.ranges[i] = Range::new(taken.limit(), r.limit());
        }
        self.held -= size;
        Some(taken)
    }

    /// Removes held ranges until `held <= self.limit`, splitting the
    /// last one if needed.  The caller frees what comes back.
    pub fn drain_to_limit(&mut self) -> Vec<Range> {
        let mut released = Vec::new();

        while self.held > self.limit {
            let r = self.ranges.pop().expect("held is positive");
            let excess = self.held - self.limit;

            if r.size() <= excess {
                self.held -= r.size();
                released.push(r);
            } else {
                let cut = Range::new(r.limit() - excess, r.limit());
                self.ranges.push(Range::new(r.base(), cut.base()));
                self.held -= excess;
                released.push(cut);
            }
        }
        released
    }
}
