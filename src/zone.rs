//! Zones partition the address space into stripes of `1 << zone_shift`
//! bytes; the stripe at `addr` belongs to zone
//! `(addr >> zone_shift) % 64`.  Pools steer placement with sets of
//! zones, so the set is exactly one machine word wide.
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

use crate::range::{align_down, Range};

/// Number of zones; one bit of `ZoneSet` per zone.
pub const ZONE_COUNT: usize = 64;

static_assertions::const_assert_eq!(ZONE_COUNT, 8 * std::mem::size_of::<ZoneSet>());

/// Maps an address to its zone.
#[inline]
pub fn zone_of(addr: usize, zone_shift: u32) -> usize {
    ((addr >> zone_shift) as usize) & (ZONE_COUNT - 1)
}

/// A set of zones, as a bit mask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ZoneSet(u64);

impl ZoneSet {
    pub const EMPTY: ZoneSet = ZoneSet(0);
    pub const UNIV: ZoneSet = ZoneSet(u64::MAX);

    #[requires(zone < ZONE_COUNT)]
    #[inline]
    pub fn single(zone: usize) -> ZoneSet {
        ZoneSet(1 << zone)
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[requires(zone < ZONE_COUNT)]
    #[inline]
    pub fn is_member(self, zone: usize) -> bool {
        self.0 & (1 << zone) != 0
    }

    #[requires(zone < ZONE_COUNT)]
    #[inline]
    pub fn add(self, zone: usize) -> ZoneSet {
        ZoneSet(self.0 | (1 << zone))
    }

    #[inline]
    pub fn union(self, other: ZoneSet) -> ZoneSet {
        ZoneSet(self.0 | other.0)
    }

    #[inline]
    pub fn diff(self, other: ZoneSet) -> ZoneSet {
        ZoneSet(self.0 & !other.0)
    }

    #[inline]
    pub fn intersect(self, other: ZoneSet) -> ZoneSet {
        ZoneSet(self.0 & other.0)
    }

    #[inline]
    pub fn is_subset(self, other: ZoneSet) -> bool {
        self.0 & !other.0 == 0
    }

    /// The set of zones touched by `range`.  A range covering 64 or
    /// more stripes touches every zone.
    pub fn of_range(range: Range, zone_shift: u32) -> ZoneSet {
        if range.is_empty() {
            return ZoneSet::EMPTY;
        }

        let first = range.base() >> zone_shift;
        let last = (range.limit() - 1) >> zone_shift;
        if last - first >= ZONE_COUNT - 1 {
            return ZoneSet::UNIV;
        }

        let mut set = ZoneSet::EMPTY;
        for stripe in first..=last {
            set = set.add(stripe & (ZONE_COUNT - 1));
        }
        set
    }
}

/// Finds the lowest sub-range of `range` that is `size` bytes long and
/// lies entirely within `zones`.
///
/// Consecutive stripes map to consecutive zones, so a sub-range larger
/// than one stripe needs a run of consecutive member zones.
#[requires(size > 0)]
pub fn first_fit_in_zones(range: Range, size: usize, zones: ZoneSet, zone_shift: u32) -> Option<Range> {
    if zones == ZoneSet::UNIV {
        return if range.size() >= size {
            Some(Range::from_size(range.base(), size))
        } else {
            None
        };
    }

    let stripe = 1usize << zone_shift;
    let mut p = range.base();
    while p < range.limit() {
        if !zones.is_member(zone_of(p, zone_shift)) {
            match align_down(p, stripe).checked_add(stripe) {
                Some(next) => p = next,
                None => break,
            }
            continue;
        }

        // Extend over the run of consecutive member stripes.
        let mut run_limit = match align_down(p, stripe).checked_add(stripe) {
            Some(l) => l,
            None => range.limit(),
        };
        while run_limit < range.limit() && zones.is_member(zone_of(run_limit, zone_shift)) {
            run_limit = match run_limit.checked_add(stripe) {
                Some(l) => l,
                None => range.limit(),
            };
        }
        let run_limit = run_limit.min(range.limit());

        if run_limit - p >= size {
            return Some(Range::from_size(p, size));
        }
        p = run_limit;
    }
    None
}

/// Mirror of `first_fit_in_zones`: the highest in-zone sub-range.
#[requires(size > 0)]
pub fn last_fit_in_zones(range: Range, size: usize, zones: ZoneSet, zone_shift: u32) -> Option<Range> {
    if zones == ZoneSet::UNIV {
        return if range.size() >= size {
            Some(Range::new(range.limit() - size, range.limit()))
        } else {
            None
        };
    }

    let stripe = 1usize << zone_shift;
    let mut q = range.limit();
    while q > range.base() {
        let last = q - 1;
        if !zones.is_member(zone_of(last, zone_shift)) {
            q = align_down(last, stripe);
            continue;
        }

        let mut run_base = align_down(last, stripe);
        while run_base > range.base() && zones.is_member(zone_of(run_base - 1, zone_shift)) {
            run_base = run_base.saturating_sub(stripe);
        }
        let run_base = run_base.max(range.base());

        if q - run_base >= size {
            return Some(Range::new(q - size, q));
        }
        q = run_base;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    // A 16-bit zone shift keeps test addresses small.
    const SHIFT: u32 = 16;
    const STRIPE: usize = 1 << SHIFT;

    #[test]
    fn zone_mapping() {
        assert_eq!(zone_of(0, SHIFT), 0);
        assert_eq!(zone_of(STRIPE - 1, SHIFT), 0);
        assert_eq!(zone_of(STRIPE, SHIFT), 1);
        // Zones wrap after 64 stripes.
        assert_eq!(zone_of(64 * STRIPE, SHIFT), 0);
    }

    #[test]
    fn set_algebra() {
        let a = ZoneSet::single(1).add(5);
        let b = ZoneSet::single(5).add(9);

        assert!(a.is_member(1) && a.is_member(5));
        assert!(!a.is_member(9));
        assert_eq!(a.union(b), ZoneSet::single(1).add(5).add(9));
        assert_eq!(a.diff(b), ZoneSet::single(1));
        assert_eq!(a.intersect(b), ZoneSet::single(5));
        assert!(ZoneSet::EMPTY.is_subset(a));
        assert!(a.is_subset(ZoneSet::UNIV));
    }

    #[test]
    fn of_range() {
        let r = Range::new(STRIPE / 2, 2 * STRIPE + 1);
        assert_eq!(
            ZoneSet::of_range(r, SHIFT),
            ZoneSet::single(0).add(1).add(2)
        );

        let wide = Range::new(0, 65 * STRIPE);
        assert_eq!(ZoneSet::of_range(wide, SHIFT), ZoneSet::UNIV);

        assert_eq!(
            ZoneSet::of_range(Range::new(STRIPE, STRIPE), SHIFT),
            ZoneSet::EMPTY
        );
    }

    #[test]
    fn first_fit_skips_non_member_stripes() {
        // Range covers zones 0..4; only zone 2 is allowed.
        let r = Range::new(0, 4 * STRIPE);
        let fit = first_fit_in_zones(r, 4096, ZoneSet::single(2), SHIFT).expect("must fit");
        assert_eq!(fit.base(), 2 * STRIPE);
        assert_eq!(fit.size(), 4096);
    }

    #[test]
    fn first_fit_requires_consecutive_member_zones() {
        let r = Range::new(0, 4 * STRIPE);
        // A two-stripe request fits only if two consecutive zones are members.
        let gap = ZoneSet::single(0).add(2);
        assert_eq!(first_fit_in_zones(r, 2 * STRIPE, gap, SHIFT), None);

        let run = ZoneSet::single(1).add(2);
        let fit = first_fit_in_zones(r, 2 * STRIPE, run, SHIFT).expect("must fit");
        assert_eq!(fit.base(), STRIPE);
    }

    #[test]
    fn last_fit_prefers_high_addresses() {
        let r = Range::new(0, 4 * STRIPE);
        let zones = ZoneSet::single(1).add(3);
        let fit = last_fit_in_zones(r, 4096, zones, SHIFT).expect("must fit");
        assert_eq!(fit.limit(), 4 * STRIPE);

        let low = first_fit_in_zones(r, 4096, zones, SHIFT).expect("must fit");
        assert_eq!(low.base(), STRIPE);
    }

    #[test]
    fn fits_respect_range_bounds() {
        // Sub-stripe range: a fit must not stick out of the range.
        let r = Range::new(STRIPE + 4096, STRIPE + 8192);
        let fit = first_fit_in_zones(r, 4096, ZoneSet::single(1), SHIFT).expect("must fit");
        assert_eq!(fit, Range::new(STRIPE + 4096, STRIPE + 8192));
        assert_eq!(first_fit_in_zones(r, 8192, ZoneSet::single(1), SHIFT), None);
    }
}
