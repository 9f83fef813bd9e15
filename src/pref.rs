//! Placement preferences: how a pool steers the arena's choice of
//! address range.  The policy treats `zones` as a wish and `avoid` as
//! a blacklist; only the last-resort fallback ignores the blacklist.
use crate::zone::ZoneSet;

/// A pool's placement preference for one allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    /// Zones to try first (Plan A).  Empty means "no preference".
    pub zones: ZoneSet,

    /// Zones to stay out of for as long as possible.  Typically the
    /// zones where ambiguous bit patterns would pin collected objects.
    pub avoid: ZoneSet,

    /// Prefer the high end of free ranges.  Selects the mirror-image
    /// searches and high-end consumption.
    pub high: bool,
}

impl Default for Placement {
    fn default() -> Placement {
        Placement {
            zones: ZoneSet::EMPTY,
            avoid: ZoneSet::EMPTY,
            high: false,
        }
    }
}

impl Placement {
    /// A preference for the given zones, low placement, no blacklist.
    pub fn in_zones(zones: ZoneSet) -> Placement {
        Placement {
            zones,
            ..Placement::default()
        }
    }

    pub fn avoiding(mut self, avoid: ZoneSet) -> Placement {
        self.avoid = avoid;
        self
    }

    pub fn high(mut self) -> Placement {
        self.high = true;
        self
    }
}
