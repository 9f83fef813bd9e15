//! Recognized arena options.  Every class accepts the full set and
//! ignores what does not apply to it, so clients can pass e.g. the
//! top-down hint unconditionally and stay portable.
use crate::zone::ZONE_COUNT;

/// Configuration for `Arena::create`.  Zero-valued size fields mean
/// "use the class default".
#[derive(Clone, Debug)]
pub struct ArenaArgs {
    /// Initial reservation size.  The client class ignores this (its
    /// size is the client's memory); the VM class reserves this much.
    pub arena_size: usize,

    /// Growth increment for chunk growth and for the control pool's
    /// spans.  0 picks a class default.
    pub extend_by: usize,

    /// Zone stripes are `1 << zone_shift` bytes.
    pub zone_shift: u32,

    /// Page size of the arena; the unit of tract allocation.  0 picks
    /// the platform page size.  Must be a power of two at least the
    /// platform page size.
    pub alignment: usize,

    /// Hard ceiling on committed bytes.
    pub commit_limit: usize,

    /// Ceiling on committed-but-idle bytes retained after frees.
    pub spare_commit_limit: usize,

    /// Block size for the range-set node pool.  0 sizes it from the
    /// node type.
    pub mfs_unit_size: usize,

    /// How much memory feeds the node pool per extension.  0 means one
    /// arena page.
    pub mfs_extend_by: usize,

    /// Whether the node pool may extend itself through the arena.  The
    /// core pins this to `false` for the range-set pool: that pool is
    /// used *during* allocation and must not recurse.  The knob exists
    /// so the option set stays uniform across classes.
    pub mfs_extend_self: bool,

    /// Reserve address space top-down where the platform supports it;
    /// silently ignored elsewhere.
    pub top_down: bool,
}

/// Default zone shift: 1 MiB stripes.
pub const ZONE_SHIFT_DEFAULT: u32 = 20;

/// Default spare-commit ceiling.
pub const SPARE_COMMIT_LIMIT_DEFAULT: usize = 16 << 20;

impl Default for ArenaArgs {
    fn default() -> ArenaArgs {
        ArenaArgs {
            arena_size: 64 << 20,
            extend_by: 0,
            zone_shift: ZONE_SHIFT_DEFAULT,
            alignment: 0,
            commit_limit: usize::MAX,
            spare_commit_limit: SPARE_COMMIT_LIMIT_DEFAULT,
            mfs_unit_size: 0,
            mfs_extend_by: 0,
            mfs_extend_self: false,
            top_down: false,
        }
    }
}

impl ArenaArgs {
    /// Sanity bounds that hold for any class.
    pub(crate) fn check(&self) -> bool {
        (self.zone_shift as usize) < usize::BITS as usize
            && ZONE_COUNT == 64
            && (self.alignment == 0 || self.alignment.is_power_of_two())
    }
}
