//! Pools are the arena's clients: every allocated tract records the
//! pool that owns it.  The core never looks inside a pool; it only
//! needs a compact identity, so a pool is a `NonZeroU32` id, with id 0
//! left invalid so that zero-filled page descriptors read as free.
use std::num::NonZeroU32;

/// The identity of a pool, as recorded in page descriptors.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId(NonZeroU32);

// Page descriptors hold `Option<PoolId>` in zero-initialised chunk
// metadata, so the niche must make `None` the all-zero pattern.
static_assertions::assert_eq_size!(Option<PoolId>, u32);

/// Owner of chunk metadata pages (page tables, allocation bitmaps).
pub(crate) const POOL_METADATA: PoolId = PoolId(unsafe { NonZeroU32::new_unchecked(1) });

/// Owner of the pages feeding the range-set block pool.
pub(crate) const POOL_BLOCKS: PoolId = PoolId(unsafe { NonZeroU32::new_unchecked(2) });

/// Owner of the embedded control pool's spans.
pub(crate) const POOL_CONTROL: PoolId = PoolId(unsafe { NonZeroU32::new_unchecked(3) });

/// Owner of ranges parked in the reservoir.
pub(crate) const POOL_RESERVOIR: PoolId = PoolId(unsafe { NonZeroU32::new_unchecked(4) });

/// First id handed to client pools by `Arena::make_pool`.
pub(crate) const POOL_FIRST_CLIENT: u32 = 5;

impl PoolId {
    pub(crate) fn from_serial(serial: u32) -> PoolId {
        PoolId(NonZeroU32::new(serial).expect("pool serials start at 1"))
    }

    /// The raw id, e.g. for diagnostics.
    pub fn id(self) -> NonZeroU32 {
        self.0
    }

    /// True for the ids the arena reserves for its own pools.
    pub fn is_internal(self) -> bool {
        self.0.get() < POOL_FIRST_CLIENT
    }
}
