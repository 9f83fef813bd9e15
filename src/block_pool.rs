//! A fixed-size block pool: the range-set indices draw their tree
//! nodes from here.  The pool deliberately cannot extend itself: it
//! is consulted *during* arena allocation, and reaching back into the
//! arena would recurse.  When it runs dry it reports `Limit` and the
//! caller feeds it a page through the bootstrap allocator.
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

use crate::error::{Error, Result};

/// Free blocks are threaded through the blocks themselves.
#[repr(C)]
struct FreeBlock {
    next: *mut FreeBlock,
}

pub(crate) struct BlockPool {
    /// Block size in bytes.  At least a pointer, pointer-aligned.
    unit: usize,
    head: *mut FreeBlock,
    free_blocks: usize,
    total_blocks: usize,
}

impl BlockPool {
    #[requires(unit >= std::mem::size_of::<FreeBlock>())]
    #[requires(unit % std::mem::align_of::<FreeBlock>() == 0)]
    pub fn new(unit: usize) -> BlockPool {
        BlockPool {
            unit,
            head: std::ptr::null_mut(),
            free_blocks: 0,
            total_blocks: 0,
        }
    }

    pub fn free_blocks(&self) -> usize {
        self.free_blocks
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    /// Pops one block.  Never extends the pool: an empty pool is
    /// `Limit`, which the arena resolves with a bootstrap page.
    #[ensures(ret.is_ok() -> self.free_blocks == old(self.free_blocks) - 1)]
    pub fn alloc(&mut self) -> Result<NonNull<u8>> {
        if self.head.is_null() {
            return Err(Error::Limit);
        }

        let block = self.head;
        self.head = unsafe { (*block).next };
        self.free_blocks -= 1;
        Ok(unsafe { NonNull::new_unchecked(block as *mut u8) })
    }

    /// Returns a block obtained from `alloc`.
    #[ensures(self.free_blocks == old(self.free_blocks) + 1)]
    pub fn free(&mut self, block: NonNull<u8>) {
        let block = block.as_ptr() as *mut FreeBlock;

        unsafe { (*block).next = self.head };
        self.head = block;
        self.free_blocks += 1;
    }

    /// Carves `[base, base + size)` into blocks and adds them to the
    /// free list.  A trailing fragment smaller than one unit is
    /// wasted.
    ///
    /// # Safety
    ///
    /// The memory must be committed, writable, pointer-aligned, and
    /// owned by the pool until the arena is destroyed.
    #[requires(base % std::mem::align_of::<FreeBlock>() == 0)]
    pub unsafe fn extend(&mut self, base: usize, size: usize) {
        let count = size / self.unit;

        for i in 0..count {
            let block = (base + i * self.unit) as *mut FreeBlock;
            (*block).next = self.head;
            self.head = block;
        }
        self.free_blocks += count;
        self.total_blocks += count;
    }
}

impl std::fmt::Debug for BlockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BlockPool")
            .field("unit", &self.unit)
            .field("free_blocks", &self.free_blocks)
            .field("total_blocks", &self.total_blocks)
            .finish()
    }
}
