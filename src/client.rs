//! The client-memory arena class: the caller hands over memory it
//! already owns, and the arena subdivides it.  "Committing" is pure
//! accounting, since the memory is resident from the start, but the
//! commit limit, spare retention, and purging behave exactly as they
//! do for the virtual-memory class, so pools cannot tell the
//! difference.
use crate::arena::ArenaState;
use crate::chunk::Chunk;
use crate::class::{ArenaClass, SpareMap};
use crate::config::ArenaArgs;
use crate::error::{Error, Result};
use crate::pool::PoolId;
use crate::range::{align_down, align_up, Range};

/// An arena class over caller-supplied memory.
#[derive(Debug)]
pub struct ClientArena {
    /// The region handed over at construction; the primary chunk is
    /// carved from it.
    region: Range,
    spare: SpareMap,
}

impl ClientArena {
    /// Wraps `[base, base + size)` as arena backing store.
    ///
    /// # Safety
    ///
    /// The memory must be writable and exclusively owned by the arena
    /// until it is destroyed; the arena stores chunk metadata and
    /// range-set nodes inside it.
    pub unsafe fn new(base: *mut u8, size: usize) -> ClientArena {
        ClientArena {
            region: Range::from_size(base as usize, size),
            spare: SpareMap::new(),
        }
    }

    /// Builds a chunk over the aligned interior of `region`.
    fn make_chunk(state: &mut ArenaState, region: Range) -> Result<usize> {
        let alignment = state.alignment();
        let base = align_up(region.base(), alignment);
        let limit = align_down(region.limit(), alignment);
        if base >= limit {
            return Err(Error::Memory);
        }
        if state.overlaps_chunk(Range::new(base, limit)) {
            return Err(Error::Fail);
        }

        let mut chunk = Chunk::new(base, limit, alignment)?;
        state.commit_charge(chunk.metadata_size())?;
        // Client memory is mapped by definition; the tables can be
        // written immediately.
        unsafe { chunk.init_tables() };
        Ok(state.add_chunk(chunk))
    }
}

impl ArenaClass for ClientArena {
    fn init(&mut self, state: &mut ArenaState, args: &ArenaArgs) -> Result<()> {
        // `arena_size` and `top_down` do not apply to client memory;
        // they are accepted and ignored.
        let _ = args;
        ClientArena::make_chunk(state, self.region)?;
        Ok(())
    }

    fn finish(&mut self, state: &mut ArenaState) {
        // The memory goes back to the client untouched.
        while state.chunk_count() > 0 {
            let last = state.chunk_count() - 1;
            self.chunk_finish(state, last);
            state.remove_chunk(last);
        }
    }

    fn extend(&mut self, state: &mut ArenaState, base: usize, size: usize) -> Result<usize> {
        ClientArena::make_chunk(state, Range::from_size(base, size))
    }

    fn pages_mark_allocated(
        &mut self,
        state: &mut ArenaState,
        chunk_index: usize,
        base_index: usize,
        count: usize,
        pool: PoolId,
    ) -> Result<()> {
        let chunk = state.chunk(chunk_index);
        let range = Range::from_size(
            chunk.page_base(base_index),
            count * chunk.page_size(),
        );

        // Charge only what isn't already spare; fail before marking.
        let spare_bytes = self.spare.probe(range);
        state.commit_charge(range.size() - spare_bytes)?;

        let (consumed, _fresh) = self.spare.consume(range);
        debug_assert_eq!(consumed, spare_bytes);
        state.spare_remove(consumed);

        state.chunk_mut(chunk_index).set_pages(base_index, count, pool);
        Ok(())
    }

    fn free(&mut self, state: &mut ArenaState, base: usize, size: usize, pool: PoolId) {
        let _ = pool;
        let chunk_index = state
            .chunk_index_of(base)
            .expect("freed range lies in a chunk");
        let base_index = state.chunk(chunk_index).index_of(base);
        let count = state.chunk(chunk_index).size_to_pages(size);
        state.chunk_mut(chunk_index).clear_pages(base_index, count);

        // Retain what fits under the spare ceiling; release the rest
        // of the charge.
        let alignment = state.alignment();
        let room = align_down(
            state.spare_commit_limit().saturating_sub(state.spare_committed()),
            alignment,
        );
        let retained = self.spare.retain(Range::from_size(base, size), room);
        state.spare_add(retained);
        state.commit_release(size - retained);
    }

    fn purge_spare(&mut self, state: &mut ArenaState, bytes: usize) -> usize {
        let bytes = align_up(bytes, state.alignment());
        let released: usize = self.spare.purge(bytes).iter().map(|r| r.size()).sum();
        state.spare_remove(released);
        state.commit_release(released);
        released
    }

    fn chunk_finish(&mut self, state: &mut ArenaState, chunk_index: usize) {
        let chunk = state.chunk(chunk_index);
        let span = Range::new(chunk.base(), chunk.limit());
        let meta = chunk.metadata_size();

        let dropped = self.spare.remove_within(span);
        state.spare_remove(dropped);
        state.commit_release(dropped);
        state.commit_release(meta);
    }

    fn compact(&mut self, state: &mut ArenaState) {
        state.sweep_empty_chunks(self);
    }

    fn describe(&self, state: &ArenaState, stream: &mut dyn std::fmt::Write) -> std::fmt::Result {
        let _ = state;
        writeln!(
            stream,
            "  client region [{:#x}, {:#x}), spare {}",
            self.region.base(),
            self.region.limit(),
            self.spare.total()
        )
    }
}
