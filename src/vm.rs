//! The virtual-memory arena class: address space is reserved with
//! `mmap(PROT_NONE)`, committed with `mprotect`, and decommitted by
//! remapping.  Reservations are over-sized and the slop trimmed so the
//! chunk base lands on the arena alignment even when it exceeds the
//! platform page size.
use crate::arena::ArenaState;
use crate::chunk::Chunk;
use crate::class::{ArenaClass, SpareMap};
use crate::config::ArenaArgs;
use crate::error::{Error, Result};
use crate::pool::PoolId;
use crate::range::{align_down, align_up, Range};

#[cfg(target_os = "linux")]
const NORESERVE: libc::c_int = libc::MAP_NORESERVE;
#[cfg(not(target_os = "linux"))]
const NORESERVE: libc::c_int = 0;

fn reserve_region(size: usize) -> Result<usize> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | NORESERVE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::Resource);
    }
    Ok(ptr as usize)
}

fn release_region(base: usize, size: usize) {
    if size == 0 {
        return;
    }
    let ret = unsafe { libc::munmap(base as *mut libc::c_void, size) };
    debug_assert_eq!(ret, 0, "munmap of our own region failed");
}

fn commit_region(base: usize, size: usize) -> Result<()> {
    if size == 0 {
        return Ok(());
    }
    let ret = unsafe {
        libc::mprotect(
            base as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
    if ret != 0 {
        return Err(Error::Resource);
    }
    Ok(())
}

/// Drops the backing pages and restores the no-access reservation.
fn decommit_region(base: usize, size: usize) {
    if size == 0 {
        return;
    }
    let ptr = unsafe {
        libc::mmap(
            base as *mut libc::c_void,
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED | NORESERVE,
            -1,
            0,
        )
    };
    debug_assert!(ptr != libc::MAP_FAILED, "remap of our own region failed");
}

/// An arena class over anonymous virtual memory.
#[derive(Debug, Default)]
pub struct VmArena {
    /// Growth increment for `grow`, set from the args.
    extend_by: usize,
    spare: SpareMap,
    /// One entry per chunk, exactly the chunk's `[base, limit)`.
    mappings: Vec<Range>,
}

impl VmArena {
    pub fn new() -> VmArena {
        Default::default()
    }

    /// Reserves `bytes` of aligned address space and registers it as a
    /// chunk.
    fn reserve_chunk(&mut self, state: &mut ArenaState, bytes: usize) -> Result<usize> {
        let alignment = state.alignment();
        let bytes = align_up(bytes, alignment);

        // Over-reserve by one alignment unit, then trim the slop.
        let want = bytes + alignment;
        let raw = reserve_region(want)?;
        let base = align_up(raw, alignment);
        let limit = base + bytes;
        release_region(raw, base - raw);
        release_region(limit, raw + want - limit);

        let mut chunk = match Chunk::new(base, limit, alignment) {
            Ok(chunk) => chunk,
            Err(e) => {
                release_region(base, bytes);
                return Err(e);
            }
        };

        if let Err(e) = commit_region(base, chunk.metadata_size()) {
            release_region(base, bytes);
            return Err(e);
        }
        if let Err(e) = state.commit_charge(chunk.metadata_size()) {
            release_region(base, bytes);
            return Err(e);
        }
        unsafe { chunk.init_tables() };

        self.mappings.push(Range::new(base, limit));
        Ok(state.add_chunk(chunk))
    }

    /// Smallest chunk size whose allocatable span holds `size` bytes.
    fn chunk_size_for(size: usize, alignment: usize) -> usize {
        // First guess: the size plus a metadata estimate, then adjust.
        let mut bytes = align_up(size + size / 128 + 2 * alignment, alignment);
        loop {
            match Chunk::new(0, bytes, alignment) {
                Ok(c) if c.alloc_range().size() >= size => return bytes,
                _ => bytes += alignment,
            }
        }
    }

    fn forget_mapping(&mut self, span: Range) {
        if let Some(i) = self.mappings.iter().position(|m| *m == span) {
            self.mappings.swap_remove(i);
        }
    }
}

impl ArenaClass for VmArena {
    fn init(&mut self, state: &mut ArenaState, args: &ArenaArgs) -> Result<()> {
        // The top-down hint only matters on platforms whose VM
        // interface can honour it; mmap picks the placement here, so
        // the hint is accepted and ignored.
        self.extend_by = if args.extend_by == 0 {
            args.arena_size
        } else {
            args.extend_by
        };

        self.reserve_chunk(state, args.arena_size.max(4 * state.alignment()))?;
        Ok(())
    }

    fn finish(&mut self, state: &mut ArenaState) {
        while state.chunk_count() > 0 {
            state.remove_chunk(state.chunk_count() - 1);
        }
        for m in self.mappings.drain(..) {
            release_region(m.base(), m.size());
        }
    }

    fn grow(&mut self, state: &mut ArenaState, pref: &crate::pref::Placement, size: usize) -> Result<usize> {
        // mmap chooses the address, so zone preferences cannot steer
        // the reservation; the policy re-searches the new span anyway.
        let _ = pref;
        let bytes = VmArena::chunk_size_for(size, state.alignment()).max(self.extend_by);
        self.reserve_chunk(state, bytes)
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
        let range = Range::from_size(chunk.page_base(base_index), count * chunk.page_size());

        let spare_bytes = self.spare.probe(range);
        state.commit_charge(range.size() - spare_bytes)?;

        let (consumed, fresh) = self.spare.consume(range);
        debug_assert_eq!(consumed, spare_bytes);

        // Commit the parts that weren't already resident.
        for (i, r) in fresh.iter().enumerate() {
            if let Err(e) = commit_region(r.base(), r.size()) {
                for done in &fresh[..i] {
                    decommit_region(done.base(), done.size());
                }
                state.commit_release(range.size() - spare_bytes);
                // Re-file the consumed spare parts: the gaps between
                // the fresh sub-ranges.
                let mut at = range.base();
                let mut readded = 0;
                for f in fresh.iter().chain(std::iter::once(&Range::new(
                    range.limit(),
                    range.limit(),
                ))) {
                    if at < f.base() {
                        let r = Range::new(at, f.base());
                        readded += self.spare.retain(r, r.size());
                    }
                    at = f.limit();
                }
                debug_assert_eq!(readded, consumed);
                return Err(e);
            }
        }
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

        let alignment = state.alignment();
        let room = align_down(
            state.spare_commit_limit().saturating_sub(state.spare_committed()),
            alignment,
        );
        let retained = self.spare.retain(Range::from_size(base, size), room);
        state.spare_add(retained);

        let rest = size - retained;
        if rest > 0 {
            decommit_region(base + retained, rest);
            state.commit_release(rest);
        }
    }

    fn purge_spare(&mut self, state: &mut ArenaState, bytes: usize) -> usize {
        let bytes = align_up(bytes, state.alignment());
        let mut released = 0;

        for r in self.spare.purge(bytes) {
            decommit_region(r.base(), r.size());
            released += r.size();
        }
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

        self.forget_mapping(span);
        release_region(span.base(), span.size());
    }

    fn compact(&mut self, state: &mut ArenaState) {
        state.sweep_empty_chunks(self);
    }

    fn describe(&self, state: &ArenaState, stream: &mut dyn std::fmt::Write) -> std::fmt::Result {
        let _ = state;
        writeln!(
            stream,
            "  vm mappings {}, spare {}",
            self.mappings.len(),
            self.spare.total()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::pref::Placement;
    use crate::sys;

    fn vm_args() -> ArenaArgs {
        ArenaArgs {
            arena_size: 4 << 20,
            alignment: sys::page_size(),
            zone_shift: 18,
            ..Default::default()
        }
    }

    #[test]
    fn smoke_test() {
        let mut arena =
            Arena::create(Box::new(VmArena::new()), &vm_args()).expect("arena should build");
        let pool = arena.make_pool();
        let page = arena.alignment();

        let base = arena
            .alloc(&Placement::default(), page, pool, false)
            .expect("should allocate");

        // The committed page must be writable and zeroed.
        unsafe {
            assert_eq!(std::ptr::read(base as *const u8), 0);
            std::ptr::write_bytes(base as *mut u8, 42, page);
        }

        arena.free(base, page, pool);
        arena.check_rep();
        arena.destroy();
    }

    #[test]
    fn grow_adds_a_chunk() {
        let mut arena =
            Arena::create(Box::new(VmArena::new()), &vm_args()).expect("arena should build");
        let pool = arena.make_pool();

        // Far larger than the primary chunk: Plan C must reserve more.
        let big = 16 << 20;
        let base = arena
            .alloc(&Placement::default(), big, pool, false)
            .expect("growth should satisfy this");
        unsafe { std::ptr::write_bytes(base as *mut u8, 1, big) };

        arena.free(base, big, pool);
        arena.check_rep();
        arena.compact();
        arena.check_rep();
        arena.destroy();
    }
}
