//! Arenas (spec §3, §4.3): per-thread (and one global, index 0) containers
//! that partition their superblocks by size class and, within each size
//! class, by fullness bin.
//!
//! Grounded directly on `a3alloc.c`'s `heap_t`/`bins` and its
//! `get_superblock_from_heap` / `get_superblock_from_global` /
//! `move_superblock` — the arena mutex there is a `pthread_spinlock_t`
//! locked/unlocked across several calls in sequence, which is exactly what
//! `RawMutex` (see `lock.rs`) is built to support.

use crate::lock::RawMutex;
use crate::superblock::Superblock;
use crate::types::{fullness_bin, FULLNESS_BINS, SIZE_CLASSES};

pub struct Arena {
    pub index: usize,
    pub lock: RawMutex,
    state: std::cell::UnsafeCell<ArenaState>,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

pub struct ArenaState {
    pub in_use: usize,
    pub pages_allocated: usize,
    pub bins: [[*mut Superblock; FULLNESS_BINS]; SIZE_CLASSES],
}

impl Arena {
    pub fn new(index: usize) -> Self {
        Arena {
            index,
            lock: RawMutex::new(),
            state: std::cell::UnsafeCell::new(ArenaState {
                in_use: 0,
                pages_allocated: 0,
                bins: [[std::ptr::null_mut(); FULLNESS_BINS]; SIZE_CLASSES],
            }),
        }
    }

    /// # Safety
    /// Caller must hold `self.lock`.
    pub unsafe fn state(&self) -> &mut ArenaState {
        &mut *self.state.get()
    }

    /// Sum of `in_use` across every superblock this arena owns, recomputed
    /// from the bin lists. Used only by the debug-mode invariant checks in
    /// spec §8, not on any hot path.
    ///
    /// # Safety
    /// Caller must hold `self.lock`.
    #[cfg(debug_assertions)]
    pub unsafe fn recompute_in_use(&self) -> usize {
        let state = self.state();
        let mut total = 0usize;
        for class in state.bins.iter() {
            for &head in class.iter() {
                let mut sb = head;
                while !sb.is_null() {
                    total += (*sb).in_use;
                    sb = (*sb).next;
                }
            }
        }
        total
    }

    /// # Safety
    /// Caller must hold `self.lock`.
    #[cfg(debug_assertions)]
    pub unsafe fn recompute_pages_allocated(&self) -> usize {
        let state = self.state();
        let mut total = 0usize;
        for class in state.bins.iter() {
            for &head in class.iter() {
                let mut sb = head;
                while !sb.is_null() {
                    total += 1;
                    sb = (*sb).next;
                }
            }
        }
        total
    }
}

/// Unlinks `sb` from `bins[size_class][bin]`.
///
/// # Safety
/// Caller holds the arena's lock and `sb` is currently linked at that cell.
unsafe fn unlink(state: &mut ArenaState, size_class: usize, bin: usize, sb: *mut Superblock) {
    let head = &mut state.bins[size_class][bin];
    if *head == sb {
        *head = (*sb).next;
    }
    if !(*sb).prev.is_null() {
        (*(*sb).prev).next = (*sb).next;
    }
    if !(*sb).next.is_null() {
        (*(*sb).next).prev = (*sb).prev;
    }
}

/// Links `sb` at the head of `bins[size_class][bin]`.
///
/// # Safety
/// Caller holds the arena's lock.
unsafe fn link_head(state: &mut ArenaState, size_class: usize, bin: usize, sb: *mut Superblock) {
    (*sb).prev = std::ptr::null_mut();
    (*sb).next = state.bins[size_class][bin];
    if !(*sb).next.is_null() {
        (*(*sb).next).prev = sb;
    }
    state.bins[size_class][bin] = sb;
}

/// The single primitive that relocates a superblock between list cells
/// (spec §4.3). Called with both involved arenas' mutexes already held, plus
/// the superblock's mutex; performs no locking itself.
///
/// `to: None` re-bins `sb` within `from` in place after an allocate changed
/// its occupancy (spec §4.4 step 4). `to: Some(from)` — the same arena,
/// passed explicitly rather than omitted — is the release path's call (spec
/// §4.4 step 6): it forces an unconditional relink even when the bin hasn't
/// changed, mirroring what the system this spec distills does on every free,
/// but (since source and destination are the same arena) moves no
/// accounting. `to: Some(other)` is the true migration case used by
/// `find_from_global` and the under-utilization donation step, and does
/// transfer `in_use`/`pages_allocated`.
///
/// # Safety
/// Caller holds `from`'s lock, `to`'s lock (if distinct from `from`'s), and
/// `sb`'s lock.
pub unsafe fn move_superblock(
    from: &Arena,
    to: Option<&Arena>,
    sb: *mut Superblock,
    size_class: usize,
    old_bin: usize,
    slot_size: usize,
    page_size: usize,
) {
    let same_arena = match to {
        Some(t) => std::ptr::eq(from, t),
        None => true,
    };
    let in_use = (*sb).in_use;
    debug_assert!(in_use <= page_size);

    let is_full = in_use + slot_size > page_size - Superblock::header_size();
    let new_bin = if is_full {
        FULLNESS_BINS - 1
    } else {
        fullness_bin(in_use, page_size)
    };

    if new_bin != old_bin || to.is_some() {
        if same_arena {
            let state = from.state();
            unlink(state, size_class, old_bin, sb);
            (*sb).bin_idx = new_bin as u8;
            link_head(state, size_class, new_bin, sb);
        } else {
            let to_arena = to.unwrap();
            unlink(from.state(), size_class, old_bin, sb);
            (*sb).bin_idx = new_bin as u8;
            link_head(to_arena.state(), size_class, new_bin, sb);
        }
    }

    if !same_arena {
        let to_arena = to.unwrap();
        from.state().in_use -= slot_size;
        to_arena.state().in_use += slot_size;
        from.state().pages_allocated -= 1;
        to_arena.state().pages_allocated += 1;
    }
}

/// Links a freshly created superblock into its owner's all-free bin and
/// accounts for the new page (spec §4.4 step 3).
///
/// # Safety
/// Caller holds `arena.lock`.
pub unsafe fn link_new(arena: &Arena, size_class: usize, sb: *mut Superblock) {
    let state = arena.state();
    link_head(state, size_class, 0, sb);
    state.pages_allocated += 1;
}

/// Removes a wholly-emptied superblock from its owner's bins entirely,
/// without re-linking it anywhere — the under-utilization step uses this
/// when a donation candidate turns out to have no live allocations left at
/// all, in which case the whole page goes straight back to the page store
/// instead of migrating to the global arena for no benefit.
///
/// # Safety
/// Caller holds `arena.lock` and `sb`'s lock; `sb` is linked at
/// `bins[size_class][bin]`.
pub unsafe fn unlink_empty(arena: &Arena, size_class: usize, bin: usize, sb: *mut Superblock) {
    let state = arena.state();
    unlink(state, size_class, bin, sb);
    state.pages_allocated -= 1;
}

/// Walks fullness bins `B-2` down to `0` (skipping the full bin), trying a
/// non-blocking acquisition of each candidate superblock's mutex and
/// re-verifying it is still not full before returning it locked (spec
/// §4.3). Returns `None` if no candidate succeeds.
///
/// # Safety
/// Caller holds `arena.lock`.
pub unsafe fn find_from_self(
    arena: &Arena,
    size_class: usize,
    slot_size: usize,
    page_size: usize,
) -> Option<*mut Superblock> {
    let state = arena.state();
    for bin in (0..=FULLNESS_BINS - 2).rev() {
        let mut sb = state.bins[size_class][bin];
        while !sb.is_null() {
            let next = (*sb).next;
            if (*sb).lock.try_lock() {
                if !(*sb).is_full(slot_size, page_size) {
                    return Some(sb);
                }
                (*sb).lock.unlock();
            }
            sb = next;
        }
    }
    None
}

/// Identical walk over the global arena's lists; on success, additionally
/// migrates the superblock into `target` and overwrites its owner field
/// before returning it locked (spec §4.3).
///
/// # Safety
/// Caller holds `global.lock` and `target.lock`.
pub unsafe fn find_from_global(
    global: &Arena,
    target: &Arena,
    size_class: usize,
    slot_size: usize,
    page_size: usize,
) -> Option<*mut Superblock> {
    let state = global.state();
    for bin in (0..=FULLNESS_BINS - 2).rev() {
        let mut sb = state.bins[size_class][bin];
        while !sb.is_null() {
            let next = (*sb).next;
            if (*sb).lock.try_lock() {
                if !(*sb).is_full(slot_size, page_size) {
                    move_superblock(global, Some(target), sb, size_class, bin, slot_size, page_size);
                    (*sb).owner.store(target.index, std::sync::atomic::Ordering::Release);
                    return Some(sb);
                }
                (*sb).lock.unlock();
            }
            sb = next;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::AlignedPages;

    fn page(owner: usize, size_class: u8) -> (AlignedPages, *mut Superblock) {
        let page = AlignedPages::new(4096);
        let sb = unsafe { Superblock::init_in_place(page.as_ptr(), owner, size_class) };
        (page, sb)
    }

    #[test]
    fn link_head_then_unlink_empties_the_bin() {
        let arena = Arena::new(1);
        let (_mem, sb) = page(1, 0);
        unsafe {
            let state = arena.state();
            link_head(state, 0, 0, sb);
            assert_eq!(state.bins[0][0], sb);
            unlink(state, 0, 0, sb);
            assert!(state.bins[0][0].is_null());
        }
    }

    #[test]
    fn find_from_self_skips_full_superblocks_and_respects_bin_order() {
        let arena = Arena::new(1);
        let page_size = 4096;
        let slot_size = 32;

        let (_mem_a, full_sb) = page(1, 0);
        let (_mem_b, free_sb) = page(1, 0);
        unsafe {
            // Make `full_sb` look completely full by cramming it with
            // `in_use` bytes up to the slot capacity.
            let slots = Superblock::slots_per_page(page_size, slot_size);
            (*full_sb).in_use = slots * slot_size;

            let state = arena.state();
            // Full superblock lands in the topmost non-full bin walked
            // first so the search has to skip past it.
            link_head(state, 0, FULLNESS_BINS - 2, full_sb);
            link_head(state, 0, 0, free_sb);

            let found = find_from_self(&arena, 0, slot_size, page_size).unwrap();
            assert_eq!(found, free_sb);
            (*found).lock.unlock();
        }
    }

    #[test]
    fn move_superblock_transfers_accounting_between_arenas() {
        let donor = Arena::new(1);
        let global = Arena::new(0);
        let page_size = 4096;
        let slot_size = 32;
        let (_mem, sb) = page(1, 0);

        unsafe {
            (*sb).in_use = slot_size;
            {
                let state = donor.state();
                link_head(state, 0, 0, sb);
                state.in_use = slot_size;
                state.pages_allocated = 1;
            }

            move_superblock(&donor, Some(&global), sb, 0, 0, slot_size, page_size);

            assert_eq!(donor.state().in_use, 0);
            assert_eq!(donor.state().pages_allocated, 0);
            assert_eq!(global.state().in_use, slot_size);
            assert_eq!(global.state().pages_allocated, 1);
            assert_eq!(global.state().bins[0][0], sb);
        }
    }
}
