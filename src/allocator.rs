//! The allocator front end (spec §4.4): `allocate`/`release`, the singleton
//! that owns the page store and the arena array, and the safe `GlobalAlloc`
//! surface built on top of them.
//!
//! Grounded on `a3alloc.c`'s `mm_init`/`mm_malloc`/`mm_free`: a thread hashes
//! to one of `P` per-thread arenas plus the one global arena at index `0`
//! (spec §5's lock-ordering rule — thread arena before global arena — falls
//! out of always acquiring the caller's own arena lock before ever touching
//! the global one), huge requests bypass arenas and bitmaps entirely, and
//! `release` re-validates ownership after acquiring both mutexes because the
//! superblock can migrate between the unlocked read of its owner and the
//! locks actually landing.

use std::alloc::{GlobalAlloc, Layout};
use std::sync::atomic::Ordering;
use std::sync::OnceLock;

use crate::arena::{self, Arena};
use crate::error::{HoardError, Result};
use crate::os::PageSupply;
use crate::page_store::PageStore;
use crate::stats;
use crate::superblock::Superblock;
use crate::thread_ident;
use crate::types::{
    class_size, size_class_of, EMPTY_THRESHOLD_FRACTION, EMPTY_THRESHOLD_SUPERBLOCKS,
    MIN_BLOCK_SIZE, SIZE_CLASSES,
};

/// Everything the front end needs: the page store and a contiguous run of
/// `P + 1` arenas (index `0` is global, `1..=P` are per-thread).
///
/// The arena array is laid out on pages obtained directly from the page
/// store rather than a `Vec`/`Box`. This crate is meant to be installed as
/// `#[global_allocator]`; any heap allocation performed while building this
/// very state would call back into `Hoard::alloc` before `CORE` is set,
/// which would either deadlock against `CORE`'s own initialization or read
/// uninitialized memory. Every field built during `init` — `PageSupply`,
/// `PageStore`, `Arena` — is deliberately allocation-free to hold for the
/// same reason.
struct Core {
    page_store: PageStore,
    arenas: *mut Arena,
    num_arenas: usize,
}

unsafe impl Send for Core {}
unsafe impl Sync for Core {}

impl Core {
    fn arena(&self, idx: usize) -> &Arena {
        debug_assert!(idx < self.num_arenas);
        unsafe { &*self.arenas.add(idx) }
    }

    fn global(&self) -> &Arena {
        self.arena(0)
    }

    fn thread_arena(&self) -> &Arena {
        let p = self.num_arenas - 1;
        self.arena(1 + thread_ident::id() % p)
    }

    fn page_size(&self) -> usize {
        self.page_store.page_size()
    }
}

static CORE: OnceLock<Core> = OnceLock::new();

fn build_core() -> Result<Core> {
    let supply = PageSupply::init()?;
    let page_size = supply.page_size();
    let page_store = PageStore::new(supply);

    let num_procs = thread_ident::cpu_count();
    let num_arenas = num_procs + 1;
    let bytes = num_arenas * std::mem::size_of::<Arena>();
    let pages = (bytes + page_size - 1) / page_size;
    let base = page_store.obtain(pages)?;
    let arenas = base as *mut Arena;
    for i in 0..num_arenas {
        unsafe { std::ptr::write(arenas.add(i), Arena::new(i)) };
    }

    Ok(Core {
        page_store,
        arenas,
        num_arenas,
    })
}

/// Explicitly initializes the process-wide allocator state (spec §4.4).
/// Idempotent — a call after the first successful one (explicit or lazy) is
/// a no-op returning `Ok(())`. Calling `allocate`/`release`, or using
/// [`Hoard`] as `#[global_allocator]`, without calling this first triggers
/// the same initialization lazily on first use.
pub fn init() -> Result<()> {
    if CORE.get().is_some() {
        return Ok(());
    }
    let core = build_core()?;
    let _ = CORE.set(core);
    Ok(())
}

/// Per spec §7: failures reaching here (after the process is already
/// running) are unrecoverable, so the lazy path aborts rather than
/// threading a `Result` through `GlobalAlloc`. Eager callers get the
/// recoverable form through [`init`] instead.
fn core() -> &'static Core {
    CORE.get_or_init(|| {
        build_core().unwrap_or_else(|e| {
            log::error!("hoard: failed to initialize: {e}");
            std::process::abort();
        })
    })
}

fn obtain_or_abort(core: &Core, pages: usize) -> *mut u8 {
    match core.page_store.obtain(pages) {
        Ok(p) => p,
        Err(e) => {
            log::error!("hoard: out of address space requesting {} page(s): {}", pages, e);
            std::process::abort();
        }
    }
}

/// Allocates a block of at least `size` bytes, aligned to at least
/// [`MIN_BLOCK_SIZE`]. `size` is clamped up to `1` (a zero-byte request
/// still gets a distinct, freeable address). Never returns a null pointer;
/// an unrecoverable out-of-memory condition aborts the process.
pub fn allocate(size: usize) -> *mut u8 {
    let size = size.max(1);
    let core = core();
    let page_size = core.page_size();

    // Spec §4.4 step 1: the huge/classed split is `page_size / 2`, not the
    // size-class table's own ceiling — they coincide (2048 B) on every
    // mainstream target (4 KiB pages), which is the only page size spec §8's
    // worked scenarios assume.
    let (ptr, committed) = if size > page_size / 2 {
        allocate_huge(core, size, page_size)
    } else {
        allocate_classed(core, size, page_size)
    };
    stats::record_alloc(committed);
    ptr
}

/// Returns the pointer plus the number of bytes actually committed for it
/// (`slot_size`, not the caller's raw `size`), so [`stats::record_alloc`]
/// logs the same unit [`stats::record_free`] later logs for the matching
/// `release` — otherwise the "current live bytes" counter drifts by the
/// rounding slop on every call instead of returning to its pre-call value.
fn allocate_classed(core: &Core, size: usize, page_size: usize) -> (*mut u8, usize) {
    let size_class = size_class_of(size);
    let slot_size = class_size(size_class);
    let arena = core.thread_arena();

    arena.lock.lock();
    unsafe {
        let sb = find_or_create(core, arena, size_class, slot_size, page_size);
        let slots = Superblock::slots_per_page(page_size, slot_size);
        let idx = (*sb)
            .next_free_slot(slots)
            .expect("a superblock returned by find_or_create always has a free slot");
        (*sb).set_bit(idx);
        (*sb).in_use += slot_size;
        arena.state().in_use += slot_size;

        let bin = (*sb).bin_idx as usize;
        arena::move_superblock(arena, None, sb, size_class, bin, slot_size, page_size);
        #[cfg(debug_assertions)]
        debug_assert_invariants(arena, sb, slot_size, page_size);
        (*sb).lock.unlock();
        arena.lock.unlock();
        (Superblock::slot_ptr(sb, idx, slot_size), slot_size)
    }
}

/// Cascade from spec §4.4 step 3: the calling thread's own arena, then the
/// global arena (migrating whatever is found there into the caller's
/// arena), then a freshly mapped page.
///
/// # Safety
/// Caller holds `arena.lock`.
unsafe fn find_or_create(
    core: &Core,
    arena: &Arena,
    size_class: usize,
    slot_size: usize,
    page_size: usize,
) -> *mut Superblock {
    if let Some(sb) = arena::find_from_self(arena, size_class, slot_size, page_size) {
        return sb;
    }

    let global = core.global();
    global.lock.lock();
    let found = arena::find_from_global(global, arena, size_class, slot_size, page_size);
    global.lock.unlock();
    if let Some(sb) = found {
        return sb;
    }

    let base = obtain_or_abort(core, 1);
    let sb = Superblock::init_in_place(base, arena.index, size_class as u8);
    // Spec §9's first open question: the superblock's own mutex is acquired
    // here, before the arena mutex guarding its creation is released below,
    // bypassing the non-blocking-trylock pattern used everywhere else —
    // preserved as-is since a brand-new superblock can have no contender.
    (*sb).lock.lock();
    arena::link_new(arena, size_class, sb);
    log::trace!(
        "arena {}: created superblock {:p} for size class {}",
        arena.index,
        sb,
        size_class
    );
    sb
}

fn allocate_huge(core: &Core, size: usize, page_size: usize) -> (*mut u8, usize) {
    let header = Superblock::header_size();
    let usable_per_page = page_size - header;
    let k = (size + usable_per_page - 1) / usable_per_page;
    let base = obtain_or_abort(core, k);
    unsafe {
        let sb = Superblock::init_in_place(base, 0, 0);
        (*sb).page_count = k;
        log::debug!("hoard: huge allocation of {} bytes over {} page(s) at {:p}", size, k, sb);
        // Matches `release_huge`'s `freed` calculation exactly, so the
        // stats counter that goes up here comes back down by the same
        // amount when this block is released.
        (Superblock::slot_area(sb), k * page_size - header)
    }
}

/// Releases a block previously returned by `allocate`. A null pointer is
/// ignored, matching `free(NULL)`.
pub fn release(p: *mut u8) {
    if p.is_null() {
        return;
    }
    let core = core();
    let page_size = core.page_size();
    let freed = unsafe {
        let sb = Superblock::header_of(p, page_size);
        if Superblock::is_huge(sb) {
            release_huge(core, sb)
        } else {
            release_classed(core, sb, p, page_size)
        }
    };
    stats::record_free(freed);
}

unsafe fn release_huge(core: &Core, sb: *mut Superblock) -> usize {
    let pages = (*sb).page_count;
    let freed = pages * core.page_size() - Superblock::header_size();
    core.page_store.release_huge(sb as *mut u8, pages);
    freed
}

/// Spec §4.4 step 6's retry protocol: `sb`'s owner can change between
/// reading it unlocked and actually acquiring both mutexes, since a
/// concurrent `find_from_global` may migrate this exact superblock in that
/// window. Re-checking after both locks are held and restarting on mismatch
/// keeps the accounting update and the relink atomic with respect to the
/// owner that was actually current.
///
/// # Safety
/// `sb` is a non-huge superblock header recovered from `p`.
unsafe fn release_classed(core: &Core, sb: *mut Superblock, p: *mut u8, page_size: usize) -> usize {
    loop {
        let owner_snapshot = (*sb).owner.load(Ordering::Acquire);
        let arena = core.arena(owner_snapshot);
        arena.lock.lock();
        (*sb).lock.lock();
        if (*sb).owner.load(Ordering::Acquire) != owner_snapshot {
            (*sb).lock.unlock();
            arena.lock.unlock();
            continue;
        }

        let size_class = (*sb).size_class as usize;
        let slot_size = class_size(size_class);
        let idx = Superblock::slot_index_of(sb, p, slot_size);
        (*sb).clear_bit(idx);
        (*sb).in_use -= slot_size;
        arena.state().in_use -= slot_size;

        let bin = (*sb).bin_idx as usize;
        // `to == Some(arena)` (the same arena), not `None`: the system this
        // spec distills forces an unconditional relink on every free, even
        // when the bin hasn't changed, unlike the allocate path's in-place
        // form above.
        arena::move_superblock(arena, Some(arena), sb, size_class, bin, slot_size, page_size);
        #[cfg(debug_assertions)]
        debug_assert_invariants(arena, sb, slot_size, page_size);
        (*sb).lock.unlock();

        let donated_empty = if arena.index != 0 {
            maybe_donate(core, arena, page_size)
        } else {
            None
        };
        arena.lock.unlock();
        if let Some(empty) = donated_empty {
            core.page_store.release_page(empty);
        }
        return slot_size;
    }
}

/// Spec §8's quantified invariants, checked after every public operation in
/// a debug build: a superblock's live-byte count agrees with its bitmap
/// population, its fullness bin agrees with that count, and its owning
/// arena's aggregate counters agree with what its bin lists actually hold.
///
/// # Safety
/// Caller holds `arena.lock` and `sb.lock`.
#[cfg(debug_assertions)]
unsafe fn debug_assert_invariants(arena: &Arena, sb: *mut Superblock, slot_size: usize, page_size: usize) {
    let popcount = (*sb).popcount();
    debug_assert_eq!(
        (*sb).in_use,
        popcount * slot_size,
        "superblock in_use disagrees with its bitmap population"
    );
    let expected_bin = (*sb).fullness_bin(slot_size, page_size) as usize;
    debug_assert_eq!(
        (*sb).bin_idx as usize, expected_bin,
        "superblock bin_idx disagrees with its fullness"
    );
    debug_assert_eq!(
        arena.state().in_use,
        arena.recompute_in_use(),
        "arena in_use disagrees with the sum over its owned superblocks"
    );
    debug_assert_eq!(
        arena.state().pages_allocated,
        arena.recompute_pages_allocated(),
        "arena pages_allocated disagrees with the count of superblocks it owns"
    );
}

/// Spec §4.4 step 7: once a per-thread arena owns more than
/// `EMPTY_THRESHOLD_SUPERBLOCKS` pages while using less than both Hoard
/// thresholds' worth of bytes, it donates a single candidate superblock —
/// wholly empty ones go straight back to the page store, partially-used
/// ones migrate to the global arena where any thread can reach them.
///
/// Returns a wholly-emptied superblock for the caller to push onto the page
/// store once every mutex — including `arena`'s own — has been released
/// (spec §4.4: "release all mutexes ... [then] push it onto the page-store
/// free-list"), rather than pushing it here while `arena.lock` is still
/// held.
///
/// # Safety
/// Caller holds `arena.lock`.
unsafe fn maybe_donate(core: &Core, arena: &Arena, page_size: usize) -> Option<*mut Superblock> {
    let (pages_allocated, bytes_in_use) = {
        let state = arena.state();
        (state.pages_allocated, state.in_use)
    };
    if pages_allocated <= EMPTY_THRESHOLD_SUPERBLOCKS {
        return None;
    }
    // Spec §4.4's first threshold compares `in_use` bytes against a raw
    // page count (`pages_allocated - K`), not a byte quantity — preserved
    // literally, since §8 scenario 4 works the example the same way.
    if bytes_in_use >= pages_allocated - EMPTY_THRESHOLD_SUPERBLOCKS {
        return None;
    }
    let limit = ((1.0 - EMPTY_THRESHOLD_FRACTION) * (pages_allocated * page_size) as f64) as usize;
    if bytes_in_use >= limit {
        return None;
    }

    let global = core.global();
    global.lock.lock();
    let mut donate_empty = None;
    for size_class in 0..SIZE_CLASSES {
        let sb = arena.state().bins[size_class][0];
        if sb.is_null() || !(*sb).lock.try_lock() {
            continue;
        }
        if (*sb).in_use == 0 {
            arena::unlink_empty(arena, size_class, 0, sb);
            (*sb).lock.unlock();
            log::debug!("arena {}: donating empty superblock {:p} to the page store", arena.index, sb);
            donate_empty = Some(sb);
        } else {
            let slot_size = class_size(size_class);
            arena::move_superblock(arena, Some(global), sb, size_class, 0, slot_size, page_size);
            (*sb).owner.store(global.index, Ordering::Release);
            (*sb).lock.unlock();
            log::debug!("arena {}: donated superblock {:p} to the global arena", arena.index, sb);
        }
        break;
    }
    global.lock.unlock();
    donate_empty
}

/// The safe `GlobalAlloc` surface (ambient addition: spec §4.4 describes
/// `allocate`/`release` as the raw operations, not a trait impl). Install
/// with `#[global_allocator] static ALLOC: hoardalloc::Hoard =
/// hoardalloc::Hoard;` after calling [`init`] (or let the first allocation
/// initialize it lazily).
pub struct Hoard;

unsafe impl GlobalAlloc for Hoard {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match try_allocate(layout) {
            Ok(p) => p,
            Err(e) => {
                log::error!("hoard: {}", e);
                std::ptr::null_mut()
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        release(ptr);
    }
}

/// Fallible entry point behind [`Hoard`]: every slot and every huge-block
/// header lands on at least an `MIN_BLOCK_SIZE`-byte boundary by
/// construction (the header's own alignment forces that much), so any
/// `Layout` asking for more is rejected up front instead of silently
/// under-aligning the returned block.
pub fn try_allocate(layout: Layout) -> Result<*mut u8> {
    if layout.align() > MIN_BLOCK_SIZE {
        return Err(HoardError::UnsupportedAlignment {
            requested: layout.align(),
            max_supported: MIN_BLOCK_SIZE,
        });
    }
    Ok(allocate(layout.size()))
}
