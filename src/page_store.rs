//! The page store (spec §4.1): a process-wide reservoir of page-sized,
//! page-aligned regions, guarded by a single mutex that is a lock-order leaf
//! (spec §5 rule 1 — no other mutex may be acquired while this one is held).

use std::sync::Mutex;

use crate::error::Result;
use crate::os::PageSupply;
use crate::superblock::Superblock;

struct PageStoreInner {
    /// Singly-linked free-list of reclaimed, wholly-empty single pages,
    /// threaded through the header's own `next` field (spec §4.1). A huge
    /// allocation spans more than one page and a free-list entry can only
    /// describe one, so releasing a huge block instead unmaps it directly
    /// (see `release_huge`) rather than caching it here.
    free_list: *mut Superblock,
}

unsafe impl Send for PageStoreInner {}

pub struct PageStore {
    supply: PageSupply,
    inner: Mutex<PageStoreInner>,
}

impl PageStore {
    pub fn new(supply: PageSupply) -> Self {
        PageStore {
            supply,
            inner: Mutex::new(PageStoreInner {
                free_list: std::ptr::null_mut(),
            }),
        }
    }

    pub fn page_size(&self) -> usize {
        self.supply.page_size()
    }

    pub fn log_page_size(&self) -> u32 {
        self.supply.log_page_size()
    }

    /// `obtain(1)` first pops a reclaimed empty superblock off the
    /// free-list; `obtain(k > 1)` always goes to the page-supply primitive,
    /// since huge blocks are not recycled from the free-list (spec §4.1).
    ///
    /// Held across the fallback `PageSupply::grow` call too, not just the
    /// free-list check: spec §4.1 says "all operations execute under the
    /// page-store mutex", and spec §6 requires calls to the page-supply
    /// primitive to be serialized by the core.
    pub fn obtain(&self, pages: usize) -> Result<*mut u8> {
        debug_assert!(pages > 0);
        let mut inner = self.inner.lock().unwrap();
        if pages == 1 && !inner.free_list.is_null() {
            let sb = inner.free_list;
            unsafe {
                inner.free_list = (*sb).next;
            }
            log::debug!("page store: reused cached page at {:p}", sb);
            return Ok(sb as *mut u8);
        }
        let base = self.supply.grow(pages)?;
        log::debug!("page store: mapped {} fresh page(s) at {:p}", pages, base);
        Ok(base)
    }

    /// Pushes a page-sized, wholly-empty superblock onto the free-list
    /// instead of returning it to the OS (spec §3's lifecycle note).
    pub fn release_page(&self, sb: *mut Superblock) {
        let mut inner = self.inner.lock().unwrap();
        unsafe {
            (*sb).next = inner.free_list;
            (*sb).prev = std::ptr::null_mut();
        }
        inner.free_list = sb;
        log::debug!("page store: cached empty page at {:p}", sb);
    }

    /// Pushes each of a huge allocation's `pages` constituent pages onto the
    /// free-list individually, as if each were an ordinary reclaimed empty
    /// superblock (spec §3's lifecycle note, §4.4, §8 scenario 5) — a huge
    /// block is never unmapped back to the OS on release, exactly like a
    /// normal one.
    pub fn release_huge(&self, base: *mut u8, pages: usize) {
        debug_assert!(pages > 0);
        let page_size = self.supply.page_size();
        let mut inner = self.inner.lock().unwrap();
        for i in 0..pages {
            let sb = unsafe { base.add(i * page_size) } as *mut Superblock;
            unsafe {
                (*sb).next = inner.free_list;
                (*sb).prev = std::ptr::null_mut();
            }
            inner.free_list = sb;
        }
        log::debug!("page store: cached {} huge page(s) starting at {:p}", pages, base);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::superblock::Superblock;

    #[test]
    fn obtain_one_then_release_recycles_the_same_page() {
        let store = PageStore::new(PageSupply::init().unwrap());
        let page_size = store.page_size();
        let base = store.obtain(1).unwrap();
        let sb = unsafe { Superblock::init_in_place(base, 0, 0) };
        store.release_page(sb);
        let reused = store.obtain(1).unwrap();
        assert_eq!(reused, base);
        assert_eq!(reused as usize % page_size, 0);
    }

    #[test]
    fn obtain_many_bypasses_the_free_list() {
        let store = PageStore::new(PageSupply::init().unwrap());
        let base = store.obtain(1).unwrap();
        let sb = unsafe { Superblock::init_in_place(base, 0, 0) };
        store.release_page(sb);
        // A huge request for >1 page must not be satisfied by the cached
        // single empty page.
        let huge = store.obtain(3).unwrap();
        assert_ne!(huge, base);
    }
}
