//! The page-supply primitive (spec §6, external collaborator).
//!
//! Grows the process's address space by whole, page-aligned regions and
//! reports the system's page size. Mirrors the teacher's `os.rs`: the same
//! split between a unix path (`libc::mmap`) and a Windows path
//! (`VirtualAlloc`), but safe-surfaced and `Result`-returning instead of
//! returning null on failure, since the core needs a real error to log and
//! abort on (spec §7) rather than a sentinel to check by hand.
//!
//! `init()` queries the page size once; every other call treats it as fixed
//! for the process lifetime, which is what the OS guarantees. Growth is
//! one-directional: spec §4.1/§4.4 reclaim empty pages into the page
//! store's own free-list rather than unmapping them back to the OS (see
//! `page_store.rs`), so this collaborator exposes no shrink/unmap
//! operation — there is no path in the core that would ever call one.

use std::io;

use crate::error::{HoardError, Result};

fn align_up(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}

/// A handle onto the OS's page-supply primitive. Carries no mutable state of
/// its own beyond the page size queried at construction; the core is what
/// serializes calls to `grow` (via the page-store mutex, spec §4.1).
pub struct PageSupply {
    page_size: usize,
    log_page_size: u32,
}

impl PageSupply {
    /// Queries the OS page size. The only fallible step in `init()` per spec
    /// §7: on failure the caller surfaces a negative status with no partial
    /// state constructed.
    pub fn init() -> Result<Self> {
        let page_size = platform::query_page_size().map_err(HoardError::Init)?;
        debug_assert!(page_size.is_power_of_two());
        Ok(PageSupply {
            page_size,
            log_page_size: page_size.trailing_zeros(),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn log_page_size(&self) -> u32 {
        self.log_page_size
    }

    /// Grows the process image by `n_pages` contiguous, page-aligned,
    /// zero-committed pages and returns the new base address.
    ///
    /// Per spec §7, failure here is not recoverable: the allocator aborts
    /// the process after logging a diagnostic. This method still returns a
    /// `Result` rather than aborting itself so the one call site (huge and
    /// superblock-creation paths in the front-end) controls exactly where
    /// the diagnostic is logged and the abort happens.
    pub fn grow(&self, n_pages: usize) -> Result<*mut u8> {
        debug_assert!(n_pages > 0);
        let size = align_up(n_pages * self.page_size, self.page_size);
        platform::map_pages(size).map_err(HoardError::Init)
    }
}

#[cfg(not(windows))]
mod platform {
    use std::io;
    use std::ptr::null_mut;

    use libc::{mmap, sysconf, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE, _SC_PAGESIZE};

    pub fn query_page_size() -> io::Result<usize> {
        let result = unsafe { sysconf(_SC_PAGESIZE) };
        if result <= 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(result as usize)
    }

    pub fn map_pages(size: usize) -> io::Result<*mut u8> {
        let p = unsafe {
            mmap(
                null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if p == MAP_FAILED {
            log::error!("mmap failed for {} bytes: {}", size, errno::errno());
            return Err(io::Error::last_os_error());
        }
        Ok(p as *mut u8)
    }
}

#[cfg(windows)]
mod platform {
    use std::io;
    use std::ptr::null_mut;

    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::sysinfoapi::GetSystemInfo;
    use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};

    pub fn query_page_size() -> io::Result<usize> {
        unsafe {
            let mut si = std::mem::zeroed();
            GetSystemInfo(&mut si);
            Ok(si.dwPageSize as usize)
        }
    }

    pub fn map_pages(size: usize) -> io::Result<*mut u8> {
        let p = unsafe { VirtualAlloc(null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE) };
        if p.is_null() {
            log::error!("VirtualAlloc failed for {} bytes", size);
            return Err(io::Error::last_os_error());
        }
        Ok(p as *mut u8)
    }
}
