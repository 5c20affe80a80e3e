//! Thread-identity and CPU-count collaborators (spec §6, out of THE CORE).
//!
//! The teacher's `internal::thread_id()` reads a TLS register directly via
//! inline asm, specialized per architecture, to avoid the cost of a real TLS
//! lookup. That specialization buys nothing once `std::thread_local!` exists
//! (it is itself backed by the same TLS register on these targets), so here
//! it is generalized to a portable counter cached per-thread — the part of
//! the teacher's design worth keeping is the *caching*, which spec §9 calls
//! out explicitly ("cache the computed hash in the TLS block" /
//! "[`tls_hash`]"), not the asm.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_ID: Cell<Option<usize>> = Cell::new(None);
}

/// A small integer, stable for the lifetime of the calling OS thread, unique
/// among currently-live threads' ids modulo reuse after a thread exits.
pub fn id() -> usize {
    THREAD_ID.with(|cell| {
        if let Some(id) = cell.get() {
            return id;
        }
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        cell.set(Some(id));
        id
    })
}

/// Number of processors visible to this process. Always positive.
pub fn cpu_count() -> usize {
    platform::cpu_count().max(1)
}

#[cfg(not(windows))]
mod platform {
    pub fn cpu_count() -> usize {
        let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if n > 0 {
            n as usize
        } else {
            1
        }
    }
}

#[cfg(windows)]
mod platform {
    pub fn cpu_count() -> usize {
        unsafe {
            let mut si = std::mem::zeroed();
            winapi::um::sysinfoapi::GetSystemInfo(&mut si);
            si.dwNumberOfProcessors.max(1) as usize
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn id_is_stable_within_a_thread() {
        assert_eq!(id(), id());
    }

    #[test]
    fn ids_are_distinct_across_threads() {
        let ids: Vec<usize> = (0..8)
            .map(|_| thread::spawn(id).join().unwrap())
            .collect();
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn cpu_count_is_positive() {
        assert!(cpu_count() >= 1);
    }
}
