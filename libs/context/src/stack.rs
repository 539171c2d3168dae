// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io::Error;
use std::ptr;

/// Minimum usable stack size. Anything smaller is rounded up; contexts
/// entered on tiny stacks fault in libc before user code even runs.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// A stack for an execution context: an anonymous mapping with an
/// inaccessible guard page below the usable region, so an overflow faults
/// instead of silently corrupting adjacent memory.
#[derive(Debug)]
pub struct Stack {
    base: *mut u8,
    mmap_len: usize,
    size: usize,
}

// === impl Stack ===

impl Stack {
    /// Maps a new stack with at least `size` usable bytes.
    pub fn new(size: usize) -> std::io::Result<Self> {
        // Apply minimum stack size.
        let size = size.max(MIN_STACK_SIZE);

        // Add a guard page to the requested size and round the size up to
        // a page boundary.
        let page_size = page_size();
        let size = (size + page_size - 1) & !(page_size - 1);
        let mmap_len = size
            .checked_add(page_size)
            .expect("integer overflow while calculating stack size");

        // Safety: anonymous mapping, no fd, flags are valid.
        unsafe {
            // Reserve address space for guard page + stack.
            let mmap = libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            );
            if mmap == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }

            // Create the result here so that a failing mprotect drops it
            // and unmaps the reservation.
            let out = Self {
                base: mmap.cast::<u8>(),
                mmap_len,
                size,
            };

            // Make everything except the guard page accessible.
            if libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(Error::last_os_error());
            }

            Ok(out)
        }
    }

    /// Lowest accessible byte of the stack (just above the guard page).
    #[must_use]
    pub fn limit(&self) -> *mut u8 {
        // Safety: the guard page is within the mapping.
        unsafe { self.base.add(self.mmap_len - self.size) }
    }

    /// Number of usable bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // Safety: we own the mapping and nothing executes on it anymore.
        let ret = unsafe { libc::munmap(self.base.cast(), self.mmap_len) };
        debug_assert_eq!(ret, 0);
    }
}

// Safety: the mapping is plain memory; ownership moves with the value.
unsafe impl Send for Stack {}

pub(crate) fn page_size() -> usize {
    // Safety: sysconf with a valid name has no preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(n).expect("negative page size")
}
