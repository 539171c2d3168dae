// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cooperative stack-swap execution contexts.
//!
//! A [`Context`] is a saved machine context plus (optionally) a private
//! [`Stack`] to run on. A scheduler thread swaps into a task's context to
//! run it and the task swaps back to suspend itself; no kernel involvement,
//! no preemption. This is the substrate for task `yield` and handle waits
//! in the scheduler.
//!
//! The switch itself is `swapcontext(3)`; stacks are anonymous mappings
//! with a guard page below the usable region.

pub mod stack;

pub use stack::{MIN_STACK_SIZE, Stack};

use core::ffi::c_int;
use core::fmt;
use core::mem::MaybeUninit;

/// Entry function of a context. Never returns: the entry must end with a
/// final [`Context::swap`] back to its caller's context.
pub type Entry = extern "C" fn(usize) -> !;

/// A saved execution context, either a capture target (created
/// [`empty`][Context::empty], filled by the first swap away from it) or a
/// prepared entry context owning the stack it will run on.
pub struct Context {
    /// Boxed: `ucontext_t` is large and must never move once captured.
    ucp: Box<MaybeUninit<libc::ucontext_t>>,
    stack: Option<Stack>,
}

// === impl Context ===

impl Context {
    /// A context slot to capture the current thread of execution into.
    ///
    /// The contents are meaningless until a [`swap`][Context::swap] away
    /// from it has filled it.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            ucp: Box::new(MaybeUninit::zeroed()),
            stack: None,
        }
    }

    /// Prepares a context that will run `entry(arg)` on `stack` when first
    /// swapped to.
    ///
    /// `entry` must never return; it suspends or finishes by swapping to
    /// another context.
    pub fn with_entry(stack: Stack, entry: Entry, arg: usize) -> std::io::Result<Self> {
        let mut ucp = Box::new(MaybeUninit::<libc::ucontext_t>::zeroed());

        // Safety: getcontext initializes the buffer; uc_stack/uc_link are
        // ours to set before makecontext consumes them.
        unsafe {
            if libc::getcontext(ucp.as_mut_ptr()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            let uc = ucp.as_mut_ptr();
            (*uc).uc_stack.ss_sp = stack.limit().cast();
            (*uc).uc_stack.ss_size = stack.size();
            (*uc).uc_link = core::ptr::null_mut();

            // makecontext passes int arguments only; the entry fn pointer
            // and its pointer-sized argument each travel as two halves.
            let [entry_hi, entry_lo] = split(entry as usize);
            let [arg_hi, arg_lo] = split(arg);
            libc::makecontext(
                uc,
                core::mem::transmute::<TrampolineFn, extern "C" fn()>(entry_trampoline),
                4,
                entry_hi,
                entry_lo,
                arg_hi,
                arg_lo,
            );
        }

        Ok(Self {
            ucp,
            stack: Some(stack),
        })
    }

    /// Suspends the current thread of execution into `from` and continues
    /// `to`. Returns when something swaps back into `from`.
    ///
    /// Raw pointers on purpose: the call does not return until the
    /// context is resumed, so holding borrows across it would alias with
    /// whoever resumes us.
    ///
    /// # Safety
    ///
    /// `to` must point to a prepared entry context that is not currently
    /// running, or a capture target previously filled by a swap away from
    /// it; `from` must be valid to write. Both must stay pinned for as
    /// long as anything may swap to them.
    pub unsafe fn swap(from: *mut Context, to: *const Context) {
        // Safety: validity forwarded to the caller; the inner buffers are
        // boxed and never move.
        let ret = unsafe {
            libc::swapcontext((*from).ucp.as_mut_ptr(), (*to).ucp.as_ptr())
        };
        assert_eq!(ret, 0, "swapcontext failed");
    }

    /// Takes the stack back out of a finished context for reuse.
    pub fn into_stack(mut self) -> Option<Stack> {
        self.stack.take()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("has_stack", &self.stack.is_some())
            .finish()
    }
}

// Safety: a context is only ever *run* by one thread at a time; the
// scheduler moves suspended tasks (and their contexts) between worker
// threads.
unsafe impl Send for Context {}

type TrampolineFn = extern "C" fn(c_int, c_int, c_int, c_int) -> !;

fn split(val: usize) -> [c_int; 2] {
    let val = val as u64;
    let hi = (val >> 32) as u32;
    let lo = (val & 0xffff_ffff) as u32;
    [
        c_int::from_ne_bytes(hi.to_ne_bytes()),
        c_int::from_ne_bytes(lo.to_ne_bytes()),
    ]
}

fn join(hi: c_int, lo: c_int) -> usize {
    let hi = u32::from_ne_bytes(hi.to_ne_bytes()) as u64;
    let lo = u32::from_ne_bytes(lo.to_ne_bytes()) as u64;
    usize::try_from((hi << 32) | lo).expect("pointer does not fit usize")
}

/// Reassembles the split entry fn pointer and argument, then tail-calls the
/// real entry.
extern "C" fn entry_trampoline(entry_hi: c_int, entry_lo: c_int, arg_hi: c_int, arg_lo: c_int) -> ! {
    // Safety: the halves were produced from a valid `Entry` in
    // `Context::with_entry` on this address space.
    let entry = unsafe {
        core::mem::transmute::<usize, Entry>(join(entry_hi, entry_lo))
    };
    entry(join(arg_hi, arg_lo))
}
