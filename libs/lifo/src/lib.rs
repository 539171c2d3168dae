// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A lock-free [intrusive] LIFO stack (a [Treiber stack]) used as the
//! freelist primitive throughout the runtime: RMA handles, task descriptors
//! and task stacks are all pooled through this type.
//!
//! The head stores a 16-bit modification counter next to the node pointer
//! and every successful `push`/`pop` bumps it, so a compare-and-swap that
//! observes a stale head loses even when the same node address has been
//! re-pushed in the meantime (the ABA problem). On 64-bit targets counter
//! and pointer share one atomic word, using the address bits a userspace
//! virtual address never sets; elsewhere the head degrades to a
//! mutex-guarded pointer with identical semantics.
//!
//! [intrusive]: https://www.boost.org/doc/libs/release/doc/html/intrusive.html
//! [Treiber stack]: https://en.wikipedia.org/wiki/Treiber_stack

mod loom;

use crate::loom::UnsafeCell;
use core::fmt;
use core::marker::{PhantomData, PhantomPinned};
use core::ptr::NonNull;

/// Trait implemented by types which can be members of an intrusive LIFO
/// stack.
///
/// In order to be part of the stack, a type must contain a [`Links`] member
/// that stores the pointer to the next node.
///
/// # Safety
///
/// This is unsafe to implement because it's the implementation's
/// responsibility to ensure that types implementing this trait are valid
/// intrusive collection nodes. In particular:
///
/// - Implementations **must** ensure that implementors are pinned in memory
///   while they are in an intrusive collection. While a given `Linked` type
///   is in an intrusive data structure, it may not be deallocated or moved
///   to a different memory location.
/// - The type implementing this trait **must not** implement [`Unpin`].
pub unsafe trait Linked {
    /// The handle owning nodes in the stack.
    ///
    /// This type must have ownership over a `Self`-typed value. When a
    /// `Handle` is dropped, it should drop the corresponding `Linked` type.
    /// A quintessential example of a `Handle` is `Box`.
    type Handle;

    /// Convert a [`Self::Handle`] to a raw pointer to `Self`, taking
    /// ownership of it in the process.
    fn into_ptr(r: Self::Handle) -> NonNull<Self>;

    /// Convert a raw pointer back into an owning [`Self::Handle`].
    ///
    /// # Safety
    ///
    /// `ptr` must point to a valid instance of `Self` that was produced by
    /// [`Self::into_ptr`] and has not been reclaimed since.
    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle;

    /// Return the [`Links`] of the node pointed to by `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a valid instance of `Self`.
    unsafe fn links(ptr: NonNull<Self>) -> NonNull<Links<Self>>
    where
        Self: Sized;
}

/// Links to the next node in the stack, to be embedded in a [`Linked`]
/// member type.
pub struct Links<T> {
    next: UnsafeCell<Option<NonNull<T>>>,
    /// Linked list nodes must never be `Unpin`.
    _unpin: PhantomPinned,
}

/// An intrusive LIFO stack of `T`s.
///
/// The stack owns the [`Linked::Handle`]s pushed onto it; dropping the
/// stack pops and releases every remaining node.
pub struct Stack<T: Linked> {
    head: Head<T>,
    _owns: PhantomData<fn(T)>,
}

// === impl Links ===

impl<T> Links<T> {
    #[cfg(not(loom))]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: UnsafeCell::new(None),
            _unpin: PhantomPinned,
        }
    }

    #[cfg(loom)]
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: UnsafeCell::new(None),
            _unpin: PhantomPinned,
        }
    }
}

impl<T> Default for Links<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Links<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Links { .. }")
    }
}

// Safety: a `Links` is only ever accessed by the thread that currently owns
// the node (by having popped it, or by holding the head CAS protocol).
unsafe impl<T: Send> Send for Links<T> {}
// Safety: see above.
unsafe impl<T: Send> Sync for Links<T> {}

cfg_if::cfg_if! {
    if #[cfg(any(loom, target_pointer_width = "64"))] {
        use crate::loom::{AtomicUsize, Ordering};
        use crossbeam_utils::CachePadded;

        /// Number of low bits actually used by userspace virtual addresses.
        /// Current 64-bit hardware leaves the top 16 bits clear for
        /// canonical user pointers, which is where the ABA tag lives.
        const TAG_SHIFT: u32 = 48;
        const TAG_ONE: usize = 1 << TAG_SHIFT;
        const PTR_MASK: usize = TAG_ONE - 1;

        struct Head<T> {
            word: CachePadded<AtomicUsize>,
            _p: PhantomData<*mut T>,
        }

        impl<T: Linked> Head<T> {
            #[cfg(not(loom))]
            const fn new() -> Self {
                Self {
                    word: CachePadded::new(AtomicUsize::new(0)),
                    _p: PhantomData,
                }
            }

            #[cfg(loom)]
            fn new() -> Self {
                Self {
                    word: CachePadded::new(AtomicUsize::new(0)),
                    _p: PhantomData,
                }
            }

            fn push(&self, node: NonNull<T>) {
                debug_assert_eq!(
                    node.as_ptr() as usize & !PTR_MASK,
                    0,
                    "node address must fit in {TAG_SHIFT} bits"
                );
                let mut old = self.word.load(Ordering::Relaxed);
                loop {
                    let next = NonNull::new((old & PTR_MASK) as *mut T);
                    // Safety: until the CAS below succeeds nobody else can
                    // observe `node`; afterwards the node belongs to the
                    // stack and `next` is frozen.
                    unsafe {
                        T::links(node).as_ref().next.with_mut(|p| *p = next);
                    }
                    let new = bump_tag(old) | node.as_ptr() as usize;
                    match self.word.compare_exchange_weak(
                        old,
                        new,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => return,
                        Err(cur) => old = cur,
                    }
                }
            }

            fn pop(&self) -> Option<NonNull<T>> {
                let mut old = self.word.load(Ordering::Acquire);
                loop {
                    let node = NonNull::new((old & PTR_MASK) as *mut T)?;
                    // Safety: `node` was the head when we loaded `old`. A
                    // concurrent pop may race us to it, in which case the
                    // CAS below fails because the tag advanced; the read of
                    // `next` may then be stale but is never dereferenced.
                    // (Nodes are handed back to freelists, never freed to
                    // the OS while the stack is live.)
                    let next = unsafe {
                        T::links(node).as_ref().next.with(|p| *p)
                    };
                    let next_bits = next.map_or(0, |n| n.as_ptr() as usize);
                    let new = bump_tag(old) | next_bits;
                    match self.word.compare_exchange_weak(
                        old,
                        new,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return Some(node),
                        Err(cur) => old = cur,
                    }
                }
            }

            fn is_empty(&self) -> bool {
                self.word.load(Ordering::Acquire) & PTR_MASK == 0
            }
        }

        #[inline]
        fn bump_tag(word: usize) -> usize {
            word.wrapping_add(TAG_ONE) & !PTR_MASK
        }
    } else {
        use crate::loom::Mutex;

        // No tag headroom in a 32-bit word; a mutex-guarded head gives the
        // same LIFO semantics without the lock-free progress guarantee.
        struct Head<T> {
            node: Mutex<Option<NonNull<T>>>,
        }

        impl<T: Linked> Head<T> {
            const fn new() -> Self {
                Self { node: Mutex::new(None) }
            }

            fn push(&self, node: NonNull<T>) {
                let mut head = self.node.lock().unwrap();
                // Safety: we hold the head lock, nobody else can observe
                // `node` until it is published below.
                unsafe {
                    T::links(node).as_ref().next.with_mut(|p| *p = *head);
                }
                *head = Some(node);
            }

            fn pop(&self) -> Option<NonNull<T>> {
                let mut head = self.node.lock().unwrap();
                let node = (*head)?;
                // Safety: we hold the head lock and `node` is on the stack.
                *head = unsafe { T::links(node).as_ref().next.with(|p| *p) };
                Some(node)
            }

            fn is_empty(&self) -> bool {
                self.node.lock().unwrap().is_none()
            }
        }
    }
}

// === impl Stack ===

impl<T: Linked> Stack<T> {
    #[cfg(not(loom))]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: Head::new(),
            _owns: PhantomData,
        }
    }

    #[cfg(loom)]
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: Head::new(),
            _owns: PhantomData,
        }
    }

    /// Push `element` onto the stack, taking ownership of it.
    pub fn push(&self, element: T::Handle) {
        self.head.push(T::into_ptr(element));
    }

    /// Pop the most recently pushed element, or `None` if the stack is
    /// empty.
    pub fn pop(&self) -> Option<T::Handle> {
        // Safety: the node was pushed via `into_ptr` and the successful CAS
        // in `Head::pop` transferred ownership back to us.
        self.head.pop().map(|node| unsafe { T::from_ptr(node) })
    }

    /// Returns `true` if no element is currently on the stack.
    ///
    /// The answer may be outdated as soon as it is produced; it is reliable
    /// only once concurrent pushers and poppers have quiesced.
    pub fn is_empty(&self) -> bool {
        self.head.is_empty()
    }

    /// Pop and drop nodes until the stack is empty.
    pub fn drain(&self) {
        while let Some(handle) = self.pop() {
            drop(handle);
        }
    }
}

impl<T: Linked> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Linked> Drop for Stack<T> {
    fn drop(&mut self) {
        self.drain();
    }
}

impl<T: Linked> fmt::Debug for Stack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stack")
            .field("is_empty", &self.is_empty())
            .finish()
    }
}

// Safety: the stack owns its nodes; moving it between threads moves the
// owned handles with it.
unsafe impl<T: Linked> Send for Stack<T> where T::Handle: Send {}
// Safety: push/pop synchronize through the head CAS (or head lock).
unsafe impl<T: Linked> Sync for Stack<T> where T::Handle: Send {}


#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use ::loom::sync::Arc;
    use ::loom::thread;
    use std::collections::BTreeSet;

    #[derive(Debug)]
    struct Entry {
        links: Links<Entry>,
        val: i32,
    }

    unsafe impl Linked for Entry {
        type Handle = Box<Entry>;

        fn into_ptr(handle: Box<Entry>) -> NonNull<Entry> {
            NonNull::from(Box::leak(handle))
        }

        unsafe fn from_ptr(ptr: NonNull<Entry>) -> Box<Entry> {
            // Safety: forwarded to the caller.
            unsafe { Box::from_raw(ptr.as_ptr()) }
        }

        unsafe fn links(ptr: NonNull<Entry>) -> NonNull<Links<Entry>> {
            // Safety: field projection within the allocation.
            unsafe { NonNull::new_unchecked(&raw mut (*ptr.as_ptr()).links) }
        }
    }

    #[test]
    fn racing_pushers() {
        loom::model(|| {
            let stack = Arc::new(Stack::<Entry>::new());

            let threads: Vec<_> = (0..2)
                .map(|t| {
                    let stack = stack.clone();
                    thread::spawn(move || {
                        stack.push(Box::new(Entry {
                            links: Links::new(),
                            val: t,
                        }));
                    })
                })
                .collect();
            for t in threads {
                t.join().unwrap();
            }

            let mut seen = BTreeSet::new();
            while let Some(e) = stack.pop() {
                seen.insert(e.val);
            }
            assert_eq!(seen, BTreeSet::from([0, 1]));
        });
    }

    #[test]
    fn racing_push_and_pop() {
        loom::model(|| {
            let stack = Arc::new(Stack::<Entry>::new());
            stack.push(Box::new(Entry {
                links: Links::new(),
                val: 0,
            }));

            let pusher = {
                let stack = stack.clone();
                thread::spawn(move || {
                    stack.push(Box::new(Entry {
                        links: Links::new(),
                        val: 1,
                    }));
                })
            };
            let popped = stack.pop().map(|e| e.val);
            pusher.join().unwrap();

            assert!(matches!(popped, Some(0 | 1)));
        });
    }
}
