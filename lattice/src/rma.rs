// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! One-sided GET/PUT.
//!
//! Completion is two-staged: *local* completion means the caller's buffer
//! is reusable, *remote* completion means the target memory reflects the
//! transfer for everyone. Plain `get`/`put` promise neither on return
//! (force them with [`flush`]); the `*_blocking` variants promise both;
//! handles let the caller overlap transfers and wait later.
//!
//! When the target unit's segment base is directly addressable (a
//! shared-memory window), a transfer degenerates to a `memcpy` and
//! completes on the spot; otherwise it is dispatched to the driver.
//! Handles come from a lock-free freelist and return to it when waited
//! on.
//!
//! [`flush`]: Runtime::rma_flush

use crate::error::{ErrorCode, Result};
use crate::gptr::{GlobalPtr, GptrFlags};
use crate::runtime::Runtime;
use crate::team::TeamId;
use crate::transport::{Completion, WinId};
use crate::unit::TeamUnit;
use core::cell::Cell;
use core::fmt;
use core::ptr::NonNull;
use std::ptr;

/// A pooled descriptor of one outstanding transfer.
pub(crate) struct Handle {
    links: lifo::Links<Handle>,
    completion: Cell<Option<Completion>>,
    win: Cell<Option<WinId>>,
    rank: Cell<i32>,
    /// Source buffer of the transfer; its reusability is what
    /// local-completion waits certify.
    src: Cell<*const u8>,
    done: Cell<bool>,
}

impl Handle {
    fn blank() -> Box<Handle> {
        Box::new(Handle {
            links: lifo::Links::new(),
            completion: Cell::new(None),
            win: Cell::new(None),
            rank: Cell::new(-1),
            src: Cell::new(ptr::null()),
            done: Cell::new(true),
        })
    }

    fn reset(&self) {
        self.completion.set(None);
        self.win.set(None);
        self.rank.set(-1);
        self.src.set(ptr::null());
        self.done.set(true);
    }
}

// Safety: `links` is only touched by the freelist; the cells are only
// accessed by the thread currently owning the popped handle.
unsafe impl Send for Handle {}

// Safety: standard intrusive-node projection; handles are pinned while
// pooled.
unsafe impl lifo::Linked for Handle {
    type Handle = Box<Handle>;

    fn into_ptr(handle: Box<Handle>) -> NonNull<Handle> {
        NonNull::from(Box::leak(handle))
    }

    unsafe fn from_ptr(ptr: NonNull<Handle>) -> Box<Handle> {
        // Safety: forwarded to the caller.
        unsafe { Box::from_raw(ptr.as_ptr()) }
    }

    unsafe fn links(ptr: NonNull<Handle>) -> NonNull<lifo::Links<Handle>> {
        // Safety: field projection within the allocation.
        unsafe { NonNull::new_unchecked(&raw mut (*ptr.as_ptr()).links) }
    }
}

/// An owned handle to one outstanding transfer. Waiting (or dropping)
/// returns the descriptor to the runtime's freelist.
pub struct HandleRef {
    rt: Runtime,
    inner: Option<Box<Handle>>,
}

impl HandleRef {
    /// Blocks until local *and* remote completion.
    pub fn wait(&mut self) -> Result<()> {
        let Some(handle) = self.inner.take() else {
            return Ok(());
        };
        let result = finish(&self.rt, &handle, true);
        handle.reset();
        self.rt.handle_pool().push(handle);
        result
    }

    /// Blocks until local completion only: the source buffer is reusable,
    /// the target may not have caught up yet.
    pub fn wait_local(&mut self) -> Result<()> {
        let Some(handle) = self.inner.take() else {
            return Ok(());
        };
        let result = finish(&self.rt, &handle, false);
        handle.reset();
        self.rt.handle_pool().push(handle);
        result
    }

    /// Non-blocking completion check; a `true` result releases the
    /// handle.
    pub fn test(&mut self) -> Result<bool> {
        self.test_inner(true)
    }

    /// Non-blocking local-completion check.
    pub fn test_local(&mut self) -> Result<bool> {
        self.test_inner(false)
    }

    fn test_inner(&mut self, remote: bool) -> Result<bool> {
        let Some(handle) = self.inner.as_ref() else {
            return Ok(true);
        };
        let done = if handle.done.get() {
            true
        } else if let Some(completion) = handle.completion.get() {
            self.rt.driver().test(completion)?
        } else {
            true
        };
        if !done {
            return Ok(false);
        }
        if remote && let Some(win) = handle.win.get() {
            self.rt.driver().fence(win, Some(handle.rank.get()))?;
        }
        let handle = self.inner.take().expect("checked above");
        handle.reset();
        self.rt.handle_pool().push(handle);
        Ok(true)
    }
}

impl Drop for HandleRef {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.take() {
            // dropping an un-waited handle abandons its completion; the
            // transfer still finishes, ordering is the caller's problem
            handle.reset();
            self.rt.handle_pool().push(handle);
        }
    }
}

impl fmt::Debug for HandleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.inner.as_ref().is_some_and(|h| !h.done.get());
        f.debug_struct("HandleRef").field("pending", &pending).finish()
    }
}

fn finish(rt: &Runtime, handle: &Handle, remote: bool) -> Result<()> {
    if let Some(completion) = handle.completion.get() {
        rt.driver().wait(completion)?;
    }
    if remote && let Some(win) = handle.win.get() {
        rt.driver().fence(win, Some(handle.rank.get()))?;
    }
    Ok(())
}

/// A resolved transfer target.
struct Target {
    win: Option<WinId>,
    rank: TeamUnit,
    disp: u64,
    /// Direct pointer when the shared-memory fast path applies.
    peer: Option<*mut u8>,
}

// === one-sided operations on the runtime handle ===

impl Runtime {
    /// Non-blocking read of `dst.len()` bytes at `gptr` into `dst`.
    /// Neither locally nor remotely complete on return; use
    /// [`rma_flush`][Self::rma_flush] or a blocking/handle variant.
    pub fn rma_get(&self, team: TeamId, dst: &mut [u8], gptr: GlobalPtr) -> Result<()> {
        self.ensure_running()?;
        let target = self.resolve(team, gptr, dst.len())?;
        if let Some(peer) = target.peer {
            // Safety: `resolve` bounds-checked the range; PGAS memory is
            // raw bytes.
            unsafe { ptr::copy_nonoverlapping(peer, dst.as_mut_ptr(), dst.len()) };
            return Ok(());
        }
        let win = target.win.ok_or(ErrorCode::NotFound)?;
        self.driver()
            .get(win, target.rank.get(), target.disp, dst.as_mut_ptr(), dst.len())?;
        Ok(())
    }

    /// Non-blocking write of `src` to `gptr`.
    pub fn rma_put(&self, team: TeamId, gptr: GlobalPtr, src: &[u8]) -> Result<()> {
        self.ensure_running()?;
        let target = self.resolve(team, gptr, src.len())?;
        if let Some(peer) = target.peer {
            // Safety: see `rma_get`.
            unsafe { ptr::copy_nonoverlapping(src.as_ptr(), peer, src.len()) };
            return Ok(());
        }
        let win = target.win.ok_or(ErrorCode::NotFound)?;
        self.driver()
            .put(win, target.rank.get(), target.disp, src.as_ptr(), src.len())?;
        Ok(())
    }

    /// Read with a handle to wait on.
    pub fn rma_get_handle(
        &self,
        team: TeamId,
        dst: &mut [u8],
        gptr: GlobalPtr,
    ) -> Result<HandleRef> {
        self.ensure_running()?;
        let target = self.resolve(team, gptr, dst.len())?;
        if let Some(peer) = target.peer {
            // Safety: see `rma_get`.
            unsafe { ptr::copy_nonoverlapping(peer, dst.as_mut_ptr(), dst.len()) };
            return Ok(self.complete_handle());
        }
        let win = target.win.ok_or(ErrorCode::NotFound)?;
        let completion =
            self.driver()
                .get(win, target.rank.get(), target.disp, dst.as_mut_ptr(), dst.len())?;
        Ok(self.pending_handle(win, target.rank, completion, dst.as_ptr()))
    }

    /// Write with a handle to wait on.
    pub fn rma_put_handle(
        &self,
        team: TeamId,
        gptr: GlobalPtr,
        src: &[u8],
    ) -> Result<HandleRef> {
        self.ensure_running()?;
        let target = self.resolve(team, gptr, src.len())?;
        if let Some(peer) = target.peer {
            // Safety: see `rma_get`.
            unsafe { ptr::copy_nonoverlapping(src.as_ptr(), peer, src.len()) };
            return Ok(self.complete_handle());
        }
        let win = target.win.ok_or(ErrorCode::NotFound)?;
        let completion =
            self.driver()
                .put(win, target.rank.get(), target.disp, src.as_ptr(), src.len())?;
        Ok(self.pending_handle(win, target.rank, completion, src.as_ptr()))
    }

    /// Read that is locally and remotely complete on return.
    pub fn rma_get_blocking(&self, team: TeamId, dst: &mut [u8], gptr: GlobalPtr) -> Result<()> {
        let mut handle = self.rma_get_handle(team, dst, gptr)?;
        handle.wait()
    }

    /// Write that is locally and remotely complete on return.
    pub fn rma_put_blocking(&self, team: TeamId, gptr: GlobalPtr, src: &[u8]) -> Result<()> {
        let mut handle = self.rma_put_handle(team, gptr, src)?;
        handle.wait()
    }

    /// Forces remote completion of everything outstanding from this unit
    /// to `gptr`'s unit on `gptr`'s segment.
    pub fn rma_flush(&self, team: TeamId, gptr: GlobalPtr) -> Result<()> {
        self.ensure_running()?;
        let target = self.resolve(team, gptr, 0)?;
        if let Some(win) = target.win {
            self.driver().fence(win, Some(target.rank.get()))?;
        }
        Ok(())
    }

    /// Forces remote completion of everything outstanding from this unit
    /// on `gptr`'s segment, to every unit.
    pub fn rma_flush_all(&self, team: TeamId, gptr: GlobalPtr) -> Result<()> {
        self.ensure_running()?;
        let target = self.resolve(team, gptr, 0)?;
        if let Some(win) = target.win {
            self.driver().fence(win, None)?;
        }
        Ok(())
    }

    fn pending_handle(
        &self,
        win: WinId,
        rank: TeamUnit,
        completion: Completion,
        src: *const u8,
    ) -> HandleRef {
        let handle = self.handle_pool().pop().unwrap_or_else(Handle::blank);
        handle.completion.set(Some(completion));
        handle.win.set(Some(win));
        handle.rank.set(rank.get());
        handle.src.set(src);
        handle.done.set(false);
        HandleRef {
            rt: self.clone(),
            inner: Some(handle),
        }
    }

    fn complete_handle(&self) -> HandleRef {
        let handle = self.handle_pool().pop().unwrap_or_else(Handle::blank);
        handle.reset();
        HandleRef {
            rt: self.clone(),
            inner: Some(handle),
        }
    }

    /// Translates `gptr` (plus a transfer size) into driver coordinates,
    /// bounds-checking against the segment.
    fn resolve(&self, team: TeamId, gptr: GlobalPtr, len: usize) -> Result<Target> {
        let home = if gptr.segid().is_local() {
            TeamId::ALL
        } else {
            team
        };
        let slot = self.team(home)?;
        let rank = if gptr.has_flag(GptrFlags::GLOBAL) {
            slot.g2l(gptr.global_unit())?
        } else {
            gptr.unit()
        };
        if !rank.is_defined() || usize::try_from(rank.get()).unwrap() >= slot.size() {
            return Err(ErrorCode::Inval);
        }

        let segments = slot.segments.lock().unwrap();
        let seg = segments.lookup(gptr.segid()).ok_or(ErrorCode::NotFound)?;
        let offset = gptr.offset();
        if offset.checked_add(len as u64).is_none_or(|end| end > seg.size as u64) {
            return Err(ErrorCode::Inval);
        }

        Ok(Target {
            win: seg.win(),
            rank,
            disp: seg.displacement(rank) + offset,
            // Safety: offset is within the segment, the peer base spans
            // it entirely.
            peer: seg
                .peer_base(rank)
                .map(|base| unsafe { base.add(usize::try_from(offset).unwrap()) }),
        })
    }
}
