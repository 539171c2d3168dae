// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Global memory allocation.
//!
//! Two flavors: *local* allocation carves the process-local buddy pool
//! (segment id −1, RMA-visible to every unit through a window spanning
//! [`TeamId::ALL`]), and *collective* allocation creates a fresh
//! team-aligned segment on every member. Externally allocated memory can
//! be registered as a segment without copying.

use crate::collective::DataType;
use crate::error::{ErrorCode, Result};
use crate::gptr::{GlobalPtr, GptrFlags};
use crate::runtime::Runtime;
use crate::segment::{SegFlags, SegmentId, SegmentInfo, SegmentKind};
use crate::team::TeamId;
use crate::unit::TeamUnit;

impl Runtime {
    /// Allocates `nbytes` from the process-local pool. Not collective;
    /// the returned pointer is RMA-visible to every unit.
    ///
    /// A zero-byte request is served as a one-byte allocation.
    ///
    /// # Errors
    ///
    /// `Again` when the pool is exhausted; freeing allocations makes
    /// retries succeed.
    pub fn memalloc(&self, nbytes: usize) -> Result<GlobalPtr> {
        self.ensure_running()?;
        let offset = {
            let mut pool = self.local_pool().lock().unwrap();
            pool.alloc(nbytes).ok_or(ErrorCode::Again)?
        };
        tracing::trace!(nbytes, offset, "local alloc");
        Ok(
            GlobalPtr::new(TeamUnit::new(0), SegmentId::LOCAL, offset as u64)
                .with_global_unit(self.my_unit()),
        )
    }

    /// Returns a local allocation to the pool.
    pub fn memfree(&self, gptr: GlobalPtr) -> Result<()> {
        self.ensure_running()?;
        if gptr.segid() != SegmentId::LOCAL
            || !gptr.has_flag(GptrFlags::GLOBAL)
            || gptr.global_unit() != self.my_unit()
        {
            return Err(ErrorCode::Inval);
        }
        let offset = usize::try_from(gptr.offset()).map_err(|_| ErrorCode::Inval)?;
        self.local_pool()
            .lock()
            .unwrap()
            .free(offset)
            .map_err(|_| ErrorCode::Inval)
    }

    /// Collectively allocates `nbytes` per member in a fresh team-aligned
    /// segment. Every member receives a pointer to the beginning of the
    /// allocation at unit 0; pointers to other members' portions are
    /// formed locally with [`GlobalPtr::with_unit`].
    pub fn team_memalloc_aligned(&self, team: TeamId, nbytes: usize) -> Result<GlobalPtr> {
        self.ensure_running()?;
        if nbytes == 0 {
            return Err(ErrorCode::Inval);
        }
        let slot = self.team(team)?;
        let mut seg = slot.segments.lock().unwrap().alloc(SegmentKind::Allocated);
        let id = seg.id;
        seg.alloc_backing(nbytes);
        self.attach_window(&slot, &mut seg, true)?;
        slot.segments.lock().unwrap().insert(seg);
        tracing::debug!(team = team.get(), id = id.get(), nbytes, "collective alloc");
        Ok(GlobalPtr::new(TeamUnit::new(0), id, 0))
    }

    /// Typed variant of [`team_memalloc_aligned`]: allocates `count`
    /// elements of `dtype` per member.
    ///
    /// [`team_memalloc_aligned`]: Self::team_memalloc_aligned
    pub fn team_memalloc_aligned_typed(
        &self,
        team: TeamId,
        count: usize,
        dtype: DataType,
    ) -> Result<GlobalPtr> {
        self.team_memalloc_aligned(team, count * dtype.size())
    }

    /// Collectively frees a segment created by
    /// [`team_memalloc_aligned`][Self::team_memalloc_aligned].
    pub fn team_memfree(&self, team: TeamId, gptr: GlobalPtr) -> Result<()> {
        self.release_segment(team, gptr, SegmentKind::Allocated)
    }

    /// Collectively registers `nbytes` of externally allocated memory at
    /// `base` as a segment of `team`. The memory stays owned by the
    /// caller and must outlive the registration.
    pub fn team_memregister(
        &self,
        team: TeamId,
        base: *mut u8,
        nbytes: usize,
    ) -> Result<GlobalPtr> {
        self.ensure_running()?;
        if base.is_null() || nbytes == 0 {
            return Err(ErrorCode::Inval);
        }
        let slot = self.team(team)?;
        let mut seg = slot.segments.lock().unwrap().alloc(SegmentKind::Registered);
        let id = seg.id;
        seg.self_base = base;
        seg.size = nbytes;
        seg.flags |= SegFlags::LOCALADDR_VALID;
        self.attach_window(&slot, &mut seg, false)?;
        slot.segments.lock().unwrap().insert(seg);
        tracing::debug!(team = team.get(), id = id.get(), nbytes, "registered segment");
        Ok(GlobalPtr::new(TeamUnit::new(0), id, 0))
    }

    /// Collectively drops a registration created by
    /// [`team_memregister`][Self::team_memregister]. The memory itself is
    /// untouched.
    pub fn team_memderegister(&self, team: TeamId, gptr: GlobalPtr) -> Result<()> {
        self.release_segment(team, gptr, SegmentKind::Registered)
    }

    fn release_segment(&self, team: TeamId, gptr: GlobalPtr, kind: SegmentKind) -> Result<()> {
        self.ensure_running()?;
        let id = gptr.segid();
        if id == SegmentId::SYMMETRIC || id.is_local() {
            return Err(ErrorCode::Inval);
        }
        let slot = self.team(team)?;
        let win = {
            let segments = slot.segments.lock().unwrap();
            let seg = segments.lookup(id).ok_or(ErrorCode::NotFound)?;
            if seg.kind != kind {
                return Err(ErrorCode::Inval);
            }
            seg.win()
        };
        if let Some(win) = win {
            self.driver().win_free(slot.comm, win)?;
        }
        slot.segments.lock().unwrap().free(id)
    }

    /// The state bits of a segment.
    pub fn segment_flags(&self, team: TeamId, segid: SegmentId) -> Result<SegFlags> {
        self.ensure_running()?;
        let slot = self.team(team)?;
        let segments = slot.segments.lock().unwrap();
        Ok(segments.lookup(segid).ok_or(ErrorCode::NotFound)?.flags)
    }

    /// Replaces the state bits of a segment.
    pub fn segment_set_flags(&self, team: TeamId, segid: SegmentId, flags: SegFlags) -> Result<()> {
        self.ensure_running()?;
        let slot = self.team(team)?;
        let mut segments = slot.segments.lock().unwrap();
        segments
            .lookup_mut(segid)
            .ok_or(ErrorCode::NotFound)?
            .flags = flags;
        Ok(())
    }

    /// The size in bytes of a segment.
    pub fn segment_size(&self, team: TeamId, segid: SegmentId) -> Result<usize> {
        self.ensure_running()?;
        let slot = self.team(team)?;
        let segments = slot.segments.lock().unwrap();
        Ok(segments.lookup(segid).ok_or(ErrorCode::NotFound)?.size)
    }

    /// Resolves a global pointer with affinity to the calling unit into a
    /// local virtual address.
    ///
    /// # Errors
    ///
    /// `Inval` when the pointer targets another unit, `NotFound` for an
    /// unknown segment.
    pub fn gptr_addr(&self, team: TeamId, gptr: GlobalPtr) -> Result<*mut u8> {
        self.ensure_running()?;
        if gptr.has_flag(GptrFlags::LOCALADDR) {
            return Ok(gptr.local_addr());
        }
        if !self.gptr_is_local(team, gptr)? {
            return Err(ErrorCode::Inval);
        }
        let slot = self.team(self.segment_home(team, gptr))?;
        let segments = slot.segments.lock().unwrap();
        let seg = segments.lookup(gptr.segid()).ok_or(ErrorCode::NotFound)?;
        let offset = usize::try_from(gptr.offset()).map_err(|_| ErrorCode::Inval)?;
        if offset >= seg.size {
            return Err(ErrorCode::Inval);
        }
        // Safety: in-bounds offset within the segment's backing region.
        Ok(unsafe { seg.self_base.add(offset) })
    }

    /// Rebuilds a global pointer's offset from a local address within its
    /// segment, the inverse of [`gptr_addr`][Self::gptr_addr] for local
    /// pointers.
    pub fn gptr_set_addr(&self, team: TeamId, gptr: GlobalPtr, addr: *mut u8) -> Result<GlobalPtr> {
        self.ensure_running()?;
        let slot = self.team(self.segment_home(team, gptr))?;
        let segments = slot.segments.lock().unwrap();
        let seg = segments.lookup(gptr.segid()).ok_or(ErrorCode::NotFound)?;
        let offset = (addr as usize)
            .checked_sub(seg.self_base as usize)
            .ok_or(ErrorCode::Inval)?;
        if offset >= seg.size {
            return Err(ErrorCode::Inval);
        }
        Ok(gptr.with_offset(offset as u64))
    }

    /// Whether `gptr` refers to memory owned by the calling unit.
    pub fn gptr_is_local(&self, team: TeamId, gptr: GlobalPtr) -> Result<bool> {
        if gptr.has_flag(GptrFlags::LOCALADDR) {
            return Ok(true);
        }
        if gptr.has_flag(GptrFlags::GLOBAL) || gptr.segid().is_local() {
            return Ok(gptr.global_unit() == self.my_unit());
        }
        Ok(self.team(team)?.my_unit == gptr.unit())
    }

    /// The team whose registry resolves `gptr`'s segment: local-pool
    /// pointers always resolve through [`TeamId::ALL`].
    fn segment_home(&self, team: TeamId, gptr: GlobalPtr) -> TeamId {
        if gptr.segid().is_local() {
            TeamId::ALL
        } else {
            team
        }
    }

    /// Installs the process-local buddy pool (segment −1 of
    /// [`TeamId::ALL`]) at init.
    pub(crate) fn setup_local_pool(&self, all: &crate::team::TeamSlot) -> Result<()> {
        let size = self.config().local_pool_size.next_power_of_two();
        let mut seg = SegmentInfo::fresh(SegmentId::LOCAL, SegmentKind::LocalPool);
        seg.alloc_backing(size);
        self.attach_window(all, &mut seg, true)?;
        all.segments.lock().unwrap().insert(seg);

        let level = size.trailing_zeros();
        *self.local_pool().lock().unwrap() = buddy::Buddy::new(level);
        tracing::debug!(size, "local pool ready");
        Ok(())
    }
}
