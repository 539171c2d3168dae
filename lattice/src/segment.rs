// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-team segment bookkeeping.
//!
//! A segment is a registered region of memory collectively accessible
//! through a team. The registry is a closed-addressing hash table keyed by
//! segment id, with two freelists recycling descriptors (and their ids)
//! for collectively *allocated* vs. externally *registered* segments.
//! The two id ranges are disjoint and each grows monotonically, so a
//! team's live ids are unique and ordered consistently on every member.
//!
//! Segment id 0 is reserved for the team's symmetric window; negative ids
//! designate the process-local pool.

use crate::error::{ErrorCode, Result};
use crate::transport::WinId;
use crate::unit::TeamUnit;
use core::fmt;
use std::alloc::Layout;

/// Number of hash buckets in a registry.
const HASH_SIZE: usize = 256;

/// First id handed out for *registered* (externally allocated) segments;
/// collective allocations count up from 1, so the ranges never collide.
const REG_ID_BASE: i16 = 16384;

/// A team-local segment identifier.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(i16);

bitflags::bitflags! {
    /// Per-segment state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SegFlags: u16 {
        /// `self_base` holds a valid local address on this unit.
        const LOCALADDR_VALID = 0x0001;
        /// The memory needs a synchronization call before local reads
        /// observe remote writes.
        const NEEDS_SYNC = 0x0002;
    }
}

/// How a segment came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// The process-local pool (buddy-allocated, id < 0).
    LocalPool,
    /// Collectively allocated by the team; the descriptor owns the
    /// backing memory.
    Allocated,
    /// Externally allocated memory registered with the team.
    Registered,
}

/// The window side of a segment: either reachable through the driver
/// only, or additionally via direct per-peer base pointers (the
/// shared-memory fast path).
#[derive(Debug)]
pub enum Window {
    /// No window (descriptor under construction).
    Detached,
    /// Driver window only; all access goes through put/get.
    Only(WinId),
    /// Driver window plus load/store pointers to each team member's base.
    WithPeers(WinId, Vec<*mut u8>),
}

/// One segment's descriptor.
pub struct SegmentInfo {
    pub id: SegmentId,
    pub kind: SegmentKind,
    pub size: usize,
    /// Per-team-member displacement (driver addressing base); exactly
    /// `team.size` entries when present.
    pub disp: Option<Vec<u64>>,
    pub window: Window,
    /// This unit's own base pointer.
    pub self_base: *mut u8,
    pub flags: SegFlags,
    backing: Option<SegMemory>,
}

/// Owned backing memory of a collectively allocated segment. Only ever
/// accessed through raw pointers; references into it are never formed.
struct SegMemory {
    ptr: *mut u8,
    layout: Layout,
}

/// The per-team table: id-hashed buckets plus the two descriptor
/// freelists.
pub struct SegmentRegistry {
    buckets: Vec<Vec<SegmentInfo>>,
    mem_freelist: Vec<SegmentInfo>,
    reg_freelist: Vec<SegmentInfo>,
    next_mem_id: i16,
    next_reg_id: i16,
}

// === impl SegmentId ===

impl SegmentId {
    /// The team's symmetric window.
    pub const SYMMETRIC: SegmentId = SegmentId(0);
    /// The process-local buddy pool.
    pub const LOCAL: SegmentId = SegmentId(-1);

    #[must_use]
    pub const fn new(raw: i16) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> i16 {
        self.0
    }

    #[must_use]
    pub const fn is_local(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[segment {}]", self.0)
    }
}

// === impl SegMemory ===

impl SegMemory {
    fn alloc(size: usize) -> Self {
        let layout = Layout::from_size_align(size.max(1), 64).expect("segment layout");
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "segment allocation of {size} bytes failed");
        Self { ptr, layout }
    }
}

impl Drop for SegMemory {
    fn drop(&mut self) {
        // Safety: allocated with exactly this layout in `alloc`.
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
    }
}

// Safety: the backing region is plain bytes addressed through raw
// pointers; the registry's owning team serializes descriptor access.
unsafe impl Send for SegMemory {}

// === impl SegmentInfo ===

impl SegmentInfo {
    pub(crate) fn fresh(id: SegmentId, kind: SegmentKind) -> Self {
        Self {
            id,
            kind,
            size: 0,
            disp: None,
            window: Window::Detached,
            self_base: core::ptr::null_mut(),
            flags: SegFlags::empty(),
            backing: None,
        }
    }

    /// Allocates owned backing memory of `size` bytes and points
    /// `self_base` at it.
    pub fn alloc_backing(&mut self, size: usize) {
        let mem = SegMemory::alloc(size);
        self.self_base = mem.ptr;
        self.size = size;
        self.flags |= SegFlags::LOCALADDR_VALID;
        self.backing = Some(mem);
    }

    /// The driver displacement of `unit`'s portion, 0 when no
    /// displacement array is present.
    #[must_use]
    pub fn displacement(&self, unit: TeamUnit) -> u64 {
        match (&self.disp, usize::try_from(unit.get())) {
            (Some(disp), Ok(idx)) => disp[idx],
            _ => 0,
        }
    }

    /// Direct pointer to `unit`'s base when a shared-memory window
    /// exists.
    #[must_use]
    pub fn peer_base(&self, unit: TeamUnit) -> Option<*mut u8> {
        match &self.window {
            Window::WithPeers(_, peers) => {
                peers.get(usize::try_from(unit.get()).ok()?).copied()
            }
            _ => None,
        }
    }

    /// The driver window, if attached.
    #[must_use]
    pub fn win(&self) -> Option<WinId> {
        match self.window {
            Window::Detached => None,
            Window::Only(win) | Window::WithPeers(win, _) => Some(win),
        }
    }
}

// Safety: raw pointers in the descriptor refer to shared PGAS memory;
// the owning team's mutex serializes mutation.
unsafe impl Send for SegmentInfo {}

impl fmt::Debug for SegmentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentInfo")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

// === impl SegmentRegistry ===

impl SegmentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buckets: (0..HASH_SIZE).map(|_| Vec::new()).collect(),
            mem_freelist: Vec::new(),
            reg_freelist: Vec::new(),
            next_mem_id: 1,
            next_reg_id: REG_ID_BASE,
        }
    }

    fn bucket_of(id: SegmentId) -> usize {
        usize::try_from(i32::from(id.get()).rem_euclid(
            i32::try_from(HASH_SIZE).unwrap(),
        ))
        .unwrap()
    }

    /// Rents a descriptor for a new segment of `kind`, assigning the next
    /// id of the matching range (or recycling a freed one). The
    /// descriptor is *not* in the table yet; fill it in and
    /// [`insert`][Self::insert] it.
    pub fn alloc(&mut self, kind: SegmentKind) -> SegmentInfo {
        match kind {
            SegmentKind::LocalPool => SegmentInfo::fresh(SegmentId::LOCAL, kind),
            SegmentKind::Allocated => {
                if let Some(mut desc) = self.mem_freelist.pop() {
                    desc.kind = kind;
                    desc
                } else {
                    let id = self.next_mem_id;
                    self.next_mem_id += 1;
                    SegmentInfo::fresh(SegmentId::new(id), kind)
                }
            }
            SegmentKind::Registered => {
                if let Some(mut desc) = self.reg_freelist.pop() {
                    desc.kind = kind;
                    desc
                } else {
                    let id = self.next_reg_id;
                    self.next_reg_id += 1;
                    SegmentInfo::fresh(SegmentId::new(id), kind)
                }
            }
        }
    }

    /// Rents the descriptor for the team's symmetric window (id 0).
    pub fn alloc_symmetric(&mut self) -> SegmentInfo {
        SegmentInfo::fresh(SegmentId::SYMMETRIC, SegmentKind::Allocated)
    }

    /// Inserts a filled descriptor into the table.
    ///
    /// A duplicate id is a protocol violation across the team and panics.
    pub fn insert(&mut self, info: SegmentInfo) {
        let bucket = Self::bucket_of(info.id);
        assert!(
            !self.buckets[bucket].iter().any(|s| s.id == info.id),
            "segment id {:?} registered twice",
            info.id
        );
        self.buckets[bucket].push(info);
    }

    #[must_use]
    pub fn lookup(&self, id: SegmentId) -> Option<&SegmentInfo> {
        self.buckets[Self::bucket_of(id)]
            .iter()
            .find(|s| s.id == id)
    }

    pub fn lookup_mut(&mut self, id: SegmentId) -> Option<&mut SegmentInfo> {
        self.buckets[Self::bucket_of(id)]
            .iter_mut()
            .find(|s| s.id == id)
    }

    /// Removes `id` from the table, releases its backing memory and
    /// returns the bare descriptor to the matching freelist for id reuse.
    pub fn free(&mut self, id: SegmentId) -> Result<()> {
        let bucket = Self::bucket_of(id);
        let pos = self.buckets[bucket]
            .iter()
            .position(|s| s.id == id)
            .ok_or(ErrorCode::NotFound)?;
        let mut desc = self.buckets[bucket].swap_remove(pos);
        desc.backing = None;
        desc.disp = None;
        desc.window = Window::Detached;
        desc.self_base = core::ptr::null_mut();
        desc.size = 0;
        desc.flags = SegFlags::empty();
        match desc.kind {
            SegmentKind::Allocated => self.mem_freelist.push(desc),
            SegmentKind::Registered => self.reg_freelist.push(desc),
            SegmentKind::LocalPool => {}
        }
        Ok(())
    }

    /// Iterates the live descriptors (arbitrary order).
    pub fn iter(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.buckets.iter().flatten()
    }
}

impl Default for SegmentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
