// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The 128-bit global pointer.
//!
//! Layout (wire ABI, stable):
//!
//! ```text
//!  bits 0..31   unit id    (team-scoped unless FLAG_GLOBAL)
//!  bits 32..47  segment id
//!  bits 48..63  flags
//!  bits 64..127 byte offset within the segment, or a virtual address
//!               when FLAG_LOCALADDR is set
//! ```
//!
//! Pointer arithmetic only ever changes the offset field; crossing the
//! owning segment's boundary is undefined.

use crate::segment::SegmentId;
use crate::unit::{GlobalUnit, TeamUnit};
use core::fmt;
use core::ops::{Add, AddAssign};

bitflags::bitflags! {
    /// Flag bits of a [`GlobalPtr`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct GptrFlags: u16 {
        /// The offset field holds a valid local virtual address on the
        /// calling unit.
        const LOCALADDR = 0x0001;
        /// The unit field is a global unit id rather than a team-scoped
        /// one.
        const GLOBAL = 0x0002;
    }
}

/// A pointer to any byte in the partitioned global address space.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalPtr {
    unit: i32,
    segid: i16,
    flags: u16,
    addr_or_offs: u64,
}

static_assertions::assert_eq_size!(GlobalPtr, u128);

// === impl GlobalPtr ===

impl GlobalPtr {
    /// The null pointer: undefined unit, segment 0, no flags, offset 0.
    pub const NULL: GlobalPtr = GlobalPtr {
        unit: -1,
        segid: 0,
        flags: 0,
        addr_or_offs: 0,
    };

    /// A pointer to `offset` within segment `segid` at `unit` (team
    /// scope).
    #[must_use]
    pub const fn new(unit: TeamUnit, segid: SegmentId, offset: u64) -> Self {
        Self {
            unit: unit.get(),
            segid: segid.get(),
            flags: 0,
            addr_or_offs: offset,
        }
    }

    /// A pointer carrying a raw local virtual address, flagged
    /// `LOCALADDR`.
    #[must_use]
    pub fn from_local_addr(unit: TeamUnit, segid: SegmentId, addr: *mut u8) -> Self {
        Self {
            unit: unit.get(),
            segid: segid.get(),
            flags: GptrFlags::LOCALADDR.bits(),
            addr_or_offs: addr as u64,
        }
    }

    #[must_use]
    pub fn is_null(self) -> bool {
        self == Self::NULL
    }

    /// The raw unit field; team-scoped unless [`GptrFlags::GLOBAL`] is
    /// set.
    #[must_use]
    pub const fn unit(self) -> TeamUnit {
        TeamUnit::new(self.unit)
    }

    /// The unit field interpreted as a global id. Meaningful only when
    /// [`GptrFlags::GLOBAL`] is set.
    #[must_use]
    pub const fn global_unit(self) -> GlobalUnit {
        GlobalUnit::new(self.unit)
    }

    #[must_use]
    pub const fn segid(self) -> SegmentId {
        SegmentId::new(self.segid)
    }

    #[must_use]
    pub const fn offset(self) -> u64 {
        self.addr_or_offs
    }

    #[must_use]
    pub fn flags(self) -> GptrFlags {
        GptrFlags::from_bits_truncate(self.flags)
    }

    #[must_use]
    pub fn has_flag(self, flag: GptrFlags) -> bool {
        self.flags().contains(flag)
    }

    /// Replaces the unit field with a team-scoped id.
    #[must_use]
    pub fn with_unit(mut self, unit: TeamUnit) -> Self {
        self.unit = unit.get();
        self.flags &= !GptrFlags::GLOBAL.bits();
        self
    }

    /// Replaces the unit field with a global id and flags the pointer
    /// `GLOBAL`.
    #[must_use]
    pub fn with_global_unit(mut self, unit: GlobalUnit) -> Self {
        self.unit = unit.get();
        self.flags |= GptrFlags::GLOBAL.bits();
        self
    }

    #[must_use]
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.addr_or_offs = offset;
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: GptrFlags) -> Self {
        self.flags = flags.bits();
        self
    }

    /// The offset field reinterpreted as a local address. Meaningful only
    /// when [`GptrFlags::LOCALADDR`] is set.
    #[must_use]
    pub fn local_addr(self) -> *mut u8 {
        usize::try_from(self.addr_or_offs)
            .expect("address does not fit usize") as *mut u8
    }

    /// Encodes the pointer into its wire representation.
    #[must_use]
    pub fn to_bits(self) -> u128 {
        (self.unit as u32 as u128)
            | ((self.segid as u16 as u128) << 32)
            | ((self.flags as u128) << 48)
            | ((self.addr_or_offs as u128) << 64)
    }

    /// Decodes a pointer from its wire representation.
    #[must_use]
    pub fn from_bits(bits: u128) -> Self {
        Self {
            unit: bits as u32 as i32,
            segid: (bits >> 32) as u16 as i16,
            flags: (bits >> 48) as u16,
            addr_or_offs: (bits >> 64) as u64,
        }
    }
}

impl Add<u64> for GlobalPtr {
    type Output = GlobalPtr;

    fn add(mut self, bytes: u64) -> GlobalPtr {
        self.addr_or_offs += bytes;
        self
    }
}

impl AddAssign<u64> for GlobalPtr {
    fn add_assign(&mut self, bytes: u64) {
        self.addr_or_offs += bytes;
    }
}

impl Default for GlobalPtr {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Debug for GlobalPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GlobalPtr(u:{} s:{} f:{:#06x} o:{:#x})",
            self.unit, self.segid, self.flags, self.addr_or_offs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn null_roundtrip() {
        assert!(GlobalPtr::NULL.is_null());
        assert_eq!(GlobalPtr::from_bits(GlobalPtr::NULL.to_bits()), GlobalPtr::NULL);
        // a pointer to unit 0 is not null
        assert!(!GlobalPtr::new(TeamUnit::new(0), SegmentId::new(0), 0).is_null());
    }

    #[test]
    fn arithmetic_is_offset_only() {
        let mut p = GlobalPtr::new(TeamUnit::new(3), SegmentId::new(7), 64);
        p += 128;
        assert_eq!(p.unit(), TeamUnit::new(3));
        assert_eq!(p.segid(), SegmentId::new(7));
        assert_eq!(p.offset(), 192);
        let q = p + 8;
        assert_eq!(q.offset(), 200);
        assert_eq!(q.unit(), p.unit());
    }

    #[test]
    fn global_flag_tracks_unit_scope() {
        let p = GlobalPtr::new(TeamUnit::new(2), SegmentId::new(1), 0);
        assert!(!p.has_flag(GptrFlags::GLOBAL));
        let g = p.with_global_unit(GlobalUnit::new(5));
        assert!(g.has_flag(GptrFlags::GLOBAL));
        assert_eq!(g.global_unit(), GlobalUnit::new(5));
        let t = g.with_unit(TeamUnit::new(2));
        assert!(!t.has_flag(GptrFlags::GLOBAL));
    }

    proptest! {
        #[test]
        fn wire_roundtrip(unit in -1i32..1024, segid in -4i16..128, flags in 0u16..4, offs in 0u64..u64::MAX) {
            let p = GlobalPtr {
                unit,
                segid,
                flags,
                addr_or_offs: offs,
            };
            prop_assert_eq!(GlobalPtr::from_bits(p.to_bits()), p);
        }

        #[test]
        fn add_preserves_unit_and_segment(unit in 0i32..64, segid in 1i16..64, offs in 0u64..1 << 32, k in 0u64..1 << 20) {
            let p = GlobalPtr::new(TeamUnit::new(unit), SegmentId::new(segid), offs);
            let q = p + k;
            prop_assert_eq!(q.unit(), p.unit());
            prop_assert_eq!(q.segid(), p.segid());
            prop_assert_eq!(q.offset(), offs + k);
        }
    }
}
