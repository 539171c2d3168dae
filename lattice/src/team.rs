// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The team tree.
//!
//! Teams are hierarchical subsets of units, each with its own transport
//! communicator and segment registry. The tree is rooted at
//! [`TeamId::ALL`], which is created at init and contains every unit.
//! Teams live in a dense arena indexed by team id; parent/child links are
//! ids, never pointers.
//!
//! Team creation is collective over the parent: all members propose their
//! next free id and agree on the maximum, which keeps ids consistent on
//! every member without a central allocator. Members of the new group get
//! a live team, everyone else gets [`TeamId::NULL`].

use crate::error::{ErrorCode, Result};
use crate::group::Group;
use crate::runtime::Runtime;
use crate::segment::{SegFlags, SegmentRegistry, Window};
use crate::transport::CommId;
use crate::unit::{GlobalUnit, TeamUnit};
use core::fmt;
use std::sync::atomic::AtomicI32;
use std::sync::{Arc, Mutex};

/// Maximum number of live teams per process.
pub const MAX_TEAMS: usize = 256;
/// Maximum depth of the team tree.
pub const MAX_DEPTH: u16 = 16;
/// Maximum number of children per team.
pub const MAX_CHILDREN: usize = 64;

/// A handle to a team.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TeamId(i16);

// === impl TeamId ===

impl TeamId {
    /// The universal team containing every unit.
    pub const ALL: TeamId = TeamId(0);
    /// The null team, returned to units outside a newly created group.
    pub const NULL: TeamId = TeamId(-1);

    #[must_use]
    pub const fn new(raw: i16) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> i16 {
        self.0
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Debug for TeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("[null team]")
        } else {
            write!(f, "[team {}]", self.0)
        }
    }
}

/// Per-team state, owned by the registry arena.
pub(crate) struct TeamSlot {
    pub id: TeamId,
    pub parent: TeamId,
    pub level: u16,
    pub comm: CommId,
    pub group: Group,
    /// The caller's identity within this team (== its comm rank).
    pub my_unit: TeamUnit,
    pub segments: Mutex<SegmentRegistry>,
    pub children: Mutex<Vec<TeamId>>,
    /// Bump allocator for lock words within segment 0.
    pub lock_slots: AtomicI32,
}

impl TeamSlot {
    pub fn size(&self) -> usize {
        self.group.size()
    }

    /// Translates a team unit to its global id.
    pub fn l2g(&self, unit: TeamUnit) -> Result<GlobalUnit> {
        usize::try_from(unit.get())
            .ok()
            .and_then(|idx| self.group.global_at(idx))
            .ok_or(ErrorCode::Inval)
    }

    /// Translates a global id to this team's unit, if a member.
    pub fn g2l(&self, unit: GlobalUnit) -> Result<TeamUnit> {
        self.group
            .local_of(unit)
            .map(|idx| TeamUnit::new(i32::try_from(idx).unwrap()))
            .ok_or(ErrorCode::Inval)
    }
}

/// The process-local arena of team slots.
pub(crate) struct TeamRegistry {
    slots: Vec<Option<Arc<TeamSlot>>>,
    /// Creation order, for reverse teardown at finalize.
    created: Vec<TeamId>,
    /// Next id this unit would assign; synchronized by the agreement
    /// reduction during team creation.
    next_id: i16,
}

impl TeamRegistry {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_TEAMS).map(|_| None).collect(),
            created: Vec::new(),
            next_id: 1,
        }
    }

    pub fn get(&self, id: TeamId) -> Option<Arc<TeamSlot>> {
        self.slots
            .get(usize::try_from(id.get()).ok()?)?
            .clone()
    }

    pub fn insert(&mut self, slot: Arc<TeamSlot>) {
        let idx = usize::try_from(slot.id.get()).unwrap();
        debug_assert!(self.slots[idx].is_none(), "team slot {idx} occupied");
        self.created.push(slot.id);
        self.slots[idx] = Some(slot);
    }

    pub fn remove(&mut self, id: TeamId) -> Option<Arc<TeamSlot>> {
        self.created.retain(|&t| t != id);
        self.slots.get_mut(usize::try_from(id.get()).ok()?)?.take()
    }

    /// Live teams in reverse creation order (children before parents for
    /// teardown).
    pub fn teardown_order(&self) -> Vec<TeamId> {
        self.created.iter().rev().copied().collect()
    }

    pub fn reserve_up_to(&mut self, id: i16) {
        self.next_id = self.next_id.max(id + 1);
    }

    pub fn next_id(&self) -> i16 {
        self.next_id
    }
}

// === team operations on the runtime handle ===

impl Runtime {
    /// Creates a team over `group`, collectively across every member of
    /// `parent`. Members of `group` obtain the new team's id; everyone
    /// else obtains [`TeamId::NULL`]. An empty group still completes the
    /// collective and yields the null team everywhere.
    pub fn team_create(&self, parent: TeamId, group: &Group) -> Result<TeamId> {
        self.ensure_running()?;
        let parent_slot = self.team(parent)?;
        if parent_slot.level + 1 > MAX_DEPTH {
            return Err(ErrorCode::Inval);
        }
        // the group must be drawn from the parent's members
        for member in group.members() {
            if !parent_slot.group.contains(member) {
                return Err(ErrorCode::Inval);
            }
        }
        {
            let children = parent_slot.children.lock().unwrap();
            if children.len() >= MAX_CHILDREN {
                return Err(ErrorCode::Inval);
            }
        }

        // agree on the new id: everyone proposes its next free one and the
        // maximum wins
        let proposed = self.teams_next_id();
        let agreed = self.agree_max_i16(parent_slot.comm, proposed)?;
        if usize::try_from(agreed).unwrap() >= MAX_TEAMS {
            return Err(ErrorCode::Inval);
        }
        self.teams_reserve(agreed);

        let members: Vec<GlobalUnit> = group.members().collect();
        let comm = self.driver().comm_split(parent_slot.comm, &members)?;
        tracing::debug!(
            parent = parent.get(),
            id = agreed,
            size = members.len(),
            member = comm.is_some(),
            "team created"
        );

        let Some(comm) = comm else {
            return Ok(TeamId::NULL);
        };

        let id = TeamId::new(agreed);
        let my_unit = self
            .team_slot_unit(group)
            .expect("comm membership implies group membership");
        let slot = Arc::new(TeamSlot {
            id,
            parent,
            level: parent_slot.level + 1,
            comm,
            group: group.clone(),
            my_unit,
            segments: Mutex::new(SegmentRegistry::new()),
            children: Mutex::new(Vec::new()),
            lock_slots: AtomicI32::new(0),
        });
        self.setup_symmetric_segment(&slot)?;

        parent_slot.children.lock().unwrap().push(id);
        self.teams_insert(slot);
        Ok(id)
    }

    /// Destroys `team`, collectively across its members.
    ///
    /// # Errors
    ///
    /// `Inval` while the team still has live children; the tree is left
    /// unchanged.
    pub fn team_destroy(&self, team: TeamId) -> Result<()> {
        self.ensure_running()?;
        if team == TeamId::ALL {
            return Err(ErrorCode::Inval);
        }
        let slot = self.team(team)?;
        if !slot.children.lock().unwrap().is_empty() {
            return Err(ErrorCode::Inval);
        }

        self.teardown_team(&slot)?;

        if let Ok(parent) = self.team(slot.parent) {
            parent.children.lock().unwrap().retain(|&c| c != team);
        }
        self.teams_remove(team);
        tracing::debug!(id = team.get(), "team destroyed");
        Ok(())
    }

    /// Releases a team's transport resources: all remaining segment
    /// windows (in agreed id order), then the communicator. Collective.
    pub(crate) fn teardown_team(&self, slot: &TeamSlot) -> Result<()> {
        self.driver().barrier(slot.comm)?;
        let mut ids: Vec<_> = {
            let segments = slot.segments.lock().unwrap();
            segments.iter().map(|s| s.id).collect()
        };
        ids.sort_unstable();
        for id in ids {
            let win = {
                let segments = slot.segments.lock().unwrap();
                segments.lookup(id).and_then(|s| s.win())
            };
            if let Some(win) = win {
                self.driver().win_free(slot.comm, win)?;
            }
            slot.segments.lock().unwrap().free(id)?;
        }
        if slot.comm != CommId::WORLD {
            self.driver().comm_free(slot.comm)?;
        }
        Ok(())
    }

    /// Creates a team with the same member set as `team` but a fresh
    /// communicator and segment registry. Collective over `team`.
    pub fn team_clone(&self, team: TeamId) -> Result<TeamId> {
        let group = self.team_group(team)?;
        self.team_create(team, &group)
    }

    /// The group underlying `team`.
    pub fn team_group(&self, team: TeamId) -> Result<Group> {
        Ok(self.team(team)?.group.clone())
    }

    pub fn team_parent(&self, team: TeamId) -> Result<TeamId> {
        Ok(self.team(team)?.parent)
    }

    pub fn team_depth(&self, team: TeamId) -> Result<u16> {
        Ok(self.team(team)?.level)
    }

    /// The `idx`-th live child of `team`, in creation order.
    pub fn team_child_at(&self, team: TeamId, idx: usize) -> Result<TeamId> {
        self.team(team)?
            .children
            .lock()
            .unwrap()
            .get(idx)
            .copied()
            .ok_or(ErrorCode::NotFound)
    }

    pub fn team_size(&self, team: TeamId) -> Result<usize> {
        Ok(self.team(team)?.size())
    }

    /// The caller's unit id within `team`.
    pub fn team_my_unit(&self, team: TeamId) -> Result<TeamUnit> {
        Ok(self.team(team)?.my_unit)
    }

    /// Translates `unit` within `team` to its global id.
    pub fn unit_l2g(&self, team: TeamId, unit: TeamUnit) -> Result<GlobalUnit> {
        self.team(team)?.l2g(unit)
    }

    /// Translates a global id to a unit within `team`.
    pub fn unit_g2l(&self, team: TeamId, unit: GlobalUnit) -> Result<TeamUnit> {
        self.team(team)?.g2l(unit)
    }

    /// Builds the symmetric window (segment 0) of a fresh team.
    pub(crate) fn setup_symmetric_segment(&self, slot: &TeamSlot) -> Result<()> {
        let size = self.config().syncarea_size;
        let mut seg = slot.segments.lock().unwrap().alloc_symmetric();
        seg.alloc_backing(size);
        self.attach_window(slot, &mut seg, true)?;
        seg.flags |= SegFlags::NEEDS_SYNC;
        slot.segments.lock().unwrap().insert(seg);
        Ok(())
    }

    /// Registers a segment's memory with the driver and fills in the
    /// displacement array (and, when `peers` is set, the shared-memory
    /// base-pointer table).
    pub(crate) fn attach_window(
        &self,
        slot: &TeamSlot,
        seg: &mut crate::segment::SegmentInfo,
        peers: bool,
    ) -> Result<()> {
        let win = self
            .driver()
            .win_create(slot.comm, seg.self_base, seg.size)?;

        // the driver addresses a rank's memory by displacement; gather
        // every member's base
        let mut disp = vec![0u8; slot.size() * 8];
        self.driver().allgather(
            slot.comm,
            &(seg.self_base as u64).to_ne_bytes(),
            &mut disp,
        )?;
        let disp: Vec<u64> = disp
            .chunks_exact(8)
            .map(|c| u64::from_ne_bytes(c.try_into().unwrap()))
            .collect();

        seg.window = if peers {
            let bases = (0..slot.size())
                .map(|rank| {
                    self.driver()
                        .win_peer_base(win, i32::try_from(rank).unwrap())
                })
                .collect::<Option<Vec<_>>>();
            match bases {
                Some(bases) => Window::WithPeers(win, bases),
                None => Window::Only(win),
            }
        } else {
            Window::Only(win)
        };
        seg.disp = Some(disp);
        Ok(())
    }

    fn team_slot_unit(&self, group: &Group) -> Option<TeamUnit> {
        group
            .local_of(self.my_unit())
            .map(|idx| TeamUnit::new(i32::try_from(idx).unwrap()))
    }

    /// Agreement reduction: the maximum of `value` across the
    /// communicator, on every member.
    fn agree_max_i16(&self, comm: CommId, value: i16) -> Result<i16> {
        let mut out = value.to_ne_bytes();
        let combine = |acc: &mut [u8], contrib: &[u8]| {
            let a = i16::from_ne_bytes(acc.try_into().unwrap());
            let b = i16::from_ne_bytes(contrib.try_into().unwrap());
            acc.copy_from_slice(&a.max(b).to_ne_bytes());
        };
        self.driver()
            .reduce(comm, 0, &value.to_ne_bytes(), &mut out, &combine)?;
        self.driver().bcast(comm, 0, &mut out)?;
        Ok(i16::from_ne_bytes(out))
    }
}
