// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Team-wide mutexes.
//!
//! A lock is one shared 32-bit word in the team's symmetric window
//! (segment 0, hosted at team unit 0) driven by the transport's remote
//! compare-and-swap: 0 means free, `unit + 1` names the holder. Creation
//! is collective so every member derives the same word; acquisition spins
//! with exponential backoff and polls the driver while waiting.

use crate::error::{ErrorCode, Result};
use crate::runtime::Runtime;
use crate::segment::SegmentId;
use crate::team::TeamId;
use crate::transport::WinId;
use core::hint;
use std::sync::atomic::Ordering;

/// Bytes of segment 0 reserved before the lock words (kept clear for
/// future runtime-internal counters).
const LOCK_AREA_OFFSET: usize = 64;

/// A mutex shared by every member of one team.
#[derive(Debug)]
pub struct TeamLock {
    team: TeamId,
    win: WinId,
    /// Driver displacement of the lock word at team unit 0.
    disp: u64,
    /// The caller's claim tag (`my_unit + 1`).
    tag: i32,
}

/// An exponential backoff for remote spin loops, capped at 2^8 spin
/// hints per round.
#[derive(Debug, Clone, Copy, Default)]
struct Backoff {
    exp: u8,
}

impl Backoff {
    const MAX_EXPONENT: u8 = 8;

    fn spin(&mut self) {
        for _ in 0..1u32 << self.exp {
            hint::spin_loop();
        }
        if self.exp < Self::MAX_EXPONENT {
            self.exp += 1;
        }
    }
}

// === lock operations on the runtime handle ===

impl Runtime {
    /// Creates a team-wide lock. Collective over `team`: every member
    /// must call in the same order relative to other lock creations so
    /// the word assignment agrees.
    pub fn team_lock(&self, team: TeamId) -> Result<TeamLock> {
        self.ensure_running()?;
        let slot = self.team(team)?;
        let index = slot.lock_slots.fetch_add(1, Ordering::AcqRel);
        let offset = LOCK_AREA_OFFSET + usize::try_from(index).unwrap() * 4;
        if offset + 4 > self.config().syncarea_size {
            return Err(ErrorCode::Again);
        }

        let (win, base) = {
            let segments = slot.segments.lock().unwrap();
            let seg = segments
                .lookup(SegmentId::SYMMETRIC)
                .ok_or(ErrorCode::NotFound)?;
            (
                seg.win().ok_or(ErrorCode::NotFound)?,
                seg.displacement(crate::unit::TeamUnit::new(0)),
            )
        };
        Ok(TeamLock {
            team,
            win,
            disp: base + offset as u64,
            tag: slot.my_unit.get() + 1,
        })
    }

    /// Acquires `lock`, spinning until the holder releases it.
    pub fn lock(&self, lock: &TeamLock) -> Result<()> {
        self.ensure_running()?;
        let mut backoff = Backoff::default();
        loop {
            if self.try_lock(lock)? {
                return Ok(());
            }
            backoff.spin();
            self.driver().progress();
        }
    }

    /// Attempts to acquire `lock` without spinning.
    pub fn try_lock(&self, lock: &TeamLock) -> Result<bool> {
        self.ensure_running()?;
        let old = self
            .driver()
            .atomic_cas32(lock.win, 0, lock.disp, 0, lock.tag)?;
        Ok(old == 0)
    }

    /// Releases `lock`.
    ///
    /// # Errors
    ///
    /// `Inval` when the caller does not hold it.
    pub fn unlock(&self, lock: &TeamLock) -> Result<()> {
        self.ensure_running()?;
        let old = self
            .driver()
            .atomic_cas32(lock.win, 0, lock.disp, lock.tag, 0)?;
        if old != lock.tag {
            tracing::error!(team = lock.team.get(), "unlock by non-holder");
            return Err(ErrorCode::Inval);
        }
        Ok(())
    }
}
