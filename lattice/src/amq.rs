// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Active messages: remote function invocation with a small payload.
//!
//! Each queue owns a collectively allocated segment holding, per team
//! member, one single-producer/single-consumer ring per possible sender.
//! A send reserves the next frame slot in its private ring at the target
//! via the ring's tail counter and publishes it with a one-sided put; the
//! target drains its rings locally. Full rings surface as [`Again`]: the
//! sender is expected to drain its own queue and retry.
//!
//! Function identifiers are process-agreed integer keys into a registry
//! populated identically on every unit at init; a message carrying an
//! unknown key or an oversized payload is a protocol violation and
//! aborts.
//!
//! [`Again`]: ErrorCode::Again

use crate::error::{ErrorCode, Result};
use crate::gptr::GlobalPtr;
use crate::runtime::Runtime;
use crate::segment::SegmentId;
use crate::team::TeamId;
use crate::transport::WinId;
use crate::unit::TeamUnit;
use core::fmt;
use std::sync::Mutex;

/// Bytes reserved at the start of each ring for the head/tail counters.
const RING_HDR: usize = 16;
/// Bytes of frame header preceding each payload: function id and length.
const FRAME_HDR: usize = 8;

/// Handler invoked for a delivered message.
pub type AmHandler = fn(&Runtime, &[u8]);

/// Process-agreed key of a registered handler.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AmFnId(pub(crate) i32);

impl fmt::Debug for AmFnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[am fn {}]", self.0)
    }
}

/// One team's active-message queue.
///
/// The handle caches the queue's addressing (window, per-member
/// displacements, own base) for the lifetime of the underlying segment.
pub struct Amq {
    team: TeamId,
    gptr: GlobalPtr,
    win: WinId,
    disp: Vec<u64>,
    self_base: *mut u8,
    my_unit: TeamUnit,
    team_size: usize,
    payload_size: usize,
    capacity: usize,
    frame_size: usize,
    /// Serializes draining; only one thread of a unit may consume the
    /// rings at a time.
    processing: Mutex<()>,
}

// Safety: the raw base pointer refers to the queue segment's backing
// memory, which outlives the handle and is only touched through the ring
// protocol.
unsafe impl Send for Amq {}
unsafe impl Sync for Amq {}

impl Amq {
    fn ring_stride(&self) -> usize {
        RING_HDR + self.capacity * self.frame_size
    }

    /// Offset of `sender`'s ring within a member's region.
    fn ring_off(&self, sender: usize) -> usize {
        sender * self.ring_stride()
    }

    /// Segment id backing this queue (for diagnostics).
    #[must_use]
    pub fn segid(&self) -> SegmentId {
        self.gptr.segid()
    }
}

impl fmt::Debug for Amq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Amq")
            .field("team", &self.team)
            .field("segid", &self.gptr.segid())
            .field("payload_size", &self.payload_size)
            .field("capacity", &self.capacity)
            .finish()
    }
}

// === active-message operations on the runtime handle ===

impl Runtime {
    /// Registers `handler` in the process-wide function table and returns
    /// its key. Every unit must register the same handlers in the same
    /// order (normally at init) so the keys agree.
    pub fn am_register(&self, handler: AmHandler) -> Result<AmFnId> {
        self.ensure_running()?;
        let mut table = self.am_handlers().lock().unwrap();
        let id = i32::try_from(table.len()).map_err(|_| ErrorCode::Other)?;
        table.push(handler);
        Ok(AmFnId(id))
    }

    /// Collectively opens a queue on `team` able to buffer `capacity`
    /// messages of up to `payload_size` bytes per (sender, receiver)
    /// pair.
    pub fn amq_open(&self, payload_size: usize, capacity: usize, team: TeamId) -> Result<Amq> {
        self.ensure_running()?;
        if payload_size == 0 || capacity == 0 {
            return Err(ErrorCode::Inval);
        }
        let slot = self.team(team)?;
        let frame_size = (FRAME_HDR + payload_size).next_multiple_of(8);
        let ring_stride = RING_HDR + capacity * frame_size;
        let region = slot.size() * ring_stride;

        let gptr = self.team_memalloc_aligned(team, region)?;
        let (win, disp, self_base) = {
            let segments = slot.segments.lock().unwrap();
            let seg = segments.lookup(gptr.segid()).ok_or(ErrorCode::Other)?;
            (
                seg.win().ok_or(ErrorCode::Other)?,
                seg.disp.clone().ok_or(ErrorCode::Other)?,
                seg.self_base,
            )
        };
        // counters start out zeroed by the collective allocation; make
        // sure no sender can observe a partially created queue
        self.driver().barrier(slot.comm)?;

        tracing::debug!(
            team = team.get(),
            segid = gptr.segid().get(),
            payload_size,
            capacity,
            "active-message queue open"
        );
        Ok(Amq {
            team,
            gptr,
            win,
            disp,
            self_base,
            my_unit: slot.my_unit,
            team_size: slot.size(),
            payload_size,
            capacity,
            frame_size,
            processing: Mutex::new(()),
        })
    }

    /// Collectively closes `q` and releases its segment. Pending messages
    /// are discarded.
    pub fn amq_close(&self, q: Amq) -> Result<()> {
        self.team_memfree(q.team, q.gptr)
    }

    /// Attempts a non-blocking enqueue of `payload` for `fn_id` at
    /// `target`.
    ///
    /// # Errors
    ///
    /// `Again` when the target's ring for this sender is full; the caller
    /// should drain its own queue ([`amq_process`][Self::amq_process])
    /// and retry.
    pub fn amq_try_send(
        &self,
        q: &Amq,
        target: TeamUnit,
        fn_id: AmFnId,
        payload: &[u8],
    ) -> Result<()> {
        self.ensure_running()?;
        if payload.len() > q.payload_size {
            return Err(ErrorCode::Inval);
        }
        let target_idx =
            usize::try_from(target.get()).ok().filter(|&t| t < q.team_size).ok_or(ErrorCode::Inval)?;
        let sender = usize::try_from(q.my_unit.get()).unwrap();
        let ring = q.disp[target_idx] + q.ring_off(sender) as u64;

        let head = self.driver().atomic_load32(q.win, target.get(), ring)?;
        let tail = self.driver().atomic_load32(q.win, target.get(), ring + 4)?;
        if tail.wrapping_sub(head) >= i32::try_from(q.capacity).unwrap() {
            return Err(ErrorCode::Again);
        }

        let slot = usize::try_from(tail.rem_euclid(i32::try_from(q.capacity).unwrap())).unwrap();
        let frame_disp = ring + (RING_HDR + slot * q.frame_size) as u64;

        let mut frame = vec![0u8; q.frame_size];
        frame[..4].copy_from_slice(&fn_id.0.to_ne_bytes());
        frame[4..8].copy_from_slice(&i32::try_from(payload.len()).unwrap().to_ne_bytes());
        frame[FRAME_HDR..FRAME_HDR + payload.len()].copy_from_slice(payload);
        self.driver()
            .put(q.win, target.get(), frame_disp, frame.as_ptr(), q.frame_size)?;
        // the payload must be remotely visible before the tail moves
        self.driver().fence(q.win, Some(target.get()))?;
        self.driver()
            .atomic_store32(q.win, target.get(), ring + 4, tail.wrapping_add(1))?;
        Ok(())
    }

    /// Enqueues at `target`, draining the local queue while the target's
    /// ring is full.
    pub fn amq_send(
        &self,
        q: &Amq,
        target: TeamUnit,
        fn_id: AmFnId,
        payload: &[u8],
    ) -> Result<()> {
        loop {
            match self.amq_try_send(q, target, fn_id, payload) {
                Err(ErrorCode::Again) => {
                    self.amq_process(q)?;
                    self.driver().progress();
                }
                other => return other,
            }
        }
    }

    /// Drains the local buffer, invoking each message's handler. Returns
    /// the number of messages processed. Concurrent callers (and handlers
    /// sending on this very queue) skip the drain instead of racing it.
    pub fn amq_process(&self, q: &Amq) -> Result<usize> {
        self.ensure_running()?;
        let Ok(_guard) = q.processing.try_lock() else {
            return Ok(0);
        };
        let mut processed = 0;
        for sender in 0..q.team_size {
            processed += self.drain_ring(q, sender, None)?;
        }
        Ok(processed)
    }

    /// Synchronizes all members of the queue's team, then drains until
    /// every message that was in flight at the barrier has been consumed.
    pub fn amq_process_blocking(&self, q: &Amq) -> Result<()> {
        self.ensure_running()?;
        self.barrier(q.team)?;
        {
            let _guard = q.processing.lock().unwrap();
            // all sends before the barrier have published their tails;
            // drain up to the snapshot
            let me = q.my_unit.get();
            let my_idx = usize::try_from(me).unwrap();
            for sender in 0..q.team_size {
                let ring = q.disp[my_idx] + q.ring_off(sender) as u64;
                let target_tail = self.driver().atomic_load32(q.win, me, ring + 4)?;
                self.drain_ring(q, sender, Some(target_tail))?;
            }
        }
        self.barrier(q.team)?;
        Ok(())
    }

    /// Fan-outs a message to every *other* member of the queue's team.
    pub fn amq_bcast(&self, q: &Amq, fn_id: AmFnId, payload: &[u8]) -> Result<()> {
        self.ensure_running()?;
        for target in 0..q.team_size {
            let target = TeamUnit::new(i32::try_from(target).unwrap());
            if target == q.my_unit {
                continue;
            }
            self.amq_send(q, target, fn_id, payload)?;
        }
        Ok(())
    }

    /// Processes `sender`'s ring, up to `until` (a tail snapshot) or
    /// until empty.
    fn drain_ring(&self, q: &Amq, sender: usize, until: Option<i32>) -> Result<usize> {
        let me = q.my_unit.get();
        let my_idx = usize::try_from(me).unwrap();
        let ring = q.disp[my_idx] + q.ring_off(sender) as u64;
        let ring_local = q.ring_off(sender);

        let mut processed = 0;
        loop {
            let head = self.driver().atomic_load32(q.win, me, ring)?;
            let tail = self.driver().atomic_load32(q.win, me, ring + 4)?;
            if head == tail || until.is_some_and(|t| head.wrapping_sub(t) >= 0) {
                return Ok(processed);
            }

            let slot =
                usize::try_from(head.rem_euclid(i32::try_from(q.capacity).unwrap())).unwrap();
            let frame_at = ring_local + RING_HDR + slot * q.frame_size;
            // Safety: the frame slot is within our own region and the
            // sender will not reuse it until `head` passes it.
            let frame = unsafe {
                core::slice::from_raw_parts(q.self_base.add(frame_at), q.frame_size)
            };
            let fn_id = i32::from_ne_bytes(frame[..4].try_into().unwrap());
            let len = i32::from_ne_bytes(frame[4..8].try_into().unwrap());
            let len = usize::try_from(len).unwrap_or(usize::MAX);
            assert!(
                len <= q.payload_size,
                "corrupt active message (len {len} > payload size {})",
                q.payload_size
            );
            // copy out and release the slot before invoking the handler:
            // handlers may send on this queue themselves, which can
            // re-enter the drain
            let payload = frame[FRAME_HDR..FRAME_HDR + len].to_vec();
            self.driver()
                .atomic_store32(q.win, me, ring, head.wrapping_add(1))?;

            let handler = {
                let table = self.am_handlers().lock().unwrap();
                let idx = usize::try_from(fn_id).unwrap_or(usize::MAX);
                *table.get(idx).unwrap_or_else(|| {
                    panic!("active message with unregistered function id {fn_id}")
                })
            };
            handler(self, &payload);
            processed += 1;
        }
    }
}
