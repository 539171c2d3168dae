// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Data-flow dependency matching.
//!
//! Dependencies name bytes in the global address space. Local ones (the
//! calling unit owns the memory) are matched eagerly against a hash table
//! keyed by (segment, offset): a new reader edges from the latest writer
//! at a phase no later than its own, a new writer additionally edges from
//! every reader since that writer. Remote readers send a registration
//! message to the owning unit and carry a dummy dependency until the
//! owner's matching writer completes and releases them with a reply
//! message.
//!
//! The table also owns every in-flight task: waiting tasks are parked
//! here, and the id → task resolution for edges and remote releases goes
//! through the in-flight map, so a recycled descriptor can never be
//! reached through a stale id.

use crate::gptr::{GlobalPtr, GptrFlags};
use crate::sched::task::{Task, TaskRef};
use crate::unit::GlobalUnit;
use hashbrown::HashMap;
use std::collections::BTreeMap;
use std::ptr::NonNull;

/// What a task does to the bytes a dependency names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    /// Read; ordered after the latest earlier write.
    In,
    /// Write; ordered after the latest earlier write and all reads since.
    Out,
    /// Read and write.
    InOut,
    /// Read that does not block later writers (used by send-side copyin
    /// tasks).
    DelayedIn,
    /// Pre-fetch of a remote range into a local buffer before the task
    /// runs.
    CopyIn,
    /// Direct task-to-task edge.
    Direct,
}

/// One dependency of a task under creation.
#[derive(Debug, Clone)]
pub struct Dep {
    pub(crate) kind: DepKind,
    pub(crate) gptr: GlobalPtr,
    /// Phase the dependency matches in; defaults to the creation phase.
    pub(crate) phase: Option<u64>,
    /// Copyin: destination buffer.
    pub(crate) dest: *mut u8,
    /// Copyin: transfer size in bytes.
    pub(crate) nbytes: usize,
    /// Direct: the predecessor task.
    pub(crate) pred: Option<TaskRef>,
}

// Safety: the embedded raw pointer is a plain buffer address carried to
// the fetch task.
unsafe impl Send for Dep {}

impl Dep {
    fn plain(kind: DepKind, gptr: GlobalPtr) -> Self {
        Self {
            kind,
            gptr,
            phase: None,
            dest: core::ptr::null_mut(),
            nbytes: 0,
            pred: None,
        }
    }

    /// A read of the bytes at `gptr`.
    #[must_use]
    pub fn input(gptr: GlobalPtr) -> Self {
        Self::plain(DepKind::In, gptr)
    }

    /// A write of the bytes at `gptr`. Output dependencies must target
    /// the calling unit's own memory.
    #[must_use]
    pub fn output(gptr: GlobalPtr) -> Self {
        Self::plain(DepKind::Out, gptr)
    }

    /// A read-modify-write of the bytes at `gptr`.
    #[must_use]
    pub fn inout(gptr: GlobalPtr) -> Self {
        Self::plain(DepKind::InOut, gptr)
    }

    /// A read that later writers need not wait for.
    #[must_use]
    pub fn delayed_input(gptr: GlobalPtr) -> Self {
        Self::plain(DepKind::DelayedIn, gptr)
    }

    /// Pre-fetches `nbytes` at `src` into the local buffer `dest` before
    /// the task runs.
    #[must_use]
    pub fn copyin(src: GlobalPtr, dest: *mut u8, nbytes: usize) -> Self {
        let mut dep = Self::plain(DepKind::CopyIn, src);
        dep.dest = dest;
        dep.nbytes = nbytes;
        dep
    }

    /// Orders the task after `pred`.
    #[must_use]
    pub fn direct(pred: &TaskRef) -> Self {
        let mut dep = Self::plain(DepKind::Direct, GlobalPtr::NULL);
        dep.pred = Some(pred.clone());
        dep
    }

    /// Pins the dependency to `phase` instead of the creation phase.
    #[must_use]
    pub fn with_phase(mut self, phase: u64) -> Self {
        self.phase = Some(phase);
        self
    }
}

/// Key of the dependency hash: (segment id, offset). Local-address
/// pointers use a reserved segment key with the raw address as offset.
pub(crate) type DepKey = (i16, u64);

const LOCALADDR_KEY: i16 = i16::MIN;

pub(crate) fn key_of(gptr: GlobalPtr) -> DepKey {
    if gptr.has_flag(GptrFlags::LOCALADDR) {
        (LOCALADDR_KEY, gptr.offset())
    } else {
        (gptr.segid().get(), gptr.offset())
    }
}

/// A remote reader registration, parked at the owner until a matching
/// writer completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DepRequest {
    pub key: DepKey,
    pub phase: u64,
    pub requester: GlobalUnit,
    pub task: u64,
}

impl DepRequest {
    pub const WIRE_SIZE: usize = 40;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[..2].copy_from_slice(&self.key.0.to_ne_bytes());
        out[4..8].copy_from_slice(&self.requester.get().to_ne_bytes());
        out[8..16].copy_from_slice(&self.key.1.to_ne_bytes());
        out[16..24].copy_from_slice(&self.phase.to_ne_bytes());
        out[24..32].copy_from_slice(&self.task.to_ne_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> DepRequest {
        assert!(bytes.len() >= Self::WIRE_SIZE, "truncated dependency request");
        DepRequest {
            key: (
                i16::from_ne_bytes(bytes[..2].try_into().unwrap()),
                u64::from_ne_bytes(bytes[8..16].try_into().unwrap()),
            ),
            phase: u64::from_ne_bytes(bytes[16..24].try_into().unwrap()),
            requester: GlobalUnit::new(i32::from_ne_bytes(bytes[4..8].try_into().unwrap())),
            task: u64::from_ne_bytes(bytes[24..32].try_into().unwrap()),
        }
    }
}

/// One (segment, offset) slot of the matching table.
#[derive(Default)]
pub(crate) struct Bucket {
    /// Latest writer: (task id, phase). The id may no longer be in
    /// flight, which reads as "already written".
    pub last_out: Option<(u64, u64)>,
    /// Readers since the latest writer.
    pub ins_since: Vec<u64>,
    /// Remote readers waiting for a matching writer to appear.
    pub remote_waiters: Vec<DepRequest>,
}

/// The per-runtime dependency state. One mutex guards the whole table;
/// it is released before any transport call.
#[derive(Default)]
pub(crate) struct DepTable {
    pub buckets: HashMap<DepKey, Bucket>,
    /// Every live task, by id.
    pub inflight: HashMap<u64, NonNull<Task>>,
    /// Tasks with unresolved dependencies (the table owns them).
    pub parked: HashMap<u64, Box<Task>>,
    /// Live task count per phase; drives the producer throttle.
    pub phase_tasks: BTreeMap<u64, usize>,
    /// Outgoing reader registrations (by owning unit) buffered until the
    /// next matching pass.
    pub pending_requests: Vec<(GlobalUnit, DepRequest)>,
}

// Safety: the table lives behind the scheduler mutex; raw task pointers
// are only dereferenced under it.
unsafe impl Send for DepTable {}

impl DepTable {
    /// Adds an edge `pred → succ` if `pred` is still in flight. Returns
    /// `true` when an edge was recorded.
    pub fn edge(&mut self, pred: u64, succ: &Task) -> bool {
        let Some(&pred_ptr) = self.inflight.get(&pred) else {
            return false;
        };
        // Safety: in-flight pointers are valid while in the map, and we
        // hold the table lock.
        let pred_task = unsafe { pred_ptr.as_ref() };
        pred_task.successors.lock().unwrap().push(succ.id);
        succ.unresolved
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        true
    }

    /// Matches one local dependency of `task`, recording the edges the
    /// ordering rules require.
    pub fn match_local(&mut self, task: &Task, key: DepKey, kind: DepKind, phase: u64) {
        let bucket = self.buckets.entry(key).or_default();
        let last_out = bucket.last_out;
        match kind {
            DepKind::In | DepKind::CopyIn | DepKind::DelayedIn => {
                if let Some((out_id, out_phase)) = last_out
                    && out_phase <= phase
                {
                    self.edge(out_id, task);
                }
                if !matches!(kind, DepKind::DelayedIn) {
                    self.buckets
                        .entry(key)
                        .or_default()
                        .ins_since
                        .push(task.id);
                }
            }
            DepKind::Out | DepKind::InOut => {
                let ins: Vec<u64> = {
                    let bucket = self.buckets.entry(key).or_default();
                    bucket.ins_since.drain(..).collect()
                };
                if let Some((out_id, _)) = last_out {
                    self.edge(out_id, task);
                }
                for reader in ins {
                    if reader != task.id {
                        self.edge(reader, task);
                    }
                }
                let bucket = self.buckets.entry(key).or_default();
                bucket.last_out = Some((task.id, phase));
                // a parked remote reader matches the new writer when its
                // phase is no earlier
                let waiters: Vec<DepRequest> = {
                    let (matched, rest): (Vec<_>, Vec<_>) = bucket
                        .remote_waiters
                        .drain(..)
                        .partition(|w| w.phase >= phase);
                    bucket.remote_waiters = rest;
                    matched
                };
                for w in waiters {
                    task.remote_releases
                        .lock()
                        .unwrap()
                        .push((w.requester.get(), w.task));
                }
            }
            DepKind::Direct => unreachable!("direct deps are matched by task id"),
        }
        task.dep_keys.lock().unwrap().push(key);
    }

    /// Handles a remote reader registration at the owner. Returns `true`
    /// when the reader can be released immediately. With `draining` set
    /// (the local task stream has ended) a reader with no matching
    /// in-flight writer is released instead of parked, since the writer
    /// can no longer appear.
    pub fn register_remote_reader(&mut self, req: DepRequest, draining: bool) -> bool {
        let bucket = self.buckets.entry(req.key).or_default();
        match bucket.last_out {
            Some((out_id, out_phase)) if out_phase <= req.phase => {
                if let Some(&out_ptr) = self.inflight.get(&out_id) {
                    // Safety: in-flight under the table lock.
                    let out = unsafe { out_ptr.as_ref() };
                    out.remote_releases
                        .lock()
                        .unwrap()
                        .push((req.requester.get(), req.task));
                    false
                } else {
                    // the writer already completed
                    true
                }
            }
            _ if draining => true,
            _ => {
                bucket.remote_waiters.push(req);
                false
            }
        }
    }

    /// Drops every parked remote reader and returns them for immediate
    /// release (used when the local task stream has drained and no
    /// matching writer can appear anymore).
    pub fn take_stale_remote_waiters(&mut self) -> Vec<DepRequest> {
        let mut out = Vec::new();
        for bucket in self.buckets.values_mut() {
            out.append(&mut bucket.remote_waiters);
        }
        out
    }

    /// Removes a completed task's reader/writer registrations, leaving
    /// the completed-writer marker in place for later readers.
    pub fn retire(&mut self, task: &Task) {
        for key in task.dep_keys.lock().unwrap().drain(..) {
            if let Some(bucket) = self.buckets.get_mut(&key) {
                bucket.ins_since.retain(|&id| id != task.id);
            }
        }
    }

    /// Lowest phase that still has live tasks.
    pub fn min_live_phase(&self) -> Option<u64> {
        self.phase_tasks.keys().next().copied()
    }

    pub fn bump_phase(&mut self, phase: u64) {
        *self.phase_tasks.entry(phase).or_insert(0) += 1;
    }

    pub fn drop_phase(&mut self, phase: u64) {
        if let Some(count) = self.phase_tasks.get_mut(&phase) {
            *count -= 1;
            if *count == 0 {
                self.phase_tasks.remove(&phase);
            }
        }
    }
}
