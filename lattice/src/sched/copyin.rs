// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Copyin pre-fetch.
//!
//! A `CopyIn` dependency asks for a remote contiguous range to be
//! resident in a local buffer before the consumer runs. The scheduler
//! expands it into a low-priority *fetch task* carrying an output
//! dependency on the destination buffer, and rewrites the consumer's
//! dependency into an input on that buffer, so ordinary matching does the
//! sequencing.
//!
//! Two fetch implementations are selectable (`COPYIN_IMPL`): a one-sided
//! `get` with a handle wait, or a two-sided send/receive negotiated with
//! the owner through an active message that spawns the send task there.
//! The wait strategy of the one-sided path (`COPYIN_WAIT`) is either
//! test-yield cycles or blocking on the handle.

use crate::error::{ErrorCode, Result};
use crate::gptr::GlobalPtr;
use crate::runtime::{CopyinImpl, CopyinWait, Runtime};
use crate::sched::deps::{Dep, DepKind};
use crate::sched::task::Priority;
use crate::segment::SegmentId;
use crate::team::TeamId;
use crate::unit::{GlobalUnit, TeamUnit};
use std::sync::atomic::Ordering;

/// Wire form of a send-side request: the owner spawns a task sending
/// `nbytes` at (segid, offset) to the requester once produced.
pub(crate) struct SendRequest {
    pub segid: i16,
    pub requester: GlobalUnit,
    pub offset: u64,
    pub nbytes: u64,
    pub phase: u64,
    pub tag: i32,
}

impl SendRequest {
    pub const WIRE_SIZE: usize = 40;

    pub fn encode(&self) -> [u8; Self::WIRE_SIZE] {
        let mut out = [0u8; Self::WIRE_SIZE];
        out[..2].copy_from_slice(&self.segid.to_ne_bytes());
        out[4..8].copy_from_slice(&self.requester.get().to_ne_bytes());
        out[8..16].copy_from_slice(&self.offset.to_ne_bytes());
        out[16..24].copy_from_slice(&self.nbytes.to_ne_bytes());
        out[24..32].copy_from_slice(&self.phase.to_ne_bytes());
        out[32..36].copy_from_slice(&self.tag.to_ne_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> SendRequest {
        assert!(bytes.len() >= Self::WIRE_SIZE, "truncated send request");
        SendRequest {
            segid: i16::from_ne_bytes(bytes[..2].try_into().unwrap()),
            requester: GlobalUnit::new(i32::from_ne_bytes(bytes[4..8].try_into().unwrap())),
            offset: u64::from_ne_bytes(bytes[8..16].try_into().unwrap()),
            nbytes: u64::from_ne_bytes(bytes[16..24].try_into().unwrap()),
            phase: u64::from_ne_bytes(bytes[24..32].try_into().unwrap()),
            tag: i32::from_ne_bytes(bytes[32..36].try_into().unwrap()),
        }
    }
}

/// Expands one `CopyIn` dependency: spawns the fetch task and returns
/// the input dependency the consumer should carry instead.
pub(crate) fn expand(rt: &Runtime, dep: &Dep) -> Result<Dep> {
    debug_assert_eq!(dep.kind, DepKind::CopyIn);
    if dep.dest.is_null() || dep.nbytes == 0 {
        return Err(ErrorCode::Inval);
    }
    let phase = dep.phase.unwrap_or_else(|| rt.phase_current());
    let dest_gptr = GlobalPtr::from_local_addr(
        rt.team_my_unit(TeamId::ALL)?,
        SegmentId::LOCAL,
        dep.dest,
    );
    let out_dep = Dep::output(dest_gptr).with_phase(phase);

    let src = dep.gptr;
    let dest = dep.dest as usize;
    let nbytes = dep.nbytes;
    let local_src = rt.gptr_is_local(TeamId::ALL, src)?;

    match rt.config().copyin_impl {
        _ if local_src => {
            // degenerate copyin: plain local copy once the producer ran
            let fetch_rt = rt.clone();
            rt.task_create(
                &[Dep::input(src).with_phase(phase), out_dep],
                Priority::Low,
                move || {
                    let from = fetch_rt
                        .gptr_addr(TeamId::ALL, src)
                        .expect("local copyin source");
                    // Safety: producer ordering came from the input
                    // dependency; ranges were validated at creation.
                    unsafe {
                        core::ptr::copy_nonoverlapping(from, dest as *mut u8, nbytes);
                    }
                },
            )?;
        }
        CopyinImpl::Get => {
            let fetch_rt = rt.clone();
            let wait = rt.config().copyin_wait;
            rt.task_create(
                &[Dep::input(src).with_phase(phase), out_dep],
                Priority::Low,
                move || fetch_get(&fetch_rt, src, dest as *mut u8, nbytes, wait),
            )?;
        }
        CopyinImpl::SendRecv => {
            let sched = rt.sched();
            let tag = sched.next_copyin_tag.fetch_add(1, Ordering::AcqRel);
            let owner = owner_of(src);
            let req = SendRequest {
                segid: src.segid().get(),
                requester: rt.my_unit(),
                offset: src.offset(),
                nbytes: nbytes as u64,
                phase,
                tag,
            };
            rt.amq_send(
                rt.default_amq(),
                TeamUnit::new(owner.get()),
                sched.am_ids().send_request,
                &req.encode(),
            )?;

            let fetch_rt = rt.clone();
            rt.task_create(&[out_dep], Priority::Low, move || {
                let comm = fetch_rt
                    .team(TeamId::ALL)
                    .expect("universal team")
                    .comm;
                // Safety: the destination buffer outlives the fetch, by
                // the copyin contract.
                let buf = unsafe {
                    core::slice::from_raw_parts_mut(dest as *mut u8, nbytes)
                };
                if let Err(err) = fetch_rt.driver().recv(comm, owner.get(), tag, buf) {
                    tracing::error!(?err, "copyin receive failed");
                    std::panic::panic_any(crate::sched::CancelSignal);
                }
            })?;
        }
    }

    Ok(Dep::input(dest_gptr).with_phase(phase))
}

/// One-sided fetch: handle get plus the configured wait strategy.
fn fetch_get(rt: &Runtime, src: GlobalPtr, dest: *mut u8, nbytes: usize, wait: CopyinWait) {
    // Safety: the destination buffer outlives the fetch, by the copyin
    // contract.
    let buf = unsafe { core::slice::from_raw_parts_mut(dest, nbytes) };
    let handle = rt.rma_get_handle(TeamId::ALL, buf, src);
    let mut handle = match handle {
        Ok(handle) => handle,
        Err(err) => {
            tracing::error!(?err, "copyin get failed");
            std::panic::panic_any(crate::sched::CancelSignal);
        }
    };
    let result = match wait {
        CopyinWait::Block => handle.wait(),
        CopyinWait::Yield => loop {
            match handle.test() {
                Ok(true) => break Ok(()),
                Ok(false) => {
                    if rt.task_yield(-1).is_err() {
                        break Ok(());
                    }
                }
                Err(err) => break Err(err),
            }
        },
    };
    if let Err(err) = result {
        tracing::error!(?err, "copyin wait failed");
        std::panic::panic_any(crate::sched::CancelSignal);
    }
}

/// Handler for the send-side of a two-sided copyin: spawns the task that
/// ships the data once the local producer finished.
pub(crate) fn am_send_request(rt: &Runtime, payload: &[u8]) {
    let req = SendRequest::decode(payload);
    let src_gptr = GlobalPtr::new(
        rt.team_my_unit(TeamId::ALL).expect("universal team"),
        SegmentId::new(req.segid),
        req.offset,
    );
    let nbytes = usize::try_from(req.nbytes).expect("copyin size");
    let dest_rank = req.requester.get();
    let tag = req.tag;

    let send_rt = rt.clone();
    rt.task_create(
        &[Dep::delayed_input(src_gptr).with_phase(req.phase)],
        Priority::Low,
        move || {
            let comm = send_rt.team(TeamId::ALL).expect("universal team").comm;
            let from = send_rt
                .gptr_addr(TeamId::ALL, src_gptr)
                .expect("copyin source resolves locally");
            // Safety: the producing task wrote this range; the segment
            // outlives the send.
            let buf = unsafe { core::slice::from_raw_parts(from, nbytes) };
            if let Err(err) = send_rt.driver().send(comm, dest_rank, tag, buf) {
                tracing::error!(?err, "copyin send failed");
            }
        },
    )
    .expect("spawn copyin send task");
}

/// The global unit owning `gptr` (scheduler scope: the universal team,
/// where team unit ids equal global ids).
fn owner_of(gptr: GlobalPtr) -> GlobalUnit {
    if gptr.has_flag(crate::gptr::GptrFlags::GLOBAL) {
        gptr.global_unit()
    } else {
        GlobalUnit::new(gptr.unit().get())
    }
}
