// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Global task cancellation.
//!
//! Cancellation is cooperative and at task granularity: a cancel request
//! raises a flag every worker checks at dependency releases and yields;
//! pending tasks are drained from the queues without running, the task
//! currently executing unwinds at its next cancellation point, and all
//! units rendezvous on a dedicated clone of the universal team before the
//! flag clears. In-flight RMA is never cancelled; it completes normally.

use crate::error::Result;
use crate::runtime::Runtime;
use crate::sched::worker;
use std::sync::atomic::Ordering;

/// Panic payload raised at cancellation points inside a task; the task
/// trampoline catches it and finishes the task as `Cancelled`.
#[derive(Debug)]
pub struct CancelSignal;

/// Handler for the cancel broadcast.
pub(crate) fn am_cancel(rt: &Runtime, _payload: &[u8]) {
    tracing::debug!("remote cancellation request");
    rt.sched().cancel_requested.store(true, Ordering::Release);
    rt.sched().notify();
}

impl Runtime {
    /// Whether a cancellation is in progress.
    #[must_use]
    pub fn cancellation_requested(&self) -> bool {
        self.sched().cancel_requested.load(Ordering::Acquire)
    }

    /// Starts global cancellation from a single unit: broadcasts the
    /// cancel request to every other unit, then unwinds the calling task
    /// (if any).
    pub fn cancel_bcast(&self) -> Result<()> {
        self.ensure_running()?;
        tracing::info!("cancellation broadcast");
        let ids = self.sched().am_ids();
        self.amq_bcast(self.default_amq(), ids.cancel, &[])?;
        self.sched().cancel_requested.store(true, Ordering::Release);
        self.sched().notify();
        if worker::in_task() {
            std::panic::panic_any(CancelSignal);
        }
        Ok(())
    }

    /// Collective cancellation: every unit enters voluntarily. Unwinds
    /// the calling task (if any) after the flag is raised.
    pub fn cancel_barrier(&self) -> Result<()> {
        self.ensure_running()?;
        tracing::info!("cancellation barrier");
        self.sched().cancel_requested.store(true, Ordering::Release);
        self.sched().notify();
        let team = *self.sched().cancel_team.get().expect("scheduler started");
        self.barrier(team)?;
        if worker::in_task() {
            std::panic::panic_any(CancelSignal);
        }
        Ok(())
    }

    /// Worker-side drain: cancels everything sitting in the queues.
    pub(crate) fn cancel_drain_queues(&self) {
        while let Some(task) = self.sched().pop_any() {
            tracing::trace!(id = task.id, "cancelling queued task");
            self.complete_task(task, true);
        }
    }

    /// Drives a cancellation to completion from the completing thread:
    /// drains queues and parked tasks, waits for running tasks to hit a
    /// cancellation point, rendezvouses with every unit, clears the flag.
    pub(crate) fn cancel_finish(&self) -> Result<()> {
        let sched = self.sched();

        loop {
            self.cancel_drain_queues();

            // waiting tasks are cancelled without ever becoming ready
            let parked: Vec<_> = {
                let mut table = sched.deps.lock().unwrap();
                let ids: Vec<u64> = table.parked.keys().copied().collect();
                ids.iter()
                    .filter_map(|id| table.parked.remove(id))
                    .collect()
            };
            for task in parked {
                self.complete_task(task, true);
            }

            // serve cancel/release traffic so other units can drain too
            self.amq_process(self.default_amq())?;
            self.driver().progress();

            if sched.num_tasks.load(Ordering::Acquire) == 0
                && sched.root_children.load(Ordering::Acquire) == 0
            {
                break;
            }
            std::thread::yield_now();
        }

        // drop registrations that will never be served
        {
            let mut table = sched.deps.lock().unwrap();
            table.take_stale_remote_waiters();
            table.pending_requests.clear();
            table.buckets.clear();
        }

        let team = *sched.cancel_team.get().expect("scheduler started");
        self.barrier(team)?;
        sched.cancel_requested.store(false, Ordering::Release);
        sched.notify();
        tracing::info!("cancellation complete");
        Ok(())
    }
}
