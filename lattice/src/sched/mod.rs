// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task scheduler.
//!
//! A fixed pool of worker threads executes tasks from per-worker ready
//! queues, a shared ready queue seeded by dependency resolution, and by
//! stealing from peers. Tasks run on their own stacks ([`context`]) so
//! they can suspend cooperatively at yields and waits. Dependencies are
//! matched in [`deps`]; remote readers travel as active messages through
//! the default queue. Phases throttle producers and scope the matching.
//!
//! The thread calling [`Runtime::task_complete`] participates in
//! execution; without it (or the optional progress thread) remote
//! dependency traffic makes no progress, which is the documented polling
//! contract.

pub(crate) mod cancel;
pub(crate) mod copyin;
pub(crate) mod deps;
pub(crate) mod queue;
pub(crate) mod task;
pub(crate) mod worker;

pub use cancel::CancelSignal;
pub use deps::{Dep, DepKind};
pub use task::{Priority, TaskRef, TaskState};

use crate::amq::AmFnId;
use crate::error::{ErrorCode, Result};
use crate::gptr::GptrFlags;
use crate::runtime::Runtime;
use crate::sched::deps::{DepRequest, DepTable, key_of};
use crate::sched::queue::TaskQueue;
use crate::sched::task::{Action, Task, TaskShared};
use crate::team::TeamId;
use crate::unit::{GlobalUnit, TeamUnit};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;

/// Function ids of the scheduler's active messages, agreed across units
/// by registration order at init.
pub(crate) struct AmIds {
    pub request: AmFnId,
    pub release: AmFnId,
    pub cancel: AmFnId,
    pub send_request: AmFnId,
    pub fence: AmFnId,
}

pub(crate) struct Scheduler {
    /// Team-shared ready queue, seeded by dependency resolution.
    pub shared: TaskQueue,
    /// One ready queue per worker.
    pub worker_queues: Vec<Arc<TaskQueue>>,
    /// Recycled task descriptors.
    pub pool: lifo::Stack<Task>,
    /// Recycled task stacks.
    pub stack_pool: Mutex<Vec<context::Stack>>,
    pub deps: Mutex<DepTable>,
    /// Tasks created and not yet done/cancelled.
    pub num_tasks: AtomicUsize,
    pub next_task_id: AtomicU64,
    pub phase: AtomicU64,
    /// Children of the implicit root task (top-level tasks).
    pub root_children: AtomicU32,
    pub cancel_requested: AtomicBool,
    pub shutdown: AtomicBool,
    pub idle_lock: Mutex<()>,
    pub idle_cv: Condvar,
    pub workers: Mutex<Vec<JoinHandle<()>>>,
    pub progress: Mutex<Option<JoinHandle<()>>>,
    pub am: OnceLock<AmIds>,
    pub cancel_team: OnceLock<TeamId>,
    pub next_copyin_tag: AtomicI32,
    /// The local task stream has drained; remote readers with no
    /// matching writer release immediately.
    pub draining: AtomicBool,
    /// Completion round of the quiescence protocol ending
    /// `task_complete`.
    pub drain_round: AtomicU64,
    /// Fences received per round.
    pub fence_counts: Mutex<hashbrown::HashMap<u64, i32>>,
}

impl Scheduler {
    pub fn new(num_workers: usize) -> Self {
        Self {
            shared: TaskQueue::new(),
            worker_queues: (0..num_workers).map(|_| Arc::new(TaskQueue::new())).collect(),
            pool: lifo::Stack::new(),
            stack_pool: Mutex::new(Vec::new()),
            deps: Mutex::new(DepTable::default()),
            num_tasks: AtomicUsize::new(0),
            next_task_id: AtomicU64::new(1),
            phase: AtomicU64::new(0),
            root_children: AtomicU32::new(0),
            cancel_requested: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            idle_lock: Mutex::new(()),
            idle_cv: Condvar::new(),
            workers: Mutex::new(Vec::new()),
            progress: Mutex::new(None),
            am: OnceLock::new(),
            cancel_team: OnceLock::new(),
            next_copyin_tag: AtomicI32::new(0),
            draining: AtomicBool::new(false),
            drain_round: AtomicU64::new(0),
            fence_counts: Mutex::new(hashbrown::HashMap::new()),
        }
    }

    pub fn am_ids(&self) -> &AmIds {
        self.am.get().expect("scheduler handlers not registered")
    }

    /// Wakes idle workers after new work arrived.
    pub fn notify(&self) {
        let _guard = self.idle_lock.lock().unwrap();
        self.idle_cv.notify_all();
    }

    /// Pops ready work: the shared queue first, then any worker queue.
    pub fn pop_any(&self) -> Option<Box<Task>> {
        self.shared
            .pop()
            .or_else(|| self.worker_queues.iter().find_map(|q| q.pop()))
    }
}

// === scheduler operations on the runtime handle ===

impl Runtime {
    /// Registers the scheduler's active-message handlers. Must run in the
    /// same position of the registration order on every unit.
    pub(crate) fn sched_register_handlers(&self) -> Result<()> {
        let ids = AmIds {
            request: self.am_register(am_dep_request)?,
            release: self.am_register(am_dep_release)?,
            cancel: self.am_register(cancel::am_cancel)?,
            send_request: self.am_register(copyin::am_send_request)?,
            fence: self.am_register(am_fence)?,
        };
        self.sched()
            .am
            .set(ids)
            .map_err(|_| ErrorCode::Inval)
            .expect("handlers registered twice");
        Ok(())
    }

    /// Starts workers and (optionally) the progress thread, and derives
    /// the cancellation team. Collective over all units.
    pub(crate) fn sched_start(&self) -> Result<()> {
        let cancel_team = self.team_clone(TeamId::ALL)?;
        self.sched()
            .cancel_team
            .set(cancel_team)
            .expect("scheduler started twice");
        worker::spawn_workers(self);
        if self.config().progress_thread {
            worker::spawn_progress(self);
        }
        Ok(())
    }

    /// Stops workers and the progress thread. Pending tasks are dropped;
    /// callers drain with [`task_complete`][Self::task_complete] first.
    pub(crate) fn sched_stop(&self) {
        let sched = self.sched();
        sched.shutdown.store(true, Ordering::Release);
        sched.notify();
        let workers: Vec<_> = sched.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
        if let Some(progress) = sched.progress.lock().unwrap().take() {
            let _ = progress.join();
        }
    }

    /// Creates a task executing `action` after `deps` are satisfied.
    pub fn task_create(
        &self,
        deps: &[Dep],
        prio: Priority,
        action: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        self.spawn_inner(deps, prio, Box::new(action), false)
            .map(|_| ())
    }

    /// Like [`task_create`][Self::task_create], returning a shared handle
    /// for `wait`/`test`.
    pub fn task_create_handle(
        &self,
        deps: &[Dep],
        prio: Priority,
        action: impl FnOnce() + Send + 'static,
    ) -> Result<TaskRef> {
        self.spawn_inner(deps, prio, Box::new(action), true)
            .map(|handle| handle.expect("handle requested"))
    }

    /// C-flavored creation: `data` is deep-copied and handed to `action`
    /// when the task runs.
    pub fn task_create_with_data(
        &self,
        deps: &[Dep],
        prio: Priority,
        action: fn(&mut [u8]),
        data: &[u8],
    ) -> Result<()> {
        let mut copy = data.to_vec();
        self.task_create(deps, prio, move || action(&mut copy))
    }

    fn spawn_inner(
        &self,
        deps: &[Dep],
        prio: Priority,
        action: Action,
        want_handle: bool,
    ) -> Result<Option<TaskRef>> {
        self.ensure_running()?;
        let sched = self.sched();
        if sched.cancel_requested.load(Ordering::Acquire) {
            return Err(ErrorCode::Again);
        }
        self.throttle_phases()?;

        // pre-pass: validate and classify, expanding copyin dependencies
        // into prefetch tasks
        let phase = sched.phase.load(Ordering::Acquire);
        let mut resolved: Vec<(Dep, bool)> = Vec::with_capacity(deps.len());
        for dep in deps {
            match dep.kind {
                DepKind::CopyIn => {
                    let replacement = copyin::expand(self, dep)?;
                    resolved.push((replacement, true));
                }
                DepKind::Direct => resolved.push((dep.clone(), true)),
                _ => {
                    let local = self.gptr_is_local(TeamId::ALL, dep.gptr)?;
                    if !local && matches!(dep.kind, DepKind::Out | DepKind::InOut) {
                        // writers must own the memory they order on
                        return Err(ErrorCode::Inval);
                    }
                    resolved.push((dep.clone(), local));
                }
            }
        }

        let id = sched.next_task_id.fetch_add(1, Ordering::AcqRel);
        let mut task = sched.pool.pop().unwrap_or_else(Task::blank);

        // parent bookkeeping
        let parent_ptr = worker::current_task_ptr();
        let parent_id = if parent_ptr.is_null() {
            sched.root_children.fetch_add(1, Ordering::AcqRel);
            0
        } else {
            // Safety: the parent is the currently running task of this
            // thread; it cannot complete while we run inside it.
            let parent = unsafe { &*parent_ptr };
            parent.num_children.fetch_add(1, Ordering::AcqRel);
            parent.id
        };

        task.reset(id, prio, phase, parent_id, action);
        let handle = want_handle.then(|| {
            Arc::new(TaskShared {
                state: AtomicU8::new(TaskState::Created as u8),
            })
        });
        *task.shared.lock().unwrap() = handle.clone();
        sched.num_tasks.fetch_add(1, Ordering::AcqRel);

        // matching happens under the table lock so that predecessor
        // completion cannot race the park decision
        let my_unit = self.my_unit();
        {
            let mut table = sched.deps.lock().unwrap();
            table.bump_phase(phase);
            table.inflight.insert(id, NonNull::from(&*task));

            for (dep, local) in &resolved {
                let dep_phase = dep.phase.unwrap_or(phase);
                match dep.kind {
                    DepKind::Direct => {
                        if let Some(pred) = &dep.pred {
                            table.edge(pred.id, &task);
                        }
                    }
                    _ if *local => {
                        table.match_local(&task, key_of(dep.gptr), dep.kind, dep_phase);
                    }
                    _ => {
                        // remote reader: dummy dependency released by the
                        // owner's completion message
                        task.unresolved.fetch_add(1, Ordering::AcqRel);
                        let target = self.gptr_owner(dep.gptr)?;
                        table.pending_requests.push((
                            target,
                            DepRequest {
                                key: key_of(dep.gptr),
                                phase: dep_phase,
                                requester: my_unit,
                                task: id,
                            },
                        ));
                    }
                }
            }

            if task.unresolved.load(Ordering::Acquire) == 0 {
                task.set_state(TaskState::Queued);
                drop(table);
                self.enqueue(task);
            } else {
                task.set_state(TaskState::Waiting);
                table.parked.insert(id, task);
            }
        }

        if self.config().matching_interval <= 1 {
            self.flush_dep_requests()?;
        }
        sched.notify();
        tracing::trace!(id, ?prio, phase, "task created");
        Ok(handle.map(|shared| TaskRef { shared, id }))
    }

    /// Pushes a ready task to the creating worker's queue, or the shared
    /// queue when called from outside the pool.
    pub(crate) fn enqueue(&self, task: Box<Task>) {
        let sched = self.sched();
        match worker::current_worker_id() {
            Some(id) => sched.worker_queues[id].push(task),
            None => sched.shared.push(task),
        }
        sched.notify();
    }

    /// Sends buffered remote reader registrations.
    pub(crate) fn flush_dep_requests(&self) -> Result<()> {
        let pending: Vec<(GlobalUnit, DepRequest)> = {
            let mut table = self.sched().deps.lock().unwrap();
            std::mem::take(&mut table.pending_requests)
        };
        if pending.is_empty() {
            return Ok(());
        }
        let amq = self.default_amq();
        let ids = self.sched().am_ids();
        for (target, req) in pending {
            self.amq_send(
                amq,
                TeamUnit::new(target.get()),
                ids.request,
                &req.encode(),
            )?;
        }
        Ok(())
    }

    /// The global unit owning the bytes behind `gptr` (scheduler scope is
    /// the universal team).
    fn gptr_owner(&self, gptr: crate::gptr::GlobalPtr) -> Result<GlobalUnit> {
        if gptr.has_flag(GptrFlags::GLOBAL) {
            return Ok(gptr.global_unit());
        }
        // team-scoped on ALL: team unit ids equal global ids
        Ok(GlobalUnit::new(gptr.unit().get()))
    }

    /// Completes a task: retires its dependency registrations, releases
    /// successors and remote readers, and recycles the descriptor (or
    /// parks it until outstanding children finish).
    pub(crate) fn complete_task(&self, task: Box<Task>, cancelled: bool) {
        let sched = self.sched();
        let mut ready: Vec<Box<Task>> = Vec::new();
        let mut releases: Vec<(i32, u64)> = Vec::new();

        {
            let mut table = sched.deps.lock().unwrap();
            self.finish_one(&mut table, task, cancelled, &mut ready, &mut releases);
        }

        for task in ready {
            self.enqueue(task);
        }
        if !releases.is_empty() {
            self.send_releases(&releases);
        }
    }

    /// Finishes one task under the table lock, cascading into parents
    /// whose last child this was.
    fn finish_one(
        &self,
        table: &mut DepTable,
        task: Box<Task>,
        cancelled: bool,
        ready: &mut Vec<Box<Task>>,
        releases: &mut Vec<(i32, u64)>,
    ) {
        let sched = self.sched();

        if !cancelled && task.num_children.load(Ordering::Acquire) > 0 {
            // a task is not done until its children are; park it
            task.set_state(TaskState::Suspended);
            table.parked.insert(task.id, task);
            return;
        }

        let final_state = if cancelled {
            TaskState::Cancelled
        } else {
            TaskState::Done
        };

        table.retire(&task);
        table.drop_phase(task.phase);
        table.inflight.remove(&task.id);

        // release local successors
        for succ in task.successors.lock().unwrap().drain(..) {
            if let Some(&succ_ptr) = table.inflight.get(&succ) {
                // Safety: in-flight under the table lock.
                let succ_task = unsafe { succ_ptr.as_ref() };
                if succ_task.unresolved.fetch_sub(1, Ordering::AcqRel) == 1
                    && let Some(succ_box) = table.parked.remove(&succ)
                {
                    succ_box.set_state(TaskState::Queued);
                    ready.push(succ_box);
                }
            }
        }

        // release remote readers
        releases.extend(task.remote_releases.lock().unwrap().drain(..));

        // parent bookkeeping, cascading finished parents
        let parent_id = task.parent;
        task.set_state(final_state);
        debug_assert!(cancelled || task.num_children.load(Ordering::Acquire) == 0);
        sched.num_tasks.fetch_sub(1, Ordering::AcqRel);
        self.recycle(task);

        if parent_id == 0 {
            sched.root_children.fetch_sub(1, Ordering::AcqRel);
        } else if let Some(&parent_ptr) = table.inflight.get(&parent_id) {
            // Safety: in-flight under the table lock.
            let parent = unsafe { parent_ptr.as_ref() };
            if parent.num_children.fetch_sub(1, Ordering::AcqRel) == 1
                && parent.state() == TaskState::Suspended
                && let Some(parent_box) = table.parked.remove(&parent_id)
            {
                // the parent's action already ran; it was waiting for us
                self.finish_one(table, parent_box, false, ready, releases);
            }
        }
    }

    fn recycle(&self, mut task: Box<Task>) {
        *task.action.lock().unwrap() = None;
        if let Some(ctx) = task.ctx.lock().unwrap().take()
            && let Some(stack) = ctx.into_stack()
        {
            self.sched().stack_pool.lock().unwrap().push(stack);
        }
        self.sched().pool.push(task);
    }

    pub(crate) fn send_releases(&self, releases: &[(i32, u64)]) {
        let amq = self.default_amq();
        let ids = self.sched().am_ids();
        for &(unit, task) in releases {
            let payload = task.to_ne_bytes();
            if let Err(err) =
                self.amq_send(amq, TeamUnit::new(unit), ids.release, &payload)
            {
                tracing::error!(?err, unit, task, "failed to send dependency release");
            }
        }
    }

    /// Releases a local dummy dependency named by an incoming release
    /// message.
    pub(crate) fn sched_release_remote(&self, task_id: u64) {
        let sched = self.sched();
        let ready = {
            let mut table = sched.deps.lock().unwrap();
            match table.inflight.get(&task_id) {
                Some(&ptr) => {
                    // Safety: in-flight under the table lock.
                    let task = unsafe { ptr.as_ref() };
                    if task.unresolved.fetch_sub(1, Ordering::AcqRel) == 1 {
                        table.parked.remove(&task_id)
                    } else {
                        None
                    }
                }
                None if sched.cancel_requested.load(Ordering::Acquire) => {
                    // the task was cancelled under us; drop the release
                    None
                }
                // releasing an unknown task is a protocol violation
                None => panic!("dependency release for unknown task {task_id}"),
            }
        };
        if let Some(task) = ready {
            task.set_state(TaskState::Queued);
            self.enqueue(task);
        }
    }

    /// Waits for `tref` to finish, executing other tasks meanwhile.
    pub fn task_wait(&self, tref: &TaskRef) -> Result<()> {
        self.ensure_running()?;
        if worker::in_task() {
            while !tref.is_finished() {
                self.task_yield(-1)?;
            }
            return Ok(());
        }
        worker::ensure_tls(self, None);
        while !tref.is_finished() {
            if let Some(task) = self.sched().pop_any() {
                worker::run_task(self, task);
            } else {
                self.sched_progress_once()?;
                std::thread::yield_now();
            }
        }
        Ok(())
    }

    /// Non-blocking completion probe of `tref`.
    pub fn task_test(&self, tref: &TaskRef) -> Result<bool> {
        self.ensure_running()?;
        Ok(tref.is_finished())
    }

    /// Yields the current task; `delay_us < 0` requests immediate
    /// rescheduling, otherwise the task does not run again before the
    /// delay elapsed. Outside a task this executes one ready task
    /// instead.
    pub fn task_yield(&self, delay_us: i64) -> Result<()> {
        self.ensure_running()?;
        worker::task_yield(self, delay_us)
    }

    /// Waits on a set of RMA handles. Inside a task this suspends
    /// (test + yield); outside it blocks on each handle.
    ///
    /// A failed handle cancels the calling task.
    pub fn wait_handles(&self, handles: &mut [crate::rma::HandleRef]) -> Result<()> {
        self.ensure_running()?;
        if !worker::in_task() {
            for handle in handles.iter_mut() {
                handle.wait()?;
            }
            return Ok(());
        }
        loop {
            let mut all = true;
            for handle in handles.iter_mut() {
                match handle.test() {
                    Ok(done) => all &= done,
                    Err(err) => {
                        // waiting on a failed transfer cancels the task
                        tracing::error!(?err, "handle failed, cancelling task");
                        std::panic::panic_any(CancelSignal);
                    }
                }
            }
            if all {
                return Ok(());
            }
            self.task_yield(-1)?;
        }
    }

    /// Bumps the local phase counter, triggering a matching pass every
    /// `MATCHING_INTERVAL` phases and throttling when too many phases
    /// are live.
    pub fn phase_advance(&self) -> Result<()> {
        self.ensure_running()?;
        let sched = self.sched();
        let phase = sched.phase.fetch_add(1, Ordering::AcqRel) + 1;
        if phase.is_multiple_of(self.config().matching_interval.max(1)) {
            self.flush_dep_requests()?;
        }
        self.throttle_phases()
    }

    /// The current phase.
    #[must_use]
    pub fn phase_current(&self) -> u64 {
        self.sched().phase.load(Ordering::Acquire)
    }

    /// Collectively aligns the phase counter across `team` to the
    /// maximum.
    pub fn phase_resync(&self, team: TeamId) -> Result<()> {
        self.ensure_running()?;
        self.flush_dep_requests()?;
        let mine = self.sched().phase.load(Ordering::Acquire);
        let mut out = mine.to_ne_bytes();
        self.allreduce(
            team,
            &mine.to_ne_bytes(),
            &mut out,
            crate::collective::ReduceOp::Max,
            crate::collective::DataType::U64,
        )?;
        self.sched()
            .phase
            .store(u64::from_ne_bytes(out), Ordering::Release);
        self.barrier(team)
    }

    /// Producer throttle: while more than `MAX_ACTIVE_PHASES` phases have
    /// live tasks, help execute instead of creating more.
    fn throttle_phases(&self) -> Result<()> {
        let max_active = self.config().max_active_phases;
        if max_active == 0 {
            return Ok(());
        }
        loop {
            let span = {
                let table = self.sched().deps.lock().unwrap();
                let phase = self.sched().phase.load(Ordering::Acquire);
                table.min_live_phase().map(|min| phase.saturating_sub(min))
            };
            if span.is_none_or(|s| s < max_active) {
                return Ok(());
            }
            if worker::in_task() {
                self.task_yield(-1)?;
            } else {
                worker::ensure_tls(self, None);
                if let Some(task) = self.sched().pop_any() {
                    worker::run_task(self, task);
                } else {
                    self.sched_progress_once()?;
                }
            }
        }
    }

    /// Runs the local task graph to completion. With `local_only` the
    /// call neither sends nor serves remote dependency traffic; a
    /// program with remote dependencies can therefore deadlock here and
    /// must use the full variant.
    pub fn task_complete(&self, local_only: bool) -> Result<()> {
        self.ensure_running()?;
        let sched = self.sched();
        worker::ensure_tls(self, None);
        if !local_only {
            self.flush_dep_requests()?;
        }

        loop {
            if sched.cancel_requested.load(Ordering::Acquire) {
                self.cancel_finish()?;
                continue;
            }
            if let Some(task) = sched.pop_any() {
                worker::run_task(self, task);
                continue;
            }
            if !local_only {
                self.sched_progress_once()?;
            }
            if sched.num_tasks.load(Ordering::Acquire) == 0
                && sched.root_children.load(Ordering::Acquire) == 0
            {
                break;
            }
            std::thread::yield_now();
        }

        if !local_only {
            self.drain_quiesce()?;
        }

        // the task stream is drained; reset the matching state
        let mut table = sched.deps.lock().unwrap();
        debug_assert!(table.parked.is_empty());
        table.buckets.clear();
        sched.phase.store(0, Ordering::Release);
        Ok(())
    }

    /// Distributed quiescence ending a non-local `task_complete`.
    ///
    /// The local stream is drained: release every parked remote reader
    /// (its writer can no longer appear), fence every peer, then keep
    /// serving messages (and any send tasks they spawn) until every
    /// peer's fence of this round arrived. Message rings are FIFO per
    /// (sender, receiver) pair, so a peer's fence implies all of its
    /// earlier releases and requests have been seen.
    fn drain_quiesce(&self) -> Result<()> {
        let sched = self.sched();
        let round = sched.drain_round.fetch_add(1, Ordering::AcqRel);
        sched.draining.store(true, Ordering::Release);

        let stale: Vec<(i32, u64)> = {
            let mut table = sched.deps.lock().unwrap();
            table
                .take_stale_remote_waiters()
                .into_iter()
                .map(|req| (req.requester.get(), req.task))
                .collect()
        };
        self.send_releases(&stale);

        let peers = self.size() - 1;
        let ids_fence = sched.am_ids().fence;
        self.amq_bcast(self.default_amq(), ids_fence, &round.to_ne_bytes())?;

        loop {
            if sched.cancel_requested.load(Ordering::Acquire) {
                // a cancellation raced the drain; settle it and keep
                // waiting for the fences
                self.cancel_finish()?;
                continue;
            }
            if let Some(task) = sched.pop_any() {
                worker::run_task(self, task);
                continue;
            }
            self.sched_progress_once()?;
            let fences = sched
                .fence_counts
                .lock()
                .unwrap()
                .get(&round)
                .copied()
                .unwrap_or(0);
            if fences >= peers
                && sched.num_tasks.load(Ordering::Acquire) == 0
                && sched.root_children.load(Ordering::Acquire) == 0
            {
                break;
            }
            std::thread::yield_now();
        }

        sched.fence_counts.lock().unwrap().remove(&round);
        sched.draining.store(false, Ordering::Release);
        Ok(())
    }

    /// One round of background progress: drains the default message
    /// queue, flushes buffered registrations, polls the driver.
    pub(crate) fn sched_progress_once(&self) -> Result<()> {
        self.amq_process(self.default_amq())?;
        self.flush_dep_requests()?;
        self.driver().progress();
        Ok(())
    }
}

// === active-message handlers ===

fn am_dep_request(rt: &Runtime, payload: &[u8]) {
    let req = DepRequest::decode(payload);
    tracing::trace!(?req, "dependency request");
    let draining = rt.sched().draining.load(Ordering::Acquire);
    let release_now = {
        let mut table = rt.sched().deps.lock().unwrap();
        table.register_remote_reader(req, draining)
    };
    if release_now {
        rt.send_releases(&[(req.requester.get(), req.task)]);
    }
}

fn am_fence(rt: &Runtime, payload: &[u8]) {
    assert!(payload.len() >= 8, "truncated fence");
    let round = u64::from_ne_bytes(payload[..8].try_into().unwrap());
    *rt.sched()
        .fence_counts
        .lock()
        .unwrap()
        .entry(round)
        .or_insert(0) += 1;
}

fn am_dep_release(rt: &Runtime, payload: &[u8]) {
    assert!(payload.len() >= 8, "truncated dependency release");
    let task_id = u64::from_ne_bytes(payload[..8].try_into().unwrap());
    tracing::trace!(task_id, "dependency release");
    rt.sched_release_remote(task_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_queues_are_independent() {
        let sched = Scheduler::new(2);
        let mut t = Task::blank();
        t.reset(1, Priority::Normal, 0, 0, Box::new(|| {}));
        sched.worker_queues[1].push(t);
        assert!(sched.worker_queues[0].pop().is_none());
        assert!(sched.pop_any().is_some());
    }
}
