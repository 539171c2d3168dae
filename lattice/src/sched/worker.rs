// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Worker threads and the cooperative dispatch loop.
//!
//! Every thread that executes tasks (workers, the progress thread's
//! owner, and whichever thread drives `task_complete`) carries a
//! thread-local cell with its *home* context and the currently running
//! task. A task runs on its own stack: the worker swaps into the task's
//! context, the task swaps back to suspend or finish, and the worker
//! reads the disposition it left behind.
//!
//! Task actions that unwind with [`CancelSignal`] were cancelled at a
//! cancellation point; any other unwind out of user code aborts the
//! process, per the failure contract.

use crate::error::Result;
use crate::runtime::{IdlePolicy, Runtime};
use crate::sched::cancel::CancelSignal;
use crate::sched::task::{Task, TaskState};
use context::{Context, Stack};
use std::cell::{Cell, OnceCell};
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    None,
    Done,
    Cancelled,
    Yielded,
}

pub(crate) struct WorkerTls {
    worker_id: Option<usize>,
    home: *mut Context,
    current: Cell<*mut Task>,
    active_ctx: Cell<*mut Context>,
    disposition: Cell<Disposition>,
}

std::thread_local! {
    static TLS: OnceCell<Rc<WorkerTls>> = const { OnceCell::new() };
}

/// Installs this thread's scheduler cell (idempotent).
pub(crate) fn ensure_tls(_rt: &Runtime, worker_id: Option<usize>) -> Rc<WorkerTls> {
    TLS.with(|tls| {
        tls.get_or_init(|| {
            Rc::new(WorkerTls {
                worker_id,
                home: Box::into_raw(Box::new(Context::empty())),
                current: Cell::new(core::ptr::null_mut()),
                active_ctx: Cell::new(core::ptr::null_mut()),
                disposition: Cell::new(Disposition::None),
            })
        })
        .clone()
    })
}

fn tls() -> Option<Rc<WorkerTls>> {
    TLS.with(|tls| tls.get().cloned())
}

/// Whether the calling thread is currently inside a task.
pub(crate) fn in_task() -> bool {
    tls().is_some_and(|cell| !cell.current.get().is_null())
}

/// The currently running task of this thread, null at root level.
pub(crate) fn current_task_ptr() -> *mut Task {
    tls().map_or(core::ptr::null_mut(), |cell| cell.current.get())
}

/// This thread's worker id, `None` outside the pool.
pub(crate) fn current_worker_id() -> Option<usize> {
    tls().and_then(|cell| cell.worker_id)
}

/// Runs `task` to its next suspension point on the calling thread.
pub(crate) fn run_task(rt: &Runtime, task: Box<Task>) {
    let sched = rt.sched();
    let cell = ensure_tls(rt, None);

    // honor a yield delay
    {
        let mut not_before = task.not_before.lock().unwrap();
        if let Some(at) = *not_before {
            if at > Instant::now() {
                drop(not_before);
                sched.shared.push(task);
                // don't busy-spin a pop/requeue cycle on a lone delayed
                // task
                std::thread::yield_now();
                return;
            }
            *not_before = None;
        }
    }

    if sched.cancel_requested.load(Ordering::Acquire) {
        rt.complete_task(task, true);
        return;
    }

    task.set_state(TaskState::Running);
    let saved_ctx = task.ctx.lock().unwrap().take();
    let raw_task = Box::into_raw(task);

    let ctx = match saved_ctx {
        Some(ctx) => ctx,
        None => {
            let stack = {
                let mut pool = sched.stack_pool.lock().unwrap();
                pool.pop()
            };
            let stack = stack
                .map_or_else(|| Stack::new(rt.config().task_stack_size), Ok)
                .expect("failed to map a task stack");
            Box::new(
                Context::with_entry(stack, task_trampoline, raw_task as usize)
                    .expect("failed to prepare task context"),
            )
        }
    };
    let raw_ctx = Box::into_raw(ctx);

    let prev_task = cell.current.replace(raw_task);
    let prev_ctx = cell.active_ctx.replace(raw_ctx);
    cell.disposition.set(Disposition::None);

    // Safety: home is this thread's pinned capture slot; the task context
    // is prepared (or previously suspended) and runs only here.
    unsafe {
        Context::swap(cell.home, raw_ctx);
    }

    let disposition = cell.disposition.get();
    cell.current.set(prev_task);
    cell.active_ctx.set(prev_ctx);

    // Safety: both were leaked above and the task is suspended or
    // finished, nothing executes on them.
    let (ctx, task) = unsafe { (Box::from_raw(raw_ctx), Box::from_raw(raw_task)) };

    match disposition {
        Disposition::Yielded => {
            *task.ctx.lock().unwrap() = Some(ctx);
            task.set_state(TaskState::Queued);
            sched.shared.push(task);
            sched.notify();
        }
        Disposition::Done => {
            if let Some(stack) = ctx.into_stack() {
                sched.stack_pool.lock().unwrap().push(stack);
            }
            rt.complete_task(task, false);
        }
        Disposition::Cancelled => {
            if let Some(stack) = ctx.into_stack() {
                sched.stack_pool.lock().unwrap().push(stack);
            }
            rt.complete_task(task, true);
        }
        Disposition::None => unreachable!("task returned without a disposition"),
    }
}

/// Entry point of every task context.
extern "C" fn task_trampoline(arg: usize) -> ! {
    let raw_task = arg as *mut Task;
    let cell = tls().expect("task entered outside a scheduler thread");

    // Safety: the task is pinned for the duration of the run.
    let action = unsafe { &*raw_task }
        .action
        .lock()
        .unwrap()
        .take()
        .expect("task without action");

    let result = std::panic::catch_unwind(AssertUnwindSafe(action));
    let disposition = match result {
        Ok(()) => Disposition::Done,
        Err(payload) if payload.downcast_ref::<CancelSignal>().is_some() => {
            Disposition::Cancelled
        }
        Err(_) => {
            // user actions must not unwind into the runtime
            tracing::error!("task action panicked, aborting");
            std::process::abort();
        }
    };
    cell.disposition.set(disposition);

    // Safety: swaps back to the worker loop; this context is never
    // resumed again.
    unsafe {
        Context::swap(cell.active_ctx.get(), cell.home);
    }
    unreachable!("finished task context resumed");
}

/// Suspends the current task (negative delay: immediate requeue). From
/// root level, executes one ready task instead.
pub(crate) fn task_yield(rt: &Runtime, delay_us: i64) -> Result<()> {
    let Some(cell) = tls() else {
        return yield_from_root(rt);
    };
    let raw_task = cell.current.get();
    if raw_task.is_null() {
        return yield_from_root(rt);
    }
    let sched = rt.sched();
    if sched.cancel_requested.load(Ordering::Acquire) {
        std::panic::panic_any(CancelSignal);
    }

    // Safety: the current task is pinned while running.
    let task = unsafe { &*raw_task };
    if delay_us >= 0 {
        *task.not_before.lock().unwrap() =
            Some(Instant::now() + Duration::from_micros(u64::try_from(delay_us).unwrap()));
    }
    task.set_state(TaskState::Suspended);
    cell.disposition.set(Disposition::Yielded);

    // Safety: suspend into the worker's home context; resumed by the
    // next `run_task` on this task.
    unsafe {
        Context::swap(cell.active_ctx.get(), cell.home);
    }

    if rt.sched().cancel_requested.load(Ordering::Acquire) {
        std::panic::panic_any(CancelSignal);
    }
    Ok(())
}

fn yield_from_root(rt: &Runtime) -> Result<()> {
    ensure_tls(rt, None);
    if let Some(task) = rt.sched().pop_any() {
        run_task(rt, task);
    } else {
        rt.driver().progress();
    }
    Ok(())
}

/// Spawns the worker pool.
pub(crate) fn spawn_workers(rt: &Runtime) {
    let sched = rt.sched();
    let num = sched.worker_queues.len();
    let mut workers = sched.workers.lock().unwrap();
    for id in 0..num {
        let rt = rt.clone();
        let handle = std::thread::Builder::new()
            .name(format!("lattice-worker-{id}"))
            .spawn(move || worker_main(&rt, id))
            .expect("failed to spawn worker");
        workers.push(handle);
    }
}

fn worker_main(rt: &Runtime, id: usize) {
    let cell = ensure_tls(rt, Some(id));
    let sched = rt.sched();
    let cfg = rt.config();
    if cfg.bind_threads {
        bind_thread(id, cfg.bind_threads_verbose);
    }
    tracing::debug!(worker = id, "worker up");

    let mut rng = fastrand::Rng::with_seed(0x9e3779b9 ^ id as u64);
    let local = sched.worker_queues[id].clone();
    loop {
        if sched.shutdown.load(Ordering::Acquire) {
            break;
        }
        if sched.cancel_requested.load(Ordering::Acquire) {
            rt.cancel_drain_queues();
            std::thread::yield_now();
            continue;
        }

        let task = local
            .pop()
            .or_else(|| sched.shared.pop())
            .or_else(|| steal(sched, id, &mut rng));
        match task {
            Some(task) => run_task(rt, task),
            None => idle_wait(rt, cfg.idle_policy, cfg.idle_sleep),
        }
    }

    // Safety: created in `ensure_tls`, the loop is over and nothing can
    // swap to this thread anymore.
    unsafe { drop(Box::from_raw(cell.home)) };
    tracing::debug!(worker = id, "worker down");
}

fn steal(
    sched: &crate::sched::Scheduler,
    me: usize,
    rng: &mut fastrand::Rng,
) -> Option<Box<Task>> {
    let n = sched.worker_queues.len();
    if n <= 1 {
        return None;
    }
    let victim = rng.usize(0..n);
    if victim == me {
        return None;
    }
    sched.worker_queues[victim].pop()
}

fn idle_wait(rt: &Runtime, policy: IdlePolicy, sleep: Duration) {
    let sched = rt.sched();
    match policy {
        IdlePolicy::Poll => std::thread::yield_now(),
        IdlePolicy::Sleep => std::thread::sleep(sleep),
        IdlePolicy::Wait => {
            if !sched.shared.is_empty() {
                return;
            }
            let guard = sched.idle_lock.lock().unwrap();
            // bounded wait so shutdown and cancellation are never missed
            let _ = sched
                .idle_cv
                .wait_timeout(guard, Duration::from_millis(10))
                .unwrap();
        }
    }
}

/// Spawns the optional progress thread polling the transport and the
/// message queue.
pub(crate) fn spawn_progress(rt: &Runtime) {
    let sched = rt.sched();
    let interval = rt.config().progress_interval;
    let rt = rt.clone();
    let handle = std::thread::Builder::new()
        .name("lattice-progress".into())
        .spawn(move || {
            tracing::debug!("progress thread up");
            while !rt.sched().shutdown.load(Ordering::Acquire) {
                if let Err(err) = rt.sched_progress_once() {
                    tracing::warn!(?err, "progress iteration failed");
                }
                std::thread::sleep(interval);
            }
        })
        .expect("failed to spawn progress thread");
    *sched.progress.lock().unwrap() = Some(handle);
}

/// Pins the calling worker to a core, round-robin over the online set.
#[cfg(target_os = "linux")]
fn bind_thread(worker_id: usize, verbose: bool) {
    // Safety: CPU_* macros operate on a zeroed set; sched_setaffinity
    // with size_of::<cpu_set_t> is the documented calling convention.
    unsafe {
        let cores = libc::sysconf(libc::_SC_NPROCESSORS_ONLN);
        if cores <= 0 {
            return;
        }
        let core = worker_id % usize::try_from(cores).unwrap();
        let mut set: libc::cpu_set_t = core::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);
        let ret = libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set);
        if verbose {
            if ret == 0 {
                tracing::info!(worker = worker_id, core, "bound worker");
            } else {
                tracing::warn!(worker = worker_id, core, "failed to bind worker");
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn bind_thread(worker_id: usize, verbose: bool) {
    if verbose {
        tracing::warn!(worker = worker_id, "thread binding is linux-only");
    }
}
