// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task descriptors.
//!
//! Tasks are pooled `Box`es recycled through the lock-free freelist; the
//! same intrusive links double as ready-queue linkage (a task is never in
//! the pool and a queue at once). State transitions are monotonic except
//! the `Queued ⇄ Running` cycle driven by yields; `Cancelled` is
//! reachable from every non-terminal state.

use crate::sched::deps::DepKey;
use core::fmt;
use smallvec::SmallVec;
use core::ptr::NonNull;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Task priority; higher runs first when several tasks are ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
}

impl Priority {
    pub(crate) const COUNT: usize = 3;

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Created = 0,
    /// Dependencies outstanding; never in a ready queue.
    Waiting = 1,
    Queued = 2,
    Running = 3,
    /// Yielded mid-execution, context saved.
    Suspended = 4,
    Done = 5,
    Cancelled = 6,
}

impl TaskState {
    fn from_u8(raw: u8) -> TaskState {
        match raw {
            0 => TaskState::Created,
            1 => TaskState::Waiting,
            2 => TaskState::Queued,
            3 => TaskState::Running,
            4 => TaskState::Suspended,
            5 => TaskState::Done,
            _ => TaskState::Cancelled,
        }
    }
}

/// The shared side of a task handle: what `wait`/`test` observe after the
/// task object itself has been recycled. Waiters poll it while helping
/// with execution, so a state word is all there is.
pub(crate) struct TaskShared {
    pub state: AtomicU8,
}

impl TaskShared {
    pub fn finish(&self, state: TaskState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }
}

/// A shared handle to one spawned task, usable for `wait`/`test` from any
/// unit-local thread.
#[derive(Clone)]
pub struct TaskRef {
    pub(crate) shared: Arc<TaskShared>,
    /// Runtime-local id of the task while in flight (dep edges to it are
    /// keyed by this).
    pub(crate) id: u64,
}

impl TaskRef {
    /// The task's current (or final) state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.shared.state()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self.state(), TaskState::Done | TaskState::Cancelled)
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskRef(#{} {:?})", self.id, self.state())
    }
}

pub(crate) type Action = Box<dyn FnOnce() + Send + 'static>;

/// One task. Pooled; every field is reset when the descriptor is rented
/// from the freelist.
pub(crate) struct Task {
    links: lifo::Links<Task>,
    /// Runtime-local id; remote releases and dep edges name tasks by it.
    pub id: u64,
    pub prio: Priority,
    pub phase: u64,
    state: AtomicU8,
    /// Unresolved dependency count; the task becomes ready at zero.
    pub unresolved: AtomicU32,
    /// Live children; a task is only complete once this is zero.
    pub num_children: AtomicU32,
    /// Parent task id (the root task for top-level tasks).
    pub parent: u64,
    /// Ids of local tasks whose dependencies this task resolves.
    pub successors: Mutex<SmallVec<[u64; 4]>>,
    /// Remote dummy dependencies to release on completion:
    /// (requester global unit, requester task id).
    pub remote_releases: Mutex<SmallVec<[(i32, u64); 2]>>,
    /// Dependency-table keys this task is registered under, for cleanup.
    pub dep_keys: Mutex<SmallVec<[DepKey; 4]>>,
    pub action: Mutex<Option<Action>>,
    /// Saved execution context while suspended.
    pub ctx: Mutex<Option<Box<context::Context>>>,
    /// Earliest time a yielded task may run again.
    pub not_before: Mutex<Option<Instant>>,
    /// Handle shared with `TaskRef`s, if any.
    pub shared: Mutex<Option<Arc<TaskShared>>>,
}

impl Task {
    pub fn blank() -> Box<Task> {
        Box::new(Task {
            links: lifo::Links::new(),
            id: 0,
            prio: Priority::Normal,
            phase: 0,
            state: AtomicU8::new(TaskState::Created as u8),
            unresolved: AtomicU32::new(0),
            num_children: AtomicU32::new(0),
            parent: 0,
            successors: Mutex::new(SmallVec::new()),
            remote_releases: Mutex::new(SmallVec::new()),
            dep_keys: Mutex::new(SmallVec::new()),
            action: Mutex::new(None),
            ctx: Mutex::new(None),
            not_before: Mutex::new(None),
            shared: Mutex::new(None),
        })
    }

    /// Re-initializes a pooled descriptor for a new task.
    pub fn reset(&mut self, id: u64, prio: Priority, phase: u64, parent: u64, action: Action) {
        self.id = id;
        self.prio = prio;
        self.phase = phase;
        self.parent = parent;
        self.state = AtomicU8::new(TaskState::Created as u8);
        self.unresolved = AtomicU32::new(0);
        self.num_children = AtomicU32::new(0);
        self.successors.get_mut().unwrap().clear();
        self.remote_releases.get_mut().unwrap().clear();
        self.dep_keys.get_mut().unwrap().clear();
        *self.action.get_mut().unwrap() = Some(action);
        *self.ctx.get_mut().unwrap() = None;
        *self.not_before.get_mut().unwrap() = None;
        *self.shared.get_mut().unwrap() = None;
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: TaskState) {
        debug_assert!(
            state_transition_ok(self.state(), state),
            "illegal task transition {:?} -> {state:?}",
            self.state()
        );
        self.state.store(state as u8, Ordering::Release);
        if matches!(state, TaskState::Done | TaskState::Cancelled)
            && let Some(shared) = self.shared.lock().unwrap().as_ref()
        {
            shared.finish(state);
        }
    }
}

fn state_transition_ok(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    match (from, to) {
        // cancellation wins from any non-terminal state
        (Done | Cancelled, _) => false,
        (_, Cancelled) => true,
        (Created, Waiting | Queued) => true,
        (Waiting, Queued) => true,
        (Queued, Running) => true,
        // yield cycle; Suspended -> Done is a parent whose action
        // finished before its last child did
        (Running, Suspended | Queued | Done) => true,
        (Suspended, Queued | Running | Done) => true,
        _ => false,
    }
}

// Safety: atomics and mutexes guard every cross-thread field; the links
// are owned by whichever queue or pool currently holds the task.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

// Safety: standard intrusive projection; pooled tasks are pinned.
unsafe impl lifo::Linked for Task {
    type Handle = Box<Task>;

    fn into_ptr(handle: Box<Task>) -> NonNull<Task> {
        NonNull::from(Box::leak(handle))
    }

    unsafe fn from_ptr(ptr: NonNull<Task>) -> Box<Task> {
        // Safety: forwarded to the caller.
        unsafe { Box::from_raw(ptr.as_ptr()) }
    }

    unsafe fn links(ptr: NonNull<Task>) -> NonNull<lifo::Links<Task>> {
        // Safety: field projection within the allocation.
        unsafe { NonNull::new_unchecked(&raw mut (*ptr.as_ptr()).links) }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("prio", &self.prio)
            .field("phase", &self.phase)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        assert!(state_transition_ok(TaskState::Created, TaskState::Waiting));
        assert!(state_transition_ok(TaskState::Waiting, TaskState::Queued));
        assert!(state_transition_ok(TaskState::Queued, TaskState::Running));
        assert!(state_transition_ok(TaskState::Running, TaskState::Done));
        // yield cycle
        assert!(state_transition_ok(TaskState::Running, TaskState::Queued));
        // cancel from anywhere non-terminal
        assert!(state_transition_ok(TaskState::Waiting, TaskState::Cancelled));
        assert!(state_transition_ok(TaskState::Running, TaskState::Cancelled));
        // terminal states are sticky
        assert!(!state_transition_ok(TaskState::Done, TaskState::Queued));
        assert!(!state_transition_ok(TaskState::Cancelled, TaskState::Running));
        // no skipping the queue
        assert!(!state_transition_ok(TaskState::Waiting, TaskState::Running));
    }
}
