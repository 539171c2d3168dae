// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A partitioned-global-address-space runtime substrate.
//!
//! The runtime spans a universe of *units* (one [`Runtime`] handle per
//! unit) that allocate memory collectively or locally, address any byte
//! of the resulting space through 128-bit [`GlobalPtr`]s, and move data
//! with one-sided GET/PUT, collectives, active messages and a data-flow
//! task scheduler:
//!
//! - [`team`] / [`group`]: hierarchical subsets of units with independent
//!   collective contexts
//! - [`segment`]: the registry translating (segment, unit, offset) to
//!   addresses, with a shared-memory fast path
//! - [`rma`]: non-blocking one-sided transfers with handles and
//!   completion ordering
//! - [`collective`]: barrier, bcast, gather/scatter/allgather,
//!   reduce/allreduce
//! - [`amq`]: remote function invocation through per-team message rings
//! - [`sched`]: worker threads running tasks with data-flow dependencies,
//!   phases, cancellation and copyin pre-fetch
//! - [`transport`]: the abstract wire driver everything dispatches to
//!   (the in-process shared-memory driver ships in-tree)
//!
//! All public calls return [`ErrorCode`]s from a closed set; there are no
//! string errors on the API.

pub mod amq;
pub mod collective;
pub mod env;
mod error;
pub mod gptr;
pub mod group;
pub mod lock;
mod mem;
pub mod rma;
pub mod runtime;
pub mod sched;
pub mod segment;
pub mod team;
pub mod transport;
pub mod unit;

pub use amq::{AmFnId, AmHandler, Amq};
pub use collective::{DataType, ReduceOp, UserReduceFn};
pub use error::{ErrorCode, Result};
pub use gptr::{GlobalPtr, GptrFlags};
pub use group::{GROUP_MAX_SIZE, Group};
pub use lock::TeamLock;
pub use rma::HandleRef;
pub use runtime::{Config, CopyinImpl, CopyinWait, IdlePolicy, LaunchArgs, Runtime};
pub use sched::{Dep, DepKind, Priority, TaskRef, TaskState};
pub use segment::{SegFlags, SegmentId};
pub use team::TeamId;
pub use transport::Transport;
pub use unit::{GlobalUnit, TeamUnit};
