// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The wire driver abstraction.
//!
//! The runtime core is written against this trait only; a driver supplies
//! communicators with byte-buffer collectives, memory windows with
//! one-sided put/get plus 32-bit atomics, and tagged two-sided messages.
//! One driver ships in-tree: the in-process shared-memory transport in
//! [`shmem`], where units are OS threads of a single process.
//!
//! Buffer sizes are bytes throughout; the driver never interprets element
//! types.

pub mod shmem;

use crate::error::Result;
use crate::unit::GlobalUnit;
use core::fmt;

/// Handle to a communicator (an ordered set of units with collective
/// state). Communicator 0 always exists and spans the universe.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommId(u32);

/// Handle to a registered memory window.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WinId(u32);

/// Completion token of one outstanding one-sided operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion(pub u64);

/// Rank of a unit within a communicator. Ranks follow the member order
/// the communicator was created with.
pub type Rank = i32;

/// Element-wise fold used by [`Transport::reduce`]: `combine(acc, contrib)`
/// folds one rank's contribution into the accumulator. Contributions are
/// folded in ascending rank order.
pub type CombineFn<'a> = &'a (dyn Fn(&mut [u8], &[u8]) + Sync);

impl CommId {
    /// The universe communicator.
    pub const WORLD: CommId = CommId(0);

    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl WinId {
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for CommId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[comm {}]", self.0)
    }
}

impl fmt::Debug for WinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[win {}]", self.0)
    }
}

/// A per-unit endpoint of the wire driver.
///
/// Collective calls must be entered by every member of the named
/// communicator; one-sided calls complete remotely no later than the next
/// matching [`fence`][Transport::fence] (a driver is free to complete them
/// earlier).
pub trait Transport: Send + Sync {
    /// This endpoint's identity in the universe.
    fn global_unit(&self) -> GlobalUnit;

    /// Number of units in the universe.
    fn universe_size(&self) -> i32;

    // --- communicators ---

    /// Collectively derives a communicator over `members` (ascending
    /// global ids) from `parent`. Every member of `parent` must call with
    /// the same `members`; callers not in `members` (or an empty
    /// `members`) receive `None`.
    fn comm_split(&self, parent: CommId, members: &[GlobalUnit]) -> Result<Option<CommId>>;

    /// Collectively releases `comm`. Must be the last collective on it.
    fn comm_free(&self, comm: CommId) -> Result<()>;

    /// This endpoint's rank in `comm`, if a member.
    fn comm_rank(&self, comm: CommId) -> Result<Rank>;

    /// Number of members of `comm`.
    fn comm_size(&self, comm: CommId) -> Result<i32>;

    // --- collectives (buffer sizes in bytes) ---

    fn barrier(&self, comm: CommId) -> Result<()>;

    fn bcast(&self, comm: CommId, root: Rank, buf: &mut [u8]) -> Result<()>;

    /// Gathers `send` from every rank into `recv` at `root` (rank order,
    /// concatenated). `recv` is ignored on non-roots.
    fn gather(&self, comm: CommId, root: Rank, send: &[u8], recv: &mut [u8]) -> Result<()>;

    /// Scatters equal chunks of `send` at `root` to every rank's `recv`.
    /// `send` is ignored on non-roots.
    fn scatter(&self, comm: CommId, root: Rank, send: &[u8], recv: &mut [u8]) -> Result<()>;

    fn allgather(&self, comm: CommId, send: &[u8], recv: &mut [u8]) -> Result<()>;

    /// Reduces contributions element-blind: the driver folds the byte
    /// buffers of all ranks with `combine` in ascending rank order.
    /// `recv` receives the result at `root` only.
    fn reduce(
        &self,
        comm: CommId,
        root: Rank,
        send: &[u8],
        recv: &mut [u8],
        combine: CombineFn<'_>,
    ) -> Result<()>;

    // --- two-sided (copyin SENDRECV path) ---

    fn send(&self, comm: CommId, dest: Rank, tag: i32, buf: &[u8]) -> Result<()>;

    fn recv(&self, comm: CommId, src: Rank, tag: i32, buf: &mut [u8]) -> Result<()>;

    // --- memory windows ---

    /// Collectively registers `len` bytes at `base` for one-sided access
    /// by every member of `comm`. The window addresses target memory by
    /// *displacement*: the value a peer must pass as `disp` to reach this
    /// unit's `base` is `base as u64` (gathered by the caller).
    fn win_create(&self, comm: CommId, base: *mut u8, len: usize) -> Result<WinId>;

    /// Collectively releases `win`. Outstanding operations must be fenced
    /// first.
    fn win_free(&self, comm: CommId, win: WinId) -> Result<()>;

    /// Direct load/store pointer to `rank`'s window memory when the two
    /// units share an address space (or a mapped shared-memory region).
    fn win_peer_base(&self, win: WinId, rank: Rank) -> Option<*mut u8>;

    // --- one-sided ---

    /// # Safety contract
    ///
    /// `src` must stay valid until the returned completion is waited on
    /// (local completion); the target range must lie within `rank`'s
    /// window.
    fn put(&self, win: WinId, rank: Rank, disp: u64, src: *const u8, len: usize)
    -> Result<Completion>;

    fn get(&self, win: WinId, rank: Rank, disp: u64, dst: *mut u8, len: usize)
    -> Result<Completion>;

    /// `true` once the operation completed locally and remotely.
    fn test(&self, completion: Completion) -> Result<bool>;

    fn wait(&self, completion: Completion) -> Result<()>;

    /// Forces remote completion of all outstanding operations on `win`
    /// targeting `rank`, or every rank when `None`.
    fn fence(&self, win: WinId, rank: Option<Rank>) -> Result<()>;

    // --- window atomics (lock + active-message counters) ---

    fn atomic_fetch_add32(&self, win: WinId, rank: Rank, disp: u64, value: i32) -> Result<i32>;

    fn atomic_cas32(
        &self,
        win: WinId,
        rank: Rank,
        disp: u64,
        expect: i32,
        desired: i32,
    ) -> Result<i32>;

    fn atomic_load32(&self, win: WinId, rank: Rank, disp: u64) -> Result<i32>;

    fn atomic_store32(&self, win: WinId, rank: Rank, disp: u64, value: i32) -> Result<()>;

    // --- lifecycle ---

    /// Polls the driver. Called by the progress thread and idle workers.
    fn progress(&self) {}

    /// Shuts the endpoint down. The last endpoint of a universe tears the
    /// shared state down with it.
    fn close(&self) -> Result<()>;
}
