// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The in-process shared-memory driver.
//!
//! Units are OS threads of one process, attached to a *sync area*
//! identified by the `--dart-syncarea-id` launch flag: the first unit to
//! attach creates the shared cluster state, later units join it, and the
//! last unit to close tears it down. Since all units share one address
//! space, every memory window is trivially a shared-memory window and
//! one-sided operations complete synchronously.
//!
//! Collectives rendezvous through a generation-counted exchange slot per
//! communicator; two-sided messages go through a tagged mailbox.

use crate::error::{ErrorCode, Result};
use crate::transport::{CombineFn, CommId, Completion, Rank, Transport, WinId};
use crate::unit::GlobalUnit;
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};

/// Sentinel communicator id published by a split that created nothing.
const NO_COMM: u32 = u32::MAX;

/// One unit's endpoint of the in-process driver.
#[derive(Debug)]
pub struct ShmemTransport {
    cluster: Arc<Cluster>,
    unit: GlobalUnit,
    closed: AtomicBool,
}

/// Process-wide registry of live clusters, keyed by sync-area id.
fn registry() -> &'static Mutex<HashMap<i32, Arc<Cluster>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<i32, Arc<Cluster>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Attaches unit `unit` of a universe of `size` units to the sync area
/// `syncarea_id`, creating the cluster on first attach.
///
/// # Errors
///
/// `Inval` when `unit`/`size` are inconsistent with each other or with an
/// existing cluster under the same id.
pub fn attach(syncarea_id: i32, unit: GlobalUnit, size: i32) -> Result<ShmemTransport> {
    if size <= 0 || !unit.is_defined() || unit.get() >= size {
        return Err(ErrorCode::Inval);
    }

    let cluster = {
        let mut reg = registry().lock().unwrap();
        reg.entry(syncarea_id)
            .or_insert_with(|| Arc::new(Cluster::new(syncarea_id, size)))
            .clone()
    };
    if cluster.size != size {
        return Err(ErrorCode::Inval);
    }
    if cluster.attached.fetch_add(1, Ordering::AcqRel) >= size {
        cluster.attached.fetch_sub(1, Ordering::AcqRel);
        return Err(ErrorCode::Inval);
    }

    tracing::debug!(unit = unit.get(), size, syncarea_id, "attached to sync area");
    Ok(ShmemTransport {
        cluster,
        unit,
        closed: AtomicBool::new(false),
    })
}

#[derive(Debug)]
struct Cluster {
    key: i32,
    size: i32,
    attached: AtomicI32,
    next_comm: AtomicU32,
    next_win: AtomicU32,
    comms: Mutex<HashMap<u32, Arc<ShmComm>>>,
    wins: Mutex<HashMap<u32, Arc<ShmWin>>>,
    mailbox: Mailbox,
}

impl Cluster {
    fn new(key: i32, size: i32) -> Self {
        let world = Arc::new(ShmComm::new(
            (0..size).map(GlobalUnit::new).collect(),
        ));
        let mut comms = HashMap::new();
        comms.insert(CommId::WORLD.get(), world);
        Self {
            key,
            size,
            attached: AtomicI32::new(0),
            next_comm: AtomicU32::new(1),
            next_win: AtomicU32::new(0),
            comms: Mutex::new(comms),
            wins: Mutex::new(HashMap::new()),
            mailbox: Mailbox::default(),
        }
    }

    fn comm(&self, id: CommId) -> Result<Arc<ShmComm>> {
        self.comms
            .lock()
            .unwrap()
            .get(&id.get())
            .cloned()
            .ok_or(ErrorCode::NotFound)
    }

    fn win(&self, id: WinId) -> Result<Arc<ShmWin>> {
        self.wins
            .lock()
            .unwrap()
            .get(&id.get())
            .cloned()
            .ok_or(ErrorCode::NotFound)
    }
}

/// A communicator: its member list (ascending global ids define the rank
/// order) and the exchange slot its collectives rendezvous through.
#[derive(Debug)]
struct ShmComm {
    members: Vec<GlobalUnit>,
    state: Mutex<ExchangeState>,
    cv: Condvar,
}

#[derive(Debug)]
struct ExchangeState {
    arrived: usize,
    generation: u64,
    slots: Vec<Option<Vec<u8>>>,
    published: Arc<Vec<Option<Vec<u8>>>>,
}

impl ShmComm {
    fn new(members: Vec<GlobalUnit>) -> Self {
        let n = members.len();
        Self {
            members,
            state: Mutex::new(ExchangeState {
                arrived: 0,
                generation: 0,
                slots: vec![None; n],
                published: Arc::new(Vec::new()),
            }),
            cv: Condvar::new(),
        }
    }

    fn rank_of(&self, unit: GlobalUnit) -> Result<usize> {
        self.members.binary_search(&unit).map_err(|_| ErrorCode::Inval)
    }

    /// The collective rendezvous: every member contributes an optional
    /// payload and receives the full table of contributions of this
    /// generation.
    ///
    /// A member that arrived at generation `g` cannot re-arrive before it
    /// has read `g`'s result, so the published table is never overwritten
    /// while a reader of the previous generation is still waiting.
    fn exchange(&self, rank: usize, payload: Option<Vec<u8>>) -> Arc<Vec<Option<Vec<u8>>>> {
        let mut st = self.state.lock().unwrap();
        let start_gen = st.generation;
        debug_assert!(st.slots[rank].is_none(), "unit re-entered a collective");
        st.slots[rank] = payload;
        st.arrived += 1;
        if st.arrived == self.members.len() {
            let fresh = vec![None; self.members.len()];
            let slots = mem::replace(&mut st.slots, fresh);
            st.published = Arc::new(slots);
            st.arrived = 0;
            st.generation += 1;
            self.cv.notify_all();
            st.published.clone()
        } else {
            while st.generation == start_gen {
                st = self.cv.wait(st).unwrap();
            }
            st.published.clone()
        }
    }
}

/// A memory window: per-rank base address and length. Displacements are
/// absolute addresses within the owning rank's (here: shared) address
/// space.
#[derive(Debug)]
struct ShmWin {
    ranks: Vec<(u64, usize)>,
}

impl ShmWin {
    fn resolve(&self, rank: Rank, disp: u64, len: usize) -> Result<*mut u8> {
        let (base, size) = *self
            .ranks
            .get(usize::try_from(rank).map_err(|_| ErrorCode::Inval)?)
            .ok_or(ErrorCode::Inval)?;
        let end = base.checked_add(size as u64).ok_or(ErrorCode::Inval)?;
        if disp < base || disp.checked_add(len as u64).is_none_or(|e| e > end) {
            return Err(ErrorCode::Inval);
        }
        Ok(usize::try_from(disp).map_err(|_| ErrorCode::Inval)? as *mut u8)
    }
}

#[derive(Debug, Default)]
struct Mailbox {
    // keyed by (comm, dest rank, src rank, tag)
    inner: Mutex<HashMap<(u32, i32, i32, i32), VecDeque<Vec<u8>>>>,
    cv: Condvar,
}

// === impl ShmemTransport ===

impl ShmemTransport {
    fn my_rank(&self, comm: &ShmComm) -> Result<usize> {
        comm.rank_of(self.unit)
    }
}

impl Transport for ShmemTransport {
    fn global_unit(&self) -> GlobalUnit {
        self.unit
    }

    fn universe_size(&self) -> i32 {
        self.cluster.size
    }

    fn comm_split(&self, parent: CommId, members: &[GlobalUnit]) -> Result<Option<CommId>> {
        let parent_comm = self.cluster.comm(parent)?;
        let my_rank = self.my_rank(&parent_comm)?;

        // membership must be an ascending subset of the parent
        if !members.windows(2).all(|w| w[0] < w[1])
            || !members.iter().all(|m| parent_comm.rank_of(*m).is_ok())
        {
            return Err(ErrorCode::Inval);
        }

        // rank 0 allocates and registers the communicator, then publishes
        // its id to the others
        let payload = (my_rank == 0).then(|| {
            let id = if members.is_empty() {
                NO_COMM
            } else {
                let id = self.cluster.next_comm.fetch_add(1, Ordering::AcqRel);
                let comm = Arc::new(ShmComm::new(members.to_vec()));
                self.cluster.comms.lock().unwrap().insert(id, comm);
                id
            };
            id.to_ne_bytes().to_vec()
        });
        let table = parent_comm.exchange(my_rank, payload);
        let id_bytes = table[0].as_ref().ok_or(ErrorCode::Other)?;
        let id = u32::from_ne_bytes(id_bytes.as_slice().try_into().map_err(|_| ErrorCode::Other)?);

        if id == NO_COMM || !members.contains(&self.unit) {
            return Ok(None);
        }
        Ok(Some(CommId::new(id)))
    }

    fn comm_free(&self, comm: CommId) -> Result<()> {
        if comm == CommId::WORLD {
            return Err(ErrorCode::Inval);
        }
        let c = self.cluster.comm(comm)?;
        let my_rank = self.my_rank(&c)?;
        c.exchange(my_rank, None);
        if my_rank == 0 {
            self.cluster.comms.lock().unwrap().remove(&comm.get());
        }
        Ok(())
    }

    fn comm_rank(&self, comm: CommId) -> Result<Rank> {
        let c = self.cluster.comm(comm)?;
        Ok(i32::try_from(self.my_rank(&c)?).unwrap())
    }

    fn comm_size(&self, comm: CommId) -> Result<i32> {
        let c = self.cluster.comm(comm)?;
        Ok(i32::try_from(c.members.len()).unwrap())
    }

    fn barrier(&self, comm: CommId) -> Result<()> {
        let c = self.cluster.comm(comm)?;
        let rank = self.my_rank(&c)?;
        c.exchange(rank, None);
        Ok(())
    }

    fn bcast(&self, comm: CommId, root: Rank, buf: &mut [u8]) -> Result<()> {
        let c = self.cluster.comm(comm)?;
        let rank = self.my_rank(&c)?;
        let root = usize::try_from(root).map_err(|_| ErrorCode::Inval)?;
        if root >= c.members.len() {
            return Err(ErrorCode::Inval);
        }
        let payload = (rank == root).then(|| buf.to_vec());
        let table = c.exchange(rank, payload);
        if rank != root {
            let src = table[root].as_ref().ok_or(ErrorCode::Other)?;
            if src.len() != buf.len() {
                return Err(ErrorCode::Inval);
            }
            buf.copy_from_slice(src);
        }
        Ok(())
    }

    fn gather(&self, comm: CommId, root: Rank, send: &[u8], recv: &mut [u8]) -> Result<()> {
        let c = self.cluster.comm(comm)?;
        let rank = self.my_rank(&c)?;
        let root = usize::try_from(root).map_err(|_| ErrorCode::Inval)?;
        if root >= c.members.len() {
            return Err(ErrorCode::Inval);
        }
        let table = c.exchange(rank, Some(send.to_vec()));
        if rank == root {
            scatter_gathered(&table, recv)?;
        }
        Ok(())
    }

    fn scatter(&self, comm: CommId, root: Rank, send: &[u8], recv: &mut [u8]) -> Result<()> {
        let c = self.cluster.comm(comm)?;
        let rank = self.my_rank(&c)?;
        let root = usize::try_from(root).map_err(|_| ErrorCode::Inval)?;
        if root >= c.members.len() {
            return Err(ErrorCode::Inval);
        }
        let payload = (rank == root).then(|| {
            debug_assert_eq!(send.len(), recv.len() * c.members.len());
            send.to_vec()
        });
        let table = c.exchange(rank, payload);
        let src = table[root].as_ref().ok_or(ErrorCode::Other)?;
        if src.len() != recv.len() * c.members.len() {
            return Err(ErrorCode::Inval);
        }
        let at = rank * recv.len();
        recv.copy_from_slice(&src[at..at + recv.len()]);
        Ok(())
    }

    fn allgather(&self, comm: CommId, send: &[u8], recv: &mut [u8]) -> Result<()> {
        let c = self.cluster.comm(comm)?;
        let rank = self.my_rank(&c)?;
        let table = c.exchange(rank, Some(send.to_vec()));
        scatter_gathered(&table, recv)
    }

    fn reduce(
        &self,
        comm: CommId,
        root: Rank,
        send: &[u8],
        recv: &mut [u8],
        combine: CombineFn<'_>,
    ) -> Result<()> {
        let c = self.cluster.comm(comm)?;
        let rank = self.my_rank(&c)?;
        let root = usize::try_from(root).map_err(|_| ErrorCode::Inval)?;
        if root >= c.members.len() {
            return Err(ErrorCode::Inval);
        }
        let table = c.exchange(rank, Some(send.to_vec()));
        if rank == root {
            if recv.len() != send.len() {
                return Err(ErrorCode::Inval);
            }
            let first = table[0].as_ref().ok_or(ErrorCode::Other)?;
            if first.len() != recv.len() {
                return Err(ErrorCode::Inval);
            }
            recv.copy_from_slice(first);
            for contrib in table.iter().skip(1) {
                let contrib = contrib.as_ref().ok_or(ErrorCode::Other)?;
                if contrib.len() != recv.len() {
                    return Err(ErrorCode::Inval);
                }
                combine(recv, contrib);
            }
        }
        Ok(())
    }

    fn send(&self, comm: CommId, dest: Rank, tag: i32, buf: &[u8]) -> Result<()> {
        let c = self.cluster.comm(comm)?;
        let rank = i32::try_from(self.my_rank(&c)?).unwrap();
        if usize::try_from(dest).map_err(|_| ErrorCode::Inval)? >= c.members.len() {
            return Err(ErrorCode::Inval);
        }
        let mut inbox = self.cluster.mailbox.inner.lock().unwrap();
        inbox
            .entry((comm.get(), dest, rank, tag))
            .or_default()
            .push_back(buf.to_vec());
        self.cluster.mailbox.cv.notify_all();
        Ok(())
    }

    fn recv(&self, comm: CommId, src: Rank, tag: i32, buf: &mut [u8]) -> Result<()> {
        let c = self.cluster.comm(comm)?;
        let rank = i32::try_from(self.my_rank(&c)?).unwrap();
        if usize::try_from(src).map_err(|_| ErrorCode::Inval)? >= c.members.len() {
            return Err(ErrorCode::Inval);
        }
        let key = (comm.get(), rank, src, tag);
        let mut inbox = self.cluster.mailbox.inner.lock().unwrap();
        loop {
            if let Some(queue) = inbox.get_mut(&key)
                && let Some(msg) = queue.pop_front()
            {
                if msg.len() != buf.len() {
                    return Err(ErrorCode::Inval);
                }
                buf.copy_from_slice(&msg);
                return Ok(());
            }
            inbox = self.cluster.mailbox.cv.wait(inbox).unwrap();
        }
    }

    fn win_create(&self, comm: CommId, base: *mut u8, len: usize) -> Result<WinId> {
        let c = self.cluster.comm(comm)?;
        let rank = self.my_rank(&c)?;

        // gather everyone's (base, len)
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&(base as u64).to_ne_bytes());
        payload.extend_from_slice(&(len as u64).to_ne_bytes());
        let table = c.exchange(rank, Some(payload));
        let mut ranks = Vec::with_capacity(c.members.len());
        for contrib in table.iter() {
            let contrib = contrib.as_ref().ok_or(ErrorCode::Other)?;
            let base = u64::from_ne_bytes(contrib[..8].try_into().unwrap());
            let len = u64::from_ne_bytes(contrib[8..16].try_into().unwrap());
            ranks.push((base, usize::try_from(len).map_err(|_| ErrorCode::Inval)?));
        }

        // rank 0 registers the window and publishes its id
        let payload = (rank == 0).then(|| {
            let id = self.cluster.next_win.fetch_add(1, Ordering::AcqRel);
            let win = Arc::new(ShmWin {
                ranks: ranks.clone(),
            });
            self.cluster.wins.lock().unwrap().insert(id, win);
            id.to_ne_bytes().to_vec()
        });
        let table = c.exchange(rank, payload);
        let id_bytes = table[0].as_ref().ok_or(ErrorCode::Other)?;
        let id = u32::from_ne_bytes(id_bytes.as_slice().try_into().map_err(|_| ErrorCode::Other)?);
        Ok(WinId::new(id))
    }

    fn win_free(&self, comm: CommId, win: WinId) -> Result<()> {
        let c = self.cluster.comm(comm)?;
        let rank = self.my_rank(&c)?;
        self.cluster.win(win)?;
        c.exchange(rank, None);
        if rank == 0 {
            self.cluster.wins.lock().unwrap().remove(&win.get());
        }
        Ok(())
    }

    fn win_peer_base(&self, win: WinId, rank: Rank) -> Option<*mut u8> {
        let win = self.cluster.win(win).ok()?;
        let (base, _) = *win.ranks.get(usize::try_from(rank).ok()?)?;
        Some(usize::try_from(base).ok()? as *mut u8)
    }

    fn put(
        &self,
        win: WinId,
        rank: Rank,
        disp: u64,
        src: *const u8,
        len: usize,
    ) -> Result<Completion> {
        let w = self.cluster.win(win)?;
        let dst = w.resolve(rank, disp, len)?;
        // Safety: the target range was bounds-checked against the window;
        // concurrent access to PGAS memory is the documented data model
        // (callers order conflicting accesses with flush/barrier).
        unsafe { ptr::copy_nonoverlapping(src, dst, len) };
        Ok(Completion(0))
    }

    fn get(
        &self,
        win: WinId,
        rank: Rank,
        disp: u64,
        dst: *mut u8,
        len: usize,
    ) -> Result<Completion> {
        let w = self.cluster.win(win)?;
        let src = w.resolve(rank, disp, len)?;
        // Safety: see `put`.
        unsafe { ptr::copy_nonoverlapping(src, dst, len) };
        Ok(Completion(0))
    }

    fn test(&self, _completion: Completion) -> Result<bool> {
        // every one-sided op completed synchronously
        Ok(true)
    }

    fn wait(&self, _completion: Completion) -> Result<()> {
        Ok(())
    }

    fn fence(&self, win: WinId, _rank: Option<Rank>) -> Result<()> {
        self.cluster.win(win)?;
        std::sync::atomic::fence(Ordering::SeqCst);
        Ok(())
    }

    fn atomic_fetch_add32(&self, win: WinId, rank: Rank, disp: u64, value: i32) -> Result<i32> {
        let w = self.cluster.win(win)?;
        let addr = w.resolve(rank, disp, 4)?;
        if addr as usize % 4 != 0 {
            return Err(ErrorCode::Inval);
        }
        // Safety: in-bounds, aligned, and only ever accessed atomically by
        // the runtime.
        let atom = unsafe { AtomicI32::from_ptr(addr.cast()) };
        Ok(atom.fetch_add(value, Ordering::AcqRel))
    }

    fn atomic_cas32(
        &self,
        win: WinId,
        rank: Rank,
        disp: u64,
        expect: i32,
        desired: i32,
    ) -> Result<i32> {
        let w = self.cluster.win(win)?;
        let addr = w.resolve(rank, disp, 4)?;
        if addr as usize % 4 != 0 {
            return Err(ErrorCode::Inval);
        }
        // Safety: see `atomic_fetch_add32`.
        let atom = unsafe { AtomicI32::from_ptr(addr.cast()) };
        Ok(match atom.compare_exchange(expect, desired, Ordering::AcqRel, Ordering::Acquire) {
            Ok(old) | Err(old) => old,
        })
    }

    fn atomic_load32(&self, win: WinId, rank: Rank, disp: u64) -> Result<i32> {
        let w = self.cluster.win(win)?;
        let addr = w.resolve(rank, disp, 4)?;
        if addr as usize % 4 != 0 {
            return Err(ErrorCode::Inval);
        }
        // Safety: see `atomic_fetch_add32`.
        let atom = unsafe { AtomicI32::from_ptr(addr.cast()) };
        Ok(atom.load(Ordering::Acquire))
    }

    fn atomic_store32(&self, win: WinId, rank: Rank, disp: u64, value: i32) -> Result<()> {
        let w = self.cluster.win(win)?;
        let addr = w.resolve(rank, disp, 4)?;
        if addr as usize % 4 != 0 {
            return Err(ErrorCode::Inval);
        }
        // Safety: see `atomic_fetch_add32`.
        let atom = unsafe { AtomicI32::from_ptr(addr.cast()) };
        atom.store(value, Ordering::Release);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ErrorCode::Inval);
        }
        if self.cluster.attached.fetch_sub(1, Ordering::AcqRel) == 1 {
            registry().lock().unwrap().remove(&self.cluster.key);
            tracing::debug!(syncarea_id = self.cluster.key, "tore down sync area");
        }
        Ok(())
    }
}

/// Concatenates a gather table into `recv` in rank order.
fn scatter_gathered(table: &[Option<Vec<u8>>], recv: &mut [u8]) -> Result<()> {
    let total: usize = table
        .iter()
        .map(|c| c.as_ref().map_or(0, Vec::len))
        .sum();
    if total != recv.len() {
        return Err(ErrorCode::Inval);
    }
    let mut at = 0;
    for contrib in table {
        let contrib = contrib.as_ref().ok_or(ErrorCode::Other)?;
        recv[at..at + contrib.len()].copy_from_slice(contrib);
        at += contrib.len();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn spawn_units<F>(syncarea_id: i32, n: i32, f: F)
    where
        F: Fn(ShmemTransport) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handles: Vec<_> = (0..n)
            .map(|u| {
                let f = f.clone();
                thread::spawn(move || {
                    let t = attach(syncarea_id, GlobalUnit::new(u), n).unwrap();
                    f(t);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn attach_validates_arguments() {
        assert_eq!(
            attach(-100, GlobalUnit::new(3), 2).unwrap_err(),
            ErrorCode::Inval
        );
        assert_eq!(
            attach(-100, GlobalUnit::UNDEFINED, 2).unwrap_err(),
            ErrorCode::Inval
        );
    }

    #[test]
    fn world_allgather() {
        spawn_units(-1, 4, |t| {
            let send = t.global_unit().get().to_ne_bytes();
            let mut recv = [0u8; 16];
            t.allgather(CommId::WORLD, &send, &mut recv).unwrap();
            for i in 0..4 {
                let v = i32::from_ne_bytes(recv[i * 4..i * 4 + 4].try_into().unwrap());
                assert_eq!(v, i32::try_from(i).unwrap());
            }
            t.close().unwrap();
        });
    }

    #[test]
    fn split_and_bcast() {
        spawn_units(-2, 4, |t| {
            let members: Vec<GlobalUnit> = [0, 2].iter().map(|&u| GlobalUnit::new(u)).collect();
            let sub = t.comm_split(CommId::WORLD, &members).unwrap();
            match (t.global_unit().get(), sub) {
                (0 | 2, Some(comm)) => {
                    let mut buf = if t.comm_rank(comm).unwrap() == 0 {
                        7i32.to_ne_bytes()
                    } else {
                        [0; 4]
                    };
                    t.bcast(comm, 0, &mut buf).unwrap();
                    assert_eq!(i32::from_ne_bytes(buf), 7);
                    t.comm_free(comm).unwrap();
                }
                (1 | 3, None) => {}
                other => panic!("unexpected split outcome {other:?}"),
            }
            t.close().unwrap();
        });
    }

    #[test]
    fn window_put_get_atomics() {
        spawn_units(-3, 2, |t| {
            let mut local = vec![0u8; 64];
            let win = t
                .win_create(CommId::WORLD, local.as_mut_ptr(), local.len())
                .unwrap();
            let me = t.global_unit().get();
            let peer = 1 - me;
            let peer_base = t.win_peer_base(win, peer).unwrap() as u64;

            // everyone puts its id into the peer's first word
            let val = me.to_ne_bytes();
            t.put(win, peer, peer_base, val.as_ptr(), 4).unwrap();
            t.fence(win, Some(peer)).unwrap();
            t.barrier(CommId::WORLD).unwrap();

            let got = i32::from_ne_bytes(local[..4].try_into().unwrap());
            assert_eq!(got, peer);

            // remote add on the second word
            t.atomic_fetch_add32(win, peer, peer_base + 4, 5).unwrap();
            t.barrier(CommId::WORLD).unwrap();
            assert_eq!(t.atomic_load32(win, me, (local.as_ptr() as u64) + 4).unwrap(), 5);

            t.barrier(CommId::WORLD).unwrap();
            t.win_free(CommId::WORLD, win).unwrap();
            t.close().unwrap();
        });
    }

    #[test]
    fn out_of_bounds_rma_is_rejected() {
        spawn_units(-4, 2, |t| {
            let mut local = vec![0u8; 16];
            let win = t
                .win_create(CommId::WORLD, local.as_mut_ptr(), local.len())
                .unwrap();
            let me = t.global_unit().get();
            let peer = 1 - me;
            let base = t.win_peer_base(win, peer).unwrap() as u64;
            let buf = [0u8; 32];
            assert_eq!(
                t.put(win, peer, base, buf.as_ptr(), 32).unwrap_err(),
                ErrorCode::Inval
            );
            t.barrier(CommId::WORLD).unwrap();
            t.win_free(CommId::WORLD, win).unwrap();
            t.close().unwrap();
        });
    }

    #[test]
    fn tagged_send_recv() {
        spawn_units(-5, 2, |t| {
            if t.global_unit().get() == 0 {
                t.send(CommId::WORLD, 1, 42, b"ping").unwrap();
            } else {
                let mut buf = [0u8; 4];
                t.recv(CommId::WORLD, 0, 42, &mut buf).unwrap();
                assert_eq!(&buf, b"ping");
            }
            t.close().unwrap();
        });
    }
}
