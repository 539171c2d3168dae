// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Team tree lifecycle, unit translation, the team lock and global
//! memory round trips.

mod common;

use lattice::{ErrorCode, GlobalUnit, Group, TeamId, TeamUnit};

#[test]
fn split_teams_have_independent_collectives() {
    common::run_units(4, |rt| {
        let me = rt.my_unit();
        let all = rt.team_group(TeamId::ALL).unwrap();
        let halves = all.split(2).unwrap();

        // all units collectively create both teams; each lands in one
        let lower = rt.team_create(TeamId::ALL, &halves[0]).unwrap();
        let upper = rt.team_create(TeamId::ALL, &halves[1]).unwrap();

        let (mine, other) = if me.get() < 2 { (lower, upper) } else { (upper, lower) };
        assert!(!mine.is_null());
        assert!(other.is_null());

        assert_eq!(rt.team_size(mine).unwrap(), 2);
        assert_eq!(rt.team_depth(mine).unwrap(), 1);
        assert_eq!(rt.team_parent(mine).unwrap(), TeamId::ALL);

        // team-unit ids are dense and translate back to global ids
        let my_team_unit = rt.team_my_unit(mine).unwrap();
        assert_eq!(my_team_unit.get(), me.get() % 2);
        assert_eq!(rt.unit_l2g(mine, my_team_unit).unwrap(), me);
        assert_eq!(rt.unit_g2l(mine, me).unwrap(), my_team_unit);

        // an allgather confined to the half
        let send = me.get().to_ne_bytes();
        let mut recv = [0u8; 8];
        rt.allgather(mine, &send, &mut recv).unwrap();
        let base = if me.get() < 2 { 0 } else { 2 };
        for i in 0..2 {
            let v = i32::from_ne_bytes(recv[i * 4..i * 4 + 4].try_into().unwrap());
            assert_eq!(v, base + i32::try_from(i).unwrap());
        }

        rt.team_destroy(mine).unwrap();
    });
}

#[test]
fn empty_group_completes_with_null_team() {
    common::run_units(2, |rt| {
        let team = rt.team_create(TeamId::ALL, &Group::new()).unwrap();
        assert!(team.is_null());
        // null teams resolve nowhere
        assert_eq!(rt.team_size(team).unwrap_err(), ErrorCode::Inval);
    });
}

#[test]
fn destroy_with_live_children_fails() {
    common::run_units(2, |rt| {
        let full = rt.team_group(TeamId::ALL).unwrap();
        let parent = rt.team_create(TeamId::ALL, &full).unwrap();
        let child = rt.team_create(parent, &full).unwrap();

        // the tree must be torn down leaves-first
        assert_eq!(rt.team_destroy(parent).unwrap_err(), ErrorCode::Inval);
        assert_eq!(rt.team_child_at(parent, 0).unwrap(), child);

        rt.team_destroy(child).unwrap();
        rt.team_destroy(parent).unwrap();
    });
}

#[test]
fn team_clone_is_a_fresh_context() {
    common::run_units(3, |rt| {
        let clone = rt.team_clone(TeamId::ALL).unwrap();
        assert!(!clone.is_null());
        assert_eq!(rt.team_size(clone).unwrap(), 3);
        assert_eq!(
            rt.team_my_unit(clone).unwrap().get(),
            rt.my_unit().get()
        );
        rt.barrier(clone).unwrap();
        rt.team_destroy(clone).unwrap();
    });
}

#[test]
fn team_lock_serializes_members() {
    common::run_units(4, |rt| {
        const ROUNDS: i32 = 25;
        let lock = rt.team_lock(TeamId::ALL).unwrap();
        let counter = rt.team_memalloc_aligned(TeamId::ALL, 4).unwrap();
        let slot = counter.with_unit(TeamUnit::new(0));

        for _ in 0..ROUNDS {
            rt.lock(&lock).unwrap();
            let mut word = [0u8; 4];
            rt.rma_get_blocking(TeamId::ALL, &mut word, slot).unwrap();
            let next = i32::from_ne_bytes(word) + 1;
            rt.rma_put_blocking(TeamId::ALL, slot, &next.to_ne_bytes())
                .unwrap();
            rt.unlock(&lock).unwrap();
        }
        rt.barrier(TeamId::ALL).unwrap();

        if rt.my_unit().get() == 0 {
            let mut word = [0u8; 4];
            rt.rma_get_blocking(TeamId::ALL, &mut word, slot).unwrap();
            assert_eq!(i32::from_ne_bytes(word), 4 * ROUNDS);
        }

        rt.barrier(TeamId::ALL).unwrap();
        rt.team_memfree(TeamId::ALL, counter).unwrap();
    });
}

#[test]
fn unlock_requires_the_holder() {
    common::run_units(2, |rt| {
        let lock = rt.team_lock(TeamId::ALL).unwrap();
        if rt.my_unit().get() == 0 {
            assert!(rt.try_lock(&lock).unwrap());
        }
        rt.barrier(TeamId::ALL).unwrap();
        if rt.my_unit().get() == 1 {
            // not ours: acquisition fails, release is rejected
            assert!(!rt.try_lock(&lock).unwrap());
            assert_eq!(rt.unlock(&lock).unwrap_err(), ErrorCode::Inval);
        }
        rt.barrier(TeamId::ALL).unwrap();
        if rt.my_unit().get() == 0 {
            rt.unlock(&lock).unwrap();
        }
        rt.barrier(TeamId::ALL).unwrap();
    });
}

#[test]
fn local_alloc_addr_roundtrip() {
    common::run_units(1, |rt| {
        let a = rt.memalloc(100).unwrap();
        let b = rt.memalloc(0).unwrap();
        assert_ne!(a.offset(), b.offset(), "zero-byte allocs still occupy a unit");

        // setaddr(getaddr(p)) == p for local pointers
        let addr = rt.gptr_addr(TeamId::ALL, a).unwrap();
        let rebuilt = rt.gptr_set_addr(TeamId::ALL, a, addr).unwrap();
        assert_eq!(rebuilt, a);

        // interior pointers resolve to interior offsets
        let inner = a + 10;
        // Safety: 10 < 100, still inside the allocation.
        let inner_addr = unsafe { addr.add(10) };
        assert_eq!(
            rt.gptr_set_addr(TeamId::ALL, inner, inner_addr).unwrap(),
            inner
        );

        rt.memfree(a).unwrap();
        rt.memfree(b).unwrap();
        // double free is rejected
        assert_eq!(rt.memfree(a).unwrap_err(), ErrorCode::Inval);
    });
}

#[test]
fn remote_local_pool_is_rma_visible() {
    common::run_units(2, |rt| {
        // both units allocate in lockstep, so offsets agree
        let mine = rt.memalloc(16).unwrap();
        let addr = rt.gptr_addr(TeamId::ALL, mine).unwrap();
        // Safety: our own allocation.
        unsafe { addr.cast::<i64>().write(i64::from(rt.my_unit().get()) + 77) };
        rt.barrier(TeamId::ALL).unwrap();

        let peer = GlobalUnit::new(1 - rt.my_unit().get());
        let theirs = mine.with_global_unit(peer);
        let mut buf = [0u8; 8];
        rt.rma_get_blocking(TeamId::ALL, &mut buf, theirs).unwrap();
        assert_eq!(i64::from_ne_bytes(buf), i64::from(peer.get()) + 77);

        rt.barrier(TeamId::ALL).unwrap();
        rt.memfree(mine).unwrap();
    });
}
