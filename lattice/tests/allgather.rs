// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Every unit contributes its own rank; after the allgather each unit
//! holds the identity permutation.

mod common;

use lattice::{DataType, ReduceOp, TeamId, TeamUnit};

fn allgather_of_rank(n: i32) {
    common::run_units(n, move |rt| {
        let send = rt.my_unit().get().to_ne_bytes();
        let mut recv = vec![0u8; 4 * usize::try_from(n).unwrap()];
        rt.allgather(TeamId::ALL, &send, &mut recv).unwrap();
        for i in 0..usize::try_from(n).unwrap() {
            let v = i32::from_ne_bytes(recv[i * 4..i * 4 + 4].try_into().unwrap());
            assert_eq!(v, i32::try_from(i).unwrap());
        }
    });
}

#[test]
fn allgather_one_unit() {
    allgather_of_rank(1);
}

#[test]
fn allgather_two_units() {
    allgather_of_rank(2);
}

#[test]
fn allgather_four_units() {
    allgather_of_rank(4);
}

#[test]
fn allgather_seven_units() {
    allgather_of_rank(7);
}

#[test]
fn allgather_zero_bytes_is_barrier() {
    common::run_units(3, |rt| {
        // must complete collectively with empty buffers
        rt.allgather(TeamId::ALL, &[], &mut []).unwrap();
    });
}

#[test]
fn gather_scatter_bcast() {
    common::run_units(4, |rt| {
        let me = rt.my_unit().get();
        let root = TeamUnit::new(2);

        // gather ranks at the root
        let send = me.to_ne_bytes();
        let mut recv = vec![0u8; 16];
        rt.gather(TeamId::ALL, root, &send, &mut recv).unwrap();
        if me == 2 {
            for i in 0..4 {
                let v = i32::from_ne_bytes(recv[i * 4..i * 4 + 4].try_into().unwrap());
                assert_eq!(v, i32::try_from(i).unwrap());
            }
        }

        // scatter doubled ranks back out
        let send: Vec<u8> = if me == 2 {
            (0..4i32).flat_map(|v| (2 * v).to_ne_bytes()).collect()
        } else {
            Vec::new()
        };
        let mut part = [0u8; 4];
        rt.scatter(TeamId::ALL, root, &send, &mut part).unwrap();
        assert_eq!(i32::from_ne_bytes(part), 2 * me);

        // broadcast a word from the root
        let mut word = if me == 2 { 0x5eedi32.to_ne_bytes() } else { [0; 4] };
        rt.bcast(TeamId::ALL, root, &mut word).unwrap();
        assert_eq!(i32::from_ne_bytes(word), 0x5eed);
    });
}

#[test]
fn reduce_and_allreduce() {
    common::run_units(4, |rt| {
        let me = rt.my_unit().get();

        // sum of ranks at root 0
        let send = me.to_ne_bytes();
        let mut recv = [0u8; 4];
        rt.reduce(
            TeamId::ALL,
            TeamUnit::new(0),
            &send,
            &mut recv,
            ReduceOp::Sum,
            DataType::I32,
        )
        .unwrap();
        if me == 0 {
            assert_eq!(i32::from_ne_bytes(recv), 6);
        }

        // max of ranks everywhere
        let mut recv = [0u8; 4];
        rt.allreduce(TeamId::ALL, &send, &mut recv, ReduceOp::Max, DataType::I32)
            .unwrap();
        assert_eq!(i32::from_ne_bytes(recv), 3);

        // a user op: byte-wise saturating add, registered identically on
        // every unit
        fn sat_add(acc: &mut [u8], contrib: &[u8]) {
            for (a, c) in acc.iter_mut().zip(contrib) {
                *a = a.saturating_add(*c);
            }
        }
        let op = rt.reduce_op_register(sat_add, true).unwrap();
        let send = [200u8, 1, 2, 3];
        let mut recv = [0u8; 4];
        rt.allreduce(TeamId::ALL, &send, &mut recv, op, DataType::Byte)
            .unwrap();
        assert_eq!(recv, [255, 4, 8, 12]);
    });
}
