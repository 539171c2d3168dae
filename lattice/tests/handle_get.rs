// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Unit 0 fills a collectively allocated segment; every other unit pulls
//! the whole segment with a handle get and verifies it element by
//! element.

mod common;

use lattice::{DataType, TeamId, TeamUnit};

const ELEMS: usize = 100;

#[test]
fn handle_get_of_team_segment() {
    common::run_units(4, |rt| {
        let gptr = rt
            .team_memalloc_aligned_typed(TeamId::ALL, ELEMS, DataType::I32)
            .unwrap();

        if rt.my_unit().get() == 0 {
            let values: Vec<u8> = (0..ELEMS)
                .flat_map(|i| (i32::try_from(i).unwrap() + 42).to_ne_bytes())
                .collect();
            rt.rma_put_blocking(TeamId::ALL, gptr, &values).unwrap();
        }
        rt.barrier(TeamId::ALL).unwrap();

        if rt.my_unit().get() != 0 {
            let mut buf = vec![0u8; ELEMS * 4];
            let mut handle = rt.rma_get_handle(TeamId::ALL, &mut buf, gptr).unwrap();
            // local completion of a get means the data arrived
            handle.wait_local().unwrap();
            for i in 0..ELEMS {
                let v = i32::from_ne_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap());
                assert_eq!(v, i32::try_from(i).unwrap() + 42);
            }
        }

        rt.barrier(TeamId::ALL).unwrap();
        rt.team_memfree(TeamId::ALL, gptr).unwrap();
    });
}

#[test]
fn blocking_put_then_get_roundtrip() {
    common::run_units(2, |rt| {
        let gptr = rt.team_memalloc_aligned(TeamId::ALL, 64).unwrap();
        let me = rt.my_unit().get();
        let peer = TeamUnit::new(1 - me);

        // write a tag into the peer's portion, fully completed on return
        let tag = (0xa0 + me) as u8;
        rt.rma_put_blocking(TeamId::ALL, gptr.with_unit(peer), &[tag; 64])
            .unwrap();
        rt.barrier(TeamId::ALL).unwrap();

        // our own portion now carries the peer's tag
        let mut mine = [0u8; 64];
        rt.rma_get_blocking(
            TeamId::ALL,
            &mut mine,
            gptr.with_unit(TeamUnit::new(me)),
        )
        .unwrap();
        assert_eq!(mine, [(0xa0 + (1 - me)) as u8; 64]);

        rt.barrier(TeamId::ALL).unwrap();
        rt.team_memfree(TeamId::ALL, gptr).unwrap();
    });
}

#[test]
fn registered_memory_is_addressable() {
    common::run_units(2, |rt| {
        // externally allocated memory, registered without copying; the
        // driver path is exercised because registered segments have no
        // peer base pointers
        let mut backing = vec![0u8; 256];
        if rt.my_unit().get() == 1 {
            backing[..4].copy_from_slice(&0x7ea5e1_i32.to_ne_bytes());
        }
        let gptr = rt
            .team_memregister(TeamId::ALL, backing.as_mut_ptr(), backing.len())
            .unwrap();
        rt.barrier(TeamId::ALL).unwrap();

        if rt.my_unit().get() == 0 {
            let mut word = [0u8; 4];
            rt.rma_get_blocking(TeamId::ALL, &mut word, gptr.with_unit(TeamUnit::new(1)))
                .unwrap();
            assert_eq!(i32::from_ne_bytes(word), 0x7ea5e1_i32);
        }

        rt.barrier(TeamId::ALL).unwrap();
        rt.team_memderegister(TeamId::ALL, gptr).unwrap();
    });
}

#[test]
fn flush_orders_plain_puts() {
    common::run_units(2, |rt| {
        let gptr = rt.team_memalloc_aligned(TeamId::ALL, 8).unwrap();
        let me = rt.my_unit().get();

        if me == 0 {
            let target = gptr.with_unit(TeamUnit::new(1));
            rt.rma_put(TeamId::ALL, target, &7i64.to_ne_bytes()).unwrap();
            // plain puts promise nothing until flushed
            rt.rma_flush(TeamId::ALL, target).unwrap();
        }
        rt.barrier(TeamId::ALL).unwrap();

        if me == 1 {
            let mut word = [0u8; 8];
            rt.rma_get_blocking(TeamId::ALL, &mut word, gptr.with_unit(TeamUnit::new(1)))
                .unwrap();
            assert_eq!(i64::from_ne_bytes(word), 7);
        }

        rt.barrier(TeamId::ALL).unwrap();
        rt.team_memfree(TeamId::ALL, gptr).unwrap();
    });
}
