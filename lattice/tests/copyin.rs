// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Copyin pre-fetch: the consumer's buffer is resident before it runs,
//! under both fetch implementations.

mod common;

use lattice::{CopyinImpl, Dep, Priority, TeamId, TeamUnit};

const NBYTES: usize = 64;

fn copyin_roundtrip(impl_: CopyinImpl) {
    common::run_units_with(
        2,
        move |mut config| {
            config.copyin_impl = impl_;
            config
        },
        |rt| {
            let gptr = rt.team_memalloc_aligned(TeamId::ALL, NBYTES).unwrap();
            let me = rt.my_unit().get();
            let data = gptr.with_unit(TeamUnit::new(0));

            if me == 0 {
                let addr = rt.gptr_addr(TeamId::ALL, data).unwrap() as usize;
                rt.task_create(&[Dep::output(data)], Priority::Normal, move || {
                    // Safety: our own portion, ordered by the dependency.
                    let buf = unsafe {
                        core::slice::from_raw_parts_mut(addr as *mut u8, NBYTES)
                    };
                    for (i, b) in buf.iter_mut().enumerate() {
                        *b = u8::try_from(i).unwrap() ^ 0x55;
                    }
                })
                .unwrap();
            } else {
                let mut dest = vec![0u8; NBYTES];
                let dest_ptr = dest.as_mut_ptr() as usize;
                rt.task_create(
                    &[Dep::copyin(data, dest_ptr as *mut u8, NBYTES)],
                    Priority::Normal,
                    move || {
                        // the fetch task made the range resident already
                        let buf = unsafe {
                            core::slice::from_raw_parts(dest_ptr as *const u8, NBYTES)
                        };
                        for (i, b) in buf.iter().enumerate() {
                            assert_eq!(*b, u8::try_from(i).unwrap() ^ 0x55);
                        }
                    },
                )
                .unwrap();
                rt.task_complete(false).unwrap();
                drop(dest);
            }

            if me == 0 {
                rt.task_complete(false).unwrap();
            }
            rt.barrier(TeamId::ALL).unwrap();
            rt.team_memfree(TeamId::ALL, gptr).unwrap();
        },
    );
}

#[test]
fn copyin_get() {
    copyin_roundtrip(CopyinImpl::Get);
}

#[test]
fn copyin_sendrecv() {
    copyin_roundtrip(CopyinImpl::SendRecv);
}

#[test]
fn local_copyin_degenerates_to_memcpy() {
    common::run_units(1, |rt| {
        let gptr = rt.memalloc(16).unwrap();
        let addr = rt.gptr_addr(TeamId::ALL, gptr).unwrap() as usize;

        rt.task_create(&[Dep::output(gptr)], Priority::Normal, move || {
            // Safety: our allocation, ordered by the dependency.
            unsafe { (addr as *mut u64).write(0xfeed_f00d) };
        })
        .unwrap();

        let mut dest = [0u8; 16];
        let dest_ptr = dest.as_mut_ptr() as usize;
        rt.task_create(
            &[Dep::copyin(gptr, dest_ptr as *mut u8, 16)],
            Priority::Normal,
            move || {
                let v = u64::from_ne_bytes(
                    // Safety: resident by the copyin contract.
                    unsafe { core::slice::from_raw_parts(dest_ptr as *const u8, 8) }
                        .try_into()
                        .unwrap(),
                );
                assert_eq!(v, 0xfeed_f00d);
            },
        )
        .unwrap();

        rt.task_complete(false).unwrap();
        drop(dest);
        rt.memfree(gptr).unwrap();
    });
}
