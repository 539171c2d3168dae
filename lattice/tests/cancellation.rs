// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Global cancellation: one task pulls the brake, pending work is
//! discarded everywhere, and the runtime stays usable afterwards.

mod common;

use lattice::{Priority, TeamId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[test]
fn cancel_bcast_discards_pending_work() {
    common::run_units(2, |rt| {
        let ran = Arc::new(AtomicUsize::new(0));

        if rt.my_unit().get() == 0 {
            let canceller = rt.clone();
            rt.task_create(&[], Priority::High, move || {
                // pulls the brake and unwinds; the task ends Cancelled
                canceller.cancel_bcast().unwrap();
                unreachable!("cancel_bcast returns into the unwound task");
            })
            .unwrap();
        }

        // a pile of would-be work on both units; some may run before the
        // cancel lands, none may run after task_complete returns
        for _ in 0..64 {
            let ran = ran.clone();
            let yielder = rt.clone();
            rt.task_create(&[], Priority::Low, move || {
                ran.fetch_add(1, Ordering::AcqRel);
                // cancellation points: every yield checks the flag
                let _ = yielder.task_yield(-1);
            })
            .unwrap();
        }

        rt.task_complete(false).unwrap();
        assert!(!rt.cancellation_requested(), "flag clears after the barrier");

        // the runtime is alive: new work runs normally
        let alive = Arc::new(AtomicBool::new(false));
        let marker = alive.clone();
        rt.task_create(&[], Priority::Normal, move || {
            marker.store(true, Ordering::Release);
        })
        .unwrap();
        rt.task_complete(false).unwrap();
        assert!(alive.load(Ordering::Acquire));
    });
}

#[test]
fn cancel_barrier_is_collective() {
    common::run_units(2, |rt| {
        // both units enter voluntarily from root level
        rt.cancel_barrier().unwrap();
        rt.task_complete(false).unwrap();
        assert!(!rt.cancellation_requested());
    });
}
