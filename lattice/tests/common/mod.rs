// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Multi-unit test harness: runs `n` units as threads of this process
//! over the in-process shared-memory transport, each with its own
//! runtime, and joins them at the end.

use lattice::{Config, GlobalUnit, Runtime};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

static NEXT_SYNCAREA: AtomicI32 = AtomicI32::new(0x4c00);

#[allow(dead_code)]
pub fn run_units<F>(n: i32, f: F)
where
    F: Fn(&Runtime) + Send + Sync + 'static,
{
    run_units_with(n, |config| config, f);
}

#[allow(dead_code)]
pub fn run_units_with<C, F>(n: i32, configure: C, f: F)
where
    C: Fn(Config) -> Config + Send + Sync + 'static,
    F: Fn(&Runtime) + Send + Sync + 'static,
{
    let area = NEXT_SYNCAREA.fetch_add(1, Ordering::Relaxed);
    let f = Arc::new(f);
    let configure = Arc::new(configure);

    let units: Vec<_> = (0..n)
        .map(|u| {
            let f = f.clone();
            let configure = configure.clone();
            std::thread::Builder::new()
                .name(format!("unit-{u}"))
                .spawn(move || {
                    let driver =
                        lattice::transport::shmem::attach(area, GlobalUnit::new(u), n).unwrap();
                    let mut config = Config::from_env();
                    // keep multi-unit tests lean
                    config.num_threads = 2;
                    let config = configure(config);
                    let rt = Runtime::init_with_driver(Box::new(driver), config).unwrap();
                    f(&rt);
                    rt.finalize().unwrap();
                })
                .unwrap()
        })
        .collect();

    for unit in units {
        unit.join().unwrap();
    }
}
