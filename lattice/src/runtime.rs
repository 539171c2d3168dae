// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Runtime lifecycle.
//!
//! [`Runtime::init`] parses the launcher-forwarded `--dart-*` flags,
//! attaches the transport, builds the universal team with its symmetric
//! window and the process-local pool, registers the scheduler's message
//! handlers, opens the default active-message queue and starts the worker
//! pool. There are no process globals: the returned handle owns
//! everything and is passed through every entry point (clones are cheap).
//!
//! [`Runtime::finalize`] drains the task graph and in-flight messages,
//! stops the workers, tears teams down in reverse creation order and
//! closes the transport.

use crate::amq::{AmHandler, Amq};
use crate::collective::UserOp;
use crate::error::{ErrorCode, Result};
use crate::group::Group;
use crate::sched::Scheduler;
use crate::team::{TeamId, TeamRegistry, TeamSlot};
use crate::transport::{CommId, Transport};
use crate::unit::{GlobalUnit, TeamUnit};
use anyhow::{Context as _, bail};
use buddy::Buddy;
use core::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Once, OnceLock};
use std::time::Duration;

/// Payload capacity of the default active-message queue; large enough
/// for every runtime-internal message.
const DEFAULT_AM_PAYLOAD: usize = 64;
const DEFAULT_AM_CAPACITY: usize = 256;

const STATE_RUNNING: u8 = 1;
const STATE_FINALIZED: u8 = 2;

/// Launcher-forwarded runtime flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchArgs {
    /// `--dart-id`: the caller's global unit id.
    pub id: GlobalUnit,
    /// `--dart-size`: universe size.
    pub size: i32,
    /// `--dart-syncarea-id`: identifier of the pre-created shared sync
    /// area.
    pub syncarea_id: i32,
    /// `--dart-syncarea-size`: size of that area in bytes.
    pub syncarea_size: Option<usize>,
}

impl FromStr for LaunchArgs {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        LaunchArgs::parse(s.split_whitespace().map(str::to_owned))
    }
}

impl LaunchArgs {
    /// Parses the runtime-reserved flags out of a command line.
    /// Arguments that do not start with `--dart-` belong to the
    /// application and are ignored; unknown `--dart-*` flags are an
    /// error.
    pub fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut id = None;
        let mut size = None;
        let mut syncarea_id = None;
        let mut syncarea_size = None;

        for arg in args {
            let Some(rest) = arg.strip_prefix("--dart-") else {
                continue;
            };
            let (key, value) = rest
                .split_once('=')
                .with_context(|| format!("flag --dart-{rest} is missing a value"))?;
            match key {
                "id" => id = Some(value.parse().context("--dart-id")?),
                "size" => size = Some(value.parse().context("--dart-size")?),
                "syncarea-id" => {
                    syncarea_id = Some(value.parse().context("--dart-syncarea-id")?);
                }
                "syncarea-size" => {
                    syncarea_size = Some(value.parse().context("--dart-syncarea-size")?);
                }
                other => bail!("unknown runtime flag --dart-{other}"),
            }
        }

        let id: i32 = id.context("--dart-id is required")?;
        let size: i32 = size.context("--dart-size is required")?;
        Ok(LaunchArgs {
            id: GlobalUnit::new(id),
            size,
            syncarea_id: syncarea_id.unwrap_or(0),
            syncarea_size,
        })
    }
}

/// How an idle worker waits for work (`IDLE_THREAD`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlePolicy {
    /// Sleep for `IDLE_THREAD_SLEEP` per round.
    Sleep,
    /// Busy-poll.
    Poll,
    /// Block until task arrival is signalled.
    Wait,
}

/// Copyin fetch implementation (`COPYIN_IMPL`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyinImpl {
    Get,
    SendRecv,
}

/// Copyin wait strategy of the one-sided path (`COPYIN_WAIT`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyinWait {
    Yield,
    Block,
}

/// Runtime tuning, populated from the environment and overridable by
/// embedding code (tests shrink the worker pool this way).
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker pool size.
    pub num_threads: usize,
    /// Per-task stack size in bytes.
    pub task_stack_size: usize,
    pub bind_threads: bool,
    pub bind_threads_verbose: bool,
    /// Phases per dependency-matching pass.
    pub matching_interval: u64,
    /// Producer throttle: maximum phases with live tasks (0 = off).
    pub max_active_phases: u64,
    pub copyin_impl: CopyinImpl,
    pub copyin_wait: CopyinWait,
    pub idle_policy: IdlePolicy,
    pub idle_sleep: Duration,
    pub progress_thread: bool,
    pub progress_interval: Duration,
    /// Bytes of each team's symmetric window (segment 0).
    pub syncarea_size: usize,
    /// Bytes of the process-local pool (rounded up to a power of two).
    pub local_pool_size: usize,
}

impl Config {
    /// Reads every runtime knob from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
        let env_threads = crate::env::number("NUM_THREADS", 0);
        let num_threads = cores.max(usize::try_from(env_threads.max(0)).unwrap());

        let matching_interval =
            u64::try_from(crate::env::number("MATCHING_INTERVAL", 1).max(1)).unwrap();
        let max_active_phases = u64::try_from(
            crate::env::number(
                "MAX_ACTIVE_PHASES",
                i64::try_from(matching_interval * 2).unwrap(),
            )
            .max(0),
        )
        .unwrap();

        Self {
            num_threads,
            task_stack_size: crate::env::size("TASK_STACKSIZE", 128 * 1024),
            bind_threads: crate::env::boolean("BIND_THREADS", false),
            bind_threads_verbose: crate::env::boolean("BIND_THREADS_VERBOSE", false),
            matching_interval,
            max_active_phases,
            copyin_impl: crate::env::keyword(
                "COPYIN_IMPL",
                &[("GET", CopyinImpl::Get), ("SENDRECV", CopyinImpl::SendRecv)],
                CopyinImpl::Get,
            ),
            copyin_wait: crate::env::keyword(
                "COPYIN_WAIT",
                &[("YIELD", CopyinWait::Yield), ("BLOCK", CopyinWait::Block)],
                CopyinWait::Yield,
            ),
            idle_policy: crate::env::keyword(
                "IDLE_THREAD",
                &[
                    ("SLEEP", IdlePolicy::Sleep),
                    ("POLL", IdlePolicy::Poll),
                    ("WAIT", IdlePolicy::Wait),
                ],
                IdlePolicy::Sleep,
            ),
            idle_sleep: crate::env::duration("IDLE_THREAD_SLEEP", Duration::from_micros(100)),
            progress_thread: crate::env::boolean("THREAD_PROGRESS", false),
            progress_interval: crate::env::duration(
                "THREAD_PROGRESS_INTERVAL",
                Duration::from_micros(100),
            ),
            syncarea_size: 64 * 1024,
            local_pool_size: 16 << 20,
        }
    }
}

/// A handle to one unit's runtime. Cheap to clone; every public entry
/// point of the crate hangs off it.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

pub(crate) struct RuntimeInner {
    driver: Box<dyn Transport>,
    config: Config,
    my_unit: GlobalUnit,
    size: i32,
    state: AtomicU8,
    teams: Mutex<TeamRegistry>,
    local_pool: Mutex<Buddy>,
    handle_pool: lifo::Stack<crate::rma::Handle>,
    user_ops: Mutex<Vec<UserOp>>,
    am_handlers: Mutex<Vec<AmHandler>>,
    sched: Scheduler,
    default_amq: OnceLock<Amq>,
}

// === impl Runtime ===

impl Runtime {
    /// Initializes this unit's runtime: attaches the in-process
    /// shared-memory transport per the launch flags, then brings the
    /// whole substrate up. Collective across the universe.
    pub fn init(args: &LaunchArgs) -> Result<Runtime> {
        let mut config = Config::from_env();
        if let Some(size) = args.syncarea_size {
            config.syncarea_size = size;
        }
        let driver = crate::transport::shmem::attach(args.syncarea_id, args.id, args.size)?;
        Self::init_with_driver(Box::new(driver), config)
    }

    /// Like [`init`][Self::init] with an explicit driver and
    /// configuration.
    pub fn init_with_driver(driver: Box<dyn Transport>, config: Config) -> Result<Runtime> {
        init_logging();
        let my_unit = driver.global_unit();
        let size = driver.universe_size();
        tracing::info!(unit = my_unit.get(), size, "runtime init");

        let rt = Runtime {
            inner: Arc::new(RuntimeInner {
                driver,
                sched: Scheduler::new(config.num_threads),
                config,
                my_unit,
                size,
                state: AtomicU8::new(STATE_RUNNING),
                teams: Mutex::new(TeamRegistry::new()),
                local_pool: Mutex::new(Buddy::new(0)),
                handle_pool: lifo::Stack::new(),
                user_ops: Mutex::new(Vec::new()),
                am_handlers: Mutex::new(Vec::new()),
                default_amq: OnceLock::new(),
            }),
        };

        // the universal team, its symmetric window, the local pool
        let group = Group::range(size)?;
        let all = Arc::new(TeamSlot {
            id: TeamId::ALL,
            parent: TeamId::NULL,
            level: 0,
            comm: CommId::WORLD,
            group,
            my_unit: TeamUnit::new(my_unit.get()),
            segments: Mutex::new(crate::segment::SegmentRegistry::new()),
            children: Mutex::new(Vec::new()),
            lock_slots: AtomicI32::new(0),
        });
        rt.setup_symmetric_segment(&all)?;
        rt.setup_local_pool(&all)?;
        rt.teams_insert(all);

        // message handlers, the default queue, the worker pool
        rt.sched_register_handlers()?;
        let amq = rt.amq_open(DEFAULT_AM_PAYLOAD, DEFAULT_AM_CAPACITY, TeamId::ALL)?;
        rt.inner
            .default_amq
            .set(amq)
            .unwrap_or_else(|_| unreachable!("default queue opened twice"));
        rt.sched_start()?;

        rt.barrier(TeamId::ALL)?;
        tracing::info!(unit = my_unit.get(), "runtime up");
        Ok(rt)
    }

    /// Tears the runtime down: drains tasks and messages, stops the
    /// workers, destroys teams in reverse creation order, closes the
    /// transport. Collective across the universe.
    pub fn finalize(&self) -> Result<()> {
        self.ensure_running()?;
        tracing::info!(unit = self.my_unit().get(), "runtime finalize");

        self.task_complete(false)?;
        self.barrier(TeamId::ALL)?;
        self.sched_stop();

        let order = {
            let teams = self.inner.teams.lock().unwrap();
            teams.teardown_order()
        };
        for id in order {
            if id == TeamId::ALL {
                continue;
            }
            if let Ok(slot) = self.team(id) {
                self.teardown_team(&slot)?;
                self.teams_remove(id);
            }
        }

        let all = self.team(TeamId::ALL)?;
        self.teardown_team(&all)?;
        self.teams_remove(TeamId::ALL);

        self.driver().close()?;
        self.inner.state.store(STATE_FINALIZED, Ordering::Release);
        Ok(())
    }

    /// The caller's global unit id.
    #[must_use]
    pub fn my_unit(&self) -> GlobalUnit {
        self.inner.my_unit
    }

    /// Number of units in the universe.
    #[must_use]
    pub fn size(&self) -> i32 {
        self.inner.size
    }

    /// `Err(NotInit)` unless the runtime is up.
    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.inner.state.load(Ordering::Acquire) == STATE_RUNNING {
            Ok(())
        } else {
            Err(ErrorCode::NotInit)
        }
    }

    // --- crate-internal accessors ---

    pub(crate) fn driver(&self) -> &dyn Transport {
        &*self.inner.driver
    }

    pub(crate) fn config(&self) -> &Config {
        &self.inner.config
    }

    pub(crate) fn sched(&self) -> &Scheduler {
        &self.inner.sched
    }

    pub(crate) fn default_amq(&self) -> &Amq {
        self.inner.default_amq.get().expect("default queue open")
    }

    pub(crate) fn local_pool(&self) -> &Mutex<Buddy> {
        &self.inner.local_pool
    }

    pub(crate) fn handle_pool(&self) -> &lifo::Stack<crate::rma::Handle> {
        &self.inner.handle_pool
    }

    pub(crate) fn user_ops(&self) -> &Mutex<Vec<UserOp>> {
        &self.inner.user_ops
    }

    pub(crate) fn am_handlers(&self) -> &Mutex<Vec<AmHandler>> {
        &self.inner.am_handlers
    }

    /// Resolves a team handle. The null team never resolves.
    pub(crate) fn team(&self, id: TeamId) -> Result<Arc<TeamSlot>> {
        if id.is_null() {
            return Err(ErrorCode::Inval);
        }
        self.inner
            .teams
            .lock()
            .unwrap()
            .get(id)
            .ok_or(ErrorCode::NotFound)
    }

    pub(crate) fn teams_next_id(&self) -> i16 {
        self.inner.teams.lock().unwrap().next_id()
    }

    pub(crate) fn teams_reserve(&self, id: i16) {
        self.inner.teams.lock().unwrap().reserve_up_to(id);
    }

    pub(crate) fn teams_insert(&self, slot: Arc<TeamSlot>) {
        self.inner.teams.lock().unwrap().insert(slot);
    }

    pub(crate) fn teams_remove(&self, id: TeamId) {
        self.inner.teams.lock().unwrap().remove(id);
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("unit", &self.inner.my_unit)
            .field("size", &self.inner.size)
            .finish_non_exhaustive()
    }
}

/// Installs the process-wide log subscriber once, honoring `LOG_LEVEL`
/// (falling back to the subscriber's default environment handling).
fn init_logging() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let filter = match crate::env::string("LOG_LEVEL") {
            Some(level) => EnvFilter::try_new(level.to_ascii_lowercase())
                .unwrap_or_else(|_| EnvFilter::new("error")),
            None => EnvFilter::from_default_env(),
        };
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_args_parse() {
        let args = LaunchArgs::from_str(
            "./app --dart-id=3 --dart-size=8 --dart-syncarea-id=11 --dart-syncarea-size=4096 --app-flag",
        )
        .unwrap();
        assert_eq!(args.id, GlobalUnit::new(3));
        assert_eq!(args.size, 8);
        assert_eq!(args.syncarea_id, 11);
        assert_eq!(args.syncarea_size, Some(4096));
    }

    #[test]
    fn launch_args_require_identity() {
        assert!(LaunchArgs::from_str("--dart-size=4").is_err());
        assert!(LaunchArgs::from_str("--dart-id=0").is_err());
    }

    #[test]
    fn launch_args_reject_unknown_dart_flags() {
        assert!(LaunchArgs::from_str("--dart-id=0 --dart-size=1 --dart-bogus=1").is_err());
        // non-dart flags are for the application
        assert!(LaunchArgs::from_str("--dart-id=0 --dart-size=1 --verbose").is_ok());
    }
}
