// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic sampling-signal sources.
//!
//! CPU mode arms one [`ThreadTimer`] per live thread, so each thread is
//! signalled in proportion to the CPU time it burns. Wall mode runs a ticker
//! thread that signals every whitelisted live thread each interval. In both
//! modes a discovery thread rescans the live thread set periodically, so
//! threads spawned after sampling starts are picked up within one detect
//! interval.

use crate::thread_timer::ThreadTimer;
use crate::whitelist::Whitelist;
use anyhow::Context;
use nix::sys::signal::Signal;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How sample timing is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplingMode {
    /// Per-thread CPU-clock timers; every live thread is a target.
    Cpu,
    /// One wall-clock ticker signalling the whitelisted live threads.
    WallClock,
}

/// Supplier of the current live thread-id set. Injectable so tests can run
/// against synthetic thread sets.
pub type ThreadProvider = Arc<dyn Fn() -> anyhow::Result<HashSet<i32>> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct TimerConfig {
    pub mode: SamplingMode,
    pub signal: Signal,
    pub sample_interval_ms: u32,
    pub thread_detect_interval_ms: u32,
}

/// Owns the discovery thread and, in wall mode, the ticker thread.
///
/// The per-thread timers live on the discovery thread and are deleted when
/// it unwinds, so after [`TimerManager::stop`] returns no further sampling
/// signals are generated.
pub struct TimerManager {
    shared: Arc<Shared>,
    discovery: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
}

struct Shared {
    config: TimerConfig,
    whitelist: Arc<Whitelist>,
    threads: ThreadProvider,
    stop: Mutex<bool>,
    wake: Condvar,
    wall_targets: Mutex<HashSet<i32>>,
}

impl TimerManager {
    /// Spawns the worker threads. The first thread scan runs immediately,
    /// so sampling begins without waiting out a detect interval.
    pub fn start(
        config: TimerConfig,
        whitelist: Arc<Whitelist>,
        threads: ThreadProvider,
    ) -> anyhow::Result<Self> {
        let shared = Arc::new(Shared {
            config,
            whitelist,
            threads,
            stop: Mutex::new(false),
            wake: Condvar::new(),
            wall_targets: Mutex::new(HashSet::new()),
        });

        let discovery = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("profiler-thread-detect".into())
                .spawn(move || discovery_loop(&shared))
                .context("failed to spawn the thread-discovery thread")?
        };
        let mut manager = Self {
            shared: Arc::clone(&shared),
            discovery: Some(discovery),
            ticker: None,
        };

        if config.mode == SamplingMode::WallClock {
            let shared = Arc::clone(&shared);
            let ticker = std::thread::Builder::new()
                .name("profiler-wall-ticker".into())
                .spawn(move || ticker_loop(&shared));
            match ticker {
                Ok(handle) => manager.ticker = Some(handle),
                Err(error) => {
                    manager.stop();
                    return Err(error).context("failed to spawn the wall-clock ticker thread");
                }
            }
        }

        tracing::debug!(mode = ?config.mode, "timer manager started");
        Ok(manager)
    }

    /// Stops and joins the worker threads. Per-thread timers are deleted as
    /// the discovery thread unwinds, so this blocks until the signal source
    /// is fully disarmed.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.discovery.is_none() && self.ticker.is_none() {
            return;
        }
        *self.shared.stop.lock() = true;
        self.shared.wake.notify_all();
        for handle in [self.discovery.take(), self.ticker.take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                tracing::error!("a timer worker thread panicked");
            }
        }
        tracing::debug!("timer manager stopped");
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn discovery_loop(shared: &Shared) {
    let interval = Duration::from_millis(u64::from(shared.config.thread_detect_interval_ms));
    let mut timers: HashMap<i32, ThreadTimer> = HashMap::new();
    loop {
        shared.rescan(&mut timers);
        let mut stop = shared.stop.lock();
        if *stop {
            break;
        }
        shared.wake.wait_for(&mut stop, interval);
        if *stop {
            break;
        }
    }
    // Dropping the map disarms every per-thread timer.
}

fn ticker_loop(shared: &Shared) {
    let pid = libdd_common::threading::get_process_id();
    let signum = shared.config.signal as libc::c_int;
    let interval = Duration::from_millis(u64::from(shared.config.sample_interval_ms));
    loop {
        {
            let mut stop = shared.stop.lock();
            if *stop {
                break;
            }
            shared.wake.wait_for(&mut stop, interval);
            if *stop {
                break;
            }
        }
        let targets = shared.wall_targets.lock().clone();
        for tid in targets {
            // ESRCH for a thread that exited since the last scan is fine.
            // SAFETY: tgkill takes no memory arguments.
            unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, signum) };
        }
    }
}

impl Shared {
    fn rescan(&self, timers: &mut HashMap<i32, ThreadTimer>) {
        let live = match (self.threads)() {
            Ok(live) => live,
            Err(error) => {
                tracing::warn!(%error, "thread enumeration failed; keeping the current target set");
                return;
            }
        };
        match self.config.mode {
            SamplingMode::Cpu => {
                timers.retain(|tid, _| live.contains(tid));
                for &tid in &live {
                    if timers.contains_key(&tid) {
                        continue;
                    }
                    match ThreadTimer::new(tid, self.config.signal, self.config.sample_interval_ms)
                    {
                        Ok(timer) => {
                            timers.insert(tid, timer);
                        }
                        Err(error) => {
                            // The thread can exit between the scan and here.
                            tracing::debug!(tid, %error, "skipping thread without a timer");
                        }
                    }
                }
            }
            SamplingMode::WallClock => {
                self.whitelist.prune(&live);
                *self.wall_targets.lock() = self.whitelist.snapshot();
            }
        }
    }
}
