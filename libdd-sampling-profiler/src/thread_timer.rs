// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-thread POSIX interval timers for CPU-time sampling.

use anyhow::Context;
use nix::sys::signal::Signal;
use rand::Rng;

const NANOS_PER_MILLI: i64 = 1_000_000;
const NANOS_PER_SEC: i64 = 1_000_000_000;

// Kernel encoding of per-thread clockids, from linux/posix-timers.h.
const CPUCLOCK_SCHED: libc::clockid_t = 2;
const CPUCLOCK_PERTHREAD_MASK: libc::clockid_t = 4;

/// The scheduler CPU-time clock of thread `tid`.
fn thread_cpu_clockid(tid: i32) -> libc::clockid_t {
    ((!tid) << 3) | CPUCLOCK_SCHED | CPUCLOCK_PERTHREAD_MASK
}

fn timespec_from_nanos(nanos: i64) -> libc::timespec {
    libc::timespec {
        tv_sec: (nanos / NANOS_PER_SEC) as libc::time_t,
        tv_nsec: (nanos % NANOS_PER_SEC) as libc::c_long,
    }
}

/// A POSIX timer ticking on one thread's CPU clock and delivering `signal`
/// directly to that thread. Dropping the handle deletes the timer.
pub struct ThreadTimer {
    timer: libc::timer_t,
}

impl ThreadTimer {
    /// Creates and arms a timer against `tid`'s scheduler CPU clock via
    /// `SIGEV_THREAD_ID`.
    ///
    /// The first expiration lands at a random point within one interval so
    /// threads discovered together do not sample in lockstep. Fails when the
    /// thread no longer exists, which callers treat as a skippable race with
    /// thread exit.
    pub fn new(tid: i32, signal: Signal, interval_ms: u32) -> anyhow::Result<Self> {
        // SAFETY: sigevent is a plain C struct for which all-zeroes is a
        // valid initial value.
        let mut sev: libc::sigevent = unsafe { std::mem::zeroed() };
        sev.sigev_notify = libc::SIGEV_THREAD_ID;
        sev.sigev_signo = signal as libc::c_int;
        sev.sigev_notify_thread_id = tid;

        let mut timer: libc::timer_t = std::ptr::null_mut();
        // SAFETY: sev and timer point at locals that outlive the call.
        if unsafe { libc::timer_create(thread_cpu_clockid(tid), &mut sev, &mut timer) } != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("timer_create failed for thread {tid}"));
        }

        let interval_ns = i64::from(interval_ms) * NANOS_PER_MILLI;
        let initial_ns = rand::thread_rng().gen_range(1..=interval_ns);
        let spec = libc::itimerspec {
            it_interval: timespec_from_nanos(interval_ns),
            it_value: timespec_from_nanos(initial_ns),
        };
        // SAFETY: the timer was just created and spec points at a local.
        if unsafe { libc::timer_settime(timer, 0, &spec, std::ptr::null_mut()) } != 0 {
            let err = std::io::Error::last_os_error();
            // SAFETY: created above and not yet handed out.
            unsafe { libc::timer_delete(timer) };
            return Err(err).with_context(|| format!("timer_settime failed for thread {tid}"));
        }

        Ok(Self { timer })
    }
}

impl Drop for ThreadTimer {
    fn drop(&mut self) {
        // SAFETY: the id came from timer_create and is deleted exactly once.
        unsafe { libc::timer_delete(self.timer) };
    }
}
