// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Grace-period synchronization between signal handlers and control code.
//!
//! [`Phaser::enter`] and [`Phaser::exit`] bracket work done inside a signal
//! handler; [`Phaser::drain`] waits, from normal context, for every bracketed
//! section that was in flight when the drain began. Entry and exit never
//! block and never allocate, so they are safe at arbitrary interruption
//! points. Draining is the rare, expensive operation.
//!
//! Two counters split the load. A drain settles one counter at a time, so an
//! `enter` that finds its first-choice counter draining always has another
//! counter to land on. The counter's high bit marks it as draining; the
//! drainer parks on the counter word itself with `FUTEX_WAIT` and the last
//! exiting section wakes it.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{fence, AtomicU32, Ordering};

const NR_PHASES: usize = 2;
const DRAINING: u32 = 1 << 31;
const COUNT_DRAINED: u32 = DRAINING;

/// Token tying an [`Phaser::enter`] to the counter it landed on. Must be
/// given back through [`Phaser::exit`] exactly once.
#[derive(Debug)]
#[must_use = "an unexited phase blocks drain forever"]
pub struct Phase(usize);

pub struct Phaser {
    counters: [CachePadded<AtomicU32>; NR_PHASES],
}

impl Phaser {
    pub const fn new() -> Self {
        Self {
            counters: [
                CachePadded::new(AtomicU32::new(0)),
                CachePadded::new(AtomicU32::new(0)),
            ],
        }
    }

    /// Opens a critical section. Never blocks; safe in signal-handler context.
    pub fn enter(&self) -> Phase {
        let mut index = 0;
        while !self.try_increment(index) {
            index = (index + 1) & (NR_PHASES - 1);
        }
        fence(Ordering::SeqCst);
        Phase(index)
    }

    fn try_increment(&self, index: usize) -> bool {
        let counter = &self.counters[index];
        // The DRAINING test must happen before the increment. Unconditional
        // increments would keep a contended counter away from COUNT_DRAINED
        // and the drainer would never wake.
        if counter.load(Ordering::Relaxed) & DRAINING != 0 {
            return false;
        }
        // A drain can set DRAINING between the test and this increment. That
        // lost race is tolerated: the drainer waits for our matching exit,
        // and the race can only happen once per counter per drain.
        counter.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Closes the critical section `phase` belongs to. Never blocks; safe in
    /// signal-handler context.
    pub fn exit(&self, phase: Phase) {
        fence(Ordering::SeqCst);
        let counter = &self.counters[phase.0];
        let value = counter.fetch_sub(1, Ordering::Relaxed).wrapping_sub(1);
        if value == COUNT_DRAINED {
            // The contract allows a single drainer, waking i32::MAX waiters
            // costs nothing extra.
            futex(counter, libc::FUTEX_WAKE, i32::MAX as u32);
        }
    }

    /// Waits for every critical section that was in flight when this call
    /// began. Must be called from normal (non-signal) context, and never from
    /// two threads at once.
    ///
    /// Sections entered while the drain is running are not waited for, except
    /// for the bounded race described in [`Phaser::enter`].
    pub fn drain(&self) {
        for counter in &self.counters {
            Self::drain_counter(counter);
            fence(Ordering::SeqCst);
        }
    }

    fn drain_counter(counter: &AtomicU32) {
        let mut value = counter.fetch_or(DRAINING, Ordering::Release) | DRAINING;
        while value != COUNT_DRAINED {
            // EAGAIN means the value moved under us, EINTR means a signal;
            // both just reload and retry.
            futex(counter, libc::FUTEX_WAIT, value);
            value = counter.load(Ordering::Relaxed);
        }
        counter.fetch_and(!DRAINING, Ordering::Relaxed);
    }

    /// True while a [`Phaser::drain`] is parked on one of the counters.
    pub fn is_draining(&self) -> bool {
        self.counters
            .iter()
            .any(|counter| counter.load(Ordering::Relaxed) & DRAINING != 0)
    }
}

impl Default for Phaser {
    fn default() -> Self {
        Self::new()
    }
}

fn futex(counter: &AtomicU32, op: libc::c_int, value: u32) -> libc::c_long {
    // SAFETY: the futex word is a live AtomicU32 for the whole call and op is
    // one of FUTEX_WAIT/FUTEX_WAKE.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            counter.as_ptr(),
            op,
            value,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null_mut::<u32>(),
            0,
        )
    }
}
