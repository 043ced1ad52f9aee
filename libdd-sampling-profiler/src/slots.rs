// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity table of sample slots shared between signal handlers and
//! the logger loop.
//!
//! A slot cycles FREE -> CLAIMED -> FILLED -> FREE. Claiming happens inside a
//! signal handler and is a single compare-and-swap; the payload cells are
//! written while the slot is CLAIMED and published with a release transition
//! to FILLED, which is the only point the logger loop may read them from.
//! There are no locks anywhere on this path.

use crate::tracer::StackCollectionRetcode;
use num_traits::FromPrimitive;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Deepest stack a single sample can carry.
pub const MAX_STACK_DEPTH: usize = 128;

// State word layout: bit 63 filled, bit 62 claimed, bits 32..40 result code,
// bits 0..32 the owning tracer id. The all-zero word is a free slot.
const FILLED: u64 = 1 << 63;
const CLAIMED: u64 = 1 << 62;
const RESULT_SHIFT: u32 = 32;
const RESULT_MASK: u64 = 0xFF << RESULT_SHIFT;
const TRACER_ID_MASK: u64 = 0xFFFF_FFFF;
const FREE: u64 = 0;

struct StackSlot {
    state: AtomicU64,
    time: UnsafeCell<i64>,
    tid: UnsafeCell<i32>,
    depth: UnsafeCell<u16>,
    frames: UnsafeCell<[u64; MAX_STACK_DEPTH]>,
}

// SAFETY: the state word serializes all access to the cells. Exactly one
// claimant may write them between FREE and FILLED, and exactly one drainer
// may read them between FILLED and FREE.
unsafe impl Sync for StackSlot {}

impl StackSlot {
    fn new() -> Self {
        Self {
            state: AtomicU64::new(FREE),
            time: UnsafeCell::new(0),
            tid: UnsafeCell::new(0),
            depth: UnsafeCell::new(0),
            frames: UnsafeCell::new([0; MAX_STACK_DEPTH]),
        }
    }
}

/// Exclusive handle to one CLAIMED slot.
///
/// Holding it is the permission to write the slot's cells. It is surrendered
/// through exactly one of [`SlotRef::publish`], [`SlotRef::release`] or
/// [`SlotRef::abandon`]; there is deliberately no drop glue, so a handle
/// abandoned after a fault-path publish touches nothing.
pub struct SlotRef<'a> {
    slot: &'a StackSlot,
    index: usize,
    claimed_word: u64,
}

impl SlotRef<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// The frame buffer and depth cell, for the collection step to fill in.
    pub fn frames_and_depth(&mut self) -> (&mut [u64; MAX_STACK_DEPTH], &mut u16) {
        // SAFETY: this handle is the unique claimant of the slot, so the
        // cells are ours until a terminal state transition.
        unsafe { (&mut *self.slot.frames.get(), &mut *self.slot.depth.get()) }
    }

    pub fn set_metadata(&mut self, tid: i32, time: i64) {
        // SAFETY: as in frames_and_depth.
        unsafe {
            *self.slot.tid.get() = tid;
            *self.slot.time.get() = time;
        }
    }

    /// Publishes the slot as FILLED with `result`, handing it to the logger
    /// loop. Aborts the process if the slot is not in the claimed state this
    /// handle put it in: that means exclusive ownership was broken, and
    /// corruption detected inside a signal handler has no safe continuation.
    pub fn publish(self, result: StackCollectionRetcode) {
        let filled =
            FILLED | ((result as u64) << RESULT_SHIFT) | (self.claimed_word & TRACER_ID_MASK);
        if self
            .slot
            .state
            .compare_exchange(self.claimed_word, filled, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            // SAFETY: abort is async-signal-safe.
            unsafe { libc::abort() };
        }
    }

    /// Returns the slot straight to FREE without publishing. Used for results
    /// the session suppresses entirely.
    pub fn release(self) {
        self.slot.state.store(FREE, Ordering::Release);
    }

    /// Gives up the handle without touching the slot. Correct only when the
    /// slot has already been published on this handle's behalf by the fault
    /// path.
    pub fn abandon(self) {}
}

/// One complete sample, as seen by the drain visitor.
pub struct FilledSlot<'a> {
    pub frames: &'a [u64],
    pub tid: i32,
    pub time: i64,
    pub result: StackCollectionRetcode,
    pub tracer_id: i32,
}

pub struct StackSlotTable {
    slots: Box<[StackSlot]>,
    cursor: AtomicUsize,
}

impl StackSlotTable {
    /// Allocates every slot up front; the capacity never changes afterwards.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "slot table needs at least one slot");
        Self {
            slots: (0..capacity).map(|_| StackSlot::new()).collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claims a FREE slot for `tracer_id`, probing each slot at most once
    /// starting at the shared cursor. Returns `None` when the table is
    /// exhausted; the caller drops that sample rather than waiting.
    ///
    /// Safe in signal-handler context: one atomic add plus bounded CAS
    /// attempts.
    pub fn claim(&self, tracer_id: i32) -> Option<SlotRef<'_>> {
        let claimed_word = CLAIMED | u64::from(tracer_id as u32);
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..self.slots.len() {
            let index = (start + offset) % self.slots.len();
            let slot = &self.slots[index];
            if slot
                .state
                .compare_exchange(FREE, claimed_word, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Some(SlotRef {
                    slot,
                    index,
                    claimed_word,
                });
            }
        }
        None
    }

    /// Publishes the CLAIMED slot at `index` as a signal-interrupted sample.
    /// Called by the fault handler on the thread that owns the claim, so the
    /// cell writes cannot race the interrupted owner. Aborts on a state word
    /// that is not CLAIMED, same as [`SlotRef::publish`].
    pub fn publish_fault(&self, index: usize, tid: i32, time: i64) {
        let slot = &self.slots[index];
        let claimed = slot.state.load(Ordering::Relaxed);
        if claimed & CLAIMED == 0 || claimed & FILLED != 0 {
            // SAFETY: abort is async-signal-safe.
            unsafe { libc::abort() };
        }
        // SAFETY: we are executing on the claimant thread, above its
        // interrupted frame, so writing its cells is single-threaded.
        unsafe {
            *slot.tid.get() = tid;
            *slot.time.get() = time;
            *slot.depth.get() = 0;
        }
        let filled = FILLED
            | ((StackCollectionRetcode::SignalInterrupt as u64) << RESULT_SHIFT)
            | (claimed & TRACER_ID_MASK);
        if slot
            .state
            .compare_exchange(claimed, filled, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            // SAFETY: abort is async-signal-safe.
            unsafe { libc::abort() };
        }
    }

    /// Passes every FILLED slot to `visitor` and frees it. Must only run on
    /// one thread at a time; the session guarantees that by draining from the
    /// logger loop (or inline from stop when no loop is attached).
    pub fn drain_filled<F>(&self, mut visitor: F)
    where
        F: FnMut(FilledSlot<'_>),
    {
        for slot in self.slots.iter() {
            let state = slot.state.load(Ordering::Acquire);
            if state & FILLED == 0 {
                continue;
            }
            let result_bits = ((state & RESULT_MASK) >> RESULT_SHIFT) as u8;
            // The byte was written by a publish from a valid retcode.
            let result = StackCollectionRetcode::from_u8(result_bits)
                .unwrap_or(StackCollectionRetcode::SignalInterrupt);
            // SAFETY: FILLED was observed with acquire ordering, so the
            // publisher's cell writes happened-before these reads, and this
            // is the only draining thread.
            let (frames, tid, time) = unsafe {
                let depth = usize::from(*slot.depth.get());
                (
                    &(&*slot.frames.get())[..depth.min(MAX_STACK_DEPTH)],
                    *slot.tid.get(),
                    *slot.time.get(),
                )
            };
            visitor(FilledSlot {
                frames,
                tid,
                time,
                result,
                tracer_id: (state & TRACER_ID_MASK) as u32 as i32,
            });
            slot.state.store(FREE, Ordering::Release);
        }
    }
}
