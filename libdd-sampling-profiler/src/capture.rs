// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-thread bookkeeping for captures in flight.
//!
//! Every sampling dispatch pushes one frame before it calls into the tracer
//! and pops it after the tracer returns, so at any instant a thread's stack
//! describes the nest of captures currently executing on it, most recent on
//! top. The fault handler consults the top frame to decide whether a SIGSEGV
//! or SIGBUS belongs to an in-flight capture, and nested dispatches unwind
//! strictly most-recent-first because each one only ever touches the frame it
//! pushed.
//!
//! The storage is const-initialized, destructor-free thread-local data made
//! of plain cells, so every access compiles down to unsynchronized reads and
//! writes of this thread's own memory. The only concurrency is signal
//! interruption by this same thread, which the write ordering below is
//! arranged for.

use std::cell::Cell;

/// Captures that can nest on one thread before samples get dropped.
pub const MAX_NESTED_CAPTURES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePhase {
    /// The dispatch is inside the tracer's collection call.
    InTracer,
    /// The collection faulted; its slot was already published by the fault
    /// handler and the dispatch must abandon it.
    Faulted,
}

struct CaptureFrame {
    slot_index: Cell<usize>,
    phase: Cell<CapturePhase>,
}

struct CaptureStack {
    depth: Cell<usize>,
    frames: [CaptureFrame; MAX_NESTED_CAPTURES],
}

thread_local! {
    static CAPTURE_STACK: CaptureStack = const {
        CaptureStack {
            depth: Cell::new(0),
            frames: [const {
                CaptureFrame {
                    slot_index: Cell::new(0),
                    phase: Cell::new(CapturePhase::InTracer),
                }
            }; MAX_NESTED_CAPTURES],
        }
    };
}

/// Opens a capture frame for the slot at `slot_index`. Returns false when the
/// nest is full; the caller must then drop the sample.
///
/// The depth is raised before the frame is written. A nested dispatch
/// interrupting mid-push therefore works above this frame and never clobbers
/// it, and no fault can observe the half-written frame because faults are
/// only attributed while a tracer call is running.
pub fn push_in_tracer(slot_index: usize) -> bool {
    CAPTURE_STACK.with(|stack| {
        let depth = stack.depth.get();
        if depth == MAX_NESTED_CAPTURES {
            return false;
        }
        stack.depth.set(depth + 1);
        let frame = &stack.frames[depth];
        frame.slot_index.set(slot_index);
        frame.phase.set(CapturePhase::InTracer);
        true
    })
}

/// Closes the top capture frame and reports the phase it ended in.
pub fn pop() -> CapturePhase {
    CAPTURE_STACK.with(|stack| {
        let depth = stack.depth.get();
        assert!(depth > 0, "capture pop without a matching push");
        let phase = stack.frames[depth - 1].phase.get();
        stack.depth.set(depth - 1);
        phase
    })
}

/// Attributes a fault to the top capture frame.
///
/// Returns the slot index of the top frame if it is still `InTracer`, marking
/// it `Faulted` so a second fault inside the same capture is no longer ours.
/// Returns `None` when no capture is in flight on this thread, or the top
/// frame already faulted once; the caller must then chain the signal onward.
pub fn fault_innermost() -> Option<usize> {
    CAPTURE_STACK.with(|stack| {
        let depth = stack.depth.get();
        if depth == 0 {
            return None;
        }
        let frame = &stack.frames[depth - 1];
        if frame.phase.get() != CapturePhase::InTracer {
            return None;
        }
        frame.phase.set(CapturePhase::Faulted);
        Some(frame.slot_index.get())
    })
}

/// Number of captures currently in flight on this thread.
pub fn depth() -> usize {
    CAPTURE_STACK.with(|stack| stack.depth.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    // The thread-local stack leaks state between tests on the same thread,
    // so every test runs its scenario on a fresh thread.
    fn on_fresh_thread<F: FnOnce() + Send + 'static>(scenario: F) {
        std::thread::spawn(scenario).join().unwrap();
    }

    #[test]
    fn test_push_pop_balances() {
        on_fresh_thread(|| {
            assert_eq!(depth(), 0);
            assert!(push_in_tracer(3));
            assert_eq!(depth(), 1);
            assert_eq!(pop(), CapturePhase::InTracer);
            assert_eq!(depth(), 0);
        });
    }

    #[test]
    fn test_fault_marks_top_frame_once() {
        on_fresh_thread(|| {
            assert!(push_in_tracer(5));
            assert_eq!(fault_innermost(), Some(5));
            // The same capture cannot be rescued twice.
            assert_eq!(fault_innermost(), None);
            assert_eq!(pop(), CapturePhase::Faulted);
        });
    }

    #[test]
    fn test_fault_with_no_capture_is_not_ours() {
        on_fresh_thread(|| {
            assert_eq!(fault_innermost(), None);
        });
    }

    #[test]
    fn test_nested_frames_unwind_most_recent_first() {
        on_fresh_thread(|| {
            assert!(push_in_tracer(1));
            assert!(push_in_tracer(2));
            assert!(push_in_tracer(3));

            // Faults attribute innermost-out as each level unwinds.
            assert_eq!(fault_innermost(), Some(3));
            assert_eq!(pop(), CapturePhase::Faulted);
            assert_eq!(fault_innermost(), Some(2));
            assert_eq!(pop(), CapturePhase::Faulted);
            assert_eq!(pop(), CapturePhase::InTracer);
            assert_eq!(depth(), 0);
        });
    }

    #[test]
    fn test_full_nest_refuses_more_captures() {
        on_fresh_thread(|| {
            for index in 0..MAX_NESTED_CAPTURES {
                assert!(push_in_tracer(index));
            }
            assert!(!push_in_tracer(99));
            assert_eq!(depth(), MAX_NESTED_CAPTURES);
            for _ in 0..MAX_NESTED_CAPTURES {
                pop();
            }
        });
    }
}
