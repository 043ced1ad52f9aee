// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::slots::MAX_STACK_DEPTH;
use libdd_trace_logger::{EntryType, MultiBufferLogger};
use num_derive::{FromPrimitive, ToPrimitive};
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of one stack collection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum StackCollectionRetcode {
    Success = 0,
    StackOverflow = 1,
    NoStackForThread = 2,
    EmptyStack = 3,
    /// The collection itself faulted and was rescued by the fault handler.
    SignalInterrupt = 4,
    TracerDisabled = 5,
    Ignore = 6,
}

impl StackCollectionRetcode {
    /// The stack-error entry type this result is logged as, or `None` for
    /// results that produce no error entry (successful captures, and the
    /// suppressed `TracerDisabled`/`Ignore` results).
    pub fn error_entry_type(self) -> Option<EntryType> {
        match self {
            StackCollectionRetcode::Success => None,
            StackCollectionRetcode::StackOverflow => Some(EntryType::StkErrStackOverflow),
            StackCollectionRetcode::NoStackForThread => Some(EntryType::StkErrNoStackForThread),
            StackCollectionRetcode::EmptyStack => Some(EntryType::StkErrEmptyStack),
            StackCollectionRetcode::SignalInterrupt => Some(EntryType::StkErrSignalInterrupt),
            StackCollectionRetcode::TracerDisabled | StackCollectionRetcode::Ignore => None,
        }
    }
}

/// A stack collection capability, registered with the profiler under an
/// integer id.
///
/// `collect_stack` runs inside a signal handler on the sampled thread's own
/// stack: implementations must be async-signal-safe there (no allocation, no
/// locks, no non-reentrant libc). A fault raised during `collect_stack` is
/// recorded as a `SignalInterrupt` sample before execution resumes at the
/// faulting point, so a one-shot fault (a raised signal, a store that a
/// concurrent unprotect made valid) unwinds cleanly; an access that keeps
/// faulting crashes the process as it would anywhere else. Everything else
/// runs in normal thread context.
pub trait Tracer: Send + Sync {
    /// Captures the interrupted thread's stack into `frames`, setting `depth`
    /// to the number of valid entries. `ucontext` is the interrupted context
    /// as delivered to the signal handler.
    fn collect_stack(
        &self,
        ucontext: *mut libc::c_void,
        frames: &mut [u64; MAX_STACK_DEPTH],
        depth: &mut u16,
    ) -> StackCollectionRetcode;

    /// Writes one successfully captured stack to the logger. Runs on the
    /// logger-loop thread.
    fn flush_stack(&self, logger: &MultiBufferLogger, frames: &[u64], tid: i32, time: i64);

    /// Called once when a profiling session starts, before any sample.
    fn start_tracing(&self) {}

    /// Called once when a profiling session stops, after the final drain.
    fn stop_tracing(&self) {}

    /// Hint that sampling is about to begin; a tracer can warm caches here.
    fn prepare(&self) {}
}

/// Read-only once handed to the profiler; lookups happen inside signal
/// handlers, which is safe precisely because nothing mutates the map
/// afterwards.
pub type TracerRegistry = HashMap<i32, Arc<dyn Tracer>>;
