// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libdd_common::threading::get_current_thread_id;
use libdd_common::time::monotonic_nanos;
use libdd_trace_logger::{EntryType, MultiBufferLogger, StandardEntry};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-session sample accounting.
///
/// Increments happen in signal context, so they are plain relaxed adds on
/// independent words; reads and resets happen from control context.
#[derive(Debug, Default)]
pub struct SessionCounters {
    filled_slots: AtomicU64,
    slot_misses: AtomicU64,
    fault_recoveries: AtomicU64,
}

/// Point-in-time copy of the session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    /// Samples published to the slot table, successes and error codes alike.
    pub filled_slots: u64,
    /// Samples dropped because no slot could be claimed.
    pub slot_misses: u64,
    /// Captures rescued by the fault handler instead of crashing.
    pub fault_recoveries: u64,
}

impl SessionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_filled(&self) {
        self.filled_slots.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slot_miss(&self) {
        self.slot_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fault_recovery(&self) {
        self.fault_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            filled_slots: self.filled_slots.load(Ordering::Relaxed),
            slot_misses: self.slot_misses.load(Ordering::Relaxed),
            fault_recoveries: self.fault_recoveries.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.filled_slots.store(0, Ordering::Relaxed);
        self.slot_misses.store(0, Ordering::Relaxed);
        self.fault_recoveries.store(0, Ordering::Relaxed);
    }

    /// Writes each nonzero counter to `logger` as a trace annotation. Runs
    /// from control context at session stop, never from a handler.
    pub fn log_nonzero(&self, logger: &MultiBufferLogger) {
        let snapshot = self.snapshot();
        for (name, value) in [
            ("filled_slots", snapshot.filled_slots),
            ("slot_misses", snapshot.slot_misses),
            ("fault_recoveries", snapshot.fault_recoveries),
        ] {
            if value != 0 {
                write_annotation(logger, name, value as i64);
            }
        }
    }
}

/// One TRACE_ANNOTATION entry carrying `value`, with STRING_KEY and
/// STRING_VALUE payloads chained to it through `matchid`.
fn write_annotation(logger: &MultiBufferLogger, name: &str, value: i64) {
    let annotation_id = logger.write(StandardEntry {
        entry_type: EntryType::TraceAnnotation,
        timestamp: monotonic_nanos(),
        tid: get_current_thread_id(),
        extra: value,
        ..Default::default()
    });
    // Both payloads are tiny, far under the variable-length bound.
    let Ok(key_id) = logger.write_bytes(EntryType::StringKey, annotation_id, name.as_bytes())
    else {
        return;
    };
    let _ = logger.write_bytes(EntryType::StringValue, key_id, value.to_string().as_bytes());
}
