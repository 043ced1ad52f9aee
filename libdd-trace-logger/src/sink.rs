// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::entries::LogEntry;

/// Destination for trace entries.
///
/// `write` runs on whichever thread called the logger, under the logger's
/// shared lock, so it should return quickly and must not call back into the
/// logger.
pub trait SinkBuffer: Send + Sync {
    fn write(&self, entry: &LogEntry);
}

/// Records every entry it receives, for assertions in tests and examples.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Default)]
pub struct MemorySink {
    entries: parking_lot::Mutex<Vec<LogEntry>>,
}

#[cfg(any(test, feature = "test-utils"))]
impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far, in arrival order.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Entries of one type, in arrival order.
    pub fn entries_of_type(&self, entry_type: crate::entries::EntryType) -> Vec<LogEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.entry_type() == entry_type)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SinkBuffer for MemorySink {
    fn write(&self, entry: &LogEntry) {
        self.entries.lock().push(entry.clone());
    }
}
