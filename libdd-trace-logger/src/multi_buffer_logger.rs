// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::counter::EntryIdCounter;
use crate::entries::{BytesEntry, EntryType, LogEntry, StandardEntry, MAX_VARIABLE_LENGTH_ENTRY};
use crate::sink::SinkBuffer;
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("Payload of {0} bytes exceeds the {MAX_VARIABLE_LENGTH_ENTRY} byte entry limit")]
    PayloadTooLarge(usize),
}

/// Assigns ids to trace entries and fans each one out to a set of sinks.
///
/// Clones share the same sink set and id sequence. Writers of different
/// entries do not block each other; registering or removing a sink is
/// exclusive with all writes, so a sink never sees a torn view of the set.
#[derive(Clone)]
pub struct MultiBufferLogger {
    inner: Arc<LoggerInner>,
}

struct LoggerInner {
    counter: EntryIdCounter,
    sinks: RwLock<Vec<Arc<dyn SinkBuffer>>>,
}

impl MultiBufferLogger {
    /// A logger drawing ids from the process-wide counter, so its entries
    /// stay orderable against every other default-constructed logger.
    pub fn new() -> Self {
        Self::with_counter(EntryIdCounter::global())
    }

    /// A logger drawing ids from `counter` instead of the process-wide one.
    pub fn with_counter(counter: EntryIdCounter) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                counter,
                sinks: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Registers `sink` to receive every subsequent entry.
    pub fn add_buffer(&self, sink: Arc<dyn SinkBuffer>) {
        self.inner.sinks.write().push(sink);
    }

    /// Unregisters `sink`. Identity is by allocation, not value, so the caller
    /// must pass a clone of the Arc it registered.
    pub fn remove_buffer(&self, sink: &Arc<dyn SinkBuffer>) {
        self.inner
            .sinks
            .write()
            .retain(|registered| !Arc::ptr_eq(registered, sink));
    }

    /// Stamps `entry` with the next id, delivers it to every registered sink
    /// and returns the assigned id.
    pub fn write(&self, mut entry: StandardEntry) -> i32 {
        let id = self.inner.counter.next_id();
        entry.id = id;
        self.fan_out(&LogEntry::Standard(entry));
        id
    }

    /// Writes a variable-length payload of at most
    /// [`MAX_VARIABLE_LENGTH_ENTRY`] bytes and returns the assigned id.
    ///
    /// An oversized payload consumes no id and reaches no sink.
    pub fn write_bytes(
        &self,
        entry_type: EntryType,
        matchid: i32,
        payload: &[u8],
    ) -> Result<i32, LoggerError> {
        if payload.len() > MAX_VARIABLE_LENGTH_ENTRY {
            return Err(LoggerError::PayloadTooLarge(payload.len()));
        }
        let id = self.inner.counter.next_id();
        self.fan_out(&LogEntry::Bytes(BytesEntry {
            id,
            entry_type,
            matchid,
            payload: payload.to_vec(),
        }));
        Ok(id)
    }

    /// Writes one [`EntryType::StackFrame`] entry per frame, each chained to
    /// the previous via `matchid`, and returns the id of the first entry.
    ///
    /// An empty `frames` writes nothing and returns 0.
    pub fn write_stack_frames(&self, tid: i32, timestamp: i64, frames: &[u64]) -> i32 {
        let mut first_id = 0;
        let mut previous_id = 0;
        for frame in frames {
            let id = self.write(StandardEntry {
                entry_type: EntryType::StackFrame,
                timestamp,
                tid,
                matchid: previous_id,
                extra: *frame as i64,
                ..Default::default()
            });
            if first_id == 0 {
                first_id = id;
            }
            previous_id = id;
        }
        first_id
    }

    fn fan_out(&self, entry: &LogEntry) {
        for sink in self.inner.sinks.read().iter() {
            sink.write(entry);
        }
    }
}

impl Default for MultiBufferLogger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;

    fn isolated_logger() -> (MultiBufferLogger, Arc<MemorySink>) {
        let logger = MultiBufferLogger::with_counter(EntryIdCounter::new());
        let sink = Arc::new(MemorySink::new());
        logger.add_buffer(sink.clone());
        (logger, sink)
    }

    fn annotation(extra: i64) -> StandardEntry {
        StandardEntry {
            entry_type: EntryType::TraceAnnotation,
            timestamp: 100,
            tid: 7,
            extra,
            ..Default::default()
        }
    }

    #[test]
    fn test_write_assigns_increasing_ids() {
        let (logger, sink) = isolated_logger();
        assert_eq!(logger.write(annotation(0)), 1);
        assert_eq!(logger.write(annotation(1)), 2);
        assert_eq!(logger.write(annotation(2)), 3);
        let ids: Vec<_> = sink.entries().iter().map(LogEntry::id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_every_sink_receives_every_entry() {
        let (logger, first) = isolated_logger();
        let second = Arc::new(MemorySink::new());
        logger.add_buffer(second.clone());
        logger.write(annotation(5));
        assert_eq!(first.entries(), second.entries());
        assert_eq!(first.len(), 1);
    }

    #[test]
    fn test_removed_sink_stops_receiving() {
        let (logger, kept) = isolated_logger();
        let removed = Arc::new(MemorySink::new());
        logger.add_buffer(removed.clone());
        logger.write(annotation(0));

        let handle: Arc<dyn SinkBuffer> = removed.clone();
        logger.remove_buffer(&handle);
        logger.write(annotation(1));

        assert_eq!(removed.len(), 1);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_write_bytes_rejects_oversized_payload() {
        let (logger, sink) = isolated_logger();
        let oversized = vec![0u8; MAX_VARIABLE_LENGTH_ENTRY + 1];
        assert!(matches!(
            logger.write_bytes(EntryType::StringKey, 0, &oversized),
            Err(LoggerError::PayloadTooLarge(len)) if len == oversized.len()
        ));
        assert!(sink.is_empty());
        // The failed write consumed no id.
        assert_eq!(logger.write(annotation(0)), 1);
    }

    #[test]
    fn test_write_bytes_accepts_payload_at_the_limit() {
        let (logger, sink) = isolated_logger();
        let payload = vec![0xABu8; MAX_VARIABLE_LENGTH_ENTRY];
        let id = logger.write_bytes(EntryType::StringValue, 9, &payload).unwrap();
        assert_eq!(id, 1);
        match &sink.entries()[0] {
            LogEntry::Bytes(entry) => {
                assert_eq!(entry.id, 1);
                assert_eq!(entry.matchid, 9);
                assert_eq!(entry.payload, payload);
            }
            other => panic!("expected a bytes entry, got {other:?}"),
        }
    }

    #[test]
    fn test_write_stack_frames_chains_matchids() {
        let (logger, sink) = isolated_logger();
        let frames = [0x1000u64, 0x2000, 0x3000];
        let first_id = logger.write_stack_frames(42, 99, &frames);
        assert_eq!(first_id, 1);

        let entries = sink.entries_of_type(EntryType::StackFrame);
        assert_eq!(entries.len(), 3);
        let mut previous_id = 0;
        for (entry, frame) in entries.iter().zip(frames) {
            match entry {
                LogEntry::Standard(entry) => {
                    assert_eq!(entry.matchid, previous_id);
                    assert_eq!(entry.extra, frame as i64);
                    assert_eq!(entry.tid, 42);
                    assert_eq!(entry.timestamp, 99);
                    previous_id = entry.id;
                }
                other => panic!("expected a standard entry, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_empty_stack_writes_nothing() {
        let (logger, sink) = isolated_logger();
        assert_eq!(logger.write_stack_frames(42, 99, &[]), 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_loggers_sharing_a_counter_never_reuse_ids() {
        let counter = EntryIdCounter::new();
        let a = MultiBufferLogger::with_counter(counter.clone());
        let b = MultiBufferLogger::with_counter(counter);
        let mut ids = vec![a.write(annotation(0)), b.write(annotation(1)), a.write(annotation(2))];
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_concurrent_writers_get_unique_ids() {
        let (logger, sink) = isolated_logger();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let logger = logger.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        logger.write(annotation(i));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let mut ids: Vec<_> = sink.entries().iter().map(LogEntry::id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 800);
    }
}
