// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

/// Largest payload accepted by the variable-length write path, in bytes.
pub const MAX_VARIABLE_LENGTH_ENTRY: usize = 1024;

/// Wire-level kind tag for trace entries.
///
/// The numeric values are part of the sink contract and must not change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, FromPrimitive, ToPrimitive,
)]
#[repr(i32)]
pub enum EntryType {
    UnknownType = 0,
    StackFrame = 44,
    TraceAnnotation = 51,
    StringKey = 55,
    StringValue = 56,
    StkErrEmptyStack = 87,
    StkErrStackOverflow = 88,
    StkErrNoStackForThread = 89,
    StkErrSignalInterrupt = 90,
}

/// Fixed-size trace entry.
///
/// `id` is assigned by the logger at write time. `matchid` links an entry to a
/// related earlier entry; 0 means no match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardEntry {
    pub id: i32,
    pub entry_type: EntryType,
    pub timestamp: i64,
    pub tid: i32,
    pub callid: i32,
    pub matchid: i32,
    pub extra: i64,
}

impl Default for StandardEntry {
    fn default() -> Self {
        Self {
            id: 0,
            entry_type: EntryType::UnknownType,
            timestamp: 0,
            tid: 0,
            callid: 0,
            matchid: 0,
            extra: 0,
        }
    }
}

/// Variable-length trace entry, holding at most [`MAX_VARIABLE_LENGTH_ENTRY`]
/// bytes of payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BytesEntry {
    pub id: i32,
    pub entry_type: EntryType,
    pub matchid: i32,
    pub payload: Vec<u8>,
}

/// A single entry as delivered to sink buffers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntry {
    Standard(StandardEntry),
    Bytes(BytesEntry),
}

impl LogEntry {
    /// The logger-assigned id of this entry.
    pub fn id(&self) -> i32 {
        match self {
            LogEntry::Standard(e) => e.id,
            LogEntry::Bytes(e) => e.id,
        }
    }

    pub fn entry_type(&self) -> EntryType {
        match self {
            LogEntry::Standard(e) => e.entry_type,
            LogEntry::Bytes(e) => e.entry_type,
        }
    }
}

impl From<StandardEntry> for LogEntry {
    fn from(entry: StandardEntry) -> Self {
        LogEntry::Standard(entry)
    }
}

impl From<BytesEntry> for LogEntry {
    fn from(entry: BytesEntry) -> Self {
        LogEntry::Bytes(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::{FromPrimitive, ToPrimitive};

    #[test]
    fn test_entry_type_wire_values() {
        let expected = [
            (EntryType::UnknownType, 0),
            (EntryType::StackFrame, 44),
            (EntryType::TraceAnnotation, 51),
            (EntryType::StringKey, 55),
            (EntryType::StringValue, 56),
            (EntryType::StkErrEmptyStack, 87),
            (EntryType::StkErrStackOverflow, 88),
            (EntryType::StkErrNoStackForThread, 89),
            (EntryType::StkErrSignalInterrupt, 90),
        ];
        for (entry_type, value) in expected {
            assert_eq!(entry_type.to_i32(), Some(value));
            assert_eq!(EntryType::from_i32(value), Some(entry_type));
        }
    }

    #[test]
    fn test_entry_type_rejects_unassigned_values() {
        assert_eq!(EntryType::from_i32(1), None);
        assert_eq!(EntryType::from_i32(-44), None);
        assert_eq!(EntryType::from_i32(91), None);
    }

    #[test]
    fn test_standard_entry_serializes_with_field_names() {
        let entry = StandardEntry {
            entry_type: EntryType::TraceAnnotation,
            timestamp: 17,
            tid: 42,
            extra: 9,
            ..Default::default()
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["entry_type"], "TraceAnnotation");
        assert_eq!(json["timestamp"], 17);
        assert_eq!(json["tid"], 42);
        assert_eq!(json["extra"], 9);
    }
}
