// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0
#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod counter;
pub mod entries;
pub mod multi_buffer_logger;
pub mod sink;

pub use counter::EntryIdCounter;
pub use entries::{BytesEntry, EntryType, LogEntry, StandardEntry, MAX_VARIABLE_LENGTH_ENTRY};
pub use multi_buffer_logger::{LoggerError, MultiBufferLogger};
pub use sink::SinkBuffer;

#[cfg(any(test, feature = "test-utils"))]
pub use sink::MemorySink;
