// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod capture;
pub mod counters;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod phaser;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod sampling_profiler;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod signal_handler;
pub mod slots;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod thread_timer;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod timer_manager;
pub mod tracer;
pub mod whitelist;

pub use counters::{CounterSnapshot, SessionCounters};
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use phaser::Phaser;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use sampling_profiler::{
    ProfilerError, SamplingProfiler, SessionConfig, DEFAULT_SLOT_CAPACITY, FAULT_SIGNALS,
    SAMPLING_SIGNAL,
};
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use signal_handler::{HandlerScope, RawHandler, SignalHandler};
pub use slots::{StackSlotTable, MAX_STACK_DEPTH};
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use thread_timer::ThreadTimer;
#[cfg(any(target_os = "linux", target_os = "android"))]
pub use timer_manager::{SamplingMode, ThreadProvider, TimerConfig, TimerManager};
pub use tracer::{StackCollectionRetcode, Tracer, TracerRegistry};
pub use whitelist::Whitelist;
