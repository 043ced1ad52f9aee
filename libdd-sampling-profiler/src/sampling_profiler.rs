// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The profiling state machine: session lifecycle, the signal dispatches, and
//! the logger loop that turns filled sample slots into trace entries.

use crate::capture::{self, CapturePhase};
use crate::counters::{CounterSnapshot, SessionCounters};
use crate::signal_handler::SignalHandler;
use crate::slots::StackSlotTable;
use crate::timer_manager::{SamplingMode, TimerConfig, TimerManager};
use crate::tracer::{StackCollectionRetcode, Tracer, TracerRegistry};
use crate::whitelist::Whitelist;
use libdd_common::threading::get_current_thread_id;
use libdd_common::time::monotonic_nanos;
use libdd_trace_logger::{MultiBufferLogger, StandardEntry};
use nix::sys::signal::Signal;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Signal carrying sampling interrupts: delivered by the per-thread timers in
/// CPU mode and by the ticker thread in wall-clock mode.
pub const SAMPLING_SIGNAL: Signal = Signal::SIGPROF;

/// Signals intercepted while a collection is in flight, so a faulting tracer
/// yields a `SignalInterrupt` sample instead of killing the process.
pub const FAULT_SIGNALS: [Signal; 2] = [Signal::SIGSEGV, Signal::SIGBUS];

/// Slot capacity used by [`SamplingProfiler::new`].
pub const DEFAULT_SLOT_CAPACITY: usize = 16;

/// How long the logger loop sleeps between drains.
const LOGGER_POLL_INTERVAL: Duration = Duration::from_millis(10);

const PHASE_IDLE: u8 = 0;
const PHASE_PROFILING: u8 = 1;
const PHASE_STOPPING: u8 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ProfilerError {
    #[error("at least one tracer must be registered")]
    EmptyTracerRegistry,
    #[error("no registered tracer with id {0:#x}")]
    UnknownTracerId(i32),
    #[error("slot capacity must be nonzero")]
    ZeroSlotCapacity,
    #[error("{0} must be nonzero")]
    ZeroInterval(&'static str),
}

/// Per-session parameters, validated at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    tracer_id: i32,
    sample_interval_ms: u32,
    thread_detect_interval_ms: u32,
    use_wall_clock: bool,
}

impl SessionConfig {
    /// A `tracer_id` of 0 selects the profiler's default tracer. Both
    /// intervals must be nonzero.
    pub fn new(
        tracer_id: i32,
        sample_interval_ms: u32,
        thread_detect_interval_ms: u32,
        use_wall_clock: bool,
    ) -> Result<Self, ProfilerError> {
        if sample_interval_ms == 0 {
            return Err(ProfilerError::ZeroInterval("sample_interval_ms"));
        }
        if thread_detect_interval_ms == 0 {
            return Err(ProfilerError::ZeroInterval("thread_detect_interval_ms"));
        }
        Ok(Self {
            tracer_id,
            sample_interval_ms,
            thread_detect_interval_ms,
            use_wall_clock,
        })
    }

    pub fn tracer_id(&self) -> i32 {
        self.tracer_id
    }

    pub fn sample_interval_ms(&self) -> u32 {
        self.sample_interval_ms
    }

    pub fn thread_detect_interval_ms(&self) -> u32 {
        self.thread_detect_interval_ms
    }

    pub fn use_wall_clock(&self) -> bool {
        self.use_wall_clock
    }
}

/// Everything a signal dispatch needs, immutable for the session's lifetime.
///
/// The enabled signal records hold a raw pointer to the live session's state;
/// [`SamplingProfiler::stop_profiling`] clears that pointer and drains
/// in-flight dispatches before the owning `Arc` can drop it.
struct SessionState {
    slots: Arc<StackSlotTable>,
    counters: SessionCounters,
    tracer: Arc<dyn Tracer>,
    tracer_id: i32,
    start_time: i64,
}

impl SessionState {
    /// Runs one stack collection from sampling-signal context.
    ///
    /// Async-signal-safe: claims a slot, runs the tracer's collection with a
    /// capture frame pushed so a fault dispatch can find the slot, then
    /// publishes or releases. A full table or a full nesting stack drops the
    /// sample and counts a miss.
    fn collect_sample(&self, ucontext: *mut libc::c_void) {
        let Some(mut slot) = self.slots.claim(self.tracer_id) else {
            self.counters.record_slot_miss();
            return;
        };
        if !capture::push_in_tracer(slot.index()) {
            self.counters.record_slot_miss();
            slot.release();
            return;
        }
        let (frames, depth) = slot.frames_and_depth();
        *depth = 0;
        let retcode = self.tracer.collect_stack(ucontext, frames, depth);
        match capture::pop() {
            CapturePhase::Faulted => {
                // The fault dispatch already published this slot.
                slot.abandon();
            }
            CapturePhase::InTracer => match retcode {
                StackCollectionRetcode::TracerDisabled | StackCollectionRetcode::Ignore => {
                    slot.release();
                }
                retcode => {
                    slot.set_metadata(get_current_thread_id(), monotonic_nanos());
                    slot.publish(retcode);
                    self.counters.record_filled();
                }
            },
        }
    }

    /// Rescues the innermost in-flight collection from fault-signal context.
    ///
    /// Publishes its slot as a `SignalInterrupt` sample and returns true.
    /// Returns false when no collection is in flight on this thread; the
    /// fault is then genuine and must chain onward.
    fn recover_fault(&self) -> bool {
        let Some(slot_index) = capture::fault_innermost() else {
            return false;
        };
        self.slots
            .publish_fault(slot_index, get_current_thread_id(), monotonic_nanos());
        self.counters.record_fault_recovery();
        self.counters.record_filled();
        true
    }
}

extern "C" fn sampling_signal_handler(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let scope = SignalHandler::enter_handler(signum);
    if scope.is_enabled() {
        let session = scope.data() as *const SessionState;
        if !session.is_null() {
            // SAFETY: stop_profiling clears the pointer and drains this
            // dispatch before the session state can drop.
            unsafe { (*session).collect_sample(ucontext) };
        }
    }
    // Never the previous action: a sampling signal from a timer torn down
    // mid-delivery must be swallowed, not terminate the process.
    // SAFETY: forwarding the arguments the OS delivered for this dispatch.
    unsafe { scope.chain_to_previous_handler(signum, info, ucontext) };
}

extern "C" fn fault_signal_handler(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let scope = SignalHandler::enter_handler(signum);
    if scope.is_enabled() {
        let session = scope.data() as *const SessionState;
        if !session.is_null() {
            // SAFETY: as for the sampling dispatch.
            if unsafe { (*session).recover_fault() } {
                return;
            }
        }
    }
    // Not a tracer fault: behave as if the profiler were never installed,
    // default action included.
    // SAFETY: forwarding the arguments the OS delivered for this dispatch.
    unsafe { scope.chain_to_previous_action(signum, info, ucontext) };
}

/// The signal records, created on first use and shared by all sessions.
#[derive(Clone, Copy)]
struct SessionRecords {
    sampling: &'static SignalHandler,
    faults: [&'static SignalHandler; 2],
}

impl SessionRecords {
    fn install() -> Self {
        Self {
            sampling: SignalHandler::initialize(SAMPLING_SIGNAL, sampling_signal_handler),
            faults: FAULT_SIGNALS
                .map(|signal| SignalHandler::initialize(signal, fault_signal_handler)),
        }
    }

    /// Fault records first: once sampling interrupts can arrive, a tracer
    /// fault must already be catchable.
    fn enable(&self) -> anyhow::Result<()> {
        for fault in &self.faults {
            fault.enable()?;
        }
        self.sampling.enable()
    }

    /// Sampling first, then faults, each drain completing before the next
    /// record is touched.
    fn disable(&self) {
        self.sampling.disable();
        for fault in &self.faults {
            fault.disable();
        }
    }

    fn set_data(&self, data: *mut libc::c_void) {
        self.sampling.set_data(data);
        for fault in &self.faults {
            fault.set_data(data);
        }
    }

    fn is_draining(&self) -> bool {
        self.sampling.is_draining() || self.faults.iter().any(|fault| fault.is_draining())
    }
}

struct ControlState {
    timer_manager: Option<TimerManager>,
}

struct LoopState {
    stop_requested: bool,
    attached: bool,
    exited: bool,
}

/// An in-process sampling profiler.
///
/// One session runs at a time: [`SamplingProfiler::start_profiling`] arms the
/// signal records and timers, a logger loop (usually on a dedicated thread)
/// drains filled slots into the logger, and
/// [`SamplingProfiler::stop_profiling`] tears everything down in an order
/// that leaves no dispatch touching freed session state.
pub struct SamplingProfiler {
    logger: MultiBufferLogger,
    default_tracer_id: i32,
    tracers: TracerRegistry,
    slots: Arc<StackSlotTable>,
    whitelist: Arc<Whitelist>,
    phase: AtomicU8,
    control: Mutex<ControlState>,
    session: RwLock<Option<Arc<SessionState>>>,
    loop_state: Mutex<LoopState>,
    loop_wake: Condvar,
    records: OnceLock<SessionRecords>,
}

impl SamplingProfiler {
    /// Builds a profiler with [`DEFAULT_SLOT_CAPACITY`] sample slots.
    ///
    /// `default_tracer_id` names the tracer used when a session config passes
    /// a tracer id of 0; it must be present in `tracers`. Every registered
    /// tracer gets its `prepare` hook called here, in normal thread context.
    pub fn new(
        logger: MultiBufferLogger,
        default_tracer_id: i32,
        tracers: TracerRegistry,
    ) -> Result<Self, ProfilerError> {
        Self::with_slot_capacity(logger, default_tracer_id, tracers, DEFAULT_SLOT_CAPACITY)
    }

    /// As [`SamplingProfiler::new`], with an explicit slot capacity.
    pub fn with_slot_capacity(
        logger: MultiBufferLogger,
        default_tracer_id: i32,
        tracers: TracerRegistry,
        slot_capacity: usize,
    ) -> Result<Self, ProfilerError> {
        if tracers.is_empty() {
            return Err(ProfilerError::EmptyTracerRegistry);
        }
        if !tracers.contains_key(&default_tracer_id) {
            return Err(ProfilerError::UnknownTracerId(default_tracer_id));
        }
        if slot_capacity == 0 {
            return Err(ProfilerError::ZeroSlotCapacity);
        }
        for tracer in tracers.values() {
            tracer.prepare();
        }
        Ok(Self {
            logger,
            default_tracer_id,
            tracers,
            slots: Arc::new(StackSlotTable::new(slot_capacity)),
            whitelist: Arc::new(Whitelist::new()),
            phase: AtomicU8::new(PHASE_IDLE),
            control: Mutex::new(ControlState {
                timer_manager: None,
            }),
            session: RwLock::new(None),
            loop_state: Mutex::new(LoopState {
                stop_requested: false,
                attached: false,
                exited: false,
            }),
            loop_wake: Condvar::new(),
            records: OnceLock::new(),
        })
    }

    /// Starts a profiling session, arming the signal records before any
    /// timer can fire. Returns false, fully unwound, if the session's tracer
    /// id is unknown or the signal records or timers cannot be set up.
    ///
    /// Panics if a session is already running; callers sequence sessions.
    pub fn start_profiling(&self, config: SessionConfig) -> bool {
        let mut control = self.control.lock();
        assert_eq!(
            self.phase.load(Ordering::Acquire),
            PHASE_IDLE,
            "start_profiling requires an idle profiler"
        );

        let tracer_id = if config.tracer_id == 0 {
            self.default_tracer_id
        } else {
            config.tracer_id
        };
        let Some(tracer) = self.tracers.get(&tracer_id) else {
            tracing::error!(tracer_id, "cannot start profiling with an unregistered tracer");
            return false;
        };

        let session = Arc::new(SessionState {
            slots: Arc::clone(&self.slots),
            counters: SessionCounters::new(),
            tracer: Arc::clone(tracer),
            tracer_id,
            start_time: monotonic_nanos(),
        });

        let records = *self.records.get_or_init(SessionRecords::install);
        records.set_data(Arc::as_ptr(&session) as *mut libc::c_void);
        if let Err(error) = records.enable() {
            records.disable();
            records.set_data(ptr::null_mut());
            tracing::error!(%error, "failed to enable the profiling signal records");
            return false;
        }
        *self.session.write() = Some(Arc::clone(&session));
        session.tracer.start_tracing();

        {
            let mut loop_state = self.loop_state.lock();
            loop_state.stop_requested = false;
            loop_state.exited = false;
        }

        let timer_config = TimerConfig {
            mode: if config.use_wall_clock {
                SamplingMode::WallClock
            } else {
                SamplingMode::Cpu
            },
            signal: SAMPLING_SIGNAL,
            sample_interval_ms: config.sample_interval_ms,
            thread_detect_interval_ms: config.thread_detect_interval_ms,
        };
        match TimerManager::start(
            timer_config,
            Arc::clone(&self.whitelist),
            Arc::new(libdd_common::proc::live_thread_ids),
        ) {
            Ok(manager) => control.timer_manager = Some(manager),
            Err(error) => {
                records.disable();
                records.set_data(ptr::null_mut());
                session.tracer.stop_tracing();
                *self.session.write() = None;
                tracing::error!(%error, "failed to start the sampling timers");
                return false;
            }
        }

        self.phase.store(PHASE_PROFILING, Ordering::Release);
        tracing::info!(
            tracer_id,
            sample_interval_ms = config.sample_interval_ms,
            thread_detect_interval_ms = config.thread_detect_interval_ms,
            wall_clock = config.use_wall_clock,
            "profiling started"
        );
        true
    }

    /// Stops the running session.
    ///
    /// Teardown order matters: the timers go first so no new interrupts
    /// arrive, the logger loop is told to wind down, the records are disabled
    /// (draining in-flight dispatches) and their session pointer cleared,
    /// then after the loop's handoff the leftover slots are flushed, the
    /// tracer session closes, and the counters are written out as trace
    /// annotations.
    ///
    /// Panics if no session is running.
    pub fn stop_profiling(&self) {
        let mut control = self.control.lock();
        assert_eq!(
            self.phase.load(Ordering::Acquire),
            PHASE_PROFILING,
            "stop_profiling requires an active session"
        );
        self.phase.store(PHASE_STOPPING, Ordering::Release);

        if let Some(manager) = control.timer_manager.take() {
            manager.stop();
        }

        {
            let mut loop_state = self.loop_state.lock();
            loop_state.stop_requested = true;
            self.loop_wake.notify_all();
        }

        if let Some(records) = self.records.get().copied() {
            records.disable();
            records.set_data(ptr::null_mut());
        }

        {
            let mut loop_state = self.loop_state.lock();
            while loop_state.attached && !loop_state.exited {
                self.loop_wake.wait(&mut loop_state);
            }
        }

        if let Some(session) = self.session.write().take() {
            // Anything published after the loop's final pass; the loop has
            // exited, so this is the only drainer.
            self.flush_filled_slots(&session);
            session.tracer.stop_tracing();
            session.counters.log_nonzero(&self.logger);
            session.counters.reset();
        }

        self.phase.store(PHASE_IDLE, Ordering::Release);
        tracing::info!("profiling stopped");
    }

    /// Runs the drain loop on the calling thread until the next
    /// [`SamplingProfiler::stop_profiling`] completes its handoff.
    ///
    /// Usually spawned on a dedicated thread right after a session starts.
    /// Without a loop attached, filled slots sit in the table until the stop
    /// path flushes them. Panics if a loop is already attached.
    pub fn logger_loop(&self) {
        {
            let mut loop_state = self.loop_state.lock();
            assert!(!loop_state.attached, "a logger loop is already attached");
            if loop_state.stop_requested {
                return;
            }
            loop_state.attached = true;
            loop_state.exited = false;
        }
        tracing::debug!("logger loop attached");

        loop {
            if let Some(session) = self.current_session() {
                self.flush_filled_slots(&session);
            }
            let mut loop_state = self.loop_state.lock();
            if loop_state.stop_requested {
                break;
            }
            self.loop_wake
                .wait_for(&mut loop_state, LOGGER_POLL_INTERVAL);
            if loop_state.stop_requested {
                break;
            }
        }

        // Final sweep for slots published since the last pass.
        if let Some(session) = self.current_session() {
            self.flush_filled_slots(&session);
        }

        {
            let mut loop_state = self.loop_state.lock();
            loop_state.attached = false;
            loop_state.exited = true;
            self.loop_wake.notify_all();
        }
        tracing::debug!("logger loop exited");
    }

    /// True from the moment a session starts until its stop completes.
    pub fn is_profiling(&self) -> bool {
        self.phase.load(Ordering::Acquire) != PHASE_IDLE
    }

    /// Whether a stop is currently blocked draining in-flight dispatches.
    /// Momentary by nature; meant for diagnostics and tests.
    pub fn is_stop_draining(&self) -> bool {
        self.records
            .get()
            .is_some_and(|records| records.is_draining())
    }

    /// Snapshot of the live session's counters; all zeros while idle.
    pub fn counters(&self) -> CounterSnapshot {
        self.current_session()
            .map(|session| session.counters.snapshot())
            .unwrap_or_default()
    }

    /// Marks `tid` for sampling in wall-clock mode. CPU mode samples every
    /// live thread and ignores the whitelist.
    pub fn add_to_whitelist(&self, tid: i32) {
        self.whitelist.add(tid);
    }

    pub fn remove_from_whitelist(&self, tid: i32) {
        self.whitelist.remove(tid);
    }

    /// The logger this profiler writes entries to.
    pub fn logger(&self) -> &MultiBufferLogger {
        &self.logger
    }

    fn current_session(&self) -> Option<Arc<SessionState>> {
        self.session.read().clone()
    }

    /// Drains every filled slot into the logger. Success samples flush
    /// through the tracer that produced them; error retcodes become bare
    /// error entries. Slots filled before this session started are freed
    /// without logging.
    fn flush_filled_slots(&self, session: &SessionState) {
        self.slots.drain_filled(|slot| {
            if slot.time < session.start_time {
                return;
            }
            match slot.result {
                StackCollectionRetcode::Success => {
                    if let Some(tracer) = self.tracers.get(&slot.tracer_id) {
                        tracer.flush_stack(&self.logger, slot.frames, slot.tid, slot.time);
                    }
                }
                other => {
                    if let Some(entry_type) = other.error_entry_type() {
                        self.logger.write(StandardEntry {
                            entry_type,
                            timestamp: slot.time,
                            tid: slot.tid,
                            ..Default::default()
                        });
                    }
                }
            }
        });
    }
}

impl Drop for SamplingProfiler {
    fn drop(&mut self) {
        // The signal records must not outlive the session state they point
        // at; unwinding past a live session would leave exactly that.
        if self.phase.load(Ordering::Acquire) == PHASE_PROFILING {
            self.stop_profiling();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::MAX_STACK_DEPTH;
    use std::sync::atomic::AtomicUsize;

    struct NullTracer {
        prepared: AtomicUsize,
    }

    impl NullTracer {
        fn new() -> Self {
            Self {
                prepared: AtomicUsize::new(0),
            }
        }
    }

    impl Tracer for NullTracer {
        fn collect_stack(
            &self,
            _ucontext: *mut libc::c_void,
            _frames: &mut [u64; MAX_STACK_DEPTH],
            _depth: &mut u16,
        ) -> StackCollectionRetcode {
            StackCollectionRetcode::EmptyStack
        }

        fn flush_stack(
            &self,
            _logger: &MultiBufferLogger,
            _frames: &[u64],
            _tid: i32,
            _time: i64,
        ) {
        }

        fn prepare(&self) {
            self.prepared.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn registry_of(ids: &[i32]) -> (TracerRegistry, Vec<Arc<NullTracer>>) {
        let mut registry = TracerRegistry::new();
        let mut tracers = Vec::new();
        for &id in ids {
            let tracer = Arc::new(NullTracer::new());
            registry.insert(id, tracer.clone() as Arc<dyn Tracer>);
            tracers.push(tracer);
        }
        (registry, tracers)
    }

    #[test]
    fn test_construction_rejects_empty_registry() {
        let result = SamplingProfiler::new(MultiBufferLogger::new(), 1, TracerRegistry::new());
        assert!(matches!(result, Err(ProfilerError::EmptyTracerRegistry)));
    }

    #[test]
    fn test_construction_rejects_unknown_default_tracer() {
        let (registry, _tracers) = registry_of(&[1]);
        let result = SamplingProfiler::new(MultiBufferLogger::new(), 2, registry);
        assert!(matches!(result, Err(ProfilerError::UnknownTracerId(2))));
    }

    #[test]
    fn test_construction_rejects_zero_slot_capacity() {
        let (registry, _tracers) = registry_of(&[1]);
        let result = SamplingProfiler::with_slot_capacity(MultiBufferLogger::new(), 1, registry, 0);
        assert!(matches!(result, Err(ProfilerError::ZeroSlotCapacity)));
    }

    #[test]
    fn test_construction_prepares_every_tracer() {
        let (registry, tracers) = registry_of(&[1, 2, 3]);
        let profiler = SamplingProfiler::new(MultiBufferLogger::new(), 2, registry);
        assert!(profiler.is_ok());
        for tracer in &tracers {
            assert_eq!(tracer.prepared.load(Ordering::Relaxed), 1);
        }
    }

    #[test]
    fn test_session_config_rejects_zero_intervals() {
        assert!(matches!(
            SessionConfig::new(0, 0, 100, false),
            Err(ProfilerError::ZeroInterval("sample_interval_ms"))
        ));
        assert!(matches!(
            SessionConfig::new(0, 10, 0, false),
            Err(ProfilerError::ZeroInterval("thread_detect_interval_ms"))
        ));
    }

    #[test]
    fn test_session_config_exposes_fields() {
        let config = SessionConfig::new(0xFACE, 19, 23, true).unwrap();
        assert_eq!(config.tracer_id(), 0xFACE);
        assert_eq!(config.sample_interval_ms(), 19);
        assert_eq!(config.thread_detect_interval_ms(), 23);
        assert!(config.use_wall_clock());
    }

    #[test]
    fn test_idle_profiler_reports_no_activity() {
        let (registry, _tracers) = registry_of(&[1]);
        let profiler = SamplingProfiler::new(MultiBufferLogger::new(), 1, registry).unwrap();
        assert!(!profiler.is_profiling());
        assert!(!profiler.is_stop_draining());
        assert_eq!(profiler.counters(), CounterSnapshot::default());
    }
}
