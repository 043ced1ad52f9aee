// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide signal-handler records.
//!
//! A [`SignalHandler`] record owns one signal number and provides what a
//! sampling dispatch needs from it:
//!
//! 1. looking up an associated data pointer from signal-handler context,
//! 2. a disable operation that blocks until every dispatch running at the
//!    time of the call has left its [`HandlerScope`],
//! 3. RAII scoping for use inside handlers, and
//! 4. chaining to whatever action was installed before ours.
//!
//! Once a record exists for a signal its handler function can never change,
//! and the record itself is never freed: a signal delivered concurrently with
//! teardown may still be on its way into the dispatch path. `uninstall`
//! restores the previously-saved OS action and retires the record; a later
//! `enable` revives it.
//!
//! Control-side operations (`enable`, `disable`, `uninstall`, `set_data`) are
//! not reentrant and must be serialized by the caller.

use crate::phaser::{Phase, Phaser};
use anyhow::Context;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// Handler signature installed at the OS level.
pub type RawHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

// Linux seems to have the most, supporting up to 64 inclusive
// https://man7.org/linux/man-pages/man7/signal.7.html
const MAX_SIGNALS: usize = 65;

static REGISTERED: [AtomicPtr<SignalHandler>; MAX_SIGNALS] =
    [const { AtomicPtr::new(std::ptr::null_mut()) }; MAX_SIGNALS];

pub struct SignalHandler {
    signal: Signal,
    handler: RawHandler,
    data: AtomicPtr<libc::c_void>,
    phaser: Phaser,
    installed: AtomicBool,
    enabled: AtomicBool,
    // Leaked boxes: a straggler dispatch may chain through a saved action at
    // any time, so old actions are replaced but never freed.
    old_action: AtomicPtr<SigAction>,
}

impl SignalHandler {
    /// Returns the process-wide record for `signal`, creating it on first
    /// call.
    ///
    /// Panics when the signal was registered earlier with a different handler
    /// function; the handler of a record cannot change for the life of the
    /// process.
    pub fn initialize(signal: Signal, handler: RawHandler) -> &'static SignalHandler {
        let index = signal as libc::c_int as usize;
        loop {
            let existing = REGISTERED[index].load(Ordering::Acquire);
            if !existing.is_null() {
                // SAFETY: records are never freed once published.
                let record = unsafe { &*existing };
                assert!(
                    record.handler == handler,
                    "{signal} is already registered with a different handler"
                );
                return record;
            }

            let record = Box::into_raw(Box::new(SignalHandler {
                signal,
                handler,
                data: AtomicPtr::new(std::ptr::null_mut()),
                phaser: Phaser::new(),
                installed: AtomicBool::new(false),
                enabled: AtomicBool::new(false),
                old_action: AtomicPtr::new(std::ptr::null_mut()),
            }));
            if REGISTERED[index]
                .compare_exchange(
                    std::ptr::null_mut(),
                    record,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                // SAFETY: just published, never freed.
                return unsafe { &*record };
            }
            // Lost the race; ours was never published.
            // SAFETY: we exclusively own this unpublished box.
            drop(unsafe { Box::from_raw(record) });
        }
    }

    /// Installs the OS-level handler if it is not currently installed, saving
    /// the action found there for chaining and restoration, then starts
    /// accepting dispatches.
    pub fn enable(&self) -> anyhow::Result<()> {
        if !self.installed.load(Ordering::Acquire) {
            let action = SigAction::new(
                SigHandler::SigAction(self.handler),
                SaFlags::SA_SIGINFO
                    | SaFlags::SA_NODEFER
                    | SaFlags::SA_ONSTACK
                    | SaFlags::SA_RESTART,
                SigSet::empty(),
            );
            // SAFETY: the handler function stays valid for the lifetime of
            // the process, as does the record it consults.
            let old = unsafe { signal::sigaction(self.signal, &action) }
                .with_context(|| format!("Failed to install handler for {}", self.signal))?;
            self.old_action
                .store(Box::into_raw(Box::new(old)), Ordering::Release);
            self.installed.store(true, Ordering::Release);
        }
        self.enabled.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Stops accepting dispatches and waits for every dispatch running at
    /// the time of this call to leave its scope. The OS-level action is left
    /// in place, so further deliveries are swallowed by the disabled scope.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
        self.phaser.drain();
    }

    /// Disables the record, restores the previously-saved OS action and
    /// retires the record. A later [`SignalHandler::enable`] revives it.
    pub fn uninstall(&self) -> anyhow::Result<()> {
        self.enabled.store(false, Ordering::Relaxed);
        let old = self.old_action.load(Ordering::Acquire);
        if self.installed.load(Ordering::Acquire) && !old.is_null() {
            // SAFETY: saved actions are leaked, never freed.
            let old = unsafe { &*old };
            // SAFETY: restoring an action previously captured by sigaction.
            unsafe { signal::sigaction(self.signal, old) }
                .with_context(|| format!("Failed to restore previous action for {}", self.signal))?;
        }
        self.phaser.drain();
        self.installed.store(false, Ordering::Release);
        Ok(())
    }

    /// Publishes `data` for retrieval by dispatches via [`HandlerScope::data`].
    pub fn set_data(&self, data: *mut libc::c_void) {
        self.data.store(data, Ordering::Relaxed);
    }

    /// Whether a [`SignalHandler::disable`] or [`SignalHandler::uninstall`]
    /// drain is currently blocked on in-flight dispatches. Momentary by
    /// nature; meant for diagnostics and tests.
    pub fn is_draining(&self) -> bool {
        self.phaser.is_draining()
    }

    /// Call first thing from a registered handler function. Aborts if no
    /// record exists for `signum`, which would mean the registry is corrupt.
    pub fn enter_handler(signum: libc::c_int) -> HandlerScope<'static> {
        let Some(record) = Self::lookup(signum) else {
            // SAFETY: abort is async-signal-safe.
            unsafe { libc::abort() };
        };
        if !record.installed.load(Ordering::Acquire) || !record.enabled.load(Ordering::Relaxed) {
            return HandlerScope {
                record,
                phase: None,
            };
        }
        let phase = record.phaser.enter();
        HandlerScope {
            record,
            phase: Some(phase),
        }
    }

    fn lookup(signum: libc::c_int) -> Option<&'static SignalHandler> {
        if signum <= 0 || signum as usize >= MAX_SIGNALS {
            return None;
        }
        let record = REGISTERED[signum as usize].load(Ordering::Acquire);
        if record.is_null() {
            None
        } else {
            // SAFETY: records are never freed once published.
            Some(unsafe { &*record })
        }
    }

    /// How we chain depends on what kind of action we're chaining to.
    /// https://www.gnu.org/software/libc/manual/html_node/Signal-Handling.html
    unsafe fn chain_to_previous_action(
        &self,
        signum: libc::c_int,
        info: *mut libc::siginfo_t,
        ucontext: *mut libc::c_void,
    ) {
        let old = self.old_action.load(Ordering::Acquire);
        if old.is_null() {
            return;
        }
        // SAFETY: saved actions are leaked, never freed.
        let old = unsafe { &*old };
        match old.handler() {
            SigHandler::SigDfl => {
                // Reinstate the default action and re-deliver so the kernel
                // side of the disposition (termination, core dump) runs.
                if unsafe { signal::sigaction(self.signal, old) }.is_err() {
                    // SAFETY: abort is async-signal-safe.
                    unsafe { libc::abort() };
                }
                // SAFETY: re-raising the signal we are handling.
                unsafe { libc::raise(signum) };
            }
            SigHandler::SigIgn => (),
            SigHandler::Handler(f) => f(signum),
            SigHandler::SigAction(f) => f(signum, info, ucontext),
        }
    }

    unsafe fn chain_to_previous_handler(
        &self,
        signum: libc::c_int,
        info: *mut libc::siginfo_t,
        ucontext: *mut libc::c_void,
    ) {
        let old = self.old_action.load(Ordering::Acquire);
        if old.is_null() {
            return;
        }
        // SAFETY: saved actions are leaked, never freed.
        let old = unsafe { &*old };
        match old.handler() {
            // Default and ignore dispositions are not handler functions; the
            // signal stops here.
            SigHandler::SigDfl | SigHandler::SigIgn => (),
            SigHandler::Handler(f) => f(signum),
            SigHandler::SigAction(f) => f(signum, info, ucontext),
        }
    }
}

/// One dispatch's presence inside a [`SignalHandler`]. Dropping it (or
/// chaining out through it) is what a [`SignalHandler::disable`] drain waits
/// for.
pub struct HandlerScope<'a> {
    record: &'a SignalHandler,
    phase: Option<Phase>,
}

impl<'a> HandlerScope<'a> {
    /// False when the record is retired or disabled; the dispatch should then
    /// do nothing of its own.
    pub fn is_enabled(&self) -> bool {
        self.phase.is_some()
    }

    /// The pointer published through [`SignalHandler::set_data`].
    pub fn data(&self) -> *mut libc::c_void {
        self.record.data.load(Ordering::Relaxed)
    }

    /// Exits this scope, then invokes the previously-installed handler
    /// function, if there was one. Default and ignore dispositions are
    /// swallowed.
    ///
    /// # Safety
    /// Must be called from signal-handler context with the `info` and
    /// `ucontext` the OS delivered for `signum`.
    pub unsafe fn chain_to_previous_handler(
        mut self,
        signum: libc::c_int,
        info: *mut libc::siginfo_t,
        ucontext: *mut libc::c_void,
    ) {
        self.exit();
        // SAFETY: forwarded from our caller's signal-handler context.
        unsafe { self.record.chain_to_previous_handler(signum, info, ucontext) }
    }

    /// Exits this scope, then performs whatever action was installed before
    /// ours, the default action included.
    ///
    /// # Safety
    /// As for [`HandlerScope::chain_to_previous_handler`].
    pub unsafe fn chain_to_previous_action(
        mut self,
        signum: libc::c_int,
        info: *mut libc::siginfo_t,
        ucontext: *mut libc::c_void,
    ) {
        self.exit();
        // SAFETY: forwarded from our caller's signal-handler context.
        unsafe { self.record.chain_to_previous_action(signum, info, ucontext) }
    }

    fn exit(&mut self) {
        if let Some(phase) = self.phase.take() {
            self.record.phaser.exit(phase);
        }
    }
}

impl Drop for HandlerScope<'_> {
    fn drop(&mut self) {
        self.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
    use std::time::Duration;

    // Every test below manipulates the process-wide disposition of SIGUSR1,
    // so they serialize on this lock and assert relative counter deltas.
    static TEST_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

    const MODE_COUNT: usize = 0;
    const MODE_PARK: usize = 1;
    const MODE_RECORD_DATA: usize = 2;

    static MODE: AtomicUsize = AtomicUsize::new(MODE_COUNT);
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    static GATE: AtomicBool = AtomicBool::new(false);
    static HANDLER_RUNNING: AtomicBool = AtomicBool::new(false);
    static SEEN_DATA: AtomicPtr<libc::c_void> = AtomicPtr::new(std::ptr::null_mut());
    static PREV_COUNTER: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn test_handler(
        signum: libc::c_int,
        info: *mut libc::siginfo_t,
        ucontext: *mut libc::c_void,
    ) {
        let scope = SignalHandler::enter_handler(signum);
        if scope.is_enabled() {
            match MODE.load(SeqCst) {
                MODE_PARK => {
                    HANDLER_RUNNING.store(true, SeqCst);
                    while !GATE.load(SeqCst) {
                        std::thread::yield_now();
                    }
                    COUNTER.fetch_add(1, SeqCst);
                }
                MODE_RECORD_DATA => {
                    SEEN_DATA.store(scope.data(), SeqCst);
                }
                _ => {
                    COUNTER.fetch_add(1, SeqCst);
                }
            }
        }
        // SAFETY: called from the handler with the delivered arguments.
        unsafe { scope.chain_to_previous_handler(signum, info, ucontext) };
    }

    extern "C" fn previous_counting_handler(_signum: libc::c_int) {
        PREV_COUNTER.fetch_add(1, SeqCst);
    }

    fn fresh_record() -> &'static SignalHandler {
        MODE.store(MODE_COUNT, SeqCst);
        GATE.store(false, SeqCst);
        HANDLER_RUNNING.store(false, SeqCst);
        SignalHandler::initialize(Signal::SIGUSR1, test_handler)
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_max_signals() {
        assert!(MAX_SIGNALS as libc::c_int > libc::SIGRTMAX());
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_initialize_returns_the_same_record() {
        let _guard = TEST_LOCK.lock();
        let a = SignalHandler::initialize(Signal::SIGUSR1, test_handler);
        let b = SignalHandler::initialize(Signal::SIGUSR1, test_handler);
        assert!(std::ptr::eq(a, b));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_enabled_record_dispatches() {
        let _guard = TEST_LOCK.lock();
        let record = fresh_record();
        record.enable().unwrap();

        let before = COUNTER.load(SeqCst);
        signal::raise(Signal::SIGUSR1).unwrap();
        assert_eq!(COUNTER.load(SeqCst), before + 1);

        record.disable();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_disabled_record_swallows_the_signal() {
        let _guard = TEST_LOCK.lock();
        let record = fresh_record();
        record.enable().unwrap();
        record.disable();

        let before = COUNTER.load(SeqCst);
        signal::raise(Signal::SIGUSR1).unwrap();
        assert_eq!(COUNTER.load(SeqCst), before, "disabled scope must not run");
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_disable_waits_for_running_handler() {
        let _guard = TEST_LOCK.lock();
        let record = fresh_record();
        record.enable().unwrap();
        MODE.store(MODE_PARK, SeqCst);

        let parked = std::thread::spawn(|| {
            signal::raise(Signal::SIGUSR1).unwrap();
        });
        while !HANDLER_RUNNING.load(SeqCst) {
            std::thread::yield_now();
        }

        let disabler = std::thread::spawn(move || {
            record.disable();
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(
            !disabler.is_finished(),
            "disable returned while a handler was still inside its scope"
        );

        GATE.store(true, SeqCst);
        parked.join().unwrap();
        disabler.join().unwrap();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_scope_sees_published_data() {
        let _guard = TEST_LOCK.lock();
        let record = fresh_record();
        record.enable().unwrap();
        MODE.store(MODE_RECORD_DATA, SeqCst);

        let mut payload = 0u64;
        let payload_ptr = &mut payload as *mut u64 as *mut libc::c_void;
        record.set_data(payload_ptr);
        signal::raise(Signal::SIGUSR1).unwrap();
        assert_eq!(SEEN_DATA.load(SeqCst), payload_ptr);

        record.set_data(std::ptr::null_mut());
        record.disable();
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_uninstall_restores_the_previous_action() {
        let _guard = TEST_LOCK.lock();
        let record = fresh_record();
        // Start from a clean OS-level state, whatever earlier tests did.
        record.uninstall().unwrap();

        let previous = SigAction::new(
            SigHandler::Handler(previous_counting_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // SAFETY: installing a plain counting handler for the test signal.
        unsafe { signal::sigaction(Signal::SIGUSR1, &previous) }.unwrap();

        // Install on top of it: our handler runs and chains to it.
        record.enable().unwrap();
        let (ours, theirs) = (COUNTER.load(SeqCst), PREV_COUNTER.load(SeqCst));
        signal::raise(Signal::SIGUSR1).unwrap();
        assert_eq!(COUNTER.load(SeqCst), ours + 1);
        assert_eq!(PREV_COUNTER.load(SeqCst), theirs + 1);

        // Retired: only the restored action runs.
        record.uninstall().unwrap();
        signal::raise(Signal::SIGUSR1).unwrap();
        assert_eq!(COUNTER.load(SeqCst), ours + 1);
        assert_eq!(PREV_COUNTER.load(SeqCst), theirs + 2);

        // Revived: both run again.
        record.enable().unwrap();
        signal::raise(Signal::SIGUSR1).unwrap();
        assert_eq!(COUNTER.load(SeqCst), ours + 2);
        assert_eq!(PREV_COUNTER.load(SeqCst), theirs + 3);

        record.uninstall().unwrap();
    }
}
