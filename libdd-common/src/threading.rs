// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Returns the kernel identifier for the current OS thread.
///
/// This is the id the kernel uses for thread-targeted signals and per-thread
/// clocks, not the pthread handle.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn get_current_thread_id() -> i32 {
    // SAFETY: syscall(SYS_gettid) has no preconditions for current thread.
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("libdd_common::threading::get_current_thread_id is unsupported on this platform");

/// Returns the identifier of the current process.
pub fn get_process_id() -> i32 {
    // SAFETY: getpid has no preconditions.
    unsafe { libc::getpid() }
}
