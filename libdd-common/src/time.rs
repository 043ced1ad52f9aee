// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Current monotonic clock reading in nanoseconds.
///
/// Async-signal-safe: clock_gettime is a plain syscall on the platforms we
/// support, so this may be called from signal handlers.
pub fn monotonic_nanos() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid, writable timespec for the duration of the call.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}

/// Current monotonic clock reading in milliseconds.
pub fn monotonic_millis() -> i64 {
    monotonic_nanos() / 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_monotonic_nanos_is_monotonic() {
        let a = monotonic_nanos();
        let b = monotonic_nanos();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_monotonic_millis_tracks_sleep() {
        let before = monotonic_millis();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let after = monotonic_millis();
        assert!(after - before >= 15, "slept 20ms but clock moved {}ms", after - before);
    }
}
