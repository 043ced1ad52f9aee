// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use parking_lot::Mutex;
use std::collections::HashSet;

/// Threads explicitly opted into wall-clock sampling.
///
/// Mutated only from normal thread context, never from a handler. The ticker
/// works off a snapshot taken each interval and the discovery step prunes
/// entries for threads that have exited, so a stale entry is harmless.
#[derive(Debug, Default)]
pub struct Whitelist {
    threads: Mutex<HashSet<i32>>,
}

impl Whitelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, tid: i32) {
        self.threads.lock().insert(tid);
    }

    pub fn remove(&self, tid: i32) {
        self.threads.lock().remove(&tid);
    }

    pub fn contains(&self, tid: i32) -> bool {
        self.threads.lock().contains(&tid)
    }

    pub fn snapshot(&self) -> HashSet<i32> {
        self.threads.lock().clone()
    }

    /// Drops every entry not present in `live`.
    pub fn prune(&self, live: &HashSet<i32>) {
        self.threads.lock().retain(|tid| live.contains(tid));
    }
}
