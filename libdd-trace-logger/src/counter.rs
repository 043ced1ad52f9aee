// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, OnceLock};

/// Hands out monotonically increasing entry ids.
///
/// Clones share the underlying sequence, so ids stay unique and orderable
/// across every logger holding a clone. Ids start at 1; 0 is reserved to mean
/// "no entry".
#[derive(Debug, Clone)]
pub struct EntryIdCounter {
    next: Arc<AtomicI32>,
}

impl EntryIdCounter {
    /// A fresh sequence, isolated from every other counter.
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicI32::new(1)),
        }
    }

    /// The process-wide sequence shared by default-constructed loggers.
    pub fn global() -> Self {
        static GLOBAL: OnceLock<EntryIdCounter> = OnceLock::new();
        GLOBAL.get_or_init(EntryIdCounter::new).clone()
    }

    /// Claims and returns the next id.
    pub fn next_id(&self) -> i32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for EntryIdCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let counter = EntryIdCounter::new();
        assert_eq!(counter.next_id(), 1);
        assert_eq!(counter.next_id(), 2);
        assert_eq!(counter.next_id(), 3);
    }

    #[test]
    fn test_clones_share_the_sequence() {
        let counter = EntryIdCounter::new();
        let clone = counter.clone();
        assert_eq!(counter.next_id(), 1);
        assert_eq!(clone.next_id(), 2);
        assert_eq!(counter.next_id(), 3);
    }

    #[test]
    fn test_global_hands_out_fresh_ids_to_every_handle() {
        let a = EntryIdCounter::global().next_id();
        let b = EntryIdCounter::global().next_id();
        assert!(b > a);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_concurrent_claims_never_collide() {
        let counter = EntryIdCounter::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                std::thread::spawn(move || (0..100).map(|_| counter.next_id()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "id {id} handed out twice");
            }
        }
        assert_eq!(seen.len(), 800);
    }
}
