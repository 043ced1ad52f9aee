// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use anyhow::Context;
use std::collections::HashSet;

/// Lists the kernel thread ids of every live thread in this process.
///
/// Reads `/proc/self/task`, so the result is a snapshot: threads may start or
/// exit while the caller is still looking at it.
pub fn live_thread_ids() -> anyhow::Result<HashSet<i32>> {
    thread_ids_in("/proc/self/task")
}

fn thread_ids_in(task_dir: &str) -> anyhow::Result<HashSet<i32>> {
    let entries = std::fs::read_dir(task_dir)
        .with_context(|| format!("Failed to read {task_dir}"))?;
    let mut tids = HashSet::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to enumerate {task_dir}"))?;
        let name = entry.file_name();
        // Anything non-numeric in the task dir is not a thread.
        if let Ok(tid) = name.to_string_lossy().parse::<i32>() {
            tids.insert(tid);
        }
    }
    Ok(tids)
}
