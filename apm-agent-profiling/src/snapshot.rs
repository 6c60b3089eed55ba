// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// One thread dump of one profiled segment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingThreadSnapshot {
    pub task_id: String,
    pub trace_segment_id: String,
    /// Dump sequence within the segment, starting at 0
    pub sequence: i32,
    pub time_ms: u64,
    /// Innermost frame first
    pub stack: Vec<String>,
}

/// Receives thread snapshots. The reporting pipeline behind it is not this
/// crate's concern.
pub trait SnapshotReceiver: Send + Sync {
    fn accept(&self, snapshot: TracingThreadSnapshot);
}

/// Collects snapshots in memory, for tests
#[cfg(any(test, feature = "test-utils"))]
#[derive(Default)]
pub struct CollectingSnapshotReceiver {
    snapshots: std::sync::Mutex<Vec<TracingThreadSnapshot>>,
}

#[cfg(any(test, feature = "test-utils"))]
impl CollectingSnapshotReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_snapshots(&self) -> Vec<TracingThreadSnapshot> {
        std::mem::take(&mut self.snapshots.lock().unwrap())
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SnapshotReceiver for CollectingSnapshotReceiver {
    fn accept(&self, snapshot: TracingThreadSnapshot) {
        self.snapshots.lock().unwrap().push(snapshot);
    }
}
