// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::now_ms;

/// Head-based segment sampler with an `n per 3 seconds` budget.
///
/// The window rolls over lazily on the sampling path, there is no background
/// reset thread. A non-positive budget samples everything.
#[derive(Debug)]
pub struct SamplingService {
    n_per_3_secs: i32,
    window: AtomicU64,
    count: AtomicUsize,
}

const WINDOW_MS: u64 = 3_000;

impl SamplingService {
    pub fn new(n_per_3_secs: i32) -> Self {
        SamplingService {
            n_per_3_secs,
            window: AtomicU64::new(0),
            count: AtomicUsize::new(0),
        }
    }

    /// Consumes one unit of the sampling budget. Returns whether the new
    /// segment should be recorded.
    pub fn try_sample(&self) -> bool {
        if self.n_per_3_secs <= 0 {
            return true;
        }
        self.roll_window();
        self.count.fetch_add(1, Ordering::Relaxed) < self.n_per_3_secs as usize
    }

    fn roll_window(&self) {
        let current = now_ms() / WINDOW_MS;
        let seen = self.window.load(Ordering::Relaxed);
        if seen != current
            && self
                .window
                .compare_exchange(seen, current, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            // Near the boundary another thread may sneak an increment in
            // between, which slightly under-counts the fresh window. The
            // budget is approximate by nature.
            self.count.store(0, Ordering::Relaxed);
        }
    }
}
