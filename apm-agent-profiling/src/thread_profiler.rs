// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::{
    atomic::{AtomicI32, AtomicU64, Ordering},
    Arc,
};

use apm_agent_context::{ProfileStatus, ProfileStatusContext};

use crate::{
    execution_context::ProfileTaskExecutionContext,
    sampler::StackSampler,
    snapshot::TracingThreadSnapshot,
    task::ProfileTask,
};

/// Watches one tracing context on behalf of one profiling task.
///
/// The status handle is shared with the context; promoting it to `Profiling`
/// here is observed by the application thread and vice versa.
pub struct ThreadProfiler {
    segment_id: String,
    status: ProfileStatusContext,
    sampler: Box<dyn StackSampler>,
    task: Arc<ProfileTask>,
    sequence: AtomicI32,
    profiling_start_time_ms: AtomicU64,
}

impl ThreadProfiler {
    pub(crate) fn new(
        segment_id: String,
        status: ProfileStatusContext,
        sampler: Box<dyn StackSampler>,
        task: Arc<ProfileTask>,
    ) -> Self {
        ThreadProfiler {
            segment_id,
            status,
            sampler,
            task,
            sequence: AtomicI32::new(0),
            profiling_start_time_ms: AtomicU64::new(0),
        }
    }

    pub fn segment_id(&self) -> &str {
        &self.segment_id
    }

    pub fn status(&self) -> &ProfileStatusContext {
        &self.status
    }

    pub(crate) fn matches(&self, segment_id: &str) -> bool {
        self.segment_id == segment_id
    }

    /// A pending profiler starts dumping only once the segment lived past
    /// the task's minimum duration threshold.
    pub(crate) fn ready_to_start(&self, now_ms: u64) -> bool {
        self.status.get() == ProfileStatus::Pending
            && now_ms.saturating_sub(self.status.first_segment_create_time_ms())
                >= self.task.min_duration_threshold.as_millis() as u64
    }

    /// Promotes a pending profiler whose segment lived long enough, charging
    /// the task's sampling budget. A profiler that loses the budget race is
    /// retired for good.
    pub(crate) fn start_profiling_if_need(
        &self,
        context: &ProfileTaskExecutionContext,
        now_ms: u64,
    ) {
        if !self.ready_to_start(now_ms) {
            return;
        }
        if context.is_start_profileable() {
            self.start_profiling(now_ms);
        } else {
            context.stop_tracing_profile(&self.segment_id);
        }
    }

    pub(crate) fn start_profiling(&self, now_ms: u64) {
        self.profiling_start_time_ms.store(now_ms, Ordering::SeqCst);
        self.status.update_status(ProfileStatus::Profiling);
    }

    pub(crate) fn stop_profiling(&self) {
        self.status.update_status(ProfileStatus::None);
    }

    /// A profiler runs at most as long as its task duration
    pub(crate) fn is_over_max_profiling_time(&self, now_ms: u64) -> bool {
        let started = self.profiling_start_time_ms.load(Ordering::SeqCst);
        started > 0 && now_ms.saturating_sub(started) >= self.task.duration.as_millis() as u64
    }

    pub(crate) fn build_snapshot(&self, now_ms: u64) -> Option<TracingThreadSnapshot> {
        let stack = self.sampler.capture()?;
        Some(TracingThreadSnapshot {
            task_id: self.task.task_id.clone(),
            trace_segment_id: self.segment_id.clone(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            time_ms: now_ms,
            stack,
        })
    }
}
