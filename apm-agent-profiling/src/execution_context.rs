// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::{
    ptr,
    sync::{
        atomic::{AtomicI32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use apm_agent::apm_warn;
use apm_agent_context::{ProfileStatus, ProfileStatusContext};
use arc_swap::ArcSwapOption;

use crate::{
    error::ProfilingError,
    profile_thread,
    sampler::StackSamplerFactory,
    snapshot::SnapshotReceiver,
    task::ProfileTask,
    thread_profiler::ThreadProfiler,
    utils::{Signal, WorkerHandle},
};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime state of one profiling task: the profiler slot array, the
/// parallelism and sampling budgets and the sampling thread.
///
/// Slots are claimed and released lock free so the application threads
/// attaching and detaching profilers never contend on a lock with the
/// sampling thread.
pub struct ProfileTaskExecutionContext {
    task: Arc<ProfileTask>,
    sampler_factory: Arc<dyn StackSamplerFactory>,
    receiver: Arc<dyn SnapshotReceiver>,
    max_parallel: usize,
    /// Contexts currently profiled through their first segment
    current_endpoint_count: AtomicUsize,
    /// Profilers ever promoted to `Profiling`, counted against the task's
    /// max sampling count
    total_started_count: AtomicI32,
    slots: Vec<ArcSwapOption<ThreadProfiler>>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl ProfileTaskExecutionContext {
    pub(crate) fn new(
        task: ProfileTask,
        sampler_factory: Arc<dyn StackSamplerFactory>,
        receiver: Arc<dyn SnapshotReceiver>,
        max_parallel: usize,
        max_accept_sub_parallel: usize,
    ) -> Self {
        // One slot per first-segment profiler plus its continued sub threads
        let slot_count = max_parallel * (max_accept_sub_parallel + 1);
        ProfileTaskExecutionContext {
            task: Arc::new(task),
            sampler_factory,
            receiver,
            max_parallel,
            current_endpoint_count: AtomicUsize::new(0),
            total_started_count: AtomicI32::new(0),
            slots: (0..slot_count).map(|_| ArcSwapOption::empty()).collect(),
            worker: Mutex::new(None),
        }
    }

    pub fn task(&self) -> &Arc<ProfileTask> {
        &self.task
    }

    /// Tries to attach a profiler to a freshly created tracing context.
    /// Returns the resulting profile status, `None` when the context was not
    /// selected.
    pub fn attempt_profiling(
        &self,
        segment_id: &str,
        create_time_ms: u64,
        first_span_op: &str,
        status: &ProfileStatusContext,
    ) -> ProfileStatus {
        if self.current_endpoint_count.load(Ordering::SeqCst) >= self.max_parallel {
            return ProfileStatus::None;
        }
        if first_span_op != self.task.first_span_op_name {
            return ProfileStatus::None;
        }
        if self.total_started_count.load(Ordering::SeqCst) > self.task.max_sampling_count {
            return ProfileStatus::None;
        }

        let current = self.current_endpoint_count.load(Ordering::SeqCst);
        if current >= self.max_parallel
            || self
                .current_endpoint_count
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            // Lost the race for a parallelism ticket
            return ProfileStatus::None;
        }

        status.update_pending(create_time_ms);
        let profiler = Arc::new(ThreadProfiler::new(
            segment_id.to_string(),
            status.clone(),
            self.sampler_factory.sampler_for_current_thread(),
            Arc::clone(&self.task),
        ));
        if !self.claim_slot(profiler) {
            status.update_status(ProfileStatus::None);
            self.current_endpoint_count.fetch_sub(1, Ordering::SeqCst);
            return ProfileStatus::None;
        }
        ProfileStatus::Pending
    }

    /// Attaches a profiler to a context continued from an already profiled
    /// segment. The sub-thread budget was already charged on the status
    /// handle; only a slot is needed here.
    pub fn continue_profiling(&self, segment_id: &str, status: &ProfileStatusContext) -> bool {
        let profiler = Arc::new(ThreadProfiler::new(
            segment_id.to_string(),
            status.clone(),
            self.sampler_factory.sampler_for_current_thread(),
            Arc::clone(&self.task),
        ));
        if !self.claim_slot(profiler) {
            status.update_status(ProfileStatus::None);
            return false;
        }
        true
    }

    /// Releases the profiler watching `segment_id`, if any. The parallelism
    /// ticket is only returned for first-segment profilers; continued sub
    /// threads never held one. The sampling thread and the application
    /// thread can both release the same slot, so the slot is taken by CAS
    /// and only the winner returns the ticket.
    pub fn stop_tracing_profile(&self, segment_id: &str) {
        for slot in &self.slots {
            let guard = slot.load();
            let Some(profiler) = guard.as_ref() else {
                continue;
            };
            if !profiler.matches(segment_id) {
                continue;
            }
            let current = Arc::as_ptr(profiler);
            let previous = slot.compare_and_swap(current, None);
            if previous.as_ref().map(Arc::as_ptr) != Some(current) {
                // The other releaser already took this slot
                return;
            }
            profiler.stop_profiling();
            if profiler.status().is_from_first_segment() {
                self.current_endpoint_count.fetch_sub(1, Ordering::SeqCst);
            }
            return;
        }
    }

    /// Charges one start against the task's max sampling count. Called by
    /// the sampling thread right before promoting a pending profiler.
    pub(crate) fn is_start_profileable(&self) -> bool {
        self.total_started_count.fetch_add(1, Ordering::SeqCst) + 1
            <= self.task.max_sampling_count
    }

    pub(crate) fn slots(&self) -> &[ArcSwapOption<ThreadProfiler>] {
        &self.slots
    }

    pub(crate) fn receiver(&self) -> &Arc<dyn SnapshotReceiver> {
        &self.receiver
    }

    fn claim_slot(&self, profiler: Arc<ThreadProfiler>) -> bool {
        for slot in &self.slots {
            let previous =
                slot.compare_and_swap(ptr::null::<ThreadProfiler>(), Some(Arc::clone(&profiler)));
            if previous.is_none() {
                return true;
            }
        }
        apm_warn!(
            "ProfileTaskExecutionContext.claim_slot: no free profiler slot for segment {}",
            profiler.segment_id()
        );
        false
    }

    /// Spawns the sampling thread for this context
    pub(crate) fn start_profiling(self: &Arc<Self>) {
        let stop = Signal::new();
        let finished = Signal::new();
        let handle = {
            let context = Arc::clone(self);
            let stop = Arc::clone(&stop);
            let finished = Arc::clone(&finished);
            thread::Builder::new()
                .name("apm-profiling".to_string())
                .spawn(move || profile_thread::run(context, stop, finished))
        };
        match handle {
            Ok(handle) => {
                if let Ok(mut worker) = self.worker.lock() {
                    *worker = Some(WorkerHandle::new(stop, finished, handle));
                }
            }
            Err(e) => {
                apm_warn!(
                    "ProfileTaskExecutionContext.start_profiling: failed to spawn sampling thread: {}",
                    e
                );
            }
        }
    }

    /// Stops the sampling thread and releases every remaining profiler
    pub(crate) fn stop_profiling(&self) -> Result<(), ProfilingError> {
        let worker = self
            .worker
            .lock()
            .map_err(|_| ProfilingError::WorkerStop("worker mutex poisoned".to_string()))?
            .take();
        if let Some(worker) = worker {
            worker.stop_and_join(STOP_TIMEOUT)?;
        }
        for slot in &self.slots {
            if let Some(profiler) = slot.swap(None) {
                profiler.stop_profiling();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::sampler::CannedStackSamplerFactory;
    use crate::snapshot::CollectingSnapshotReceiver;

    use super::*;

    fn test_task(max_sampling_count: i32) -> ProfileTask {
        ProfileTask {
            task_id: "t-1".to_string(),
            first_span_op_name: "/api/orders".to_string(),
            duration: Duration::from_secs(60),
            min_duration_threshold: Duration::ZERO,
            thread_dump_period: Duration::from_millis(10),
            max_sampling_count,
            start_time_ms: 0,
        }
    }

    fn test_context(max_parallel: usize, max_sub: usize) -> ProfileTaskExecutionContext {
        ProfileTaskExecutionContext::new(
            test_task(5),
            Arc::new(CannedStackSamplerFactory {
                frames: vec!["frame".to_string()],
            }),
            Arc::new(CollectingSnapshotReceiver::new()),
            max_parallel,
            max_sub,
        )
    }

    #[test]
    fn test_parallelism_budget_caps_accepted_contexts() {
        let context = test_context(2, 0);

        let mut accepted = 0;
        for i in 0..3 {
            let status = ProfileStatusContext::none();
            let got = context.attempt_profiling(&format!("seg-{i}"), 100, "/api/orders", &status);
            if got == ProfileStatus::Pending {
                assert!(status.is_being_watched());
                accepted += 1;
            } else {
                assert!(!status.is_being_watched());
            }
        }
        assert_eq!(accepted, 2);
    }

    #[test]
    fn test_endpoint_name_must_match() {
        let context = test_context(2, 0);
        let status = ProfileStatusContext::none();

        let got = context.attempt_profiling("seg-1", 100, "/api/other", &status);

        assert_eq!(got, ProfileStatus::None);
        assert!(!status.is_being_watched());
    }

    #[test]
    fn test_stop_releases_the_parallelism_ticket() {
        let context = test_context(1, 0);

        let first = ProfileStatusContext::none();
        assert_eq!(
            context.attempt_profiling("seg-1", 100, "/api/orders", &first),
            ProfileStatus::Pending
        );

        // Budget exhausted while seg-1 is profiled
        let second = ProfileStatusContext::none();
        assert_eq!(
            context.attempt_profiling("seg-2", 100, "/api/orders", &second),
            ProfileStatus::None
        );

        context.stop_tracing_profile("seg-1");
        assert!(!first.is_being_watched());

        let third = ProfileStatusContext::none();
        assert_eq!(
            context.attempt_profiling("seg-3", 100, "/api/orders", &third),
            ProfileStatus::Pending
        );
    }

    #[test]
    fn test_sampling_count_budget() {
        let context = test_context(10, 0);

        for _ in 0..5 {
            assert!(context.is_start_profileable());
        }
        assert!(!context.is_start_profileable());
        assert!(!context.is_start_profileable());

        // A spent budget also rejects fresh attempts outright
        let status = ProfileStatusContext::none();
        assert_eq!(
            context.attempt_profiling("seg-late", 100, "/api/orders", &status),
            ProfileStatus::None
        );
        assert!(!status.is_being_watched());
    }

    #[test]
    fn test_continued_profiler_does_not_hold_a_ticket() {
        let context = test_context(1, 2);

        let parent = ProfileStatusContext::none();
        assert_eq!(
            context.attempt_profiling("seg-1", 100, "/api/orders", &parent),
            ProfileStatus::Pending
        );

        let child = ProfileStatusContext::none();
        assert!(child.continued(&parent.captured(), 2));
        assert!(context.continue_profiling("seg-2", &child));

        // The sub thread keeps the ticket count at 1; stopping it does not
        // release the parent's ticket.
        context.stop_tracing_profile("seg-2");
        let next = ProfileStatusContext::none();
        assert_eq!(
            context.attempt_profiling("seg-3", 100, "/api/orders", &next),
            ProfileStatus::None
        );

        context.stop_tracing_profile("seg-1");
        let after = ProfileStatusContext::none();
        assert_eq!(
            context.attempt_profiling("seg-4", 100, "/api/orders", &after),
            ProfileStatus::Pending
        );
    }

    #[test]
    fn test_racing_releases_return_the_ticket_exactly_once() {
        use std::sync::Barrier;

        let context = Arc::new(test_context(1, 0));
        let rounds = 300;
        let barrier = Arc::new(Barrier::new(3));

        // Two releasers racing over the same slot, like the sampling thread
        // retiring a profiler while the application thread finishes the
        // context
        let releasers: Vec<_> = (0..2)
            .map(|_| {
                let context = Arc::clone(&context);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    for _ in 0..rounds {
                        barrier.wait();
                        context.stop_tracing_profile("seg-race");
                        barrier.wait();
                    }
                })
            })
            .collect();

        for _ in 0..rounds {
            let status = ProfileStatusContext::none();
            // A lost or double-returned ticket would make this attempt fail
            assert_eq!(
                context.attempt_profiling("seg-race", 100, "/api/orders", &status),
                ProfileStatus::Pending
            );
            barrier.wait();
            barrier.wait();
            assert!(!status.is_being_watched());
        }
        for releaser in releasers {
            releaser.join().unwrap();
        }
    }

    #[test]
    fn test_slot_exhaustion_rolls_the_attempt_back() {
        // One first-segment slot and no sub-thread slots
        let context = test_context(1, 0);

        let parent = ProfileStatusContext::none();
        assert_eq!(
            context.attempt_profiling("seg-1", 100, "/api/orders", &parent),
            ProfileStatus::Pending
        );

        let child = ProfileStatusContext::none();
        child.continued(&parent.captured(), 1);
        assert!(!context.continue_profiling("seg-2", &child));
        assert!(!child.is_being_watched());
    }
}
