// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end profiling through the tracing context lifecycle: a profile
//! task is activated, a matching context gets watched, the sampling thread
//! dumps it, and a continued context on another thread is dumped too.

use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use apm_agent::{meter::MeterRegistry, so11y::AgentSo11y, Config};
use apm_agent_context::{CollectingReporter, ContextManager, ProfileStatus, ProfilingWatcher};
use apm_agent_profiling::{
    ProfileTask, ProfileTaskExecutionService, SnapshotReceiver, StackSampler, StackSamplerFactory,
    TracingThreadSnapshot,
};

struct FixedStackSampler;

impl StackSampler for FixedStackSampler {
    fn capture(&self) -> Option<Vec<String>> {
        Some(vec!["handle_order".to_string(), "main".to_string()])
    }
}

struct FixedStackSamplerFactory;

impl StackSamplerFactory for FixedStackSamplerFactory {
    fn sampler_for_current_thread(&self) -> Box<dyn StackSampler> {
        Box::new(FixedStackSampler)
    }
}

#[derive(Default)]
struct RecordingReceiver {
    snapshots: Mutex<Vec<TracingThreadSnapshot>>,
}

impl RecordingReceiver {
    fn segment_ids(&self) -> Vec<String> {
        self.snapshots
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.trace_segment_id.clone())
            .collect()
    }

    fn count(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }
}

impl SnapshotReceiver for RecordingReceiver {
    fn accept(&self, snapshot: TracingThreadSnapshot) {
        self.snapshots.lock().unwrap().push(snapshot);
    }
}

fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn test_profiles_traced_endpoint_across_threads() {
    let config = Arc::new(Config::builder().build());
    let registry = MeterRegistry::new();
    let so11y = Arc::new(AgentSo11y::new(Arc::clone(&registry)).unwrap());
    let reporter = Arc::new(CollectingReporter::new());
    let receiver = Arc::new(RecordingReceiver::default());

    let service = Arc::new(ProfileTaskExecutionService::new(
        Arc::clone(&config),
        Arc::new(FixedStackSamplerFactory),
        Arc::clone(&receiver) as Arc<dyn SnapshotReceiver>,
    ));
    service
        .add_profile_task(ProfileTask {
            task_id: "task-42".to_string(),
            first_span_op_name: "/api/orders".to_string(),
            duration: Duration::from_secs(60),
            min_duration_threshold: Duration::ZERO,
            thread_dump_period: Duration::from_millis(10),
            max_sampling_count: 5,
            start_time_ms: 0,
        })
        .unwrap();

    let manager = Arc::new(ContextManager::new(
        Arc::clone(&config),
        Arc::clone(&reporter) as _,
        so11y,
        Arc::clone(&service) as Arc<dyn ProfilingWatcher>,
    ));

    let entry = manager.create_entry_span("/api/orders", None);
    assert!(entry >= 0);

    // The sampling thread promotes the context and starts dumping it
    assert!(wait_until(Duration::from_secs(5), || receiver.count() >= 2));

    let snapshot = manager.capture().unwrap();
    assert_eq!(snapshot.profile_status().get(), ProfileStatus::Profiling);

    // A continued context on another thread is dumped under its own segment
    let worker = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || {
            let local = manager.create_local_span("/api/orders/load");
            assert!(manager.continued(&snapshot));
            let segment_id = manager
                .capture()
                .map(|s| s.trace_segment_id().to_string())
                .unwrap();
            thread::sleep(Duration::from_millis(100));
            manager.stop_span(local);
            segment_id
        })
    };
    let sub_segment_id = worker.join().unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        receiver.segment_ids().iter().any(|id| id == &sub_segment_id)
    }));

    manager.stop_span(entry);
    service.shutdown();

    // Both segments were reported and the profiled one carries the snapshots
    let segments = reporter.take_segments();
    assert_eq!(segments.len(), 2);
    let entry_segment = segments
        .iter()
        .find(|s| s.trace_segment_id() != sub_segment_id)
        .unwrap();
    let ids = receiver.segment_ids();
    assert!(ids.iter().any(|id| id == entry_segment.trace_segment_id()));
}
