// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use apm_agent::apm_debug;
use apm_agent_context::ProfileStatus;

use crate::{
    execution_context::ProfileTaskExecutionContext,
    now_ms,
    utils::Signal,
};

/// Body of the sampling thread. Wakes every thread dump period, promotes
/// pending profilers whose segment lived long enough, dumps the running ones
/// and retires the ones past the task duration. Exits promptly when the stop
/// signal is raised.
pub(crate) fn run(
    context: Arc<ProfileTaskExecutionContext>,
    stop: Arc<Signal>,
    finished: Arc<Signal>,
) {
    apm_debug!(
        "profile thread started for task {}",
        context.task().task_id
    );
    let period = context.task().thread_dump_period;
    while !stop.wait_raised(period) {
        tick(&context);
    }
    apm_debug!(
        "profile thread stopped for task {}",
        context.task().task_id
    );
    finished.raise();
}

fn tick(context: &ProfileTaskExecutionContext) {
    let now = now_ms();
    for slot in context.slots() {
        let guard = slot.load();
        let Some(profiler) = guard.as_ref() else {
            continue;
        };
        match profiler.status().get() {
            ProfileStatus::Pending => profiler.start_profiling_if_need(context, now),
            ProfileStatus::Profiling => {
                if profiler.is_over_max_profiling_time(now) {
                    context.stop_tracing_profile(profiler.segment_id());
                } else if let Some(snapshot) = profiler.build_snapshot(now) {
                    context.receiver().accept(snapshot);
                }
            }
            ProfileStatus::None => {}
        }
    }
}
