// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use apm_agent::{apm_error, apm_info, Config};
use apm_agent_context::{ProfileStatusContext, ProfilingWatcher};
use arc_swap::ArcSwapOption;

use crate::{
    error::ProfilingError,
    execution_context::ProfileTaskExecutionContext,
    sampler::StackSamplerFactory,
    snapshot::SnapshotReceiver,
    task::ProfileTask,
};

/// Runs profiling tasks one at a time. A new task replaces the current one;
/// plugging the service in as the context manager's [`ProfilingWatcher`]
/// wires profiling to the tracing context lifecycle.
pub struct ProfileTaskExecutionService {
    config: Arc<Config>,
    sampler_factory: Arc<dyn StackSamplerFactory>,
    receiver: Arc<dyn SnapshotReceiver>,
    current: ArcSwapOption<ProfileTaskExecutionContext>,
}

impl ProfileTaskExecutionService {
    pub fn new(
        config: Arc<Config>,
        sampler_factory: Arc<dyn StackSamplerFactory>,
        receiver: Arc<dyn SnapshotReceiver>,
    ) -> Self {
        ProfileTaskExecutionService {
            config,
            sampler_factory,
            receiver,
            current: ArcSwapOption::empty(),
        }
    }

    /// Validates and activates a profiling task, replacing the current one
    pub fn add_profile_task(&self, task: ProfileTask) -> Result<(), ProfilingError> {
        self.validate(&task)?;
        apm_info!(
            "activating profile task {} for endpoint {}",
            task.task_id,
            task.first_span_op_name
        );

        let context = Arc::new(ProfileTaskExecutionContext::new(
            task,
            Arc::clone(&self.sampler_factory),
            Arc::clone(&self.receiver),
            self.config.profile_max_parallel(),
            self.config.profile_max_accept_sub_parallel(),
        ));
        context.start_profiling();

        if let Some(previous) = self.current.swap(Some(context)) {
            self.stop_context(&previous);
        }
        Ok(())
    }

    /// Stops and drops the current task, if any
    pub fn stop_current_task(&self) {
        if let Some(previous) = self.current.swap(None) {
            self.stop_context(&previous);
        }
    }

    pub fn shutdown(&self) {
        self.stop_current_task();
    }

    fn stop_context(&self, context: &ProfileTaskExecutionContext) {
        if let Err(e) = context.stop_profiling() {
            apm_error!(
                "ProfileTaskExecutionService.stop_context: task {}: {}",
                context.task().task_id,
                e
            );
        }
    }

    fn validate(&self, task: &ProfileTask) -> Result<(), ProfilingError> {
        if task.first_span_op_name.is_empty() {
            return Err(ProfilingError::InvalidTask("empty endpoint name"));
        }
        if task.duration.is_zero() {
            return Err(ProfilingError::InvalidTask("zero duration"));
        }
        if task.duration > self.config.profile_max_duration() {
            return Err(ProfilingError::InvalidTask(
                "duration exceeds the configured maximum",
            ));
        }
        if task.thread_dump_period < self.config.profile_dump_period() {
            return Err(ProfilingError::InvalidTask(
                "thread dump period below the configured minimum",
            ));
        }
        if task.max_sampling_count <= 0 {
            return Err(ProfilingError::InvalidTask("non-positive sampling count"));
        }
        Ok(())
    }
}

impl Drop for ProfileTaskExecutionService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ProfilingWatcher for ProfileTaskExecutionService {
    fn on_context_create(
        &self,
        segment_id: &str,
        create_time_ms: u64,
        first_span_op: &str,
        status: &ProfileStatusContext,
    ) {
        if let Some(context) = self.current.load_full() {
            context.attempt_profiling(segment_id, create_time_ms, first_span_op, status);
        }
    }

    fn on_profiling_recheck(
        &self,
        segment_id: &str,
        create_time_ms: u64,
        first_span_op: &str,
        status: &ProfileStatusContext,
    ) {
        if status.is_being_watched() {
            return;
        }
        self.on_context_create(segment_id, create_time_ms, first_span_op, status);
    }

    fn on_continued(&self, segment_id: &str, status: &ProfileStatusContext) {
        if let Some(context) = self.current.load_full() {
            context.continue_profiling(segment_id, status);
        }
    }

    fn on_context_finish(&self, segment_id: &str, status: &ProfileStatusContext) {
        if !status.is_being_watched() {
            return;
        }
        if let Some(context) = self.current.load_full() {
            context.stop_tracing_profile(segment_id);
        }
    }
}
