// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Thread profiling driven by tracing context lifecycle.
//!
//! A profiling task names an endpoint; contexts whose first span matches it
//! get a thread profiler claimed into a lock-free slot array, within a
//! parallelism budget and a total sampling budget. A background thread
//! promotes pending profilers, dumps the running ones and retires the ones
//! past their task duration.

mod error;
mod execution_context;
mod profile_thread;
mod sampler;
mod service;
mod snapshot;
mod task;
mod thread_profiler;
mod utils;

pub use error::ProfilingError;
pub use execution_context::ProfileTaskExecutionContext;
pub use sampler::{StackSampler, StackSamplerFactory};
#[cfg(any(test, feature = "test-utils"))]
pub use sampler::{CannedStackSampler, CannedStackSamplerFactory};
pub use service::ProfileTaskExecutionService;
pub use snapshot::{SnapshotReceiver, TracingThreadSnapshot};
#[cfg(any(test, feature = "test-utils"))]
pub use snapshot::CollectingSnapshotReceiver;
pub use task::ProfileTask;
pub use thread_profiler::ThreadProfiler;

/// Milliseconds since the unix epoch
pub(crate) fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
