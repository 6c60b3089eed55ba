// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracing context core: the span/segment data model, per-thread context
//! management, cross-process and cross-thread propagation, and the profile
//! status shared between a tracing context and the profiler watching it.

pub mod carrier;
pub mod correlation;
mod error;
pub mod ids;
pub mod manager;
pub mod profile_status;
pub mod sampling;
pub mod snapshot;
pub mod trace;
pub mod tracing_context;

pub use carrier::{ContextCarrier, Extractor, Injector};
pub use correlation::CorrelationContext;
pub use error::Error;
pub use ids::DistributedTraceId;
pub use manager::{ContextManager, NoopProfilingWatcher, ProfilingWatcher, SegmentReporter};
#[cfg(any(test, feature = "test-utils"))]
pub use manager::CollectingReporter;
pub use profile_status::{ProfileStatus, ProfileStatusContext};
pub use snapshot::ContextSnapshot;
pub use trace::{SegmentRef, SegmentRefType, Span, SpanKind, TraceSegment};
pub use tracing_context::{AsyncSpanHandle, SpanStopOutcome, TracingContext};

/// Milliseconds since the unix epoch
pub(crate) fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
