// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use crate::{
    profile_status::ProfileStatusContext, tracing_context::TracingContext, CorrelationContext,
    DistributedTraceId,
};

/// A read-only capture of a tracing context, taken on one thread so the
/// trace can be continued on another.
///
/// Snapshots are immutable: the originating context keeps mutating after the
/// capture without affecting what was captured. The profile status inside is
/// a detached copy that shares only the trace-wide sub-thread budget counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    trace_segment_id: String,
    span_id: i32,
    trace_id: DistributedTraceId,
    parent_endpoint: String,
    correlation: CorrelationContext,
    profile_status: ProfileStatusContext,
}

impl ContextSnapshot {
    pub(crate) fn new(
        trace_segment_id: String,
        span_id: i32,
        trace_id: DistributedTraceId,
        parent_endpoint: String,
        correlation: CorrelationContext,
        profile_status: ProfileStatusContext,
    ) -> Self {
        ContextSnapshot {
            trace_segment_id,
            span_id,
            trace_id,
            parent_endpoint,
            correlation,
            profile_status,
        }
    }

    pub fn trace_segment_id(&self) -> &str {
        &self.trace_segment_id
    }

    pub fn span_id(&self) -> i32 {
        self.span_id
    }

    pub fn trace_id(&self) -> &DistributedTraceId {
        &self.trace_id
    }

    pub fn parent_endpoint(&self) -> &str {
        &self.parent_endpoint
    }

    pub fn correlation(&self) -> &CorrelationContext {
        &self.correlation
    }

    pub fn profile_status(&self) -> &ProfileStatusContext {
        &self.profile_status
    }

    /// A snapshot is only worth continuing when it points at a real span of
    /// a real segment. Snapshots of ignored contexts are invalid.
    pub fn is_valid(&self) -> bool {
        self.span_id >= 0 && !self.trace_segment_id.is_empty() && !self.trace_id.is_empty()
    }

    /// Whether the snapshot was taken from the given context; continuing a
    /// context into itself is a no-op.
    pub fn is_from_current(&self, context: &TracingContext) -> bool {
        self.trace_segment_id == context.trace_segment_id()
    }
}
