// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use crate::{
    carrier::ContextCarrier, ids, now_ms, snapshot::ContextSnapshot, trace::Span,
    DistributedTraceId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentRefType {
    /// The parent segment ran in another process; the ref came in through a
    /// carrier.
    CrossProcess,
    /// The parent segment ran on another thread of this process; the ref came
    /// from a context snapshot.
    CrossThread,
}

/// A pointer from one trace segment to the parent segment that caused it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRef {
    ref_type: SegmentRefType,
    trace_id: DistributedTraceId,
    trace_segment_id: String,
    span_id: i32,
    parent_service: String,
    parent_service_instance: String,
    parent_endpoint: String,
    network_address_used_at_peer: Option<String>,
}

impl SegmentRef {
    /// Builds a cross process ref from an extracted carrier. Returns None
    /// when the carrier has not been populated by a valid context header.
    pub fn from_carrier(carrier: &ContextCarrier) -> Option<Self> {
        if !carrier.is_valid() {
            return None;
        }
        Some(SegmentRef {
            ref_type: SegmentRefType::CrossProcess,
            trace_id: carrier.trace_id().clone(),
            trace_segment_id: carrier.trace_segment_id().to_string(),
            span_id: carrier.span_id(),
            parent_service: carrier.parent_service().to_string(),
            parent_service_instance: carrier.parent_service_instance().to_string(),
            parent_endpoint: carrier.parent_endpoint().to_string(),
            network_address_used_at_peer: Some(carrier.address_used_at_client().to_string()),
        })
    }

    /// Builds a cross thread ref from a snapshot taken in this process.
    /// Service identity comes from the local configuration since both
    /// segments belong to the same instance.
    pub fn from_snapshot(snapshot: &ContextSnapshot, service: &str, instance: &str) -> Self {
        SegmentRef {
            ref_type: SegmentRefType::CrossThread,
            trace_id: snapshot.trace_id().clone(),
            trace_segment_id: snapshot.trace_segment_id().to_string(),
            span_id: snapshot.span_id(),
            parent_service: service.to_string(),
            parent_service_instance: instance.to_string(),
            parent_endpoint: snapshot.parent_endpoint().to_string(),
            network_address_used_at_peer: None,
        }
    }

    pub fn ref_type(&self) -> SegmentRefType {
        self.ref_type
    }

    pub fn trace_id(&self) -> &DistributedTraceId {
        &self.trace_id
    }

    pub fn trace_segment_id(&self) -> &str {
        &self.trace_segment_id
    }

    pub fn span_id(&self) -> i32 {
        self.span_id
    }

    pub fn parent_service(&self) -> &str {
        &self.parent_service
    }

    pub fn parent_service_instance(&self) -> &str {
        &self.parent_service_instance
    }

    pub fn parent_endpoint(&self) -> &str {
        &self.parent_endpoint
    }

    pub fn network_address_used_at_peer(&self) -> Option<&str> {
        self.network_address_used_at_peer.as_deref()
    }
}

// Two refs are the same parent pointer when they point at the same span of
// the same segment, whatever the service tagging says.
impl PartialEq for SegmentRef {
    fn eq(&self, other: &Self) -> bool {
        self.trace_segment_id == other.trace_segment_id && self.span_id == other.span_id
    }
}

/// All spans of one thread of execution, reported as a unit once the last
/// span stops
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSegment {
    trace_segment_id: String,
    trace_id: DistributedTraceId,
    refs: Vec<SegmentRef>,
    spans: Vec<Span>,
    create_time_ms: u64,
    is_size_limited: bool,
    #[serde(skip)]
    related: bool,
}

impl TraceSegment {
    pub(crate) fn new() -> Self {
        TraceSegment {
            trace_segment_id: ids::new_global_id(),
            trace_id: DistributedTraceId::generate(),
            refs: Vec::new(),
            spans: Vec::new(),
            create_time_ms: now_ms(),
            is_size_limited: false,
            related: false,
        }
    }

    /// Placeholder left behind once the real segment has been handed to the
    /// reporter
    pub(crate) fn drained() -> Self {
        TraceSegment {
            trace_segment_id: String::new(),
            trace_id: DistributedTraceId::from(""),
            refs: Vec::new(),
            spans: Vec::new(),
            create_time_ms: 0,
            is_size_limited: false,
            related: true,
        }
    }

    pub fn trace_segment_id(&self) -> &str {
        &self.trace_segment_id
    }

    pub fn trace_id(&self) -> &DistributedTraceId {
        &self.trace_id
    }

    pub fn refs(&self) -> &[SegmentRef] {
        &self.refs
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn create_time_ms(&self) -> u64 {
        self.create_time_ms
    }

    pub fn is_size_limited(&self) -> bool {
        self.is_size_limited
    }

    /// Adopts a trace id coming from a parent segment. The first relation
    /// wins; the self-generated id is only used when the segment turns out
    /// to be the root of the trace.
    pub(crate) fn relate(&mut self, trace_id: DistributedTraceId) {
        if !self.related {
            self.trace_id = trace_id;
            self.related = true;
        }
    }

    pub(crate) fn add_ref(&mut self, segment_ref: SegmentRef) {
        if !self.refs.contains(&segment_ref) {
            self.refs.push(segment_ref);
        }
    }

    /// Stores a completed span
    pub(crate) fn archive(&mut self, span: Span) {
        self.spans.push(span);
    }

    pub(crate) fn mark_size_limited(&mut self) {
        self.is_size_limited = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::SpanKind;

    fn some_ref(segment_id: &str, span_id: i32, service: &str) -> SegmentRef {
        SegmentRef {
            ref_type: SegmentRefType::CrossThread,
            trace_id: DistributedTraceId::from("t1"),
            trace_segment_id: segment_id.to_string(),
            span_id,
            parent_service: service.to_string(),
            parent_service_instance: "i".to_string(),
            parent_endpoint: "/e".to_string(),
            network_address_used_at_peer: None,
        }
    }

    #[test]
    fn test_ref_equality_ignores_service_tagging() {
        assert_eq!(some_ref("seg", 1, "a"), some_ref("seg", 1, "b"));
        assert_ne!(some_ref("seg", 1, "a"), some_ref("seg", 2, "a"));
        assert_ne!(some_ref("seg", 1, "a"), some_ref("other", 1, "a"));
    }

    #[test]
    fn test_first_relation_wins() {
        let mut segment = TraceSegment::new();
        segment.relate(DistributedTraceId::from("first"));
        segment.relate(DistributedTraceId::from("second"));
        assert_eq!(segment.trace_id().as_str(), "first");
    }

    #[test]
    fn test_duplicate_refs_are_dropped() {
        let mut segment = TraceSegment::new();
        segment.add_ref(some_ref("seg", 1, "a"));
        segment.add_ref(some_ref("seg", 1, "b"));
        assert_eq!(segment.refs().len(), 1);
    }

    #[test]
    fn test_archive_keeps_spans_in_finish_order() {
        let mut segment = TraceSegment::new();
        segment.archive(Span::new(1, 0, "child", SpanKind::Local));
        segment.archive(Span::new(0, -1, "root", SpanKind::Entry));
        assert_eq!(segment.spans()[0].span_id(), 1);
        assert_eq!(segment.spans()[1].span_id(), 0);
    }
}
