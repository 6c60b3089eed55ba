// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::{now_ms, trace::SegmentRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanKind {
    /// A service provider side span, e.g. an inbound HTTP request
    Entry,
    /// A client side span pointing at a remote peer
    Exit,
    /// Anything in between
    Local,
}

/// A timestamped event attached to a span
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub time_ms: u64,
    pub data: Vec<(String, String)>,
}

/// One operation inside a trace segment.
///
/// Spans are stack based: re-entering the same entry span or calling the same
/// peer through nested layers bumps an internal depth counter instead of
/// creating a new span, so instrumentation layered over itself still produces
/// one span per logical operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    span_id: i32,
    parent_span_id: i32,
    operation_name: String,
    peer: Option<String>,
    kind: SpanKind,
    component_id: u32,
    start_time_ms: u64,
    end_time_ms: u64,
    tags: Vec<(Cow<'static, str>, String)>,
    logs: Vec<LogEvent>,
    is_error: bool,
    skip_analysis: bool,
    refs: Vec<SegmentRef>,
    is_noop: bool,
    #[serde(skip)]
    depth: u32,
    #[serde(skip)]
    prepared_for_async: bool,
}

impl Span {
    pub(crate) fn new(span_id: i32, parent_span_id: i32, operation_name: &str, kind: SpanKind) -> Self {
        Span {
            span_id,
            parent_span_id,
            operation_name: operation_name.to_string(),
            peer: None,
            kind,
            component_id: 0,
            start_time_ms: now_ms(),
            end_time_ms: 0,
            tags: Vec::new(),
            logs: Vec::new(),
            is_error: false,
            skip_analysis: false,
            refs: Vec::new(),
            is_noop: false,
            depth: 1,
            prepared_for_async: false,
        }
    }

    /// A placeholder span created past the per-segment span limit. It keeps
    /// the stack discipline intact and its kind, but records nothing. A noop
    /// exit span still carries its peer so the context can be injected
    /// through it.
    pub(crate) fn noop(span_id: i32, kind: SpanKind) -> Self {
        let mut span = Span::new(span_id, -1, "", kind);
        span.is_noop = true;
        span
    }

    pub fn span_id(&self) -> i32 {
        self.span_id
    }

    pub fn parent_span_id(&self) -> i32 {
        self.parent_span_id
    }

    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    pub fn kind(&self) -> SpanKind {
        self.kind
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub fn component_id(&self) -> u32 {
        self.component_id
    }

    pub fn start_time_ms(&self) -> u64 {
        self.start_time_ms
    }

    pub fn end_time_ms(&self) -> u64 {
        self.end_time_ms
    }

    pub fn tags(&self) -> &[(Cow<'static, str>, String)] {
        &self.tags
    }

    pub fn logs(&self) -> &[LogEvent] {
        &self.logs
    }

    pub fn refs(&self) -> &[SegmentRef] {
        &self.refs
    }

    pub fn is_error(&self) -> bool {
        self.is_error
    }

    pub fn is_noop(&self) -> bool {
        self.is_noop
    }

    pub fn skip_analysis(&self) -> bool {
        self.skip_analysis
    }

    pub fn is_prepared_for_async(&self) -> bool {
        self.prepared_for_async
    }

    pub fn tag(&mut self, key: impl Into<Cow<'static, str>>, value: impl Into<String>) {
        if self.is_noop {
            return;
        }
        self.tags.push((key.into(), value.into()));
    }

    pub fn log_event(&mut self, data: Vec<(String, String)>) {
        if self.is_noop {
            return;
        }
        self.logs.push(LogEvent {
            time_ms: now_ms(),
            data,
        });
    }

    pub fn error_occurred(&mut self) {
        if self.is_noop {
            return;
        }
        self.is_error = true;
    }

    pub fn set_component_id(&mut self, component_id: u32) {
        if self.is_noop {
            return;
        }
        self.component_id = component_id;
    }

    pub fn set_skip_analysis(&mut self, skip: bool) {
        self.skip_analysis = skip;
    }

    pub(crate) fn set_peer(&mut self, peer: &str) {
        self.peer = Some(peer.to_string());
    }

    pub(crate) fn add_ref(&mut self, segment_ref: SegmentRef) {
        if self.is_noop {
            return;
        }
        self.refs.push(segment_ref);
    }

    pub(crate) fn set_prepared_for_async(&mut self) {
        self.prepared_for_async = true;
    }

    /// Restarts an entry span for a new inbound operation. Everything the
    /// previous instrumentation layer recorded is discarded; the span now
    /// describes the outermost operation.
    pub(crate) fn reenter_entry(&mut self, operation_name: &str) {
        self.depth += 1;
        if self.is_noop {
            return;
        }
        self.operation_name = operation_name.to_string();
        self.start_time_ms = now_ms();
        self.component_id = 0;
        self.tags.clear();
        self.logs.clear();
        self.is_error = false;
    }

    /// Re-enters an exit span targeting the same peer. The outermost exit
    /// wins; nested layers only balance the depth counter.
    pub(crate) fn reenter_exit(&mut self) {
        self.depth += 1;
    }

    /// Balances one `create_*` call. Returns true when the span actually
    /// completed, i.e. its depth counter reached zero.
    pub(crate) fn finish(&mut self) -> bool {
        self.depth -= 1;
        if self.depth == 0 {
            if self.end_time_ms == 0 {
                self.end_time_ms = now_ms();
            }
            true
        } else {
            false
        }
    }

    pub(crate) fn set_end_time(&mut self, end_time_ms: u64) {
        self.end_time_ms = end_time_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reentered_entry_span_is_restarted() {
        let mut span = Span::new(0, -1, "/dispatch", SpanKind::Entry);
        span.tag("inner", "true");
        span.error_occurred();

        span.reenter_entry("/api/orders");

        assert_eq!(span.operation_name(), "/api/orders");
        assert!(span.tags().is_empty());
        assert!(!span.is_error());

        // Two layers entered, two finishes to complete
        assert!(!span.finish());
        assert!(span.finish());
    }

    #[test]
    fn test_noop_span_records_nothing() {
        let mut span = Span::noop(12, SpanKind::Exit);
        span.tag("key", "value");
        span.log_event(vec![("event".to_string(), "oops".to_string())]);
        span.error_occurred();

        assert!(span.is_noop());
        assert_eq!(span.kind(), SpanKind::Exit);
        assert!(span.tags().is_empty());
        assert!(span.logs().is_empty());
        assert!(!span.is_error());
    }
}
