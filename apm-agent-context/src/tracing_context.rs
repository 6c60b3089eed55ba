// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The tracing context of one thread of execution.
//!
//! Spans are created and stopped in stack order; the context finishes, and
//! its segment becomes reportable, when the last span stops. Spans prepared
//! for async completion detach from the stack discipline and gate the
//! segment until they finish, possibly on other threads.

use std::{
    collections::HashMap,
    mem,
    sync::{Arc, Mutex},
};

use apm_agent::{apm_error, apm_warn, Config};

use crate::{
    manager::SegmentReporter,
    now_ms,
    profile_status::ProfileStatusContext,
    snapshot::ContextSnapshot,
    trace::{SegmentRef, Span, SpanKind, TraceSegment},
    ContextCarrier, CorrelationContext, DistributedTraceId, Error,
};

/// What happened to the context after a span stopped
#[derive(Debug)]
pub enum SpanStopOutcome {
    /// Other spans are still running
    Alive,
    /// The last span stopped; the segment is ready to report
    Finished(TraceSegment),
    /// The last span stopped but async spans are still pending; the async
    /// gate will report the segment once they all finish
    AwaitingAsync,
}

pub struct TracingContext {
    config: Arc<Config>,
    segment: TraceSegment,
    active_spans: Vec<Span>,
    span_id_seq: i32,
    first_span_op_name: Option<String>,
    correlation: CorrelationContext,
    profile_status: ProfileStatusContext,
    async_gate: Option<Arc<AsyncGate>>,
    async_slots: HashMap<i32, Arc<AsyncSlot>>,
    finished: bool,
}

impl TracingContext {
    pub fn new(config: Arc<Config>) -> Self {
        let correlation = CorrelationContext::new(
            config.correlation_max_key_count(),
            config.correlation_max_value_size(),
        );
        TracingContext {
            config,
            segment: TraceSegment::new(),
            active_spans: Vec::new(),
            span_id_seq: 0,
            first_span_op_name: None,
            correlation,
            profile_status: ProfileStatusContext::none(),
            async_gate: None,
            async_slots: HashMap::new(),
            finished: false,
        }
    }

    pub fn trace_segment_id(&self) -> &str {
        self.segment.trace_segment_id()
    }

    pub fn trace_id(&self) -> &DistributedTraceId {
        self.segment.trace_id()
    }

    pub fn create_time_ms(&self) -> u64 {
        self.segment.create_time_ms()
    }

    pub fn profile_status(&self) -> &ProfileStatusContext {
        &self.profile_status
    }

    /// Operation name of the first span of this segment, the endpoint name
    /// profiling tasks match against
    pub fn first_span_op_name(&self) -> Option<&str> {
        self.first_span_op_name.as_deref()
    }

    pub fn is_active(&self) -> bool {
        !self.finished && !self.active_spans.is_empty()
    }

    pub fn active_span_id(&self) -> i32 {
        self.active_spans.last().map_or(-1, Span::span_id)
    }

    /// Runs `f` against the currently active span, if any
    pub fn with_active_span<R>(&mut self, f: impl FnOnce(&mut Span) -> R) -> Option<R> {
        self.active_spans.last_mut().map(f)
    }

    pub fn correlation(&self) -> &CorrelationContext {
        &self.correlation
    }

    pub fn correlation_mut(&mut self) -> &mut CorrelationContext {
        &mut self.correlation
    }

    /// Starts a service provider side span. An already active entry span at
    /// the stack top is restarted for the new operation instead of being
    /// nested; a valid carrier relates this segment to its cross process
    /// parent.
    pub fn create_entry_span(
        &mut self,
        operation_name: &str,
        carrier: Option<&ContextCarrier>,
    ) -> i32 {
        if self.finished {
            return self.log_finished_misuse("create_entry_span");
        }
        if self.over_span_limit() {
            return self.push_noop_span(SpanKind::Entry, None);
        }

        let reused = matches!(
            self.active_spans.last(),
            Some(top) if top.kind() == SpanKind::Entry
        );
        let span_id = if reused {
            // Restart for the outer layer of instrumentation
            if let Some(top) = self.active_spans.last_mut() {
                top.reenter_entry(operation_name);
                if top.parent_span_id() == -1 && !top.is_noop() {
                    self.first_span_op_name = Some(operation_name.to_string());
                }
                top.span_id()
            } else {
                -1
            }
        } else {
            self.push_span(operation_name, SpanKind::Entry, None)
        };

        if let Some(carrier) = carrier {
            self.extract(carrier);
        }
        span_id
    }

    /// Starts a client side span pointing at `peer`. Nested exits to the
    /// same peer fold into the active exit span. When a carrier is supplied
    /// the context is injected into it right away.
    pub fn create_exit_span(
        &mut self,
        operation_name: &str,
        peer: &str,
        carrier: Option<&mut ContextCarrier>,
    ) -> i32 {
        if self.finished {
            return self.log_finished_misuse("create_exit_span");
        }
        let merged = matches!(
            self.active_spans.last(),
            Some(top) if top.kind() == SpanKind::Exit && top.peer() == Some(peer)
        );
        let span_id = if merged {
            if let Some(top) = self.active_spans.last_mut() {
                top.reenter_exit();
                top.span_id()
            } else {
                -1
            }
        } else if self.over_span_limit() {
            self.push_noop_span(SpanKind::Exit, Some(peer))
        } else {
            self.push_span(operation_name, SpanKind::Exit, Some(peer))
        };

        if let Some(carrier) = carrier {
            if let Err(e) = self.inject(carrier) {
                apm_warn!("{e}");
            }
        }
        span_id
    }

    pub fn create_local_span(&mut self, operation_name: &str) -> i32 {
        if self.finished {
            return self.log_finished_misuse("create_local_span");
        }
        if self.over_span_limit() {
            return self.push_noop_span(SpanKind::Local, None);
        }
        self.push_span(operation_name, SpanKind::Local, None)
    }

    /// Balances one `create_*` call. The id must belong to the active span;
    /// a mismatch is logged and handled defensively by stopping the actual
    /// active span, keeping the context alive instead of panicking.
    pub fn stop_span(&mut self, span_id: i32) -> SpanStopOutcome {
        if self.finished {
            self.log_finished_misuse("stop_span");
            return SpanStopOutcome::Alive;
        }
        let completed = match self.active_spans.last_mut() {
            None => {
                apm_error!("stopping span {span_id} but no span is active");
                return SpanStopOutcome::Alive;
            }
            Some(top) => {
                if top.span_id() != span_id {
                    apm_error!(
                        "stopping span {span_id} but the active span is {}, the context may be corrupted",
                        top.span_id()
                    );
                }
                top.finish()
            }
        };
        if !completed {
            return SpanStopOutcome::Alive;
        }

        if let Some(span) = self.active_spans.pop() {
            if span.is_prepared_for_async() {
                self.detach_async_span(span);
            } else if !span.is_noop() {
                self.segment.archive(span);
            }
        }

        if self.active_spans.is_empty() {
            self.finish_segment()
        } else {
            SpanStopOutcome::Alive
        }
    }

    /// Captures this context so the trace can be continued on another thread
    pub fn capture(&self) -> ContextSnapshot {
        ContextSnapshot::new(
            self.segment.trace_segment_id().to_string(),
            self.active_span_id(),
            self.segment.trace_id().clone(),
            self.first_span_op_name.clone().unwrap_or_default(),
            self.correlation.clone(),
            self.profile_status.captured(),
        )
    }

    /// Continues a trace captured on another thread of this process.
    /// Returns whether profiling should carry on in this context. Invalid
    /// snapshots, and snapshots of this very context, are a no-op.
    pub fn continued(&mut self, snapshot: &ContextSnapshot) -> bool {
        if !snapshot.is_valid() || snapshot.is_from_current(self) {
            return false;
        }
        let segment_ref = SegmentRef::from_snapshot(
            snapshot,
            self.config.service_name(),
            self.config.instance_name(),
        );
        self.segment.relate(snapshot.trace_id().clone());
        self.segment.add_ref(segment_ref.clone());
        if let Some(top) = self.active_spans.last_mut() {
            top.add_ref(segment_ref);
        }
        self.correlation.extend_from(snapshot.correlation());
        self.profile_status.continued(
            snapshot.profile_status(),
            self.config.profile_max_accept_sub_parallel(),
        )
    }

    /// Injects this context into a carrier. Only valid from an active exit
    /// span, which determines the peer the context travels to.
    pub fn inject(&self, carrier: &mut ContextCarrier) -> Result<(), Error> {
        let span = self
            .active_spans
            .last()
            .ok_or_else(|| Error::inject("no active span", "tracing_context"))?;
        if span.kind() != SpanKind::Exit {
            return Err(Error::inject(
                "the active span is not an exit span",
                "tracing_context",
            ));
        }
        carrier.fill(
            self.segment.trace_id().clone(),
            self.segment.trace_segment_id().to_string(),
            span.span_id(),
            self.config.service_name().to_string(),
            self.config.instance_name().to_string(),
            self.first_span_op_name.clone().unwrap_or_default(),
            span.peer().unwrap_or_default().to_string(),
            self.correlation.clone(),
        );
        Ok(())
    }

    /// Applies an extracted carrier: relates the trace id, records the cross
    /// process parent ref and merges the inbound correlation. Invalid
    /// carriers are a no-op.
    pub fn extract(&mut self, carrier: &ContextCarrier) {
        let Some(segment_ref) = SegmentRef::from_carrier(carrier) else {
            return;
        };
        self.segment.relate(carrier.trace_id().clone());
        self.segment.add_ref(segment_ref.clone());
        if let Some(top) = self.active_spans.last_mut() {
            if top.kind() == SpanKind::Entry {
                top.add_ref(segment_ref);
            }
        }
        self.correlation.extend_from(carrier.correlation());
    }

    /// Detaches the given active span from stack discipline. `stop_span`
    /// still balances the stack, but the segment is not reported until the
    /// returned handle's `async_finish` runs, possibly on another thread.
    pub fn prepare_for_async(
        &mut self,
        span_id: i32,
        reporter: Arc<dyn SegmentReporter>,
    ) -> Result<AsyncSpanHandle, Error> {
        let span = self
            .active_spans
            .iter_mut()
            .find(|s| s.span_id() == span_id)
            .ok_or_else(|| Error::span("preparing a span that is not active for async", "async"))?;
        if span.is_noop() {
            return Err(Error::span("a noop span cannot go async", "async"));
        }
        if span.is_prepared_for_async() {
            return Err(Error::span("span already prepared for async", "async"));
        }
        span.set_prepared_for_async();

        let gate = self
            .async_gate
            .get_or_insert_with(|| Arc::new(AsyncGate::new(reporter)))
            .clone();
        gate.add_pending();

        let slot = Arc::new(AsyncSlot::default());
        self.async_slots.insert(span_id, Arc::clone(&slot));
        Ok(AsyncSpanHandle { gate, slot })
    }

    fn over_span_limit(&mut self) -> bool {
        let limit = self.config.span_limit_per_segment();
        if limit >= 0 && self.span_id_seq >= limit {
            self.segment.mark_size_limited();
            true
        } else {
            false
        }
    }

    fn next_span_id(&mut self) -> i32 {
        let id = self.span_id_seq;
        self.span_id_seq += 1;
        id
    }

    fn push_span(&mut self, operation_name: &str, kind: SpanKind, peer: Option<&str>) -> i32 {
        let parent_span_id = self.active_span_id();
        let span_id = self.next_span_id();
        let mut span = Span::new(span_id, parent_span_id, operation_name, kind);
        if let Some(peer) = peer {
            span.set_peer(peer);
        }
        if parent_span_id == -1 {
            self.first_span_op_name = Some(operation_name.to_string());
        }
        self.active_spans.push(span);
        span_id
    }

    fn push_noop_span(&mut self, kind: SpanKind, peer: Option<&str>) -> i32 {
        let span_id = self.next_span_id();
        let mut span = Span::noop(span_id, kind);
        if kind == SpanKind::Exit {
            // Keep the peer so injection through a noop exit span still
            // propagates the context downstream
            if let Some(peer) = peer {
                span.set_peer(peer);
            }
        }
        self.active_spans.push(span);
        span_id
    }

    fn detach_async_span(&mut self, span: Span) {
        let Some(slot) = self.async_slots.remove(&span.span_id()) else {
            apm_error!(
                "span {} prepared for async has no pending async slot",
                span.span_id()
            );
            return;
        };
        if let Some(gate) = &self.async_gate {
            if let Some(span) = slot.deliver(span) {
                // async_finish already ran, complete right away
                gate.complete(span);
            }
        }
    }

    fn finish_segment(&mut self) -> SpanStopOutcome {
        self.finished = true;
        let segment = mem::replace(&mut self.segment, TraceSegment::drained());
        match &self.async_gate {
            None => SpanStopOutcome::Finished(segment),
            Some(gate) => match gate.stash(segment) {
                Some(segment) => SpanStopOutcome::Finished(segment),
                None => SpanStopOutcome::AwaitingAsync,
            },
        }
    }

    fn log_finished_misuse(&self, operation: &str) -> i32 {
        apm_error!("{operation} called on an already finished tracing context");
        -1
    }
}

#[derive(Debug, Default)]
enum AsyncSlotState {
    /// prepared, neither stopped nor finished yet
    #[default]
    Waiting,
    /// async_finish ran before the main thread stopped the span
    FinishedEarly(u64),
    /// the main thread stopped the span, waiting for async_finish
    Detached(Span),
    Done,
}

#[derive(Debug, Default)]
struct AsyncSlot {
    state: Mutex<AsyncSlotState>,
}

impl AsyncSlot {
    /// Called by `stop_span`. Returns the span back when it already finished
    /// asynchronously and can be completed on the spot.
    fn deliver(&self, mut span: Span) -> Option<Span> {
        let Ok(mut state) = self.state.lock() else {
            return None;
        };
        match mem::take(&mut *state) {
            AsyncSlotState::FinishedEarly(end_time_ms) => {
                *state = AsyncSlotState::Done;
                span.set_end_time(end_time_ms);
                Some(span)
            }
            _ => {
                *state = AsyncSlotState::Detached(span);
                None
            }
        }
    }

    /// Called by `async_finish`. Returns the span when it was already
    /// detached by the main thread.
    fn finish(&self) -> Option<Span> {
        let Ok(mut state) = self.state.lock() else {
            return None;
        };
        match mem::take(&mut *state) {
            AsyncSlotState::Detached(mut span) => {
                *state = AsyncSlotState::Done;
                span.set_end_time(now_ms());
                Some(span)
            }
            AsyncSlotState::Waiting => {
                *state = AsyncSlotState::FinishedEarly(now_ms());
                None
            }
            done => {
                *state = done;
                apm_warn!("async span finished more than once");
                None
            }
        }
    }
}

struct AsyncGate {
    reporter: Arc<dyn SegmentReporter>,
    state: Mutex<GateState>,
}

#[derive(Default)]
struct GateState {
    pending: usize,
    finished: Vec<Span>,
    segment: Option<TraceSegment>,
}

impl AsyncGate {
    fn new(reporter: Arc<dyn SegmentReporter>) -> Self {
        AsyncGate {
            reporter,
            state: Mutex::new(GateState::default()),
        }
    }

    fn add_pending(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.pending += 1;
        }
    }

    /// One async span fully finished. Reports the segment if it was the last
    /// one and the main stack is already done.
    fn complete(&self, span: Span) {
        let ready = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.finished.push(span);
            state.pending = state.pending.saturating_sub(1);
            if state.pending == 0 {
                state.segment.take().map(|segment| {
                    let finished = mem::take(&mut state.finished);
                    (segment, finished)
                })
            } else {
                None
            }
        };
        if let Some((mut segment, finished)) = ready {
            for span in finished {
                segment.archive(span);
            }
            self.reporter.report(segment);
        }
    }

    /// The main stack finished. Returns the segment back when nothing is
    /// pending anymore, otherwise keeps it until the last `complete`.
    fn stash(&self, mut segment: TraceSegment) -> Option<TraceSegment> {
        let Ok(mut state) = self.state.lock() else {
            return Some(segment);
        };
        if state.pending == 0 {
            for span in mem::take(&mut state.finished) {
                segment.archive(span);
            }
            Some(segment)
        } else {
            state.segment = Some(segment);
            None
        }
    }
}

/// Completes a span that outlived its stack position. Safe to send to the
/// thread where the async work actually ends.
pub struct AsyncSpanHandle {
    gate: Arc<AsyncGate>,
    slot: Arc<AsyncSlot>,
}

impl AsyncSpanHandle {
    pub fn async_finish(self) {
        if let Some(span) = self.slot.finish() {
            self.gate.complete(span);
        }
    }
}
