// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-thread context management.
//!
//! The manager is an explicitly constructed process-wide service; the only
//! implicit state is the thread-local slot holding the context of the
//! current thread of execution. Segments rejected by the sampler still get a
//! context so span create/stop calls stay balanced, but it records nothing.

use std::{cell::RefCell, sync::Arc};

use apm_agent::{apm_warn, so11y::AgentSo11y, Config};

use crate::{
    profile_status::ProfileStatusContext,
    sampling::SamplingService,
    snapshot::ContextSnapshot,
    trace::{Span, TraceSegment},
    tracing_context::{AsyncSpanHandle, SpanStopOutcome, TracingContext},
    ContextCarrier, Error,
};

/// Receives finished segments. The reporting pipeline behind it is not this
/// crate's concern.
pub trait SegmentReporter: Send + Sync {
    fn report(&self, segment: TraceSegment);
}

/// Observes tracing context lifecycle events, so a profiling implementation
/// can attach thread profilers to interesting contexts. Every callback has a
/// no-op default.
pub trait ProfilingWatcher: Send + Sync {
    /// A sampled context was created with the given first operation name.
    fn on_context_create(
        &self,
        _segment_id: &str,
        _create_time_ms: u64,
        _first_span_op: &str,
        _status: &ProfileStatusContext,
    ) {
    }

    /// The first operation name of an existing context changed; the context
    /// may newly match, or no longer match, a profiling task.
    fn on_profiling_recheck(
        &self,
        _segment_id: &str,
        _create_time_ms: u64,
        _first_span_op: &str,
        _status: &ProfileStatusContext,
    ) {
    }

    /// The context adopted a snapshot whose profile status requests
    /// continued profiling.
    fn on_continued(&self, _segment_id: &str, _status: &ProfileStatusContext) {}

    /// The context finished; any profiler attached to it must be released.
    fn on_context_finish(&self, _segment_id: &str, _status: &ProfileStatusContext) {}
}

/// Watcher used when profiling is disabled
pub struct NoopProfilingWatcher;

impl ProfilingWatcher for NoopProfilingWatcher {}

struct IgnoredContext {
    depth: usize,
}

enum ActiveContext {
    Tracing(Box<TracingContext>),
    Ignored(IgnoredContext),
}

thread_local! {
    static ACTIVE_CONTEXT: RefCell<Option<ActiveContext>> = const { RefCell::new(None) };
}

pub struct ContextManager {
    config: Arc<Config>,
    reporter: Arc<dyn SegmentReporter>,
    so11y: Arc<AgentSo11y>,
    watcher: Arc<dyn ProfilingWatcher>,
    sampler: SamplingService,
}

impl ContextManager {
    pub fn new(
        config: Arc<Config>,
        reporter: Arc<dyn SegmentReporter>,
        so11y: Arc<AgentSo11y>,
        watcher: Arc<dyn ProfilingWatcher>,
    ) -> Self {
        let sampler = SamplingService::new(config.sample_n_per_3_secs());
        ContextManager {
            config,
            reporter,
            so11y,
            watcher,
            sampler,
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Starts an entry span, creating the thread's context on first use. A
    /// carrier holding a valid upstream context forces sampling.
    pub fn create_entry_span(&self, operation_name: &str, carrier: Option<&ContextCarrier>) -> i32 {
        self.with_slot(|slot| match slot {
            None => {
                let propagated = carrier.is_some_and(ContextCarrier::is_valid);
                let (active, span_id) = self.create_context(|ctx| {
                    ctx.create_entry_span(operation_name, carrier)
                }, propagated);
                *slot = Some(active);
                span_id
            }
            Some(ActiveContext::Tracing(ctx)) => {
                let op_before = ctx.first_span_op_name().map(str::to_string);
                let span_id = ctx.create_entry_span(operation_name, carrier);
                if ctx.first_span_op_name().is_some()
                    && ctx.first_span_op_name() != op_before.as_deref()
                {
                    if let Some(first_op) = ctx.first_span_op_name() {
                        self.watcher.on_profiling_recheck(
                            ctx.trace_segment_id(),
                            ctx.create_time_ms(),
                            first_op,
                            ctx.profile_status(),
                        );
                    }
                }
                span_id
            }
            Some(ActiveContext::Ignored(ignored)) => {
                ignored.depth += 1;
                -1
            }
        })
    }

    pub fn create_exit_span(
        &self,
        operation_name: &str,
        peer: &str,
        carrier: Option<&mut ContextCarrier>,
    ) -> i32 {
        self.with_slot(|slot| match slot {
            None => {
                let (active, span_id) = self.create_context(|ctx| {
                    ctx.create_exit_span(operation_name, peer, carrier)
                }, false);
                *slot = Some(active);
                span_id
            }
            Some(ActiveContext::Tracing(ctx)) => ctx.create_exit_span(operation_name, peer, carrier),
            Some(ActiveContext::Ignored(ignored)) => {
                ignored.depth += 1;
                -1
            }
        })
    }

    pub fn create_local_span(&self, operation_name: &str) -> i32 {
        self.with_slot(|slot| match slot {
            None => {
                let (active, span_id) =
                    self.create_context(|ctx| ctx.create_local_span(operation_name), false);
                *slot = Some(active);
                span_id
            }
            Some(ActiveContext::Tracing(ctx)) => ctx.create_local_span(operation_name),
            Some(ActiveContext::Ignored(ignored)) => {
                ignored.depth += 1;
                -1
            }
        })
    }

    /// Stops a span. Returns whether the whole context of this thread ended.
    pub fn stop_span(&self, span_id: i32) -> bool {
        self.with_slot(|slot| {
            let ended = match slot {
                None => {
                    apm_warn!("stop_span({span_id}) called without an active context");
                    return false;
                }
                Some(ActiveContext::Tracing(ctx)) => match ctx.stop_span(span_id) {
                    SpanStopOutcome::Alive => false,
                    SpanStopOutcome::Finished(segment) => {
                        self.finish_tracing_context(ctx, Some(segment));
                        true
                    }
                    SpanStopOutcome::AwaitingAsync => {
                        self.finish_tracing_context(ctx, None);
                        true
                    }
                },
                Some(ActiveContext::Ignored(ignored)) => {
                    ignored.depth -= 1;
                    if ignored.depth == 0 {
                        self.so11y.record_context_finish(true);
                        true
                    } else {
                        false
                    }
                }
            };
            if ended {
                *slot = None;
            }
            ended
        })
    }

    pub fn is_active(&self) -> bool {
        self.with_slot(|slot| slot.is_some())
    }

    pub fn active_span_id(&self) -> i32 {
        self.with_slot(|slot| match slot {
            Some(ActiveContext::Tracing(ctx)) => ctx.active_span_id(),
            _ => -1,
        })
    }

    /// The distributed trace id of the current thread's context
    pub fn global_trace_id(&self) -> Option<crate::DistributedTraceId> {
        self.with_slot(|slot| match slot {
            Some(ActiveContext::Tracing(ctx)) => Some(ctx.trace_id().clone()),
            _ => None,
        })
    }

    pub fn with_active_span<R>(&self, f: impl FnOnce(&mut Span) -> R) -> Option<R> {
        self.with_slot(|slot| match slot {
            Some(ActiveContext::Tracing(ctx)) => ctx.with_active_span(f),
            _ => None,
        })
    }

    /// Captures the current context for cross thread continuation. None when
    /// the thread has no recorded context.
    pub fn capture(&self) -> Option<ContextSnapshot> {
        self.with_slot(|slot| match slot {
            Some(ActiveContext::Tracing(ctx)) => Some(ctx.capture()),
            _ => None,
        })
    }

    /// Continues a snapshot in the current context. Returns whether
    /// profiling carries on here.
    pub fn continued(&self, snapshot: &ContextSnapshot) -> bool {
        self.with_slot(|slot| match slot {
            Some(ActiveContext::Tracing(ctx)) => {
                let continue_profiling = ctx.continued(snapshot);
                if continue_profiling {
                    self.watcher
                        .on_continued(ctx.trace_segment_id(), ctx.profile_status());
                }
                continue_profiling
            }
            _ => false,
        })
    }

    pub fn inject(&self, carrier: &mut ContextCarrier) -> Result<(), Error> {
        self.with_slot(|slot| match slot {
            Some(ActiveContext::Tracing(ctx)) => ctx.inject(carrier),
            _ => Err(Error::inject("no active tracing context", "context_manager")),
        })
    }

    pub fn correlation_put(&self, key: &str, value: Option<String>) {
        self.with_slot(|slot| {
            if let Some(ActiveContext::Tracing(ctx)) = slot {
                ctx.correlation_mut().put(key, value);
            }
        })
    }

    pub fn correlation_get(&self, key: &str) -> Option<String> {
        self.with_slot(|slot| match slot {
            Some(ActiveContext::Tracing(ctx)) => ctx.correlation().get(key).map(str::to_string),
            _ => None,
        })
    }

    /// Detaches the given span for async completion. The returned handle
    /// finishes it from any thread.
    pub fn prepare_for_async(&self, span_id: i32) -> Result<AsyncSpanHandle, Error> {
        self.with_slot(|slot| match slot {
            Some(ActiveContext::Tracing(ctx)) => {
                ctx.prepare_for_async(span_id, Arc::clone(&self.reporter))
            }
            _ => Err(Error::span("no active tracing context", "async")),
        })
    }

    /// Records that a context was found leaked by an external reaper
    pub fn report_leaked(&self, ignored: bool) {
        self.so11y.record_leaked_context(ignored);
    }

    fn create_context(
        &self,
        first_span: impl FnOnce(&mut TracingContext) -> i32,
        propagated: bool,
    ) -> (ActiveContext, i32) {
        let sampled =
            propagated || self.config.keep_tracing() || self.sampler.try_sample();
        self.so11y.record_context_create(propagated, !sampled);
        if sampled {
            let mut ctx = Box::new(TracingContext::new(Arc::clone(&self.config)));
            let span_id = first_span(&mut ctx);
            self.watcher.on_context_create(
                ctx.trace_segment_id(),
                ctx.create_time_ms(),
                ctx.first_span_op_name().unwrap_or(""),
                ctx.profile_status(),
            );
            (ActiveContext::Tracing(ctx), span_id)
        } else {
            (ActiveContext::Ignored(IgnoredContext { depth: 1 }), -1)
        }
    }

    fn finish_tracing_context(&self, ctx: &TracingContext, segment: Option<TraceSegment>) {
        self.watcher
            .on_context_finish(ctx.trace_segment_id(), ctx.profile_status());
        self.so11y.record_context_finish(false);
        if let Some(segment) = segment {
            self.reporter.report(segment);
        }
    }

    fn with_slot<R>(&self, f: impl FnOnce(&mut Option<ActiveContext>) -> R) -> R {
        ACTIVE_CONTEXT.with(|slot| f(&mut slot.borrow_mut()))
    }
}

/// Collects reported segments in memory, for tests
#[cfg(any(test, feature = "test-utils"))]
pub struct CollectingReporter {
    segments: std::sync::Mutex<Vec<TraceSegment>>,
}

#[cfg(any(test, feature = "test-utils"))]
impl CollectingReporter {
    pub fn new() -> Self {
        CollectingReporter {
            segments: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn take_segments(&self) -> Vec<TraceSegment> {
        std::mem::take(&mut self.segments.lock().unwrap())
    }

    pub fn segment_count(&self) -> usize {
        self.segments.lock().unwrap().len()
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl Default for CollectingReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SegmentReporter for CollectingReporter {
    fn report(&self, segment: TraceSegment) {
        self.segments.lock().unwrap().push(segment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apm_agent::{configuration::CompositeSource, meter::MeterRegistry};
    use serial_test::serial;
    use std::sync::Mutex;

    fn manager_with(
        configure: impl FnOnce(&mut apm_agent::configuration::ConfigBuilder),
        watcher: Arc<dyn ProfilingWatcher>,
    ) -> (ContextManager, Arc<CollectingReporter>) {
        let mut builder = Config::builder_from(&CompositeSource::new());
        configure(&mut builder);
        let config = Arc::new(builder.build());
        let reporter = Arc::new(CollectingReporter::new());
        let so11y = Arc::new(AgentSo11y::new(MeterRegistry::new()).unwrap());
        let manager = ContextManager::new(config, Arc::clone(&reporter) as _, so11y, watcher);
        (manager, reporter)
    }

    fn default_manager() -> (ContextManager, Arc<CollectingReporter>) {
        manager_with(|_| {}, Arc::new(NoopProfilingWatcher))
    }

    #[test]
    #[serial]
    fn test_lazy_context_creation_and_reporting() {
        let (manager, reporter) = default_manager();

        assert!(!manager.is_active());
        let entry = manager.create_entry_span("/api/orders", None);
        assert!(manager.is_active());
        let exit = manager.create_exit_span("db/query", "db:5432", None);

        assert!(!manager.stop_span(exit));
        assert!(manager.stop_span(entry));
        assert!(!manager.is_active());

        let segments = reporter.take_segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].spans().len(), 2);
    }

    #[test]
    #[serial]
    fn test_sampler_rejection_creates_ignored_context() {
        // Budget of zero is "sample everything" per the original semantics,
        // so use a one-shot budget and burn it first.
        let (manager, reporter) = manager_with(
            |b| {
                b.set_sample_n_per_3_secs(1);
            },
            Arc::new(NoopProfilingWatcher),
        );

        let first = manager.create_entry_span("/api", None);
        assert!(manager.stop_span(first));

        // The second context in the same window is ignored
        let second = manager.create_entry_span("/api", None);
        assert_eq!(second, -1);
        assert!(manager.is_active());
        let inner = manager.create_local_span("inner");
        assert_eq!(inner, -1);
        assert!(!manager.stop_span(inner));
        assert!(manager.stop_span(second));
        assert!(!manager.is_active());

        assert_eq!(reporter.segment_count(), 1);
    }

    #[test]
    #[serial]
    fn test_propagated_context_forces_sampling() {
        let (manager, reporter) = manager_with(
            |b| {
                b.set_sample_n_per_3_secs(1);
            },
            Arc::new(NoopProfilingWatcher),
        );

        // Burn the budget
        let first = manager.create_entry_span("/api", None);
        manager.stop_span(first);

        // Build a valid upstream carrier
        let mut carrier = ContextCarrier::new(3, 128);
        carrier.deserialize_context(&format!(
            "1-{}-{}-0-{}-{}-{}-{}",
            b64("trace"),
            b64("seg"),
            b64("svc"),
            b64("inst"),
            b64("/up"),
            b64("peer:80"),
        ));
        assert!(carrier.is_valid());

        let entry = manager.create_entry_span("/api", Some(&carrier));
        assert_ne!(entry, -1);
        manager.stop_span(entry);

        assert_eq!(reporter.segment_count(), 2);

        fn b64(s: &str) -> String {
            use base64::{engine::general_purpose::STANDARD, Engine as _};
            STANDARD.encode(s)
        }
    }

    #[test]
    #[serial]
    fn test_keep_tracing_overrides_sampler() {
        let (manager, reporter) = manager_with(
            |b| {
                b.set_sample_n_per_3_secs(1).set_keep_tracing(true);
            },
            Arc::new(NoopProfilingWatcher),
        );

        for _ in 0..3 {
            let span = manager.create_entry_span("/api", None);
            assert_ne!(span, -1);
            manager.stop_span(span);
        }
        assert_eq!(reporter.segment_count(), 3);
    }

    #[derive(Default)]
    struct RecordingWatcher {
        events: Mutex<Vec<String>>,
    }

    impl ProfilingWatcher for RecordingWatcher {
        fn on_context_create(
            &self,
            _segment_id: &str,
            _create_time_ms: u64,
            first_span_op: &str,
            _status: &ProfileStatusContext,
        ) {
            self.events
                .lock()
                .unwrap()
                .push(format!("create:{first_span_op}"));
        }

        fn on_profiling_recheck(
            &self,
            _segment_id: &str,
            _create_time_ms: u64,
            first_span_op: &str,
            _status: &ProfileStatusContext,
        ) {
            self.events
                .lock()
                .unwrap()
                .push(format!("recheck:{first_span_op}"));
        }

        fn on_context_finish(&self, _segment_id: &str, _status: &ProfileStatusContext) {
            self.events.lock().unwrap().push("finish".to_string());
        }
    }

    #[test]
    #[serial]
    fn test_watcher_sees_lifecycle_and_recheck() {
        let watcher = Arc::new(RecordingWatcher::default());
        let (manager, _reporter) = manager_with(|_| {}, Arc::clone(&watcher) as _);

        let outer = manager.create_entry_span("/dispatch", None);
        // Entry reuse changes the first operation name
        let inner = manager.create_entry_span("/api/orders", None);
        assert_eq!(outer, inner);
        manager.stop_span(inner);
        manager.stop_span(outer);

        let events = watcher.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "create:/dispatch".to_string(),
                "recheck:/api/orders".to_string(),
                "finish".to_string()
            ]
        );
    }

    #[test]
    #[serial]
    fn test_correlation_accessors() {
        let (manager, _reporter) = default_manager();

        let span = manager.create_entry_span("/api", None);
        manager.correlation_put("user", Some("42".to_string()));
        assert_eq!(manager.correlation_get("user"), Some("42".to_string()));
        manager.stop_span(span);

        assert_eq!(manager.correlation_get("user"), None);
    }

    #[test]
    #[serial]
    fn test_cross_thread_via_manager() {
        let (manager, reporter) = default_manager();
        let manager = Arc::new(manager);

        let entry = manager.create_entry_span("/api/orders", None);
        let snapshot = manager.capture().unwrap();

        let worker = {
            let manager = Arc::clone(&manager);
            std::thread::spawn(move || {
                let span = manager.create_local_span("worker");
                manager.continued(&snapshot);
                manager.stop_span(span);
            })
        };
        worker.join().unwrap();

        manager.stop_span(entry);

        let segments = reporter.take_segments();
        assert_eq!(segments.len(), 2);
        let child = segments
            .iter()
            .find(|s| !s.refs().is_empty())
            .expect("one segment carries the cross thread ref");
        assert_eq!(child.refs()[0].span_id(), entry);
    }
}
