// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent self-observability.
//!
//! One component owns every agent-health meter. Counters are resolved once at
//! construction; the per-plugin error counters are resolved lazily since the
//! tag set is open ended.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::{
    meter::{Counter, Histogram, MeterRegistry},
    Result,
};

/// Time buckets for context performance, in nanoseconds
pub const CONTEXT_PERFORMANCE_STEPS: [f64; 12] = [
    1_000.0,
    10_000.0,
    50_000.0,
    100_000.0,
    300_000.0,
    500_000.0,
    1_000_000.0,
    5_000_000.0,
    10_000_000.0,
    20_000_000.0,
    50_000_000.0,
    100_000_000.0,
];

pub struct AgentSo11y {
    registry: Arc<MeterRegistry>,

    created_tracing_propagated: Arc<Counter>,
    created_tracing_sampler: Arc<Counter>,
    created_ignored_propagated: Arc<Counter>,
    created_ignored_sampler: Arc<Counter>,
    finished_tracing: Arc<Counter>,
    finished_ignored: Arc<Counter>,
    leaked_tracing: Arc<Counter>,
    leaked_ignored: Arc<Counter>,
    context_performance: Arc<Histogram>,

    // keyed by (plugin_name, inter_type)
    interceptor_errors: RwLock<HashMap<(String, &'static str), Arc<Counter>>>,
}

impl AgentSo11y {
    pub fn new(registry: Arc<MeterRegistry>) -> Result<Self> {
        let created = |name: &'static str, created_by: &'static str| {
            registry.counter(name).tag("created_by", created_by).build()
        };
        let context_performance = registry
            .histogram("tracing_context_performance")
            .steps(CONTEXT_PERFORMANCE_STEPS.to_vec())
            .build()?;

        Ok(AgentSo11y {
            created_tracing_propagated: created("created_tracing_context_counter", "propagated"),
            created_tracing_sampler: created("created_tracing_context_counter", "sampler"),
            created_ignored_propagated: created("created_ignored_context_counter", "propagated"),
            created_ignored_sampler: created("created_ignored_context_counter", "sampler"),
            finished_tracing: registry.counter("finished_tracing_context_counter").build(),
            finished_ignored: registry.counter("finished_ignored_context_counter").build(),
            leaked_tracing: registry
                .counter("possible_leaked_context_counter")
                .tag("source", "tracing")
                .build(),
            leaked_ignored: registry
                .counter("possible_leaked_context_counter")
                .tag("source", "ignore")
                .build(),
            context_performance,
            interceptor_errors: RwLock::new(HashMap::new()),
            registry,
        })
    }

    pub fn record_context_create(&self, propagated: bool, ignored: bool) {
        let counter = match (ignored, propagated) {
            (false, true) => &self.created_tracing_propagated,
            (false, false) => &self.created_tracing_sampler,
            (true, true) => &self.created_ignored_propagated,
            (true, false) => &self.created_ignored_sampler,
        };
        counter.increment(1);
    }

    pub fn record_context_finish(&self, ignored: bool) {
        if ignored {
            self.finished_ignored.increment(1);
        } else {
            self.finished_tracing.increment(1);
        }
    }

    /// A context was dropped while still active, e.g. a span left open
    /// when its owning thread went away.
    pub fn record_leaked_context(&self, ignored: bool) {
        if ignored {
            self.leaked_ignored.increment(1);
        } else {
            self.leaked_tracing.increment(1);
        }
    }

    /// Time spent inside interceptors on behalf of one intercepted call, in
    /// nanoseconds
    pub fn record_interceptor_time_cost(&self, nanos: f64) {
        self.context_performance.add_value(nanos);
    }

    pub fn record_interceptor_error(&self, plugin_name: &str, inter_type: &'static str) {
        let key = (plugin_name.to_string(), inter_type);
        if let Some(counter) = self
            .interceptor_errors
            .read()
            .expect("so11y lock poisoned")
            .get(&key)
        {
            counter.increment(1);
            return;
        }

        let counter = self
            .registry
            .counter("interceptor_error_counter")
            .tag("plugin_name", plugin_name)
            .tag("inter_type", inter_type)
            .build();
        counter.increment(1);
        self.interceptor_errors
            .write()
            .expect("so11y lock poisoned")
            .insert(key, counter);
    }

    pub fn registry(&self) -> &Arc<MeterRegistry> {
        &self.registry
    }
}
