// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Self-observability meter primitives.
//!
//! Meters are identified by name plus sorted tag pairs; building the same
//! identity twice returns the same underlying meter, so callers can keep
//! cheap `Arc` handles without coordinating registration order.

use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MeterId {
    name: Cow<'static, str>,
    tags: Vec<(Cow<'static, str>, String)>,
}

impl MeterId {
    fn new(name: Cow<'static, str>, mut tags: Vec<(Cow<'static, str>, String)>) -> Self {
        tags.sort();
        MeterId { name, tags }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tags(&self) -> &[(Cow<'static, str>, String)] {
        &self.tags
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    count: AtomicU64,
}

impl Counter {
    pub fn increment(&self, n: u64) {
        self.count.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// A fixed-bucket histogram. `steps` are the inclusive lower bounds of each
/// bucket; a value below the first step is dropped into the first bucket.
#[derive(Debug)]
pub struct Histogram {
    steps: Vec<f64>,
    buckets: Vec<AtomicU64>,
    observed: AtomicU64,
}

impl Histogram {
    fn new(steps: Vec<f64>) -> Self {
        let buckets = steps.iter().map(|_| AtomicU64::new(0)).collect();
        Histogram {
            steps,
            buckets,
            observed: AtomicU64::new(0),
        }
    }

    pub fn add_value(&self, value: f64) {
        let index = match self
            .steps
            .iter()
            .position(|step| value < *step)
        {
            Some(0) | None if self.steps.is_empty() => return,
            Some(0) => 0,
            Some(i) => i - 1,
            None => self.steps.len() - 1,
        };
        self.buckets[index].fetch_add(1, Ordering::Relaxed);
        self.observed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observed_count(&self) -> u64 {
        self.observed.load(Ordering::Relaxed)
    }

    pub fn bucket_counts(&self) -> Vec<u64> {
        self.buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }

    pub fn steps(&self) -> &[f64] {
        &self.steps
    }
}

/// Registry of all self-observability meters of one agent instance
#[derive(Debug, Default)]
pub struct MeterRegistry {
    counters: RwLock<HashMap<MeterId, Arc<Counter>>>,
    histograms: RwLock<HashMap<MeterId, Arc<Histogram>>>,
}

impl MeterRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn counter(self: &Arc<Self>, name: impl Into<Cow<'static, str>>) -> CounterBuilder {
        CounterBuilder {
            registry: Arc::clone(self),
            name: name.into(),
            tags: Vec::new(),
        }
    }

    pub fn histogram(self: &Arc<Self>, name: impl Into<Cow<'static, str>>) -> HistogramBuilder {
        HistogramBuilder {
            registry: Arc::clone(self),
            name: name.into(),
            tags: Vec::new(),
            steps: Vec::new(),
        }
    }

    /// Snapshot of every counter, for the reporting pipeline
    pub fn counters(&self) -> Vec<(MeterId, u64)> {
        self.counters
            .read()
            .expect("meter registry lock poisoned")
            .iter()
            .map(|(id, c)| (id.clone(), c.get()))
            .collect()
    }
}

pub struct CounterBuilder {
    registry: Arc<MeterRegistry>,
    name: Cow<'static, str>,
    tags: Vec<(Cow<'static, str>, String)>,
}

impl CounterBuilder {
    pub fn tag(mut self, key: impl Into<Cow<'static, str>>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn build(self) -> Arc<Counter> {
        let id = MeterId::new(self.name, self.tags);
        let mut counters = self
            .registry
            .counters
            .write()
            .expect("meter registry lock poisoned");
        Arc::clone(counters.entry(id).or_default())
    }
}

pub struct HistogramBuilder {
    registry: Arc<MeterRegistry>,
    name: Cow<'static, str>,
    tags: Vec<(Cow<'static, str>, String)>,
    steps: Vec<f64>,
}

impl HistogramBuilder {
    pub fn tag(mut self, key: impl Into<Cow<'static, str>>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn steps(mut self, steps: Vec<f64>) -> Self {
        self.steps = steps;
        self
    }

    pub fn build(self) -> Result<Arc<Histogram>> {
        let id = MeterId::new(self.name, self.tags);
        let mut histograms = self
            .registry
            .histograms
            .write()
            .expect("meter registry lock poisoned");
        if let Some(existing) = histograms.get(&id) {
            if existing.steps() != self.steps.as_slice() {
                return Err(Error::MeterConflict {
                    name: id.name().to_string(),
                });
            }
            return Ok(Arc::clone(existing));
        }
        let histogram = Arc::new(Histogram::new(self.steps));
        histograms.insert(id, Arc::clone(&histogram));
        Ok(histogram)
    }
}
