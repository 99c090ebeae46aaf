// Copyright (c) MySocial Team
// SPDX-License-Identifier: Apache-2.0

//! Metrics sink injected into every pipeline component.
//!
//! Components never touch a global registry. Production wiring hands them a
//! [`PrometheusMetrics`]; tests hand them an [`InMemoryMetrics`] and assert on
//! the recorded values.

use parking_lot::Mutex;
use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

pub type Labels<'a> = &'a [(&'static str, &'a str)];

/// Counter/gauge capability shared by all components.
pub trait MetricsSink: Send + Sync {
    fn incr_counter(&self, name: &'static str, labels: Labels<'_>, by: u64);

    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64);

    fn incr(&self, name: &'static str, labels: Labels<'_>) {
        self.incr_counter(name, labels, 1);
    }
}

pub type SharedMetrics = Arc<dyn MetricsSink>;

/// Prometheus-backed sink. Metric families are registered lazily the first
/// time a name is seen, using the label names of that first observation.
pub struct PrometheusMetrics {
    registry: Registry,
    counters: Mutex<HashMap<&'static str, IntCounterVec>>,
    gauges: Mutex<HashMap<&'static str, GaugeVec>>,
}

impl PrometheusMetrics {
    pub fn new() -> Self {
        Self {
            registry: Registry::new_custom(Some("vylet".to_string()), None)
                .unwrap_or_default(),
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
        }
    }

    /// Render every registered family in the text exposition format.
    pub fn render(&self) -> anyhow::Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }

    fn counter_vec(&self, name: &'static str, labels: Labels<'_>) -> Option<IntCounterVec> {
        let mut counters = self.counters.lock();
        if let Some(existing) = counters.get(name) {
            return Some(existing.clone());
        }
        let label_names: Vec<&str> = labels.iter().map(|(k, _)| *k).collect();
        let vec = IntCounterVec::new(Opts::new(name, name), &label_names).ok()?;
        if let Err(e) = self.registry.register(Box::new(vec.clone())) {
            warn!("Failed to register counter {}: {}", name, e);
            return None;
        }
        counters.insert(name, vec.clone());
        Some(vec)
    }

    fn gauge_vec(&self, name: &'static str, labels: Labels<'_>) -> Option<GaugeVec> {
        let mut gauges = self.gauges.lock();
        if let Some(existing) = gauges.get(name) {
            return Some(existing.clone());
        }
        let label_names: Vec<&str> = labels.iter().map(|(k, _)| *k).collect();
        let vec = GaugeVec::new(Opts::new(name, name), &label_names).ok()?;
        if let Err(e) = self.registry.register(Box::new(vec.clone())) {
            warn!("Failed to register gauge {}: {}", name, e);
            return None;
        }
        gauges.insert(name, vec.clone());
        Some(vec)
    }
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn incr_counter(&self, name: &'static str, labels: Labels<'_>, by: u64) {
        if let Some(vec) = self.counter_vec(name, labels) {
            let values: Vec<&str> = labels.iter().map(|(_, v)| *v).collect();
            match vec.get_metric_with_label_values(&values) {
                Ok(counter) => counter.inc_by(by),
                Err(e) => warn!("Counter {} rejected labels: {}", name, e),
            }
        }
    }

    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        if let Some(vec) = self.gauge_vec(name, labels) {
            let values: Vec<&str> = labels.iter().map(|(_, v)| *v).collect();
            match vec.get_metric_with_label_values(&values) {
                Ok(gauge) => gauge.set(value),
                Err(e) => warn!("Gauge {} rejected labels: {}", name, e),
            }
        }
    }
}

fn series_key(name: &str, labels: Labels<'_>) -> String {
    let mut key = name.to_string();
    for (k, v) in labels {
        key.push_str(&format!(",{}={}", k, v));
    }
    key
}

/// Recording sink for tests.
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, f64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of one labelled counter series; labels must be given in the
    /// order the component emits them.
    pub fn counter(&self, name: &str, labels: Labels<'_>) -> u64 {
        self.counters
            .lock()
            .get(&series_key(name, labels))
            .copied()
            .unwrap_or(0)
    }

    /// Sum over every series of a counter regardless of labels.
    pub fn counter_total(&self, name: &str) -> u64 {
        let prefix = format!("{},", name);
        self.counters
            .lock()
            .iter()
            .filter(|(k, _)| k.as_str() == name || k.starts_with(&prefix))
            .map(|(_, v)| *v)
            .sum()
    }

    pub fn gauge(&self, name: &str, labels: Labels<'_>) -> Option<f64> {
        self.gauges.lock().get(&series_key(name, labels)).copied()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn incr_counter(&self, name: &'static str, labels: Labels<'_>, by: u64) {
        *self
            .counters
            .lock()
            .entry(series_key(name, labels))
            .or_insert(0) += by;
    }

    fn set_gauge(&self, name: &'static str, labels: Labels<'_>, value: f64) {
        self.gauges.lock().insert(series_key(name, labels), value);
    }
}
