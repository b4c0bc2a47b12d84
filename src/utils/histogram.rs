//! Lightweight in-process metric histograms.
//!
//! The scheduler reports latency and count metrics under dotted names such as
//! `TaskLatency.MyScheduler.UserVisible`. Samples are aggregated into
//! count/sum/min/max summaries held in a process-global registry; tests read
//! them back through [`snapshot`].

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

/// Aggregated samples for one named histogram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistogramData {
    /// Number of recorded samples
    pub count: u64,
    /// Sum of all samples
    pub sum: u64,
    /// Smallest recorded sample
    pub min: u64,
    /// Largest recorded sample
    pub max: u64,
}

impl HistogramData {
    fn record(&mut self, sample: u64) {
        self.count += 1;
        self.sum += sample;
        self.min = self.min.min(sample);
        self.max = self.max.max(sample);
    }

    /// Mean sample value, zero when empty.
    pub fn mean(&self) -> u64 {
        if self.count == 0 { 0 } else { self.sum / self.count }
    }
}

impl Default for HistogramData {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0,
            min: u64::MAX,
            max: 0,
        }
    }
}

/// Global histogram registry.
static REGISTRY: Lazy<RwLock<HashMap<String, HistogramData>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn record_sample(name: &str, sample: u64) {
    let mut registry = REGISTRY.write().unwrap();
    registry.entry(name.to_string()).or_default().record(sample);
}

/// Records a duration sample (in microseconds) under `name`.
pub fn record_time(name: &str, duration: Duration) {
    record_sample(name, duration.as_micros() as u64);
}

/// Records a plain count sample under `name`.
pub fn record_count(name: &str, value: u64) {
    record_sample(name, value);
}

/// Returns the aggregated data for `name`, if any sample was recorded.
pub fn snapshot(name: &str) -> Option<HistogramData> {
    REGISTRY.read().unwrap().get(name).copied()
}

/// Returns the names of all histograms with at least one sample, sorted.
pub fn snapshot_names() -> Vec<String> {
    let mut names: Vec<String> = REGISTRY.read().unwrap().keys().cloned().collect();
    names.sort();
    names
}
