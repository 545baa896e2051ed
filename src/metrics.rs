//! Running averages for scalar training metrics.
//!
//! Meters have no reset. A fresh [`MetricAggregator`] is created
//! for every epoch, while the run-wide aggregator lives for the whole
//! process.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Running accumulator for one scalar series.
///
/// # Example
/// ```
/// use dcgan_rs::metrics::AverageMeter;
///
/// let mut meter = AverageMeter::new();
/// meter.update(1.0);
/// meter.update(3.0);
/// assert_eq!(meter.val(), 3.0);
/// assert_eq!(meter.avg(), 2.0);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AverageMeter {
    /// Latest raw observation
    val: f64,
    /// Sum of all observations
    sum: f64,
    /// Number of observations
    count: usize,
}

impl AverageMeter {
    /// Create an empty meter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one observation. NaN and infinities are stored as-is.
    pub fn update(&mut self, value: f64) {
        self.val = value;
        self.sum += value;
        self.count += 1;
    }

    /// Latest observation, 0.0 before the first update.
    pub fn val(&self) -> f64 {
        self.val
    }

    /// Mean of all observations, 0.0 before the first update.
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Sum of all observations.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Number of observations.
    pub fn count(&self) -> usize {
        self.count
    }
}

/// A set of named [`AverageMeter`]s created on first use.
#[derive(Debug, Clone, Default)]
pub struct MetricAggregator {
    meters: BTreeMap<String, AverageMeter>,
}

impl MetricAggregator {
    /// Create an aggregator with no meters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value` under `name`.
    pub fn update(&mut self, name: &str, value: f64) {
        self.meters.entry(name.to_string()).or_default().update(value);
    }

    /// Meter for `name`, if it has been updated at least once.
    pub fn get(&self, name: &str) -> Option<&AverageMeter> {
        self.meters.get(name)
    }

    /// Latest observation of `name`.
    pub fn val(&self, name: &str) -> Option<f64> {
        self.get(name).map(AverageMeter::val)
    }

    /// Mean of `name`.
    pub fn avg(&self, name: &str) -> Option<f64> {
        self.get(name).map(AverageMeter::avg)
    }

    /// Iterate meters in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AverageMeter)> {
        self.meters.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.meters.is_empty()
    }
}
