//! Shared statistics registry.
//!
//! One [`Statistics`] instance is shared by every forked instance of a
//! runtime. A metric name is set up once per counter kind; every
//! [`Statistics::add`] then feeds all counters configured for that name.
//! Values with different tag sets are tracked separately.
//!
//! | Kind | Flush value |
//! |------|-------------|
//! | `Abs` | Running sum |
//! | `Avg` | Mean of all added values |
//! | `Per(d)` | Sum since last flush, scaled to a rate per `d` |
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use wsev::stats::{CounterKind, Statistics};
//!
//! let stats = Statistics::new();
//! stats.setup("messages", CounterKind::Abs);
//! stats.setup("messages", CounterKind::Per(Duration::from_secs(1)));
//! stats.add("messages", 1.0).unwrap();
//!
//! let summary = stats.flush();
//! assert_eq!(summary.len(), 2);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::error::{Error, Result};

/// Metric tags.
pub type Tags = BTreeMap<String, String>;

// ============================================================================
// CounterKind
// ============================================================================

/// Aggregation applied by a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterKind {
    /// Running sum.
    Abs,
    /// Running mean.
    Avg,
    /// Rate per interval.
    Per(Duration),
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abs => f.write_str("abs"),
            Self::Avg => f.write_str("avg"),
            Self::Per(interval) => write!(f, "per {interval:?}"),
        }
    }
}

// ============================================================================
// Counter
// ============================================================================

#[derive(Debug)]
enum Counter {
    Abs { sum: f64 },
    Avg { sum: f64, count: u64 },
    Per { sum: f64, interval: Duration, stamp: Instant },
}

impl Counter {
    fn new(kind: CounterKind) -> Self {
        match kind {
            CounterKind::Abs => Self::Abs { sum: 0.0 },
            CounterKind::Avg => Self::Avg { sum: 0.0, count: 0 },
            CounterKind::Per(interval) => Self::Per {
                sum: 0.0,
                interval,
                stamp: Instant::now(),
            },
        }
    }

    fn add(&mut self, value: f64) {
        match self {
            Self::Abs { sum } | Self::Per { sum, .. } => *sum += value,
            Self::Avg { sum, count } => {
                *sum += value;
                *count += 1;
            }
        }
    }

    fn flush(&mut self) -> f64 {
        match self {
            Self::Abs { sum } => *sum,
            Self::Avg { sum, count } => {
                if *count == 0 {
                    0.0
                } else {
                    *sum / *count as f64
                }
            }
            Self::Per {
                sum,
                interval,
                stamp,
            } => {
                let windows = stamp.elapsed().as_secs_f64() / interval.as_secs_f64();
                let rate = if windows > 0.0 { *sum / windows } else { 0.0 };
                *sum = 0.0;
                *stamp = Instant::now();
                rate
            }
        }
    }
}

#[derive(Debug)]
struct Metric {
    tags: Tags,
    counters: Vec<(CounterKind, Counter)>,
}

#[derive(Debug, Default)]
struct Registry {
    kinds: FxHashMap<String, Vec<CounterKind>>,
    metrics: FxHashMap<String, Vec<Metric>>,
}

// ============================================================================
// Statistics
// ============================================================================

/// Thread-safe counter registry. Cloning shares the registry.
#[derive(Clone, Default)]
pub struct Statistics {
    inner: Arc<Mutex<Registry>>,
}

impl Statistics {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a counter of `kind` to metric `name`.
    ///
    /// Setting up the same kind twice is a no-op.
    pub fn setup(&self, name: impl Into<String>, kind: CounterKind) {
        let mut registry = self.inner.lock();
        let kinds = registry.kinds.entry(name.into()).or_default();
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }

    /// Adds `value` to the untagged series of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `name` was never set up.
    pub fn add(&self, name: &str, value: f64) -> Result<()> {
        self.add_tagged(name, value, &Tags::new())
    }

    /// Adds `value` to the series of `name` carrying `tags`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `name` was never set up.
    pub fn add_tagged(&self, name: &str, value: f64, tags: &Tags) -> Result<()> {
        let mut registry = self.inner.lock();
        let Registry { kinds, metrics } = &mut *registry;

        let kinds = kinds
            .get(name)
            .ok_or_else(|| Error::config(format!("metric {name:?} has no counters")))?;

        let series = metrics.entry(name.to_string()).or_default();
        if let Some(metric) = series.iter_mut().find(|m| m.tags == *tags) {
            // Kinds set up after the series was created join it here.
            for kind in kinds {
                if !metric.counters.iter().any(|(k, _)| k == kind) {
                    metric.counters.push((*kind, Counter::new(*kind)));
                }
            }
            for (_, counter) in &mut metric.counters {
                counter.add(value);
            }
            return Ok(());
        }

        let mut metric = Metric {
            tags: tags.clone(),
            counters: kinds.iter().map(|k| (*k, Counter::new(*k))).collect(),
        };
        for (_, counter) in &mut metric.counters {
            counter.add(value);
        }
        series.push(metric);
        Ok(())
    }

    /// Returns `true` if `name` has been set up.
    #[must_use]
    pub fn is_setup(&self, name: &str) -> bool {
        self.inner.lock().kinds.contains_key(name)
    }

    /// Reads every counter, restarting `Per` windows.
    #[must_use]
    pub fn flush(&self) -> Summary {
        let mut registry = self.inner.lock();

        let mut results: Vec<SummaryEntry> = registry
            .metrics
            .iter_mut()
            .flat_map(|(name, series)| {
                series.iter_mut().flat_map(move |metric| {
                    let tags = metric.tags.clone();
                    metric.counters.iter_mut().map(move |(kind, counter)| SummaryEntry {
                        name: name.clone(),
                        kind: kind.to_string(),
                        value: counter.flush(),
                        tags: tags.clone(),
                    })
                })
            })
            .collect();

        results.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| a.tags.cmp(&b.tags))
                .then_with(|| a.kind.cmp(&b.kind))
        });
        Summary { results }
    }
}

impl fmt::Debug for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.lock();
        f.debug_struct("Statistics")
            .field("metrics", &registry.kinds.len())
            .finish()
    }
}

// ============================================================================
// Summary
// ============================================================================

/// One flushed counter value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryEntry {
    /// Metric name.
    pub name: String,
    /// Counter kind, e.g. `"abs"` or `"per 1s"`.
    pub kind: String,
    /// Flushed value.
    pub value: f64,
    /// Series tags.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: Tags,
}

/// Flushed values of every counter, sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    /// Flushed entries.
    pub results: Vec<SummaryEntry>,
}

impl Summary {
    /// Returns the number of entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Returns `true` if nothing was recorded.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Returns the first untagged value of `name` with counter `kind`.
    #[must_use]
    pub fn value(&self, name: &str, kind: CounterKind) -> Option<f64> {
        let kind = kind.to_string();
        self.results
            .iter()
            .find(|e| e.name == name && e.kind == kind && e.tags.is_empty())
            .map(|e| e.value)
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.results {
            write!(f, "{} ({}): {:.3}", entry.name, entry.kind, entry.value)?;
            if !entry.tags.is_empty() {
                let tags: Vec<String> = entry.tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
                write!(f, " [{}]", tags.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_without_setup_fails() {
        let stats = Statistics::new();
        let err = stats.add("missing", 1.0).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_abs_and_avg() {
        let stats = Statistics::new();
        stats.setup("latency", CounterKind::Abs);
        stats.setup("latency", CounterKind::Avg);
        for v in [1.0, 2.0, 6.0] {
            stats.add("latency", v).unwrap();
        }

        let summary = stats.flush();
        assert_eq!(summary.value("latency", CounterKind::Abs), Some(9.0));
        assert_eq!(summary.value("latency", CounterKind::Avg), Some(3.0));

        // Abs and Avg keep accumulating across flushes.
        stats.add("latency", 3.0).unwrap();
        let summary = stats.flush();
        assert_eq!(summary.value("latency", CounterKind::Abs), Some(12.0));
    }

    #[test]
    fn test_per_restarts_window() {
        let stats = Statistics::new();
        let kind = CounterKind::Per(Duration::from_millis(1));
        stats.setup("sent", kind);
        stats.add("sent", 10.0).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        let first = stats.flush().value("sent", kind).unwrap();
        assert!(first > 0.0);
        assert!(first <= 2.0 + f64::EPSILON);

        let second = stats.flush().value("sent", kind).unwrap();
        assert!(second.abs() < f64::EPSILON);
    }

    #[test]
    fn test_tags_split_series() {
        let stats = Statistics::new();
        stats.setup("bytes", CounterKind::Abs);

        let mut tags = Tags::new();
        tags.insert("conn".into(), "a".into());
        stats.add_tagged("bytes", 5.0, &tags).unwrap();
        stats.add("bytes", 1.0).unwrap();

        let summary = stats.flush();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary.value("bytes", CounterKind::Abs), Some(1.0));
    }

    #[test]
    fn test_summary_serializes() {
        let stats = Statistics::new();
        stats.setup("n", CounterKind::Abs);
        stats.add("n", 2.0).unwrap();

        let json = serde_json::to_value(stats.flush()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"results": [{"name": "n", "kind": "abs", "value": 2.0}]})
        );
        assert_eq!(stats.flush().to_string(), "n (abs): 2.000\n");
    }
}
