use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::metric::{CycleMetric, Metric};

/// The `Aggregate` trait defines how raw [`Metric`] values are collected and
/// combined into an intermediate, mergeable representation.
///
/// Aggregates store compact raw data (counts, sums, extrema) and should not
/// compute final statistics such as averages or ratios; those belong in a
/// `Report`, which is converted from an aggregate. Keep `merge` associative
/// and commutative so worker-local aggregates can be combined in any order.
pub trait Aggregate
where
    Self: Serialize + DeserializeOwned + PartialOrd + PartialEq + Send + Sync + Debug + Clone,
{
    /// The metric type this aggregate summarizes.
    type Metric: Metric;

    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Aggregate multiple metrics into the current instance.
    fn aggregate(&mut self, metrics: &[Self::Metric]) {
        metrics.iter().for_each(|m| self.consume(m));
    }

    /// Incorporate a single metric into the aggregate.
    fn consume(&mut self, metric: &Self::Metric);

    /// Combine two different aggregates into one.
    fn merge(&mut self, other: Self);
}

/// The built-in accumulator over [`CycleMetric`] samples.
///
/// Tracks totals and extrema only; averages, throughput, and ratios are
/// derived later by `CycleReport`.
#[derive(Debug, Clone, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct CycleAggregate {
    pub count: u64,
    pub total_latency: Duration,
    pub min_latency: Option<Duration>,
    pub max_latency: Duration,
    /// Samples whose result code was nonzero.
    pub error_count: u64,
    pub result_counts: BTreeMap<i32, u64>,
}

impl Aggregate for CycleAggregate {
    type Metric = CycleMetric;

    fn new() -> Self {
        CycleAggregate::default()
    }

    fn consume(&mut self, metric: &Self::Metric) {
        self.count += 1;
        self.total_latency += metric.latency;
        self.min_latency = Some(match self.min_latency {
            Some(min) => min.min(metric.latency),
            None => metric.latency,
        });
        self.max_latency = self.max_latency.max(metric.latency);
        if metric.result != 0 {
            self.error_count += 1;
        }
        *self.result_counts.entry(metric.result).or_insert(0) += 1;
    }

    fn merge(&mut self, other: Self) {
        self.count += other.count;
        self.total_latency += other.total_latency;
        self.min_latency = match (self.min_latency, other.min_latency) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_latency = self.max_latency.max(other.max_latency);
        self.error_count += other.error_count;
        for (result, count) in other.result_counts {
            *self.result_counts.entry(result).or_insert(0) += count;
        }
    }
}

/// Where motors deliver their per-cycle samples.
///
/// One sink instance is shared by every motor of an activity, so `record`
/// takes `&self` and must be safe under concurrent callers.
pub trait MetricsSink: Send + Sync {
    fn record(&self, metric: &CycleMetric);
}

/// A mutex-guarded aggregate usable directly as a [`MetricsSink`].
#[derive(Debug, Default)]
pub struct SharedAggregate<A: Aggregate> {
    inner: Mutex<A>,
}

impl<A: Aggregate> SharedAggregate<A> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(A::new()),
        }
    }

    /// A copy of the aggregate as of now.
    pub fn snapshot(&self) -> A {
        self.inner.lock().unwrap().clone()
    }

    /// Drain the aggregate, leaving it empty.
    pub fn take(&self) -> A {
        std::mem::replace(&mut self.inner.lock().unwrap(), A::new())
    }

    pub fn merge(&self, other: A) {
        self.inner.lock().unwrap().merge(other);
    }
}

impl<A: Aggregate<Metric = CycleMetric>> MetricsSink for SharedAggregate<A> {
    fn record(&self, metric: &CycleMetric) {
        self.inner.lock().unwrap().consume(metric);
    }
}

/// A sink that drops every sample, for activities that only care about
/// side effects.
#[derive(Debug, Default)]
pub struct NullSink;

impl NullSink {
    pub fn shared() -> Arc<dyn MetricsSink> {
        Arc::new(NullSink)
    }
}

impl MetricsSink for NullSink {
    fn record(&self, _metric: &CycleMetric) {}
}
