use std::fmt::Debug;
use std::time::Duration;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::aggregate::{Aggregate, CycleAggregate};

/// Final, human- or machine-oriented statistics derived from an [`Aggregate`].
pub trait Report<A>
where
    Self: Send + Sync + Debug + From<A> + Serialize + DeserializeOwned,
    A: Aggregate,
{
}

/// Delivers a finished [`Report`] to some sink (stdout, a file, a wire).
pub trait Reporter<A: Aggregate, R: Report<A>> {
    fn report(&self, report: R) -> Result<(), Box<dyn std::error::Error>>;
}

/// Derived statistics for one activity's cycle dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub count: u64,
    pub mean_latency: Duration,
    pub min_latency: Duration,
    pub max_latency: Duration,
    /// Fraction of cycles with a nonzero result code, in `[0.0, 1.0]`.
    pub error_ratio: f64,
    /// Cycles per second over the wall window, when one was supplied.
    pub ops_per_sec: Option<f64>,
}

impl From<CycleAggregate> for CycleReport {
    fn from(agg: CycleAggregate) -> Self {
        let mean_latency = if agg.count > 0 {
            agg.total_latency.div_f64(agg.count as f64)
        } else {
            Duration::ZERO
        };
        let error_ratio = if agg.count > 0 {
            agg.error_count as f64 / agg.count as f64
        } else {
            0.0
        };
        Self {
            count: agg.count,
            mean_latency,
            min_latency: agg.min_latency.unwrap_or(Duration::ZERO),
            max_latency: agg.max_latency,
            error_ratio,
            ops_per_sec: None,
        }
    }
}

impl CycleReport {
    /// Derive a report including throughput over the wall-clock window the
    /// aggregate was collected in.
    pub fn over_window(agg: CycleAggregate, window: Duration) -> Self {
        let count = agg.count;
        let mut report = Self::from(agg);
        if !window.is_zero() {
            report.ops_per_sec = Some(count as f64 / window.as_secs_f64());
        }
        report
    }
}

impl Report<CycleAggregate> for CycleReport {}

/// Prints reports in debug form.
pub struct StdoutReporter;

impl Reporter<CycleAggregate, CycleReport> for StdoutReporter {
    fn report(&self, report: CycleReport) -> Result<(), Box<dyn std::error::Error>> {
        println!("{report:#?}");
        Ok(())
    }
}

/// Prints reports as one JSON document per line.
pub struct JsonReporter;

impl Reporter<CycleAggregate, CycleReport> for JsonReporter {
    fn report(&self, report: CycleReport) -> Result<(), Box<dyn std::error::Error>> {
        println!("{}", serde_json::to_string(&report)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::CycleMetric;

    fn aggregate_of(latencies_ms: &[u64], errors: u64) -> CycleAggregate {
        let mut agg = CycleAggregate::new();
        for (i, &ms) in latencies_ms.iter().enumerate() {
            agg.consume(&CycleMetric {
                cycle: i as u64,
                latency: Duration::from_millis(ms),
                result: if (i as u64) < errors { 9 } else { 0 },
            });
        }
        agg
    }

    #[test]
    fn report_derives_means_and_ratios() {
        let report = CycleReport::from(aggregate_of(&[10, 20, 30, 40], 1));
        assert_eq!(report.count, 4);
        assert_eq!(report.mean_latency, Duration::from_millis(25));
        assert_eq!(report.min_latency, Duration::from_millis(10));
        assert_eq!(report.max_latency, Duration::from_millis(40));
        assert_eq!(report.error_ratio, 0.25);
        assert_eq!(report.ops_per_sec, None);
    }

    #[test]
    fn empty_aggregate_reports_zeroes() {
        let report = CycleReport::from(CycleAggregate::new());
        assert_eq!(report.count, 0);
        assert_eq!(report.mean_latency, Duration::ZERO);
        assert_eq!(report.error_ratio, 0.0);
    }

    #[test]
    fn throughput_over_a_window() {
        let report = CycleReport::over_window(aggregate_of(&[1, 1, 1, 1], 0), Duration::from_secs(2));
        assert_eq!(report.ops_per_sec, Some(2.0));
        let report = CycleReport::over_window(aggregate_of(&[1], 0), Duration::ZERO);
        assert_eq!(report.ops_per_sec, None);
    }

    #[test]
    fn reports_serialize_to_json() {
        let report = CycleReport::over_window(aggregate_of(&[5, 15], 1), Duration::from_secs(1));
        let json = serde_json::to_string(&report).unwrap();
        let back: CycleReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }
}
