use std::fmt::Debug;
use std::time::Duration;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Metrics that can be collected and processed by the engine.
/// Metrics can be composed of other metrics as well.
pub trait Metric
where
    Self: Serialize + DeserializeOwned + PartialOrd + PartialEq + Send + Sync + Debug + Clone,
{
}

/// One sample per completed cycle: which cycle ran, how long all of its
/// phases took, and the action's result code (0 is success).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct CycleMetric {
    pub cycle: u64,
    pub latency: Duration,
    pub result: i32,
}

impl Metric for CycleMetric {}
