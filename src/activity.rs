//! Activity definitions: the live configuration unit of the engine.
//!
//! An [`ActivityDef`] is a string parameter map with typed accessors, parsed
//! from compact `k=v;k=v` specs. It is shared between the owner that mutates
//! it and the executor, input, and motors that observe it. Observation is by
//! explicit notification: the owner mutates the def (bumping its version
//! counter), then calls `ActivityExecutor::on_def_update`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use typed_builder::TypedBuilder;

use crate::aggregate::{CycleAggregate, MetricsSink, SharedAggregate};
use crate::error::{EngineError, Result};
use crate::executor::ActionDispenser;
use crate::input::CycleInput;
use crate::rate::RateSpec;

pub const PARAM_ALIAS: &str = "alias";
pub const PARAM_CYCLES: &str = "cycles";
pub const PARAM_THREADS: &str = "threads";
pub const PARAM_STRIDE: &str = "stride";
pub const PARAM_TARGET_RATE: &str = "targetrate";

const DEFAULT_ALIAS: &str = "unnamed";

/// A named, versioned bag of activity parameters.
///
/// Writes that would leave the def invalid are rejected whole; readers never
/// observe a half-applied change. Every successful mutation bumps the version
/// counter, which motors poll to bound configuration staleness.
pub struct ActivityDef {
    params: RwLock<BTreeMap<String, String>>,
    version: AtomicU64,
}

impl ActivityDef {
    /// Parse a def from its compact form, e.g.
    /// `"alias=a;cycles=0..1000;threads=4;targetrate=100,1.0;stride=10"`.
    ///
    /// `cycles=N` is shorthand for `cycles=0..N`.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut params = BTreeMap::new();
        for entry in spec.split(';') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (name, value) = entry.split_once('=').ok_or_else(|| {
                EngineError::InvalidParameter {
                    name: entry.to_string(),
                    value: String::new(),
                    reason: "parameters take the form name=value".into(),
                }
            })?;
            params.insert(name.trim().to_string(), value.trim().to_string());
        }
        let def = Self {
            params: RwLock::new(params),
            version: AtomicU64::new(0),
        };
        def.validate()?;
        Ok(def)
    }

    /// Monotonic change counter; bumped by every successful mutation.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn alias(&self) -> String {
        self.get(PARAM_ALIAS)
            .unwrap_or_else(|| DEFAULT_ALIAS.to_string())
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.params.read().unwrap().get(name).cloned()
    }

    /// The cycle interval `[start, end)` as a single-lock snapshot.
    pub fn cycle_bounds(&self) -> Result<(u64, u64)> {
        let raw = self
            .get(PARAM_CYCLES)
            .unwrap_or_else(|| "0..1".to_string());
        Self::parse_bounds(&raw)
    }

    fn parse_bounds(raw: &str) -> Result<(u64, u64)> {
        let invalid = |reason: &str| EngineError::InvalidParameter {
            name: PARAM_CYCLES.into(),
            value: raw.into(),
            reason: reason.into(),
        };
        let (start, end) = match raw.split_once("..") {
            Some((start, end)) => (
                start
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| invalid("start cycle is not a number"))?,
                end.trim()
                    .parse::<u64>()
                    .map_err(|_| invalid("end cycle is not a number"))?,
            ),
            None => (
                0,
                raw.trim()
                    .parse::<u64>()
                    .map_err(|_| invalid("cycle count is not a number"))?,
            ),
        };
        if start > end {
            return Err(EngineError::InvalidCycleRange { start, end });
        }
        Ok((start, end))
    }

    /// Requested motor count; `auto` or absence means one per CPU.
    pub fn threads(&self) -> Result<usize> {
        match self.get(PARAM_THREADS) {
            None => Ok(num_cpus::get()),
            Some(raw) if raw == "auto" => Ok(num_cpus::get()),
            Some(raw) => {
                let threads =
                    raw.parse::<usize>()
                        .map_err(|_| EngineError::InvalidParameter {
                            name: PARAM_THREADS.into(),
                            value: raw.clone(),
                            reason: "threads must be a non-negative integer or 'auto'".into(),
                        })?;
                Ok(threads)
            }
        }
    }

    /// Cycles claimed per input grant. Defaults to 1.
    pub fn stride(&self) -> Result<u64> {
        match self.get(PARAM_STRIDE) {
            None => Ok(1),
            Some(raw) => raw.parse::<u64>().map_err(|_| EngineError::InvalidParameter {
                name: PARAM_STRIDE.into(),
                value: raw.clone(),
                reason: "stride must be a positive integer".into(),
            }),
        }
    }

    /// The requested pace, if any. A rate of 0 is returned as-is; inputs
    /// treat it as "unlimited".
    pub fn target_rate(&self) -> Result<Option<RateSpec>> {
        match self.get(PARAM_TARGET_RATE) {
            None => Ok(None),
            Some(raw) => raw.parse::<RateSpec>().map(Some),
        }
    }

    pub fn set_cycles(&self, start: u64, end: u64) -> Result<()> {
        if start > end {
            return Err(EngineError::InvalidCycleRange { start, end });
        }
        self.set_param(PARAM_CYCLES, &format!("{start}..{end}"))
    }

    pub fn set_threads(&self, threads: usize) -> Result<()> {
        self.set_param(PARAM_THREADS, &threads.to_string())
    }

    /// Set one parameter, rejecting the write if it would leave the def
    /// invalid.
    pub fn set_param(&self, name: &str, value: &str) -> Result<()> {
        let mut params = self.params.write().unwrap();
        let candidate = {
            let mut candidate = params.clone();
            candidate.insert(name.to_string(), value.to_string());
            candidate
        };
        Self::validate_params(&candidate)?;
        *params = candidate;
        self.version.fetch_add(1, Ordering::Release);
        tracing::debug!(name, value, version = self.version(), "activity def changed");
        Ok(())
    }

    /// Fail-fast whole-def validation, naming the offending parameter.
    pub fn validate(&self) -> Result<()> {
        Self::validate_params(&self.params.read().unwrap())
    }

    fn validate_params(params: &BTreeMap<String, String>) -> Result<()> {
        let (start, end) = match params.get(PARAM_CYCLES) {
            Some(raw) => Self::parse_bounds(raw)?,
            None => (0, 1),
        };

        let stride = match params.get(PARAM_STRIDE) {
            Some(raw) => raw.parse::<u64>().map_err(|_| EngineError::InvalidParameter {
                name: PARAM_STRIDE.into(),
                value: raw.clone(),
                reason: "stride must be a positive integer".into(),
            })?,
            None => 1,
        };
        let cycles = end - start;
        if stride == 0 || (cycles > 0 && cycles % stride != 0) {
            return Err(EngineError::InvalidStride { stride, cycles });
        }

        if let Some(raw) = params.get(PARAM_THREADS) {
            if raw != "auto" && raw.parse::<usize>().is_err() {
                return Err(EngineError::InvalidParameter {
                    name: PARAM_THREADS.into(),
                    value: raw.clone(),
                    reason: "threads must be a non-negative integer or 'auto'".into(),
                });
            }
        }

        if let Some(raw) = params.get(PARAM_TARGET_RATE) {
            let spec = raw.parse::<RateSpec>()?;
            if !spec.ops_per_sec.is_finite() || spec.ops_per_sec < 0.0 {
                return Err(EngineError::InvalidRate(spec.ops_per_sec));
            }
        }
        Ok(())
    }

    /// Human-oriented one-liner for logs, e.g. `0..1000 (1000 cycles)`.
    pub fn cycle_summary(&self) -> String {
        match self.cycle_bounds() {
            Ok((start, end)) => format!("{start}..{end} ({} cycles)", end - start),
            Err(_) => "invalid cycle bounds".to_string(),
        }
    }
}

impl std::fmt::Debug for ActivityDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityDef")
            .field("params", &*self.params.read().unwrap())
            .field("version", &self.version())
            .finish()
    }
}

impl std::fmt::Display for ActivityDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let params = self.params.read().unwrap();
        let mut first = true;
        for (name, value) in params.iter() {
            if !first {
                write!(f, ";")?;
            }
            write!(f, "{name}={value}")?;
            first = false;
        }
        Ok(())
    }
}

/// Everything an executor needs to run one activity.
#[derive(TypedBuilder)]
pub struct Activity {
    #[builder(setter(into))]
    pub name: String,
    pub def: Arc<ActivityDef>,
    pub input: Arc<dyn CycleInput>,
    pub actions: Arc<dyn ActionDispenser>,
    #[builder(default = Arc::new(SharedAggregate::<CycleAggregate>::default()))]
    pub sink: Arc<dyn MetricsSink>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_compact_form() {
        let def =
            ActivityDef::parse("alias=a;cycles=0..1000;threads=4;targetrate=100,1.0;stride=10")
                .unwrap();
        assert_eq!(def.alias(), "a");
        assert_eq!(def.cycle_bounds().unwrap(), (0, 1000));
        assert_eq!(def.threads().unwrap(), 4);
        assert_eq!(def.stride().unwrap(), 10);
        let rate = def.target_rate().unwrap().unwrap();
        assert_eq!(rate.ops_per_sec, 100.0);
        assert_eq!(rate.strictness, 1.0);
    }

    #[test]
    fn cycle_count_shorthand() {
        let def = ActivityDef::parse("cycles=500").unwrap();
        assert_eq!(def.cycle_bounds().unwrap(), (0, 500));
        assert_eq!(def.alias(), "unnamed");
    }

    #[test]
    fn defaults() {
        let def = ActivityDef::parse("alias=a").unwrap();
        assert_eq!(def.cycle_bounds().unwrap(), (0, 1));
        assert_eq!(def.stride().unwrap(), 1);
        assert_eq!(def.threads().unwrap(), num_cpus::get());
        assert!(def.target_rate().unwrap().is_none());
    }

    #[test]
    fn rejects_inverted_bounds() {
        assert!(matches!(
            ActivityDef::parse("cycles=10..5"),
            Err(EngineError::InvalidCycleRange { start: 10, end: 5 })
        ));
        let def = ActivityDef::parse("cycles=10").unwrap();
        assert!(def.set_cycles(7, 3).is_err());
    }

    #[test]
    fn rejects_stride_that_does_not_divide() {
        assert!(matches!(
            ActivityDef::parse("cycles=10;stride=3"),
            Err(EngineError::InvalidStride { stride: 3, cycles: 10 })
        ));
        assert!(ActivityDef::parse("cycles=10;stride=0").is_err());
        assert!(ActivityDef::parse("cycles=10;stride=5").is_ok());
    }

    #[test]
    fn invalid_writes_are_rejected_whole() {
        let def = ActivityDef::parse("cycles=100").unwrap();
        let before = def.version();
        assert!(def.set_param("stride", "7").is_err());
        assert_eq!(def.version(), before);
        assert_eq!(def.stride().unwrap(), 1);
    }

    #[test]
    fn mutation_bumps_the_version() {
        let def = ActivityDef::parse("cycles=100").unwrap();
        let v0 = def.version();
        def.set_cycles(0, 200).unwrap();
        def.set_threads(2).unwrap();
        assert_eq!(def.version(), v0 + 2);
    }

    #[test]
    fn malformed_entries_are_named() {
        let err = ActivityDef::parse("alias").unwrap_err();
        assert!(matches!(err, EngineError::InvalidParameter { .. }));
        assert!(ActivityDef::parse("threads=lots").is_err());
        assert!(ActivityDef::parse("targetrate=fast").is_err());
    }

    #[test]
    fn display_round_trips() {
        let def = ActivityDef::parse("alias=a;cycles=0..100;threads=2").unwrap();
        let reparsed = ActivityDef::parse(&def.to_string()).unwrap();
        assert_eq!(reparsed.alias(), "a");
        assert_eq!(reparsed.cycle_bounds().unwrap(), (0, 100));
        assert_eq!(reparsed.threads().unwrap(), 2);
    }
}
