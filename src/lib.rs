//! Flywheel — a programmable load-generation engine for Rust.
//!
//! Flywheel dispatches numbered cycles across a pool of motor threads at a
//! controlled rate. You describe an activity (its cycle interval, thread
//! count, stride, and target rate) as a compact parameter string, plug in an
//! action to run per cycle, and the engine takes care of pacing, exactly-once
//! dispatch, live reconfiguration, and metrics collection.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`ActivityDef`]: the live configuration unit — a versioned parameter map
//!   parsed from `k=v;k=v` specs. Mutate it at runtime, then notify the
//!   executor, and the running pool reshapes itself.
//! - [`CycleInput`]: a shared source of cycle numbers. [`TargetRateInput`]
//!   paces dispatch through a [`RateLimiter`]; [`LinkedInput`] trails another
//!   activity's input without ever passing it.
//! - [`RateLimiter`]: nanosecond-precision pacing with two disciplines in one
//!   type — averaging (slack is banked, bursts allowed) and strict (lag
//!   decays by a configurable fraction per late grant).
//! - [`Action`]: your per-cycle work. Returning an incomplete [`Applied`]
//!   makes the motor re-invoke the same cycle, so multi-phase operations
//!   need no state machine of their own.
//! - [`Motor`]: one dispatch loop per OS thread, with an observable
//!   lifecycle ([`SlotState`]).
//! - [`ActivityExecutor`]: owns the motor pool and reconciles it against the
//!   def, growing and shrinking mid-run without redelivering cycles.
//! - [`Metric`] / [`Aggregate`] / [`Report`] / [`Reporter`]: a pipeline from
//!   per-cycle samples to final statistics.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use flywheel::{
//!     ActionDispenser, Activity, ActivityDef, ActivityExecutor, Applied,
//!     CycleAggregate, CycleInput, CycleReport, MetricsSink, Reporter,
//!     SharedAggregate, StdoutReporter, TargetRateInput,
//! };
//!
//! fn main() -> flywheel::Result<()> {
//!     let def = Arc::new(ActivityDef::parse(
//!         "alias=demo;cycles=0..1000;threads=2;stride=10",
//!     )?);
//!     let input = Arc::new(TargetRateInput::new(&def)?);
//!     let sink = Arc::new(SharedAggregate::<CycleAggregate>::default());
//!
//!     let activity = Activity::builder()
//!         .name(def.alias())
//!         .def(Arc::clone(&def))
//!         .input(input as Arc<dyn CycleInput>)
//!         // One action instance per motor slot; this one just echoes.
//!         .actions(Arc::new(|_slot: usize| {
//!             Box::new(|_cycle: u64| Applied::ok()) as Box<dyn flywheel::Action>
//!         }) as Arc<dyn ActionDispenser>)
//!         .sink(Arc::clone(&sink) as Arc<dyn MetricsSink>)
//!         .build();
//!
//!     let executor = ActivityExecutor::new(activity);
//!     executor.start()?;
//!     executor.await_completion(Duration::from_secs(10))?;
//!
//!     let report = CycleReport::from(sink.snapshot());
//!     assert_eq!(report.count, 1000);
//!     StdoutReporter {}.report(report).ok();
//!     Ok(())
//! }
//! ```
//!
//! # Where to start
//!
//! - Read the docs for [`ActivityDef`], [`CycleInput`], and
//!   [`ActivityExecutor`]; between them they cover the whole lifecycle of an
//!   activity.
//! - [`RateLimiter`] documents the ticks-timeline scheduling model and the
//!   averaging/strict trade-off.

/// Activity definitions and the builder glue around them
pub mod activity;
/// Metric aggregators and sinks
pub mod aggregate;
/// Engine errors
pub mod error;
/// The executor that owns and reconciles the motor pool
pub mod executor;
/// Cycle inputs
pub mod input;
/// Single metrics
pub mod metric;
/// Per-thread dispatch loops and their state machine
pub mod motor;
/// Nanosecond-precision rate limiting
pub mod rate;
/// Reports and Reporters
pub mod report;

pub use activity::{Activity, ActivityDef};
pub use aggregate::{Aggregate, CycleAggregate, MetricsSink, NullSink, SharedAggregate};
pub use error::{EngineError, Result};
pub use executor::{ActionDispenser, ActivityExecutor};
pub use input::{CycleInput, CycleSegment, LinkedInput, TargetRateInput};
pub use metric::{CycleMetric, Metric};
pub use motor::{Action, Applied, Motor, SlotState, SlotStateTracker};
pub use rate::{NanoClock, RateLimiter, RateSpec, SystemNanoClock};
pub use report::{CycleReport, JsonReporter, Report, Reporter, StdoutReporter};
