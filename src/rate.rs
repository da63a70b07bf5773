//! Nanosecond-precision rate limiting.
//!
//! The limiter keeps its scheduling state as a single atomic "ticks timeline":
//! an accumulator of nanoseconds granted to callers so far. Nanoseconds are the
//! native precision of the monotonic system timer, and integer nanoseconds are
//! low-error when converting the round ops/s numbers users tend to ask for.
//! Holding the whole schedule in one atomic allows the timeline to be compared
//! directly against the clock, and makes `fetch_add` the only serialization
//! point on the hot path.
//!
//! Each [`RateLimiter::acquire`] call claims a discrete time slice from the
//! timeline. If the claimed slice starts in the future the calling thread
//! sleeps until then; otherwise the call returns immediately with the
//! scheduling lag in nanoseconds.
//!
//! A single limiter type covers both disciplines. With `strictness == 0.0`
//! (the averaging discipline) unused schedule slack is preserved indefinitely,
//! so callers that fell behind may burst arbitrarily as long as the long-run
//! average holds. With `strictness > 0.0` a fraction of any lag larger than
//! one grant is folded back into the timeline on each late acquire ("gap
//! annealing"), decaying banked slack toward isochronous dispatch. The
//! fraction is a right-shift: `strictness == 1.0` anneals the full lag
//! immediately.
//!
//! Note that the ticks timeline cannot rate limit a single event. A grant
//! simply consumes nanoseconds from the schedule; previous allocations of the
//! timeline determine the start time of a subsequent caller, not the caller
//! itself.

use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Sentinel shift value meaning "never anneal" (the averaging discipline).
const ANNEAL_DISABLED: u32 = 64;

/// Nanoseconds in one second, as the timeline's currency.
const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

/// A monotonic nanosecond clock.
///
/// The limiter is written against this trait so schedule arithmetic can be
/// driven deterministically in tests.
pub trait NanoClock: Send + Sync {
    fn now_nanos(&self) -> u64;
}

/// The default clock: monotonic nanoseconds since the clock was created.
pub struct SystemNanoClock {
    origin: Instant,
}

impl Default for SystemNanoClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl NanoClock for SystemNanoClock {
    fn now_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// A target pace: operations per second plus a strictness in `[0.0, 1.0]`.
///
/// Strictness `0.0` selects the averaging discipline; `1.0` full isochronous
/// strictness. Values in between are quantized to a power-of-two annealing
/// fraction, snapping to the nearest offset below the requested ratio.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateSpec {
    pub ops_per_sec: f64,
    pub strictness: f64,
}

impl RateSpec {
    pub fn new(ops_per_sec: f64, strictness: f64) -> Self {
        Self {
            ops_per_sec,
            strictness,
        }
    }

    /// An averaging spec: slack is banked, bursts are allowed.
    pub fn average(ops_per_sec: f64) -> Self {
        Self::new(ops_per_sec, 0.0)
    }

    /// A fully strict spec: lag is annealed away on the next late acquire.
    pub fn strict(ops_per_sec: f64) -> Self {
        Self::new(ops_per_sec, 1.0)
    }
}

impl std::fmt::Display for RateSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ops/s, strictness {}", self.ops_per_sec, self.strictness)
    }
}

impl FromStr for RateSpec {
    type Err = EngineError;

    /// Parses `"<rate>"` or `"<rate>,<strictness>"` (`;` also accepted).
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split([',', ';']).collect();
        let invalid = |reason: &str| EngineError::InvalidParameter {
            name: "rate".into(),
            value: s.into(),
            reason: reason.into(),
        };
        match parts.as_slice() {
            [rate] => {
                let ops = rate
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| invalid("rate is not a number"))?;
                Ok(RateSpec::average(ops))
            }
            [rate, strictness] => {
                let ops = rate
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| invalid("rate is not a number"))?;
                let strictness = strictness
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| invalid("strictness is not a number"))?;
                Ok(RateSpec::new(ops, strictness))
            }
            _ => Err(invalid(
                "rate specs are either '<rate>' or '<rate>,<strictness>' as in 5000.0 or 5000.0,1.0",
            )),
        }
    }
}

/// Quantize a strictness ratio to a right-shift annealing amount.
///
/// `1.0` maps to shift 0 (fold the whole lag), `0.0` disables annealing, and
/// anything in between maps to the power of two at or below the ratio.
fn compensation_shift(strictness: f64) -> Result<u32> {
    if !(0.0..=1.0).contains(&strictness) {
        return Err(EngineError::InvalidParameter {
            name: "strictness".into(),
            value: strictness.to_string(),
            reason: "strictness must be between 0.0 and 1.0".into(),
        });
    }
    if strictness == 0.0 {
        Ok(ANNEAL_DISABLED)
    } else if strictness >= 1.0 {
        Ok(0)
    } else {
        let scaled = (strictness * i64::MAX as f64) as u64;
        Ok(scaled.leading_zeros().min(63))
    }
}

struct Inner {
    spec: RateSpec,
    started: bool,
}

/// A blocking, lock-free-on-the-hot-path rate limiter.
///
/// `acquire` is safe for unbounded concurrent callers; the only serialization
/// point is one `fetch_add` on the ticks timeline. Rate and strictness changes
/// mutate several related fields and therefore take a mutex, folding the
/// currently observed lag into a persistent accumulator and resetting the
/// timeline reference to "now" so the new rate takes effect immediately with
/// neither a burst nor a stall inherited from the old schedule.
pub struct RateLimiter {
    clock: Arc<dyn NanoClock>,
    /// The next nanosecond at which a new grant may begin.
    ticks_timeline: AtomicU64,
    /// Cached clock reading, refreshed only when the schedule demands it.
    last_seen_nanos: AtomicU64,
    /// Lag carried across rate changes, in nanoseconds (signed: callers may
    /// also run ahead of schedule at the instant of a change).
    accumulated_delay: AtomicI64,
    /// Nanoseconds granted per op at the current rate (hot-path copy).
    op_ticks: AtomicU64,
    /// Right-shift applied to lag on late acquires; `ANNEAL_DISABLED` for the
    /// averaging discipline.
    shift: AtomicU32,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(spec: RateSpec) -> Result<Self> {
        Self::with_clock(spec, Arc::new(SystemNanoClock::default()))
    }

    pub fn with_clock(spec: RateSpec, clock: Arc<dyn NanoClock>) -> Result<Self> {
        let op_ticks = Self::op_ticks_for(spec.ops_per_sec)?;
        let shift = compensation_shift(spec.strictness)?;
        let now = clock.now_nanos();
        Ok(Self {
            clock,
            ticks_timeline: AtomicU64::new(now),
            last_seen_nanos: AtomicU64::new(now),
            accumulated_delay: AtomicI64::new(0),
            op_ticks: AtomicU64::new(op_ticks),
            shift: AtomicU32::new(shift),
            inner: Mutex::new(Inner {
                spec,
                started: false,
            }),
        })
    }

    fn op_ticks_for(rate: f64) -> Result<u64> {
        if !rate.is_finite() || rate <= 0.0 || rate > NANOS_PER_SECOND {
            return Err(EngineError::InvalidRate(rate));
        }
        Ok((NANOS_PER_SECOND / rate) as u64)
    }

    /// Zero the delay accumulator and re-anchor the timeline at "now".
    ///
    /// Idempotent; later calls are no-ops once the limiter is started.
    pub fn start(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.started {
            inner.started = true;
            self.accumulated_delay.store(0, Ordering::Relaxed);
            self.reset_references();
        }
    }

    fn reset_references(&self) {
        let now = self.clock.now_nanos();
        self.ticks_timeline.store(now, Ordering::Relaxed);
        self.last_seen_nanos.store(now, Ordering::Relaxed);
    }

    /// Acquire one grant at the current rate.
    pub fn acquire(&self) -> u64 {
        self.acquire_nanos(self.op_ticks.load(Ordering::Relaxed))
    }

    /// Claim `nanos` from the schedule, blocking if the claimed slice starts
    /// in the future.
    ///
    /// Returns the nanoseconds by which this grant's ideal start time had
    /// already passed (0 for callers that are on pace or early). Under a
    /// strict spec, lag beyond one grant is partially folded back into the
    /// timeline so it cannot be banked indefinitely.
    pub fn acquire_nanos(&self, nanos: u64) -> u64 {
        let scheduled = self.ticks_timeline.fetch_add(nanos, Ordering::Relaxed);
        let mut now = self.last_seen_nanos.load(Ordering::Relaxed);

        // Throughput optimization: only consult the clock when the cached
        // reading cannot prove the caller is late.
        if now < scheduled {
            now = self.clock.now_nanos();
            self.last_seen_nanos.store(now, Ordering::Relaxed);
        }

        if now < scheduled {
            std::thread::sleep(Duration::from_nanos(scheduled - now));
            // No scheduling delay is attributable to this caller.
            return 0;
        }

        let lag = now - scheduled;
        let shift = self.shift.load(Ordering::Relaxed);
        if shift < ANNEAL_DISABLED && lag > nanos {
            self.ticks_timeline.fetch_add(lag >> shift, Ordering::Relaxed);
        }
        lag
    }

    /// Nanoseconds the timeline currently trails the clock (negative when
    /// callers are ahead of schedule).
    pub fn current_delay(&self) -> i64 {
        self.clock.now_nanos() as i64 - self.ticks_timeline.load(Ordering::Relaxed) as i64
    }

    /// Current delay plus lag folded in by previous rate changes.
    pub fn cumulative_delay(&self) -> i64 {
        self.current_delay() + self.accumulated_delay.load(Ordering::Relaxed)
    }

    pub fn rate(&self) -> f64 {
        self.inner.lock().unwrap().spec.ops_per_sec
    }

    pub fn spec(&self) -> RateSpec {
        self.inner.lock().unwrap().spec
    }

    /// Nanoseconds granted per op at the current rate.
    pub fn op_nanos(&self) -> u64 {
        self.op_ticks.load(Ordering::Relaxed)
    }

    /// The effective annealing shift, or `None` under the averaging
    /// discipline. Exposed for observability and tests.
    pub fn annealing_shift(&self) -> Option<u32> {
        match self.shift.load(Ordering::Relaxed) {
            ANNEAL_DISABLED => None,
            s => Some(s),
        }
    }

    /// Change the target rate, keeping the current strictness.
    pub fn set_rate(&self, ops_per_sec: f64) -> Result<()> {
        let strictness = self.inner.lock().unwrap().spec.strictness;
        self.update(&RateSpec::new(ops_per_sec, strictness))
    }

    /// Apply a new rate spec in place.
    ///
    /// The observed lag is folded into the cumulative accumulator and the
    /// timeline is re-anchored at "now", so the change takes effect without
    /// inheriting schedule debt from the old rate.
    pub fn update(&self, spec: &RateSpec) -> Result<()> {
        let op_ticks = Self::op_ticks_for(spec.ops_per_sec)?;
        let shift = compensation_shift(spec.strictness)?;

        let mut inner = self.inner.lock().unwrap();
        if inner.spec == *spec {
            return Ok(());
        }
        tracing::info!(
            old = %inner.spec,
            new = %spec,
            op_nanos = op_ticks,
            "rate limiter updated"
        );
        self.accumulated_delay
            .fetch_add(self.current_delay(), Ordering::Relaxed);
        self.op_ticks.store(op_ticks, Ordering::Relaxed);
        self.shift.store(shift, Ordering::Relaxed);
        inner.spec = *spec;
        self.reset_references();
        Ok(())
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("spec", &self.spec())
            .field("op_nanos", &self.op_nanos())
            .field("current_delay", &self.current_delay())
            .field("annealing_shift", &self.annealing_shift())
            .finish()
    }
}
