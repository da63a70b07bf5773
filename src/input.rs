//! Cycle inputs: shared sources of work for motor threads.
//!
//! An input hands out cycle numbers from a half-open interval. Every cycle in
//! the interval is issued exactly once across all consumers, no matter how
//! many motor threads pull from the same input concurrently.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::activity::ActivityDef;
use crate::error::Result;
use crate::rate::RateLimiter;

/// How long a linked consumer parks when its upstream has not moved.
const LINKED_PARK: Duration = Duration::from_millis(1);

/// A contiguous half-open run of cycles `[start, end)`, granted to one motor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleSegment {
    pub start: u64,
    pub end: u64,
}

impl CycleSegment {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl IntoIterator for CycleSegment {
    type Item = u64;
    type IntoIter = std::ops::Range<u64>;

    fn into_iter(self) -> Self::IntoIter {
        self.start..self.end
    }
}

/// A shared source of cycle numbers.
///
/// Implementations are thread-safe through interior mutability; one input
/// instance is shared by every motor of an activity. The upper bound is
/// exclusive everywhere: issued values lie in `[min, max)`, and exhaustion is
/// reported as `None` without advancing any cursor.
pub trait CycleInput: Send + Sync {
    /// Claim the next `stride` cycles as one contiguous segment, or `None` if
    /// fewer than `stride` cycles remain.
    fn next_segment(&self, stride: u64) -> Option<CycleSegment>;

    /// Claim a single cycle.
    fn next_cycle(&self) -> Option<u64> {
        self.next_segment(1).map(|seg| seg.start)
    }

    /// Inclusive lower bound of the interval.
    fn min(&self) -> u64;

    /// Exclusive upper bound of the interval.
    fn max(&self) -> u64;

    /// The next cycle that would be issued.
    fn current(&self) -> u64;

    /// `(issued, total)` over the current interval.
    fn progress(&self) -> (u64, u64) {
        let total = self.max().saturating_sub(self.min());
        let done = self.current().saturating_sub(self.min()).min(total);
        (done, total)
    }

    /// Re-read interval bounds and pacing from a changed definition.
    fn on_def_update(&self, def: &ActivityDef) -> Result<()>;

    /// Ask the input to stop issuing cycles. Default: ignored.
    fn request_stop(&self) {}

    /// The limiter pacing this input, if any. Motors use it to pace
    /// multi-phase continuations of a single cycle.
    fn rate_limiter(&self) -> Option<Arc<RateLimiter>> {
        None
    }
}

/// The standard input: an atomic cursor over `[min, max)`, optionally paced
/// by a [`RateLimiter`].
///
/// The limiter is consulted once per grant before the cursor CAS, so blocking
/// for pace never holds up other consumers. A `targetrate` of zero (or none
/// at all) means unlimited; the limiter itself never accepts a zero rate, so
/// the "0 disables limiting" policy lives here.
pub struct TargetRateInput {
    cycle: AtomicU64,
    min_cycle: AtomicU64,
    max_cycle: AtomicU64,
    limiter: RwLock<Option<Arc<RateLimiter>>>,
}

impl TargetRateInput {
    pub fn new(def: &ActivityDef) -> Result<Self> {
        let (start, end) = def.cycle_bounds()?;
        let limiter = match def.target_rate()? {
            Some(spec) if spec.ops_per_sec > 0.0 => {
                let limiter = Arc::new(RateLimiter::new(spec)?);
                limiter.start();
                Some(limiter)
            }
            _ => None,
        };
        Ok(Self {
            cycle: AtomicU64::new(start),
            min_cycle: AtomicU64::new(start),
            max_cycle: AtomicU64::new(end),
            limiter: RwLock::new(limiter),
        })
    }

    /// An unlimited input over `[start, end)`, mostly for tests and linked
    /// upstreams built in code.
    pub fn unlimited(start: u64, end: u64) -> Self {
        Self {
            cycle: AtomicU64::new(start),
            min_cycle: AtomicU64::new(start),
            max_cycle: AtomicU64::new(end),
            limiter: RwLock::new(None),
        }
    }
}

impl CycleInput for TargetRateInput {
    fn next_segment(&self, stride: u64) -> Option<CycleSegment> {
        let max = self.max_cycle.load(Ordering::Relaxed);
        if self.cycle.load(Ordering::Relaxed).checked_add(stride)? > max {
            return None;
        }

        // Pace first: a caller blocked on the limiter must not hold a claim
        // on the cursor. The guard is dropped before the acquire so a rate
        // change never waits out a sleeping grant.
        let limiter = self.limiter.read().unwrap().clone();
        if let Some(limiter) = limiter {
            limiter.acquire_nanos(limiter.op_nanos() * stride);
        }

        let mut cur = self.cycle.load(Ordering::Relaxed);
        loop {
            let next = cur.checked_add(stride)?;
            if next > self.max_cycle.load(Ordering::Relaxed) {
                return None;
            }
            match self
                .cycle
                .compare_exchange(cur, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return Some(CycleSegment { start: cur, end: next }),
                Err(seen) => cur = seen,
            }
        }
    }

    fn min(&self) -> u64 {
        self.min_cycle.load(Ordering::Relaxed)
    }

    fn max(&self) -> u64 {
        self.max_cycle.load(Ordering::Relaxed)
    }

    fn current(&self) -> u64 {
        self.cycle.load(Ordering::Relaxed)
    }

    /// Apply changed bounds and pacing.
    ///
    /// The end bound moves first so the interval is never transiently empty
    /// when only the end grew. The cursor resets only when the start bound
    /// actually changed; an end-only extension lets dispatch continue from
    /// where it is.
    fn on_def_update(&self, def: &ActivityDef) -> Result<()> {
        let (start, end) = def.cycle_bounds()?;
        self.max_cycle.store(end, Ordering::Relaxed);
        if self.min_cycle.swap(start, Ordering::Relaxed) != start {
            self.cycle.store(start, Ordering::Relaxed);
        }

        match def.target_rate()? {
            Some(spec) if spec.ops_per_sec > 0.0 => {
                let mut limiter = self.limiter.write().unwrap();
                match limiter.as_deref() {
                    Some(existing) => existing.update(&spec)?,
                    None => {
                        tracing::info!(rate = %spec, "target rate enabled");
                        let fresh = Arc::new(RateLimiter::new(spec)?);
                        fresh.start();
                        *limiter = Some(fresh);
                    }
                }
            }
            _ => {
                let mut limiter = self.limiter.write().unwrap();
                if limiter.take().is_some() {
                    tracing::info!("target rate disabled");
                }
            }
        }
        Ok(())
    }

    fn rate_limiter(&self) -> Option<Arc<RateLimiter>> {
        self.limiter.read().unwrap().clone()
    }
}

/// An input that trails another activity's input.
///
/// Consumers advance freely while behind the last observed upstream position,
/// then re-sample the upstream and park briefly when it has not moved. The
/// invariant is that this input's cursor never passes the upstream's.
///
/// A linked input has no exhaustion of its own; it ends when
/// [`CycleInput::request_stop`] is called, after which `next_segment` returns
/// `None` without re-issuing any cycle.
pub struct LinkedInput {
    upstream: Arc<dyn CycleInput>,
    cycle: AtomicU64,
    /// Last observed upstream cursor; only ever moves forward.
    linked_point: AtomicU64,
    running: AtomicBool,
}

impl LinkedInput {
    pub fn new(upstream: Arc<dyn CycleInput>) -> Self {
        let at = upstream.current();
        Self {
            upstream,
            cycle: AtomicU64::new(at),
            linked_point: AtomicU64::new(at),
            running: AtomicBool::new(true),
        }
    }
}

impl CycleInput for LinkedInput {
    fn next_segment(&self, stride: u64) -> Option<CycleSegment> {
        loop {
            if !self.running.load(Ordering::Relaxed) {
                return None;
            }
            let cur = self.cycle.load(Ordering::Relaxed);
            let next = cur.checked_add(stride)?;
            if next <= self.linked_point.load(Ordering::Relaxed) {
                if self
                    .cycle
                    .compare_exchange(cur, next, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    return Some(CycleSegment { start: cur, end: next });
                }
                continue;
            }
            // Caught up to the last sample; take a fresh one.
            let observed = self.upstream.current();
            self.linked_point.fetch_max(observed, Ordering::Relaxed);
            if next > observed {
                std::thread::park_timeout(LINKED_PARK);
            }
        }
    }

    fn min(&self) -> u64 {
        self.upstream.min()
    }

    fn max(&self) -> u64 {
        self.upstream.max()
    }

    fn current(&self) -> u64 {
        self.cycle.load(Ordering::Relaxed)
    }

    /// Bounds and pacing belong to the upstream activity; nothing to apply.
    fn on_def_update(&self, _def: &ActivityDef) -> Result<()> {
        Ok(())
    }

    fn request_stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[test]
    fn segments_cover_the_interval_exactly_once() {
        let input = Arc::new(TargetRateInput::unlimited(0, 10_000));
        let seen = Arc::new(Mutex::new(HashSet::new()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let input = Arc::clone(&input);
                let seen = Arc::clone(&seen);
                std::thread::spawn(move || {
                    while let Some(seg) = input.next_segment(10) {
                        let mut seen = seen.lock().unwrap();
                        for cycle in seg {
                            assert!(seen.insert(cycle), "cycle {cycle} issued twice");
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 10_000);
        assert!(seen.iter().all(|&c| c < 10_000));
        assert_eq!(input.progress(), (10_000, 10_000));
    }

    #[test]
    fn exhaustion_does_not_advance_the_cursor() {
        let input = TargetRateInput::unlimited(0, 10);
        assert!(input.next_segment(10).is_some());
        assert_eq!(input.next_segment(1), None);
        assert_eq!(input.next_cycle(), None);
        assert_eq!(input.current(), 10);
    }

    #[test]
    fn partial_tail_is_not_issued() {
        // 3 cycles left but stride 5: nothing fits, nothing moves.
        let input = TargetRateInput::unlimited(0, 3);
        assert_eq!(input.next_segment(5), None);
        assert_eq!(input.current(), 0);
        assert_eq!(input.next_segment(3), Some(CycleSegment { start: 0, end: 3 }));
    }

    #[test]
    fn def_update_extends_the_end_without_resetting() {
        let def = ActivityDef::parse("alias=a;cycles=0..10").unwrap();
        let input = TargetRateInput::new(&def).unwrap();
        while input.next_cycle().is_some() {}
        assert_eq!(input.current(), 10);

        def.set_cycles(0, 20).unwrap();
        input.on_def_update(&def).unwrap();
        assert_eq!(input.next_cycle(), Some(10));
        assert_eq!(input.max(), 20);
    }

    #[test]
    fn def_update_with_new_start_resets_the_cursor() {
        let def = ActivityDef::parse("alias=a;cycles=0..10").unwrap();
        let input = TargetRateInput::new(&def).unwrap();
        input.next_cycle();

        def.set_cycles(100, 200).unwrap();
        input.on_def_update(&def).unwrap();
        assert_eq!(input.next_cycle(), Some(100));
        assert_eq!(input.progress(), (1, 100));
    }

    #[test]
    fn bounds_near_u64_max_exhaust_instead_of_overflowing() {
        let input = TargetRateInput::unlimited(u64::MAX - 5, u64::MAX);
        let mut issued = 0;
        while input.next_cycle().is_some() {
            issued += 1;
        }
        assert_eq!(issued, 5);
        assert_eq!(input.current(), u64::MAX);
        assert_eq!(input.next_segment(2), None);
        assert_eq!(input.current(), u64::MAX);
    }

    #[test]
    fn rate_change_is_not_blocked_by_a_sleeping_acquire() {
        use std::time::Instant;

        // One op per second: the second grant sleeps for ~1s.
        let def = ActivityDef::parse("alias=a;cycles=1000;targetrate=1").unwrap();
        let input = Arc::new(TargetRateInput::new(&def).unwrap());
        let worker = {
            let input = Arc::clone(&input);
            std::thread::spawn(move || {
                input.next_segment(1);
                input.next_segment(1);
            })
        };
        std::thread::sleep(Duration::from_millis(150));

        def.set_param("targetrate", "1000").unwrap();
        let begin = Instant::now();
        input.on_def_update(&def).unwrap();
        assert!(
            begin.elapsed() < Duration::from_millis(500),
            "rate change waited out a sleeping grant: {:?}",
            begin.elapsed()
        );
        worker.join().unwrap();
    }

    #[test]
    fn def_update_toggles_the_limiter() {
        let def = ActivityDef::parse("alias=a;cycles=1000;targetrate=100").unwrap();
        let input = TargetRateInput::new(&def).unwrap();
        let limiter = input.rate_limiter().unwrap();
        assert_eq!(limiter.rate(), 100.0);

        def.set_param("targetrate", "500,1.0").unwrap();
        input.on_def_update(&def).unwrap();
        assert_eq!(input.rate_limiter().unwrap().rate(), 500.0);

        def.set_param("targetrate", "0").unwrap();
        input.on_def_update(&def).unwrap();
        assert!(input.rate_limiter().is_none());
    }

    #[test]
    fn linked_never_passes_its_upstream() {
        let upstream = Arc::new(TargetRateInput::unlimited(0, 50_000));
        let linked = Arc::new(LinkedInput::new(Arc::clone(&upstream) as Arc<dyn CycleInput>));

        let consumer = {
            let linked = Arc::clone(&linked);
            std::thread::spawn(move || {
                let mut issued = 0u64;
                while linked.next_segment(1).is_some() {
                    issued += 1;
                }
                issued
            })
        };

        let mut upstream_issued = 0u64;
        while upstream.next_cycle().is_some() {
            upstream_issued += 1;
            assert!(linked.current() <= upstream.current());
        }
        assert_eq!(upstream_issued, 50_000);

        // Let the trailer drain, then end it.
        while linked.current() < upstream.current() {
            std::thread::sleep(Duration::from_millis(1));
        }
        linked.request_stop();
        let issued = consumer.join().unwrap();
        assert_eq!(issued, 50_000);
    }

    #[test]
    fn stopped_linked_input_reports_exhaustion() {
        let upstream = Arc::new(TargetRateInput::unlimited(0, 10));
        let linked = LinkedInput::new(Arc::clone(&upstream) as Arc<dyn CycleInput>);
        upstream.next_cycle();
        linked.request_stop();
        assert_eq!(linked.next_segment(1), None);
        assert_eq!(linked.current(), 0);
    }
}
