//! Motors: one dispatch loop per OS thread.
//!
//! A motor owns one slot of an activity's thread pool. It pulls cycle
//! segments from the shared input, applies the slot's action to each cycle,
//! and records a metric per completed cycle. Lifecycle is tracked through a
//! small atomic state machine so the executor can observe and steer every
//! slot without locks.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::activity::ActivityDef;
use crate::aggregate::MetricsSink;
use crate::error::{EngineError, Result};
use crate::input::CycleInput;
use crate::metric::CycleMetric;

/// Lifecycle state of one motor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    /// Constructed, thread not yet running.
    Initialized = 0,
    /// Dispatch loop running.
    Started = 1,
    /// Stop requested; the loop will exit at the next cycle boundary.
    Stopping = 2,
    /// Stopped on request; may be re-armed.
    Stopped = 3,
    /// Input exhausted; may be re-armed after the def changes.
    Finished = 4,
}

impl SlotState {
    /// Compact status code, used in pool status strings.
    pub fn code(&self) -> &'static str {
        match self {
            SlotState::Initialized => "I>",
            SlotState::Started => "S>",
            SlotState::Stopping => "-\\",
            SlotState::Stopped => "_.",
            SlotState::Finished => "F.",
        }
    }

    /// The legal transition table. Everything not listed is illegal.
    pub fn can_transition_to(self, to: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, to),
            (Initialized, Started)
                | (Started, Stopping)
                | (Started, Finished)
                | (Stopping, Stopped)
                | (Stopped, Started)
                | (Finished, Started)
        )
    }

    fn from_u8(raw: u8) -> SlotState {
        match raw {
            0 => SlotState::Initialized,
            1 => SlotState::Started,
            2 => SlotState::Stopping,
            3 => SlotState::Stopped,
            _ => SlotState::Finished,
        }
    }
}

/// Atomic, transition-validated state cell for one slot.
pub struct SlotStateTracker {
    slot: usize,
    state: AtomicU8,
}

impl SlotStateTracker {
    pub fn new(slot: usize) -> Self {
        Self {
            slot,
            state: AtomicU8::new(SlotState::Initialized as u8),
        }
    }

    pub fn get(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `to`, validating against the transition table. Illegal
    /// transitions leave the state untouched.
    pub fn enter(&self, to: SlotState) -> Result<()> {
        let mut cur = self.get();
        loop {
            if !cur.can_transition_to(to) {
                return Err(EngineError::InvalidTransition { from: cur, to });
            }
            match self.state.compare_exchange(
                cur as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::trace!(slot = self.slot, from = ?cur, ?to, "slot state");
                    return Ok(());
                }
                Err(seen) => cur = SlotState::from_u8(seen),
            }
        }
    }
}

/// Outcome of applying an action to a cycle.
///
/// `result` is a caller-defined status code where 0 means success; `complete`
/// tells the motor whether the cycle needs another phase. The motor re-invokes
/// the same cycle until an outcome is complete, pacing each continuation
/// through the input's rate limiter when one is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub result: i32,
    pub complete: bool,
}

impl Applied {
    /// A completed cycle with status 0.
    pub fn ok() -> Self {
        Self::complete(0)
    }

    /// A completed cycle with the given status code.
    pub fn complete(result: i32) -> Self {
        Self {
            result,
            complete: true,
        }
    }

    /// A phase boundary: the motor will invoke the same cycle again.
    pub fn incomplete(result: i32) -> Self {
        Self {
            result,
            complete: false,
        }
    }
}

/// Errors actions raise; carried as the source of `EngineError::Action`.
pub type ActionError = Box<dyn std::error::Error + Send + Sync>;

/// Per-slot work applied to each cycle.
///
/// One action instance belongs to one motor, so methods take `&mut self`;
/// state shared between slots belongs in whatever the action closes over.
pub trait Action: Send {
    /// One-time setup on the motor thread, before the first cycle.
    fn init(&mut self) -> std::result::Result<(), ActionError> {
        Ok(())
    }

    fn apply(&mut self, cycle: u64) -> std::result::Result<Applied, ActionError>;

    /// Observe a changed definition. Default: ignored.
    fn on_def_update(&mut self, _def: &ActivityDef) {}
}

impl<F> Action for F
where
    F: FnMut(u64) -> Applied + Send,
{
    fn apply(&mut self, cycle: u64) -> std::result::Result<Applied, ActionError> {
        Ok(self(cycle))
    }
}

/// One slot's dispatch loop plus the state it runs against.
pub struct Motor {
    slot: usize,
    def: Arc<ActivityDef>,
    input: Arc<dyn CycleInput>,
    action: Mutex<Box<dyn Action>>,
    tracker: SlotStateTracker,
    sink: Arc<dyn MetricsSink>,
    seen_version: AtomicU64,
}

impl Motor {
    pub fn new(
        slot: usize,
        def: Arc<ActivityDef>,
        input: Arc<dyn CycleInput>,
        action: Box<dyn Action>,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            slot,
            def,
            input,
            action: Mutex::new(action),
            tracker: SlotStateTracker::new(slot),
            sink,
            seen_version: AtomicU64::new(0),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn state(&self) -> SlotState {
        self.tracker.get()
    }

    /// Ask the loop to exit at its next cycle boundary. Only meaningful for
    /// a Started motor; anything else is left alone.
    pub fn request_stop(&self) {
        match self.tracker.enter(SlotState::Stopping) {
            Ok(()) => tracing::debug!(slot = self.slot, "stop requested"),
            Err(_) => tracing::trace!(
                slot = self.slot,
                state = ?self.tracker.get(),
                "stop request ignored"
            ),
        }
    }

    /// Forward a changed definition.
    ///
    /// The shared input is updated immediately. The action is only updated if
    /// its lock is free; a running loop picks the change up itself by version
    /// polling, which bounds staleness to one segment.
    pub fn on_def_update(&self, def: &ActivityDef) -> Result<()> {
        self.input.on_def_update(def)?;
        if let Ok(mut action) = self.action.try_lock() {
            action.on_def_update(def);
            self.seen_version.store(def.version(), Ordering::Release);
        }
        Ok(())
    }

    /// The dispatch loop. Runs on a dedicated thread until the input is
    /// exhausted, a stop is requested, or the action fails.
    pub fn run(&self) -> Result<()> {
        let result = self.dispatch();
        if let Err(err) = &result {
            tracing::error!(slot = self.slot, %err, "motor failed");
            self.park_after_failure();
        }
        result
    }

    /// Leave a failed slot parked rather than nominally running. The loop
    /// may have exited with the slot Started or already Stopping.
    fn park_after_failure(&self) {
        if self.tracker.get() == SlotState::Started {
            if let Err(err) = self.tracker.enter(SlotState::Stopping) {
                tracing::trace!(slot = self.slot, %err, "stop raced failure parking");
            }
        }
        if self.tracker.get() == SlotState::Stopping {
            if let Err(err) = self.tracker.enter(SlotState::Stopped) {
                tracing::warn!(slot = self.slot, %err, "could not park failed motor");
            }
        }
    }

    fn dispatch(&self) -> Result<()> {
        let rearmed = self.tracker.get() == SlotState::Finished;
        self.tracker.enter(SlotState::Started)?;
        if rearmed {
            let (done, total) = self.input.progress();
            if done >= total {
                tracing::warn!(
                    slot = self.slot,
                    "motor re-armed against an exhausted input; it will finish immediately"
                );
            }
        }

        let mut action = self.action.lock().unwrap();
        action
            .init()
            .map_err(|source| EngineError::ActionInit {
                slot: self.slot,
                source,
            })?;

        let mut stride = self.def.stride()?;
        self.seen_version.store(self.def.version(), Ordering::Release);
        tracing::debug!(slot = self.slot, stride, "motor started");

        while self.tracker.get() == SlotState::Started {
            let version = self.def.version();
            if self.seen_version.swap(version, Ordering::AcqRel) != version {
                stride = self.def.stride()?;
                action.on_def_update(&self.def);
                tracing::debug!(slot = self.slot, stride, version, "motor resynced");
            }

            let Some(segment) = self.input.next_segment(stride) else {
                // A stop request can race exhaustion; the stop wins and is
                // settled after the loop.
                if let Err(err) = self.tracker.enter(SlotState::Finished) {
                    if self.tracker.get() != SlotState::Stopping {
                        return Err(err);
                    }
                }
                break;
            };

            // A claimed cycle can never be issued again, so the whole
            // segment is applied even when a stop lands while it runs. Stops
            // take effect at the claim boundary above.
            for cycle in segment {
                let begin = Instant::now();
                let mut applied = self.apply(&mut **action, cycle)?;
                while !applied.complete {
                    if let Some(limiter) = self.input.rate_limiter() {
                        limiter.acquire();
                    }
                    applied = self.apply(&mut **action, cycle)?;
                }
                self.sink.record(&CycleMetric {
                    cycle,
                    latency: begin.elapsed(),
                    result: applied.result,
                });
            }
        }

        if self.tracker.get() == SlotState::Stopping {
            self.tracker.enter(SlotState::Stopped)?;
        }
        tracing::debug!(slot = self.slot, state = ?self.tracker.get(), "motor exited");
        Ok(())
    }

    fn apply(&self, action: &mut dyn Action, cycle: u64) -> Result<Applied> {
        action.apply(cycle).map_err(|source| EngineError::Action {
            slot: self.slot,
            cycle,
            source,
        })
    }
}
