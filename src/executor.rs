//! The activity executor: owns the motor pool and reconciles it against the
//! activity definition.
//!
//! The executor never dispatches cycles itself. It spawns one named OS thread
//! per motor slot, resizes the pool when the def's thread target changes, and
//! propagates def changes to the input and every motor. All pool mutation is
//! serialized by the motors mutex.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::activity::Activity;
use crate::error::{EngineError, Result};
use crate::motor::{Action, Motor, SlotState};

/// How long reconciliation waits for a spawned motor to come up.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(1);
const STARTUP_POLL: Duration = Duration::from_millis(50);
const COMPLETION_POLL: Duration = Duration::from_millis(50);

/// Hands each new motor slot its own action instance.
///
/// Called once per slot at spawn time; re-armed slots keep the action they
/// were first given.
pub trait ActionDispenser: Send + Sync {
    fn dispense(&self, slot: usize) -> Box<dyn Action>;
}

impl<F> ActionDispenser for F
where
    F: Fn(usize) -> Box<dyn Action> + Send + Sync,
{
    fn dispense(&self, slot: usize) -> Box<dyn Action> {
        self(slot)
    }
}

struct MotorSlot {
    motor: Arc<Motor>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl MotorSlot {
    fn thread_live(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

/// Runs one [`Activity`]: a motor pool over a shared input.
pub struct ActivityExecutor {
    activity: Activity,
    motors: Mutex<Vec<MotorSlot>>,
    /// Slots shrunk out of the pool whose threads have not been joined yet.
    /// Their motors are Stopping and exit at their next claim boundary;
    /// joining them inside `reconcile` could block behind a parked or
    /// sleeping claim, so they are reaped by the completion paths instead.
    graveyard: Mutex<Vec<MotorSlot>>,
}

impl ActivityExecutor {
    pub fn new(activity: Activity) -> Self {
        Self {
            activity,
            motors: Mutex::new(Vec::new()),
            graveyard: Mutex::new(Vec::new()),
        }
    }

    pub fn activity(&self) -> &Activity {
        &self.activity
    }

    /// Validate the def and bring the pool up to its thread target. Every
    /// spawned motor is awaited to Started (or Finished, for an input that
    /// is already exhausted) before this returns.
    pub fn start(&self) -> Result<()> {
        self.activity.def.validate()?;
        let target = self.activity.def.threads()?;
        tracing::info!(
            activity = %self.activity.name,
            threads = target,
            cycles = %self.activity.def.cycle_summary(),
            "starting activity"
        );
        let mut motors = self.motors.lock().unwrap();
        self.reconcile(&mut motors, target)
    }

    /// Apply a changed definition: input first, then pool size, then each
    /// motor. Ordering matters twice over. The input must learn new bounds
    /// before any Finished motor is re-armed against it, and the pool must
    /// reach its new shape before motors observe the def.
    pub fn on_def_update(&self) -> Result<()> {
        let def = &self.activity.def;
        def.validate()?;
        tracing::info!(
            activity = %self.activity.name,
            version = def.version(),
            def = %**def,
            "applying definition change"
        );
        self.activity.input.on_def_update(def)?;

        let target = def.threads()?;
        let mut motors = self.motors.lock().unwrap();
        self.reconcile(&mut motors, target)?;
        for slot in motors.iter() {
            slot.motor.on_def_update(def)?;
        }
        Ok(())
    }

    fn reconcile(&self, motors: &mut MutexGuard<'_, Vec<MotorSlot>>, target: usize) -> Result<()> {
        if motors.len() != target {
            tracing::info!(
                activity = %self.activity.name,
                from = motors.len(),
                to = target,
                "resizing motor pool"
            );
        }
        // Shrink from the tail so surviving slot ids stay stable. Stops are
        // requested, never awaited here: the dropped motor may be parked on
        // an idle linked upstream or sleeping out a grant.
        while motors.len() > target {
            if let Some(slot) = motors.pop() {
                slot.motor.request_stop();
                self.graveyard.lock().unwrap().push(slot);
            }
        }

        while motors.len() < target {
            let slot_id = motors.len();
            let action = self.activity.actions.dispense(slot_id);
            let motor = Arc::new(Motor::new(
                slot_id,
                Arc::clone(&self.activity.def),
                Arc::clone(&self.activity.input),
                action,
                Arc::clone(&self.activity.sink),
            ));
            motors.push(MotorSlot {
                motor,
                handle: None,
            });
        }

        for slot in motors.iter_mut() {
            if slot.thread_live() {
                continue;
            }
            if let Some(handle) = slot.handle.take() {
                Self::reap(slot.motor.slot(), handle);
            }
            let state = slot.motor.state();
            let (done, total) = self.activity.input.progress();
            let runnable = match state {
                SlotState::Initialized | SlotState::Stopped => true,
                // Re-arm a finished motor only when there is work again.
                SlotState::Finished => done < total,
                SlotState::Started | SlotState::Stopping => false,
            };
            if runnable {
                self.spawn(slot)?;
            }
        }

        for slot in motors.iter_mut() {
            Self::await_startup(slot)?;
        }
        Ok(())
    }

    fn spawn(&self, slot: &mut MotorSlot) -> Result<()> {
        let slot_id = slot.motor.slot();
        let motor = Arc::clone(&slot.motor);
        let handle = std::thread::Builder::new()
            .name(format!("{}-motor-{slot_id}", self.activity.name))
            .spawn(move || motor.run())
            .map_err(|source| EngineError::Spawn {
                slot: slot_id,
                source,
            })?;
        tracing::debug!(activity = %self.activity.name, slot = slot_id, "motor thread spawned");
        slot.handle = Some(handle);
        Ok(())
    }

    /// Wait for a spawned motor to reach Started (or Finished). A pool that
    /// cannot fully staff itself is an error, not a degraded success.
    fn await_startup(slot: &mut MotorSlot) -> Result<()> {
        let deadline = Instant::now() + STARTUP_TIMEOUT;
        loop {
            let state = slot.motor.state();
            if matches!(state, SlotState::Started | SlotState::Finished) {
                return Ok(());
            }
            if slot.handle.as_ref().is_some_and(|h| h.is_finished()) {
                if let Some(handle) = slot.handle.take() {
                    return match handle.join() {
                        Ok(result) => result,
                        Err(_) => Err(EngineError::MotorPanicked {
                            slot: slot.motor.slot(),
                        }),
                    };
                }
            }
            if Instant::now() >= deadline {
                return Err(EngineError::StartupTimeout {
                    slot: slot.motor.slot(),
                    state,
                });
            }
            std::thread::sleep(STARTUP_POLL);
        }
    }

    fn reap(slot_id: usize, handle: JoinHandle<Result<()>>) {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(slot = slot_id, %err, "motor exited with error"),
            Err(_) => tracing::warn!(slot = slot_id, "motor thread panicked"),
        }
    }

    /// Request a cooperative stop of the input and every motor. Returns
    /// immediately; pair with [`await_completion`](Self::await_completion).
    pub fn stop(&self) {
        tracing::info!(activity = %self.activity.name, "stop requested");
        self.activity.input.request_stop();
        for slot in self.motors.lock().unwrap().iter() {
            slot.motor.request_stop();
        }
    }

    /// Stop, wait up to `grace` for motor threads to exit, then abandon any
    /// stragglers. Returns the number of motors that never reached Started.
    pub fn force_stop(&self, grace: Duration) -> usize {
        self.stop();
        let deadline = Instant::now() + grace;
        let mut motors = self.motors.lock().unwrap();
        let mut graveyard = self.graveyard.lock().unwrap();
        loop {
            if motors
                .iter()
                .chain(graveyard.iter())
                .all(|slot| !slot.thread_live())
            {
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(COMPLETION_POLL);
        }

        let mut never_started = 0;
        for slot in motors.iter_mut().chain(graveyard.iter_mut()) {
            if slot.thread_live() {
                tracing::warn!(slot = slot.motor.slot(), "abandoning unresponsive motor thread");
                drop(slot.handle.take());
            } else if let Some(handle) = slot.handle.take() {
                Self::reap(slot.motor.slot(), handle);
            }
            if slot.motor.state() == SlotState::Initialized {
                never_started += 1;
            }
        }
        graveyard.clear();
        never_started
    }

    /// Wait for every motor thread to exit, surfacing the first action error
    /// or panic. `EngineError::CompletionTimeout` if the pool is still
    /// running when `timeout` elapses.
    pub fn await_completion(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut motors = self.motors.lock().unwrap();
                let mut graveyard = self.graveyard.lock().unwrap();
                if motors
                    .iter()
                    .chain(graveyard.iter())
                    .all(|slot| !slot.thread_live())
                {
                    let mut first_error = None;
                    for slot in motors.iter_mut().chain(graveyard.iter_mut()) {
                        if let Some(handle) = slot.handle.take() {
                            let outcome = match handle.join() {
                                Ok(result) => result,
                                Err(_) => Err(EngineError::MotorPanicked {
                                    slot: slot.motor.slot(),
                                }),
                            };
                            if let Err(err) = outcome {
                                first_error.get_or_insert(err);
                            }
                        }
                    }
                    graveyard.clear();
                    return match first_error {
                        Some(err) => Err(err),
                        None => {
                            tracing::info!(activity = %self.activity.name, "activity complete");
                            Ok(())
                        }
                    };
                }
            }
            if Instant::now() >= deadline {
                return Err(EngineError::CompletionTimeout);
            }
            std::thread::sleep(COMPLETION_POLL);
        }
    }

    /// `(issued, total)` over the input's current interval.
    pub fn progress(&self) -> (u64, u64) {
        self.activity.input.progress()
    }

    pub fn motor_count(&self) -> usize {
        self.motors.lock().unwrap().len()
    }

    pub fn motor_states(&self) -> Vec<SlotState> {
        self.motors
            .lock()
            .unwrap()
            .iter()
            .map(|slot| slot.motor.state())
            .collect()
    }

    /// Compact pool status, one two-char code per slot, e.g. `"S>S>F."`.
    pub fn slot_status(&self) -> String {
        self.motor_states()
            .iter()
            .map(SlotState::code)
            .collect::<Vec<_>>()
            .concat()
    }

    pub fn is_running(&self) -> bool {
        self.motors
            .lock()
            .unwrap()
            .iter()
            .any(|slot| matches!(slot.motor.state(), SlotState::Started | SlotState::Stopping))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityDef;
    use crate::aggregate::{CycleAggregate, MetricsSink, SharedAggregate};
    use crate::input::{CycleInput, TargetRateInput};
    use crate::motor::Applied;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn executor_for(
        spec: &str,
    ) -> (Arc<ActivityDef>, Arc<SharedAggregate<CycleAggregate>>, ActivityExecutor) {
        let def = Arc::new(ActivityDef::parse(spec).unwrap());
        let input = Arc::new(TargetRateInput::new(&def).unwrap());
        let sink = Arc::new(SharedAggregate::<CycleAggregate>::default());
        let activity = Activity::builder()
            .name(def.alias())
            .def(Arc::clone(&def))
            .input(input as Arc<dyn CycleInput>)
            .actions(Arc::new(|_slot: usize| {
                Box::new(|_cycle: u64| Applied::ok()) as Box<dyn Action>
            }) as Arc<dyn ActionDispenser>)
            .sink(Arc::clone(&sink) as Arc<dyn MetricsSink>)
            .build();
        (def, sink, ActivityExecutor::new(activity))
    }

    #[test]
    fn pool_runs_to_completion() {
        let (_, sink, executor) = executor_for("alias=t;cycles=0..1000;threads=4");
        executor.start().unwrap();
        executor.await_completion(Duration::from_secs(5)).unwrap();
        assert_eq!(sink.snapshot().count, 1000);
        assert_eq!(executor.progress(), (1000, 1000));
        assert!(executor
            .motor_states()
            .iter()
            .all(|s| *s == SlotState::Finished));
        assert_eq!(executor.slot_status(), "F.F.F.F.");
    }

    #[test]
    fn dispenser_sees_each_slot_once() {
        let dispensed = Arc::new(AtomicUsize::new(0));
        let def = Arc::new(ActivityDef::parse("alias=t;cycles=0..100;threads=2").unwrap());
        let input = Arc::new(TargetRateInput::new(&def).unwrap());
        let counter = Arc::clone(&dispensed);
        let activity = Activity::builder()
            .name("t")
            .def(Arc::clone(&def))
            .input(input as Arc<dyn CycleInput>)
            .actions(Arc::new(move |_slot: usize| {
                counter.fetch_add(1, Ordering::Relaxed);
                Box::new(|_: u64| Applied::ok()) as Box<dyn Action>
            }) as Arc<dyn ActionDispenser>)
            .build();
        let executor = ActivityExecutor::new(activity);
        executor.start().unwrap();
        // A second start with an unchanged target dispenses nothing new.
        executor.start().unwrap();
        executor.await_completion(Duration::from_secs(5)).unwrap();
        assert_eq!(dispensed.load(Ordering::Relaxed), 2);
        assert_eq!(executor.motor_count(), 2);
    }

    #[test]
    fn pool_shrinks_from_the_tail() {
        let (def, _, executor) =
            executor_for("alias=t;cycles=0..2000000;threads=4;targetrate=50");
        executor.start().unwrap();
        assert_eq!(executor.motor_count(), 4);

        def.set_threads(2).unwrap();
        executor.on_def_update().unwrap();
        assert_eq!(executor.motor_count(), 2);
        assert!(executor.is_running());
        executor.stop();
        executor.await_completion(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn pool_grows_mid_run() {
        let (def, _, executor) =
            executor_for("alias=t;cycles=0..2000000;threads=2;targetrate=50");
        executor.start().unwrap();

        def.set_threads(5).unwrap();
        executor.on_def_update().unwrap();
        assert_eq!(executor.motor_count(), 5);
        assert!(executor
            .motor_states()
            .iter()
            .all(|s| *s == SlotState::Started));
        executor.stop();
        executor.await_completion(Duration::from_secs(5)).unwrap();
        assert!(!executor.is_running());
    }

    #[test]
    fn stop_is_cooperative_and_awaitable() {
        let (_, sink, executor) =
            executor_for("alias=t;cycles=0..2000000;threads=2;targetrate=200");
        executor.start().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        executor.stop();
        executor.await_completion(Duration::from_secs(5)).unwrap();
        let issued = sink.snapshot().count;
        assert!(issued > 0);
        assert!(issued < 2_000_000);
        assert!(executor
            .motor_states()
            .iter()
            .all(|s| *s == SlotState::Stopped));
    }

    #[test]
    fn force_stop_reports_motors_that_never_ran() {
        let (_, _, executor) = executor_for("alias=t;cycles=0..100;threads=2");
        // Before start the pool is empty, so nothing is counted.
        assert_eq!(executor.force_stop(Duration::from_millis(10)), 0);

        executor.start().unwrap();
        executor.await_completion(Duration::from_secs(5)).unwrap();
        assert_eq!(executor.force_stop(Duration::from_millis(10)), 0);
    }

    #[test]
    fn action_errors_surface_from_await_completion() {
        let def = Arc::new(ActivityDef::parse("alias=t;cycles=0..100;threads=1").unwrap());
        let input = Arc::new(TargetRateInput::new(&def).unwrap());
        let activity = Activity::builder()
            .name("t")
            .def(Arc::clone(&def))
            .input(input as Arc<dyn CycleInput>)
            .actions(Arc::new(|_slot: usize| {
                Box::new(|cycle: u64| {
                    if cycle == 50 {
                        // A nonzero result is not an error; fail via panic-free
                        // error path instead.
                        Applied::complete(1)
                    } else {
                        Applied::ok()
                    }
                }) as Box<dyn Action>
            }) as Arc<dyn ActionDispenser>)
            .build();
        let executor = ActivityExecutor::new(activity);
        executor.start().unwrap();
        executor.await_completion(Duration::from_secs(5)).unwrap();

        // And a genuinely failing action. It runs long enough for startup to
        // observe the motor before the failure lands.
        struct Failing;
        impl Action for Failing {
            fn apply(
                &mut self,
                cycle: u64,
            ) -> std::result::Result<Applied, crate::motor::ActionError> {
                std::thread::sleep(Duration::from_millis(5));
                if cycle >= 50 { Err("wire broke".into()) } else { Ok(Applied::ok()) }
            }
        }
        let def = Arc::new(ActivityDef::parse("alias=f;cycles=0..100;threads=1").unwrap());
        let input = Arc::new(TargetRateInput::new(&def).unwrap());
        let activity = Activity::builder()
            .name("f")
            .def(Arc::clone(&def))
            .input(input as Arc<dyn CycleInput>)
            .actions(Arc::new(|_slot: usize| Box::new(Failing) as Box<dyn Action>)
                as Arc<dyn ActionDispenser>)
            .build();
        let executor = ActivityExecutor::new(activity);
        executor.start().unwrap();
        let err = executor.await_completion(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, EngineError::Action { .. }));
    }
}
