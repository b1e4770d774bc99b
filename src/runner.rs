//! Step-loop driver with cooperative pause/stop control.
//!
//! The engine itself is synchronous; a hosting application that runs the
//! loop on a worker thread signals it through [`RunControl`]. Suspension
//! only ever happens between steps, so no step is left half-applied.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info};

use crate::sched::Scheduler;
use crate::sim::environment::Environment;
use crate::sim::metrics::RewardSet;

/// Shared pause/stop flags checked at step boundaries.
#[derive(Debug, Default)]
pub struct RunControl {
    stop: AtomicBool,
    pause: AtomicBool,
}

impl RunControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Requests a cooperative stop; the loop exits before the next step.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn pause(&self) {
        self.pause.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.pause.store(false, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::Acquire)
    }
}

/// Outcome of a run loop.
#[derive(Debug)]
pub struct RunSummary {
    /// Steps actually executed.
    pub steps: u64,
    /// Rewards from the final executed step.
    pub final_rewards: Option<RewardSet>,
    /// True when the loop exited on a stop request rather than completion.
    pub stopped_early: bool,
}

/// Runs the decide/step/learn loop until the horizon or a stop request.
///
/// While paused, the loop sleeps between step boundaries and keeps
/// re-checking both flags.
pub fn run(
    env: &mut Environment,
    scheduler: &mut Scheduler,
    control: Option<&RunControl>,
) -> RunSummary {
    let mut state = env.state();
    let mut steps = 0u64;
    let mut final_rewards = None;
    let mut stopped_early = false;

    loop {
        if let Some(control) = control {
            while control.is_paused() && !control.is_stopped() {
                std::thread::sleep(Duration::from_millis(20));
            }
            if control.is_stopped() {
                info!(steps, "run stopped by request");
                stopped_early = true;
                break;
            }
        }

        let decisions = scheduler.decide(&state);
        let (rewards, next_state, done) = env.step(&decisions);
        scheduler.learn(&state, &decisions, &rewards, &next_state);

        state = next_state;
        steps += 1;
        final_rewards = Some(rewards);
        debug!(steps, "loop step complete");

        if done {
            info!(steps, "simulation horizon reached");
            break;
        }
    }

    RunSummary {
        steps,
        final_rewards,
        stopped_early,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScenarioConfig;

    fn small_config() -> ScenarioConfig {
        let mut cfg = ScenarioConfig::baseline();
        cfg.simulation.days = 1;
        cfg.simulation.step_minutes = 60;
        cfg.users.count = 10;
        cfg.chargers.station_count = 2;
        cfg.chargers.chargers_per_station = 1;
        cfg
    }

    #[test]
    fn runs_to_horizon_without_control() {
        let cfg = small_config();
        let mut env = Environment::new(cfg.clone());
        env.reset();
        let mut scheduler = Scheduler::new(&cfg);
        let summary = run(&mut env, &mut scheduler, None);
        assert_eq!(summary.steps, 24);
        assert!(!summary.stopped_early);
        assert!(summary.final_rewards.is_some());
    }

    #[test]
    fn pre_stopped_control_runs_zero_steps() {
        let cfg = small_config();
        let mut env = Environment::new(cfg.clone());
        env.reset();
        let mut scheduler = Scheduler::new(&cfg);
        let control = RunControl::new();
        control.stop();
        let summary = run(&mut env, &mut scheduler, Some(control.as_ref()));
        assert_eq!(summary.steps, 0);
        assert!(summary.stopped_early);
    }

    #[test]
    fn pause_then_stop_exits_cleanly() {
        let cfg = small_config();
        let mut env = Environment::new(cfg.clone());
        env.reset();
        let mut scheduler = Scheduler::new(&cfg);
        let control = RunControl::new();
        control.pause();

        let stopper = Arc::clone(&control);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            stopper.stop();
        });

        let summary = run(&mut env, &mut scheduler, Some(control.as_ref()));
        let _ = handle.join();
        assert!(summary.stopped_early);
        assert_eq!(summary.steps, 0);
    }
}
