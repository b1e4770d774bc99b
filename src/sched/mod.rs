//! Scheduling layer: one entry point dispatching to interchangeable
//! algorithms, with rule-based fallback on any algorithm error.

pub mod coordinated;
pub mod marl;
pub mod rule_based;
pub mod uncoordinated;

use std::collections::BTreeMap;

use rand::SeedableRng;
use rand::rngs::StdRng;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ScenarioConfig;
use crate::sim::metrics::RewardSet;
use crate::sim::{ChargerId, SimState, UserId};

/// Seed offset for the scheduler RNG, decorrelating it from the world RNG.
const SCHEDULER_SEED_OFFSET: u64 = 101;
/// Seed offset for the MARL exploration RNG.
const MARL_SEED_OFFSET: u64 = 202;

/// Assignment map produced by every algorithm.
pub type Decisions = BTreeMap<UserId, ChargerId>;

/// The available scheduling algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    RuleBased,
    Uncoordinated,
    CoordinatedMas,
    Marl,
}

impl Algorithm {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rule_based" => Some(Self::RuleBased),
            "uncoordinated" => Some(Self::Uncoordinated),
            "coordinated_mas" => Some(Self::CoordinatedMas),
            "marl" => Some(Self::Marl),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RuleBased => "rule_based",
            Self::Uncoordinated => "uncoordinated",
            Self::CoordinatedMas => "coordinated_mas",
            Self::Marl => "marl",
        }
    }
}

/// Recoverable algorithm failures; all of them trigger rule-based fallback
/// at the scheduler boundary instead of propagating.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("state has no chargers")]
    NoChargers,
    #[error("state has no users")]
    NoUsers,
    #[error("{0} subsystem is not initialized")]
    Uninitialized(&'static str),
}

/// Dispatching scheduler owning per-algorithm state.
pub struct Scheduler {
    algorithm: Algorithm,
    config: ScenarioConfig,
    mas: coordinated::MultiAgentSystem,
    marl: Option<marl::MarlSystem>,
    rng: StdRng,
}

impl Scheduler {
    /// Builds a scheduler for the configured algorithm.
    ///
    /// An unknown algorithm name degrades to rule-based with a warning
    /// rather than failing, matching the error policy of the engine.
    pub fn new(config: &ScenarioConfig) -> Self {
        let algorithm = match Algorithm::parse(&config.simulation.algorithm) {
            Some(a) => a,
            None => {
                warn!(
                    algorithm = %config.simulation.algorithm,
                    "unknown scheduling algorithm, using rule_based"
                );
                Algorithm::RuleBased
            }
        };
        info!(algorithm = algorithm.name(), "scheduler initialized");

        let seed = config.simulation.seed;
        let marl = (algorithm == Algorithm::Marl).then(|| {
            let mut system =
                marl::MarlSystem::new(&config.marl, seed.wrapping_add(MARL_SEED_OFFSET));
            if let Err(e) = system.load_q_tables() {
                warn!(error = %e, "failed to load Q-tables, starting empty");
            }
            system
        });

        Self {
            algorithm,
            config: config.clone(),
            mas: coordinated::MultiAgentSystem::new(&config.scheduler.weights),
            marl,
            rng: StdRng::seed_from_u64(seed.wrapping_add(SCHEDULER_SEED_OFFSET)),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Produces this step's `{user -> charger}` assignments.
    ///
    /// Any algorithm error falls back to rule-based for this step only;
    /// errors never propagate to the caller.
    pub fn decide(&mut self, state: &SimState) -> Decisions {
        let result = match self.algorithm {
            Algorithm::RuleBased => Ok(rule_based::schedule(state, &self.config)),
            Algorithm::Uncoordinated => Ok(uncoordinated::schedule(state, &mut self.rng)),
            Algorithm::CoordinatedMas => self.mas.make_decisions(state, &self.config),
            Algorithm::Marl => match &mut self.marl {
                Some(system) => system.decide(state, &self.config.marl),
                None => Err(ScheduleError::Uninitialized("marl")),
            },
        };

        match result {
            Ok(decisions) => {
                info!(
                    algorithm = self.algorithm.name(),
                    assignments = decisions.len(),
                    "scheduling decision made"
                );
                decisions
            }
            Err(e) => {
                warn!(
                    algorithm = self.algorithm.name(),
                    error = %e,
                    "algorithm failed, falling back to rule_based for this step"
                );
                rule_based::schedule(state, &self.config)
            }
        }
    }

    /// Feeds one transition to the learner (MARL only; no-op otherwise).
    pub fn learn(
        &mut self,
        state: &SimState,
        decisions: &Decisions,
        rewards: &RewardSet,
        next_state: &SimState,
    ) {
        if let Some(system) = &mut self.marl {
            system.learn(state, decisions, rewards, next_state);
        }
    }

    /// Loads persisted Q-tables (MARL only; no-op otherwise).
    pub fn load_q_tables(&mut self) -> Result<usize, marl::QTableIoError> {
        match &mut self.marl {
            Some(system) => system.load_q_tables(),
            None => Ok(0),
        }
    }

    /// Persists Q-tables (MARL only; no-op otherwise).
    pub fn save_q_tables(&self) -> Result<usize, marl::QTableIoError> {
        match &self.marl {
            Some(system) => system.save_q_tables(),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::environment::Environment;

    fn small_config(algorithm: &str) -> ScenarioConfig {
        let mut cfg = ScenarioConfig::baseline();
        cfg.simulation.days = 1;
        cfg.simulation.algorithm = algorithm.to_string();
        cfg.users.count = 20;
        cfg.chargers.station_count = 2;
        cfg.chargers.chargers_per_station = 2;
        cfg
    }

    #[test]
    fn algorithm_names_round_trip() {
        for a in [
            Algorithm::RuleBased,
            Algorithm::Uncoordinated,
            Algorithm::CoordinatedMas,
            Algorithm::Marl,
        ] {
            assert_eq!(Algorithm::parse(a.name()), Some(a));
        }
        assert_eq!(Algorithm::parse("bogus"), None);
    }

    #[test]
    fn unknown_algorithm_degrades_to_rule_based() {
        let mut cfg = small_config("rule_based");
        cfg.simulation.algorithm = "not_an_algorithm".to_string();
        let scheduler = Scheduler::new(&cfg);
        assert_eq!(scheduler.algorithm(), Algorithm::RuleBased);
    }

    #[test]
    fn every_algorithm_produces_valid_assignments() {
        for name in ["rule_based", "uncoordinated", "coordinated_mas", "marl"] {
            let cfg = small_config(name);
            let env = Environment::new(cfg.clone());
            let state = env.state();
            let mut scheduler = Scheduler::new(&cfg);
            let decisions = scheduler.decide(&state);
            for (user_id, charger_id) in &decisions {
                assert!(state.users.contains_key(user_id), "{name}: unknown user");
                assert!(state.chargers.contains_key(charger_id), "{name}: unknown charger");
            }
        }
    }

    #[test]
    fn learn_is_a_noop_for_non_marl() {
        let cfg = small_config("rule_based");
        let mut env = Environment::new(cfg.clone());
        let state = env.reset();
        let mut scheduler = Scheduler::new(&cfg);
        let decisions = scheduler.decide(&state);
        let (rewards, next_state, _) = env.step(&decisions);
        scheduler.learn(&state, &decisions, &rewards, &next_state);
        assert_eq!(scheduler.save_q_tables().ok(), Some(0));
    }
}
