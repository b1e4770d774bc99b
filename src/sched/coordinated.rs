//! Coordinated multi-agent scheduling: three single-objective agents each
//! propose a full assignment, and a coordinator resolves them by weighted
//! vote under shared capacity tracking.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::config::{OptimizationWeights, ScenarioConfig};
use crate::sim::charger::{Charger, ChargerKind, ChargerStatus};
use crate::sim::user::User;
use crate::sim::{ChargerId, SimState, UserId};

use super::{Decisions, ScheduleError};

/// Queue-plus-occupancy cap the coordinator and grid agent enforce.
const MAX_POOL_LEN: usize = 4;

/// Agent recommending per-user charger choices that minimize the user's
/// weighted time/price cost.
#[derive(Debug, Default)]
pub struct UserSatisfactionAgent {
    pub last_decision: Decisions,
}

impl UserSatisfactionAgent {
    /// Day/night SoC threshold under which users get recommendations.
    fn charging_threshold(hour: u32) -> f32 {
        if (6..22).contains(&hour) { 35.0 } else { 45.0 }
    }

    pub fn make_decisions(&mut self, state: &SimState) -> Decisions {
        let mut recommendations = Decisions::new();
        let hour = state.hour;
        let threshold = Self::charging_threshold(hour);

        for user in state.users.values() {
            if user.is_engaged() {
                continue;
            }
            if !(user.needs_charge_decision || user.soc < threshold) || user.soc >= 90.0 {
                continue;
            }
            if let Some(charger_id) = self.best_charger_for(user, state) {
                recommendations.insert(user.id.clone(), charger_id);
            }
        }

        self.last_decision = recommendations.clone();
        recommendations
    }

    fn best_charger_for(&self, user: &User, state: &SimState) -> Option<ChargerId> {
        let mut best: Option<(f32, &ChargerId)> = None;
        for (charger_id, charger) in &state.chargers {
            if charger.status == ChargerStatus::Failure {
                continue;
            }
            let distance = user.position.distance_km(&charger.position);
            if !distance.is_finite() {
                continue;
            }
            let travel_time = distance * 2.0; // minutes, rough urban estimate

            let per_user_wait = if charger.kind == ChargerKind::Normal {
                20.0
            } else {
                10.0
            };
            let mut wait_time = charger.queue.len() as f32 * per_user_wait;
            if charger.status == ChargerStatus::Occupied {
                wait_time += per_user_wait / 2.0;
            }

            let charge_needed_kwh = user.battery_capacity_kwh * (1.0 - user.soc / 100.0);
            let est_cost =
                charge_needed_kwh * state.grid.current_price * charger.price_multiplier;

            let time_cost = travel_time + wait_time;
            let price_cost = est_cost / 50.0;
            let weighted =
                time_cost * user.time_sensitivity + price_cost * user.price_sensitivity;

            if best.is_none_or(|(c, _)| weighted < c) {
                best = Some((weighted, charger_id));
            }
        }
        best.map(|(_, id)| id.clone())
    }
}

/// Agent recommending assignments that maximize operator revenue potential.
#[derive(Debug, Default)]
pub struct OperatorProfitAgent {
    pub last_decision: Decisions,
}

impl OperatorProfitAgent {
    pub fn make_decisions(&mut self, state: &SimState) -> Decisions {
        let mut recommendations = Decisions::new();
        let hour = state.hour;

        for user in state.users.values() {
            if user.is_engaged() || user.soc >= 95.0 {
                continue;
            }
            if let Some(charger_id) = self.most_profitable_charger(user, state, hour) {
                recommendations.insert(user.id.clone(), charger_id);
            }
        }

        self.last_decision = recommendations.clone();
        recommendations
    }

    fn most_profitable_charger(
        &self,
        user: &User,
        state: &SimState,
        hour: u32,
    ) -> Option<ChargerId> {
        let grid = &state.grid;
        let base_price = grid.current_price;
        let mut best: Option<(f32, &ChargerId)> = None;

        for (charger_id, charger) in &state.chargers {
            if charger.status == ChargerStatus::Failure {
                continue;
            }

            let price_at_time = if grid.is_peak(hour) {
                base_price.max(grid.peak_price)
            } else if grid.is_valley(hour) {
                base_price.min(grid.valley_price)
            } else {
                base_price
            };
            let effective_price = price_at_time * charger.price_multiplier;

            let mut potential = effective_price;
            match charger.kind {
                ChargerKind::Fast => potential *= 1.15,
                ChargerKind::Superfast => potential *= 1.3,
                ChargerKind::Normal => {}
            }
            potential /= 1.0 + charger.queue.len() as f32 * 0.25;
            let charge_needed_factor = (100.0 - user.soc) / 50.0;
            potential *= 1.0 + charge_needed_factor * 0.1;

            if best.is_none_or(|(p, _)| potential > p) {
                best = Some((potential, charger_id));
            }
        }
        best.map(|(_, id)| id.clone())
    }
}

/// Agent steering demand toward grid-friendly hours and chargers, with its
/// own greedily filled capacity pool.
#[derive(Debug, Default)]
pub struct GridFriendlinessAgent {
    pub last_decision: Decisions,
}

impl GridFriendlinessAgent {
    pub fn make_decisions(&mut self, state: &SimState) -> Decisions {
        let mut decisions = Decisions::new();
        let hour = state.hour;
        let grid = &state.grid;

        // Candidates by descending charge need.
        let mut candidates: Vec<(&UserId, &User, f32)> = state
            .users
            .iter()
            .filter(|(_, u)| {
                !u.is_engaged()
                    && (u.needs_charge_decision || u.soc < 50.0)
                    && 95.0 - u.soc >= 20.0
            })
            .map(|(id, u)| (id, u, 100.0 - u.soc))
            .collect();
        candidates.sort_by(|a, b| {
            b.2.partial_cmp(&a.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(b.0))
        });

        // Score chargers with spare room.
        let time_score = if grid.is_valley(hour) {
            1.0
        } else if !grid.is_peak(hour) {
            0.5
        } else {
            0.0
        };
        let renewable_score = grid.renewable_percent / 100.0;
        let load_score = (1.0 - grid.load_percent / 100.0).max(0.0);

        let mut scored: Vec<(f32, &ChargerId, &Charger)> = state
            .chargers
            .iter()
            .filter(|(_, c)| {
                c.status != ChargerStatus::Failure && c.occupancy_load() < MAX_POOL_LEN
            })
            .map(|(id, c)| {
                let score = time_score * 0.5 + load_score * 0.3 + renewable_score * 0.2;
                (score, id, c)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(b.1))
        });

        let mut assigned: BTreeMap<&ChargerId, usize> = BTreeMap::new();
        for (user_id, _, _) in candidates {
            let slot = scored.iter().position(|(_, id, c)| {
                c.occupancy_load() + assigned.get(id).copied().unwrap_or(0) < MAX_POOL_LEN
            });
            let Some(i) = slot else {
                break;
            };
            let (_, charger_id, charger) = scored[i];
            decisions.insert(user_id.clone(), charger_id.clone());
            *assigned.entry(charger_id).or_insert(0) += 1;
            if charger.occupancy_load() + assigned.get(charger_id).copied().unwrap_or(0)
                >= MAX_POOL_LEN
            {
                scored.remove(i);
            }
        }

        self.last_decision = decisions.clone();
        decisions
    }
}

/// Coordinator: weighted voting across agent recommendations with shared
/// capacity accounting.
#[derive(Debug)]
pub struct Coordinator {
    user_weight: f32,
    profit_weight: f32,
    grid_weight: f32,
}

impl Coordinator {
    pub fn new(weights: &OptimizationWeights) -> Self {
        let mut coordinator = Self {
            user_weight: 0.4,
            profit_weight: 0.3,
            grid_weight: 0.3,
        };
        coordinator.set_weights(weights);
        coordinator
    }

    /// Installs objective weights, normalized to sum to 1.
    pub fn set_weights(&mut self, weights: &OptimizationWeights) {
        self.user_weight = weights.user_satisfaction;
        self.profit_weight = weights.operator_profit;
        self.grid_weight = weights.grid_friendliness;
        let total = self.user_weight + self.profit_weight + self.grid_weight;
        if total > 0.0 && (total - 1.0).abs() > 1e-6 {
            debug!(total, "coordinator weights do not sum to 1, normalizing");
            self.user_weight /= total;
            self.profit_weight /= total;
            self.grid_weight /= total;
        }
    }

    /// Normalized `(user, profit, grid)` weights.
    pub fn weights(&self) -> (f32, f32, f32) {
        (self.user_weight, self.profit_weight, self.grid_weight)
    }

    /// Resolves the three recommendation maps into final assignments.
    pub fn resolve(
        &self,
        user_decisions: &Decisions,
        profit_decisions: &Decisions,
        grid_decisions: &Decisions,
        state: &SimState,
    ) -> Decisions {
        let mut final_decisions = Decisions::new();
        let mut conflicts = 0usize;

        // Capacity accounting is seeded with real occupancy and queues and
        // shared across the whole resolution pass.
        let mut assigned: BTreeMap<&ChargerId, usize> = state
            .chargers
            .iter()
            .map(|(id, c)| (id, c.occupancy_load()))
            .collect();

        let mut all_users: Vec<&UserId> = user_decisions
            .keys()
            .chain(profit_decisions.keys())
            .chain(grid_decisions.keys())
            .collect();
        all_users.sort();
        all_users.dedup();

        for user_id in all_users {
            let mut choices: Vec<(&ChargerId, f32)> = Vec::new();
            if let Some(c) = user_decisions.get(user_id) {
                choices.push((c, self.user_weight));
            }
            if let Some(c) = profit_decisions.get(user_id) {
                choices.push((c, self.profit_weight));
            }
            if let Some(c) = grid_decisions.get(user_id) {
                choices.push((c, self.grid_weight));
            }
            if choices.is_empty() {
                continue;
            }

            let mut distinct: Vec<&&ChargerId> = choices.iter().map(|(c, _)| c).collect();
            distinct.sort();
            distinct.dedup();
            if distinct.len() > 1 {
                conflicts += 1;
            }

            let mut votes: BTreeMap<&ChargerId, f32> = BTreeMap::new();
            for (charger_id, weight) in &choices {
                if state.chargers.contains_key(*charger_id) {
                    *votes.entry(*charger_id).or_insert(0.0) += *weight;
                } else {
                    warn!(user = %user_id, charger = %charger_id, "vote for unknown charger ignored");
                }
            }
            if votes.is_empty() {
                continue;
            }

            // Highest vote first; ties break on charger id for stability.
            let mut ranked: Vec<(&ChargerId, f32)> =
                votes.into_iter().collect();
            ranked.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.0.cmp(b.0))
            });

            for (charger_id, vote) in ranked {
                if assigned.get(charger_id).copied().unwrap_or(0) >= MAX_POOL_LEN {
                    continue;
                }
                let failed = state
                    .chargers
                    .get(charger_id)
                    .is_none_or(|c| c.status == ChargerStatus::Failure);
                if failed {
                    debug!(user = %user_id, charger = %charger_id, "top vote is failed, trying next");
                    continue;
                }
                final_decisions.insert(user_id.clone(), charger_id.clone());
                *assigned.entry(charger_id).or_insert(0) += 1;
                debug!(user = %user_id, charger = %charger_id, vote, "coordinator assignment");
                break;
            }
            // Unassignable users are simply omitted, not retried.
        }

        info!(
            assignments = final_decisions.len(),
            conflicts, "coordinator resolution complete"
        );
        final_decisions
    }
}

/// The full coordinated multi-agent system.
pub struct MultiAgentSystem {
    pub user_agent: UserSatisfactionAgent,
    pub profit_agent: OperatorProfitAgent,
    pub grid_agent: GridFriendlinessAgent,
    pub coordinator: Coordinator,
}

impl MultiAgentSystem {
    pub fn new(weights: &OptimizationWeights) -> Self {
        Self {
            user_agent: UserSatisfactionAgent::default(),
            profit_agent: OperatorProfitAgent::default(),
            grid_agent: GridFriendlinessAgent::default(),
            coordinator: Coordinator::new(weights),
        }
    }

    /// Runs all three agents and coordinates their recommendations.
    pub fn make_decisions(
        &mut self,
        state: &SimState,
        config: &ScenarioConfig,
    ) -> Result<Decisions, ScheduleError> {
        if state.chargers.is_empty() {
            return Err(ScheduleError::NoChargers);
        }
        if state.users.is_empty() {
            return Err(ScheduleError::NoUsers);
        }

        // Weights may have been reconfigured between steps.
        self.coordinator.set_weights(&config.scheduler.weights);

        let user_decisions = self.user_agent.make_decisions(state);
        let profit_decisions = self.profit_agent.make_decisions(state);
        let grid_decisions = self.grid_agent.make_decisions(state);

        Ok(self
            .coordinator
            .resolve(&user_decisions, &profit_decisions, &grid_decisions, state))
    }
}
