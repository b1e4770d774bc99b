//! Rule-based scheduling: multi-criteria scoring with time-of-day adjusted
//! weights and greedy assignment under per-charger load limits.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::config::ScenarioConfig;
use crate::sim::charger::{Charger, ChargerKind, ChargerStatus};
use crate::sim::user::{User, UserProfile, UserType};
use crate::sim::{ChargerId, SimState};

use super::Decisions;

/// Produces `{user -> charger}` assignments for one step.
pub fn schedule(state: &SimState, config: &ScenarioConfig) -> Decisions {
    let mut decisions = Decisions::new();
    if state.users.is_empty() || state.chargers.is_empty() {
        debug!("rule_based: empty state, nothing to schedule");
        return decisions;
    }

    let sched = &config.scheduler;
    let hour = state.hour;
    let is_peak = state.grid.is_peak(hour);
    let is_valley = state.grid.is_valley(hour);
    let load_percent = state.grid.load_percent;

    let max_queue_len = if is_peak {
        sched.max_queue_peak
    } else if is_valley {
        sched.max_queue_valley
    } else {
        sched.max_queue_shoulder
    };

    // Time-of-day weight shaping: lean on the grid during peaks, on
    // profit/users during valleys.
    let base = &sched.weights;
    let mut w_user = base.user_satisfaction;
    let mut w_profit = base.operator_profit;
    let mut w_grid = base.grid_friendliness;
    if is_peak {
        let grid_boost = (load_percent / 200.0).min(0.3);
        w_grid = (w_grid + grid_boost).min(0.7);
        w_user = (w_user - grid_boost / 2.0).max(0.1);
        w_profit = (w_profit - grid_boost / 2.0).max(0.1);
    } else if is_valley {
        w_grid = (w_grid - 0.15).max(0.2);
        w_profit = (w_profit + 0.1).min(0.6);
        w_user = (w_user + 0.05).min(0.6);
    }
    let total = w_user + w_profit + w_grid;
    if total > 0.0 {
        w_user /= total;
        w_profit /= total;
        w_grid /= total;
    }

    // Candidate users, ordered by explicit need then urgency.
    let min_charge_needed = config.users.min_charge_threshold_percent;
    let mut candidates: Vec<(&User, f32, bool)> = Vec::new();
    for user in state.users.values() {
        if user.is_engaged() {
            continue;
        }
        let mut threshold = sched.default_charge_soc_threshold;
        match user.profile {
            UserProfile::Anxious => threshold += 10.0,
            UserProfile::Economic => threshold -= 10.0,
            _ => {}
        }
        if is_peak {
            threshold -= 5.0;
        } else if is_valley {
            threshold += 10.0;
        }
        let threshold = threshold.clamp(15.0, 60.0);

        let charge_needed = 95.0 - user.soc;
        let eligible =
            (user.needs_charge_decision || (user.soc <= threshold && user.soc < 80.0))
                && charge_needed >= min_charge_needed;
        if !eligible {
            continue;
        }
        let urgency = if user.soc < threshold {
            (threshold - user.soc) / threshold
        } else {
            0.0
        };
        let bump = if user.needs_charge_decision { 0.3 } else { 0.0 };
        candidates.push((user, (urgency + bump).clamp(0.0, 1.0), user.needs_charge_decision));
    }
    candidates.sort_by(|a, b| {
        b.2.cmp(&a.2)
            .then(b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
            .then(a.0.id.cmp(&b.0.id))
    });

    // Current charger loads, updated locally as assignments are made so a
    // single pass cannot overbook.
    let mut loads: BTreeMap<&ChargerId, usize> = state
        .chargers
        .iter()
        .filter(|(_, c)| c.status != ChargerStatus::Failure)
        .map(|(id, c)| (id, c.occupancy_load()))
        .collect();

    for &(user, urgency, _) in &candidates {
        // Nearest usable chargers, capped at the candidate limit.
        let mut reachable: Vec<(&ChargerId, &Charger, f32)> = state
            .chargers
            .iter()
            .filter(|(id, c)| {
                c.status != ChargerStatus::Failure
                    && loads.get(id).copied().unwrap_or(0) < max_queue_len
            })
            .map(|(id, c)| (id, c, user.position.distance_km(&c.position)))
            .filter(|(_, _, d)| d.is_finite())
            .collect();
        reachable.sort_by(|a, b| {
            a.2.partial_cmp(&b.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(b.0))
        });
        reachable.truncate(sched.candidate_limit);

        let mut best: Option<(&ChargerId, f32)> = None;
        for (charger_id, charger, distance) in reachable {
            let queue_len = loads.get(charger_id).copied().unwrap_or(0);
            let user_score = user_satisfaction_score(user, charger, distance, queue_len);
            let profit_score = operator_profit_score(user, charger, state);
            let grid_score = grid_friendliness_score(charger, state);

            // Situational weight boosts, renormalized per evaluation.
            let mut aw_user = w_user;
            let mut aw_profit = w_profit;
            let mut aw_grid = w_grid;
            if grid_score < -0.5 {
                aw_grid = (aw_grid * 1.5).min(0.8);
            }
            if urgency > 0.9 && user.soc < 15.0 {
                aw_user = (aw_user * 1.5).min(0.6);
            }
            let adj_total = aw_user + aw_profit + aw_grid;
            if adj_total > 0.0 {
                aw_user /= adj_total;
                aw_profit /= adj_total;
                aw_grid /= adj_total;
            }

            let combined =
                user_score * aw_user + profit_score * aw_profit + grid_score * aw_grid;
            let penalized = combined - queue_len as f32 * sched.queue_penalty;

            if best.is_none_or(|(_, s)| penalized > s) {
                best = Some((charger_id, penalized));
            }
        }

        if let Some((charger_id, score)) = best {
            decisions.insert(user.id.clone(), charger_id.clone());
            *loads.entry(charger_id).or_insert(0) += 1;
            debug!(user = %user.id, charger = %charger_id, score, "rule_based assignment");
        }
    }

    info!(
        assignments = decisions.len(),
        candidates = candidates.len(),
        "rule_based schedule complete"
    );
    decisions
}

/// User-satisfaction sub-score in [-1, 1]: distance, expected wait, power
/// match, and price, with an emergency boost for low SoC.
pub(crate) fn user_satisfaction_score(
    user: &User,
    charger: &Charger,
    distance_km: f32,
    queue_len: usize,
) -> f32 {
    let distance_score = if distance_km < 2.0 {
        0.5 - distance_km * 0.1
    } else if distance_km < 5.0 {
        0.3 - (distance_km - 2.0) * 0.1
    } else if distance_km < 10.0 {
        0.0 - (distance_km - 5.0) * 0.05
    } else {
        (-0.25 - (distance_km - 10.0) * 0.025).max(-0.5)
    };

    let wait_score = match queue_len {
        0 => 0.5,
        1..=2 => 0.3,
        3..=5 => 0.1,
        6..=8 => -0.1,
        _ => -0.3,
    };

    let urgency = if user.soc < 40.0 {
        (40.0 - user.soc) / 40.0
    } else {
        0.0
    };
    let expected_power = match user.user_type {
        UserType::Taxi | UserType::RideHailing => 50.0 + urgency * 50.0,
        UserType::Logistics => 30.0 + urgency * 50.0,
        UserType::Private => 20.0 + urgency * 30.0,
    };
    let power_ratio = if expected_power > 0.0 {
        charger.max_power_kw / expected_power
    } else {
        1.0
    };
    let power_score = if power_ratio >= 1.5 {
        0.4
    } else if power_ratio >= 1.0 {
        0.3
    } else if power_ratio >= 0.7 {
        0.1
    } else if power_ratio >= 0.5 {
        -0.1
    } else {
        -0.2
    };

    let price_score = ((1.0 - charger.price_multiplier) * 0.5).clamp(-0.3, 0.3);

    let emergency_factor = if user.soc < 15.0 {
        1.5
    } else if user.soc < 25.0 {
        1.2
    } else {
        1.0
    };

    let mut satisfaction = distance_score * 0.4 * emergency_factor
        + wait_score * 0.3 * emergency_factor
        + power_score * 0.15
        + price_score * 0.15;
    if emergency_factor > 1.2 && satisfaction < -0.5 {
        satisfaction = (satisfaction * 0.8).max(-0.5);
    }
    satisfaction.clamp(-1.0, 1.0)
}

/// Operator-profit sub-score in [-1, 1]: effective price, charger class,
/// queue length, and the user's charge demand.
pub(crate) fn operator_profit_score(user: &User, charger: &Charger, state: &SimState) -> f32 {
    let charge_needed_factor = (100.0 - user.soc) / 50.0;
    let effective_price = state.grid.current_price * charger.price_multiplier;

    let mut score = effective_price;
    match charger.kind {
        ChargerKind::Fast => score *= 1.15,
        ChargerKind::Superfast => score *= 1.30,
        ChargerKind::Normal => {}
    }
    score -= charger.queue.len() as f32 * 0.15;
    score *= 1.0 + charge_needed_factor * 0.05;

    // Linear remap from the typical [0.5, 2.0] raw band onto [-1, 1].
    let normalized = (score - 0.5) / 1.5;
    (2.0 * normalized - 1.0).clamp(-1.0, 1.0)
}

/// Grid-friendliness sub-score in [-1, 1]: load level, renewables, time of
/// day, and a penalty on very high-power chargers.
pub(crate) fn grid_friendliness_score(charger: &Charger, state: &SimState) -> f32 {
    let load_percent = state.grid.load_percent;
    let renewable_ratio = state.grid.renewable_percent / 100.0;
    let hour = state.hour;

    let load_score = if load_percent < 30.0 {
        0.8
    } else if load_percent < 50.0 {
        0.5 - (load_percent - 30.0) * 0.015
    } else if load_percent < 70.0 {
        0.2 - (load_percent - 50.0) * 0.01
    } else if load_percent < 85.0 {
        0.0 - (load_percent - 70.0) * 0.015
    } else {
        (-0.225 - (load_percent - 85.0) * 0.01).max(-0.5)
    };

    let renewable_score = 0.8 * renewable_ratio;

    let time_score = if state.grid.is_peak(hour) {
        -0.3
    } else if state.grid.is_valley(hour) {
        0.6
    } else {
        0.2
    };

    let power_penalty = if charger.max_power_kw > 150.0 {
        0.1
    } else if charger.max_power_kw > 50.0 {
        0.05
    } else {
        0.0
    };

    let raw = load_score + renewable_score + time_score - power_penalty;
    let mut score = raw.clamp(-0.9, 1.0);
    if score < 0.0 {
        score *= 0.8;
    } else {
        score = (score * 1.1).min(1.0);
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScenarioConfig;
    use crate::sim::environment::Environment;
    use crate::sim::user::UserStatus;

    fn small_env() -> Environment {
        let mut cfg = ScenarioConfig::baseline();
        cfg.simulation.days = 1;
        cfg.users.count = 40;
        cfg.chargers.station_count = 3;
        cfg.chargers.chargers_per_station = 3;
        Environment::new(cfg)
    }

    #[test]
    fn never_assigns_engaged_users_or_failed_chargers() {
        let mut cfg = ScenarioConfig::baseline();
        cfg.simulation.days = 1;
        cfg.users.count = 40;
        cfg.chargers.station_count = 3;
        cfg.chargers.chargers_per_station = 3;
        cfg.chargers.failure_rate = 0.5;
        let env = Environment::new(cfg.clone());
        let state = env.state();
        let decisions = schedule(&state, &cfg);
        for (user_id, charger_id) in &decisions {
            assert!(!state.users[user_id].is_engaged());
            assert_ne!(state.chargers[charger_id].status, ChargerStatus::Failure);
        }
    }

    #[test]
    fn respects_local_load_limit() {
        let env = small_env();
        let state = env.state();
        let cfg = env.config().clone();
        let decisions = schedule(&state, &cfg);

        let mut per_charger: BTreeMap<&str, usize> = BTreeMap::new();
        for charger_id in decisions.values() {
            *per_charger.entry(charger_id).or_insert(0) += 1;
        }
        // Reset starts at hour 0, a valley hour, so the valley cap applies.
        for (charger_id, n) in per_charger {
            let existing = state.chargers[charger_id].occupancy_load();
            assert!(existing + n <= cfg.scheduler.max_queue_valley);
        }
    }

    #[test]
    fn is_deterministic_for_a_fixed_state() {
        let env = small_env();
        let state = env.state();
        let cfg = env.config().clone();
        assert_eq!(schedule(&state, &cfg), schedule(&state, &cfg));
    }

    #[test]
    fn flagged_low_soc_user_is_assigned() {
        let mut env = small_env();
        let mut state = env.reset();
        // Manufacture a clearly needy user.
        if let Some(user) = state.users.values_mut().next() {
            user.soc = 12.0;
            user.needs_charge_decision = true;
            user.status = UserStatus::Idle;
            user.target_charger = None;
        }
        let cfg = env.config().clone();
        let decisions = schedule(&state, &cfg);
        let first = state.users.keys().next().cloned().unwrap_or_default();
        assert!(decisions.contains_key(&first));
    }

    #[test]
    fn sub_scores_stay_in_range() {
        let env = small_env();
        let state = env.state();
        for user in state.users.values() {
            for charger in state.chargers.values() {
                let d = user.position.distance_km(&charger.position);
                let s1 = user_satisfaction_score(user, charger, d, charger.queue.len());
                let s2 = operator_profit_score(user, charger, &state);
                let s3 = grid_friendliness_score(charger, &state);
                for s in [s1, s2, s3] {
                    assert!((-1.0..=1.0).contains(&s), "sub-score out of range: {s}");
                }
            }
        }
    }
}
