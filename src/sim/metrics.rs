//! Population-level reward scores and the analytical uncoordinated baseline.

use std::fmt;

use rand::Rng;
use rand::rngs::StdRng;

use crate::config::OptimizationWeights;
use crate::sim::SimState;
use crate::sim::charger::ChargerStatus;
use crate::sim::user::UserStatus;

/// Nominal daily revenue per charger that maps to a full profit score.
const REVENUE_TARGET_PER_CHARGER: f32 = 50.0;

/// Analytical estimates of the same KPIs under uncoordinated charging.
///
/// These are heuristics derived from the coordinated scores, not a parallel
/// simulation; they bound nothing and exist for comparison display only.
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineEstimate {
    pub user_satisfaction: f32,
    pub operator_profit: f32,
    pub grid_friendliness: f32,
    pub total_reward: f32,
    /// `(total - baseline) / |baseline| * 100`, absent for near-zero baselines.
    pub improvement_percentage: Option<f32>,
}

/// The four weighted KPI scores for one step, each in [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct RewardSet {
    pub user_satisfaction: f32,
    pub operator_profit: f32,
    pub grid_friendliness: f32,
    pub total_reward: f32,
    pub baseline: Option<BaselineEstimate>,
}

impl fmt::Display for RewardSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "user={:.3} profit={:.3} grid={:.3} total={:.3}",
            self.user_satisfaction, self.operator_profit, self.grid_friendliness, self.total_reward
        )?;
        if let Some(b) = &self.baseline {
            write!(f, " | baseline total={:.3}", b.total_reward)?;
            if let Some(pct) = b.improvement_percentage {
                write!(f, " improvement={pct:.1}%")?;
            }
        }
        Ok(())
    }
}

/// Computes the reward scores for a state snapshot.
///
/// `rng` feeds the stochastic component of the baseline profit estimate; it
/// is the environment RNG so that fixed seeds stay deterministic.
pub fn compute(
    state: &SimState,
    weights: &OptimizationWeights,
    enable_baseline: bool,
    rng: &mut StdRng,
) -> RewardSet {
    let total_users = state.users.len().max(1) as f32;
    let total_chargers = state.chargers.len().max(1) as f32;

    // User satisfaction: mean SoC discounted by the waiting fraction.
    let soc_sum: f32 = state.users.values().map(|u| u.soc).sum();
    let avg_soc = soc_sum / total_users;
    let waiting = state
        .users
        .values()
        .filter(|u| u.status == UserStatus::Waiting)
        .count() as f32;
    let satisfaction_raw = (avg_soc / 100.0) * (1.0 - 0.5 * (waiting / total_users));
    let user_satisfaction = (2.0 * satisfaction_raw - 1.0).clamp(-1.0, 1.0);

    // Operator profit: revenue against a nominal target plus utilization.
    let total_revenue: f32 = state.chargers.values().map(|c| c.daily_revenue).sum();
    let occupied = state
        .chargers
        .values()
        .filter(|c| c.status == ChargerStatus::Occupied)
        .count() as f32;
    let utilization = occupied / total_chargers;
    let profit_factor = total_revenue / (total_chargers * REVENUE_TARGET_PER_CHARGER + 1e-6);
    let profit_raw = (profit_factor * 0.6 + utilization * 0.4).min(1.0);
    let operator_profit = (2.0 * profit_raw - 1.0).clamp(-1.0, 1.0);

    // Grid friendliness: load level, renewable share, time of day, and EV
    // load concentration.
    let load_percent = state.grid.load_percent;
    let renewable_ratio = state.grid.renewable_percent / 100.0;
    let load_factor = if load_percent < 30.0 {
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
    let renewable_factor = 0.8 * renewable_ratio;
    let hour = state.hour;
    let time_factor = if state.grid.is_peak(hour) {
        -0.3
    } else if state.grid.is_valley(hour) {
        0.6
    } else {
        0.2
    };
    let mut concentration_factor = 0.0;
    if state.grid.total_load_kw > 1e-6 {
        let ev_ratio = state.grid.total_ev_load_kw / state.grid.total_load_kw;
        if ev_ratio > 0.3 {
            concentration_factor = -0.15 * (ev_ratio - 0.3) / 0.7;
        }
    }
    let raw = load_factor + renewable_factor + time_factor + concentration_factor;
    let mut grid_friendliness = raw.clamp(-0.9, 1.0);
    if grid_friendliness < 0.0 {
        grid_friendliness *= 0.8;
    } else {
        grid_friendliness = (grid_friendliness * 1.1).min(1.0);
    }

    let total_reward = user_satisfaction * weights.user_satisfaction
        + operator_profit * weights.operator_profit
        + grid_friendliness * weights.grid_friendliness;

    let baseline = enable_baseline.then(|| {
        // Longer expected waits under uncoordinated charging.
        let unc_satisfaction_raw = (avg_soc / 100.0) * 0.7;
        let unc_user = (2.0 * unc_satisfaction_raw - 1.0).clamp(-1.0, 1.0);

        // Uneven revenue distribution eats into margins.
        let reduction: f32 = rng.random_range(0.7..=0.9);
        let unc_profit = (operator_profit * reduction - 0.1).clamp(-1.0, 1.0);

        // Uncoordinated charging clusters into peak hours.
        let unc_grid = if state.grid.is_peak(hour) {
            -0.7 - 0.1 * renewable_ratio
        } else if state.grid.is_valley(hour) {
            0.2 + 0.2 * renewable_ratio
        } else {
            -0.2 - 0.1 * renewable_ratio
        }
        .clamp(-1.0, 1.0);

        let unc_total = unc_user * weights.user_satisfaction
            + unc_profit * weights.operator_profit
            + unc_grid * weights.grid_friendliness;
        let improvement_percentage = (unc_total.abs() > 1e-6)
            .then(|| (total_reward - unc_total) / unc_total.abs() * 100.0);

        BaselineEstimate {
            user_satisfaction: unc_user,
            operator_profit: unc_profit,
            grid_friendliness: unc_grid,
            total_reward: unc_total,
            improvement_percentage,
        }
    });

    RewardSet {
        user_satisfaction,
        operator_profit,
        grid_friendliness,
        total_reward,
        baseline,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScenarioConfig;
    use crate::sim::environment::Environment;
    use rand::SeedableRng;

    fn small_state() -> SimState {
        let mut cfg = ScenarioConfig::baseline();
        cfg.simulation.days = 1;
        cfg.users.count = 20;
        cfg.chargers.station_count = 2;
        cfg.chargers.chargers_per_station = 2;
        Environment::new(cfg).state()
    }

    #[test]
    fn scores_stay_in_range() {
        let state = small_state();
        let mut rng = StdRng::seed_from_u64(1);
        let rewards = compute(&state, &OptimizationWeights::default(), true, &mut rng);
        for score in [
            rewards.user_satisfaction,
            rewards.operator_profit,
            rewards.grid_friendliness,
        ] {
            assert!((-1.0..=1.0).contains(&score), "score out of range: {score}");
        }
        let b = rewards.baseline.as_ref();
        assert!(b.is_some());
        for score in [
            b.map(|b| b.user_satisfaction).unwrap_or(2.0),
            b.map(|b| b.operator_profit).unwrap_or(2.0),
            b.map(|b| b.grid_friendliness).unwrap_or(2.0),
        ] {
            assert!((-1.0..=1.0).contains(&score));
        }
    }

    #[test]
    fn baseline_disabled_yields_none() {
        let state = small_state();
        let mut rng = StdRng::seed_from_u64(1);
        let rewards = compute(&state, &OptimizationWeights::default(), false, &mut rng);
        assert!(rewards.baseline.is_none());
    }

    #[test]
    fn total_is_weighted_sum() {
        let state = small_state();
        let mut rng = StdRng::seed_from_u64(1);
        let w = OptimizationWeights {
            user_satisfaction: 0.5,
            operator_profit: 0.25,
            grid_friendliness: 0.25,
        };
        let r = compute(&state, &w, false, &mut rng);
        let expected = r.user_satisfaction * 0.5
            + r.operator_profit * 0.25
            + r.grid_friendliness * 0.25;
        assert!((r.total_reward - expected).abs() < 1e-6);
    }

    #[test]
    fn improvement_is_relative_to_baseline_magnitude() {
        let state = small_state();
        let mut rng = StdRng::seed_from_u64(9);
        let r = compute(&state, &OptimizationWeights::default(), true, &mut rng);
        let b = r.baseline.as_ref();
        if let Some(pct) = b.and_then(|b| b.improvement_percentage) {
            let unc_total = b.map(|b| b.total_reward).unwrap_or(0.0);
            let expected = (r.total_reward - unc_total) / unc_total.abs() * 100.0;
            assert!((pct - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn display_formats_without_panic() {
        let state = small_state();
        let mut rng = StdRng::seed_from_u64(1);
        let r = compute(&state, &OptimizationWeights::default(), true, &mut rng);
        let s = format!("{r}");
        assert!(s.contains("total="));
    }
}
