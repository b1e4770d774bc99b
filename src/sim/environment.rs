//! Simulation environment: owns the populations, the grid, and the clock,
//! and orchestrates one step of the world per `step` call.

use std::collections::BTreeMap;

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, info, warn};

use crate::config::ScenarioConfig;
use crate::geo::Point;
use crate::sim::charger::{Charger, ChargerKind, ChargingSession, simulate_chargers};
use crate::sim::clock::SimClock;
use crate::sim::grid::GridModel;
use crate::sim::metrics::{self, RewardSet};
use crate::sim::user::{
    DrivingStyle, User, UserProfile, UserStatus, UserStepCtx, UserType, VehicleClass,
    simulate_users,
};
use crate::sim::{ChargerId, SimState, UserId};

/// SoC bands sampled at population build time: `(probability, lo, hi)`.
const SOC_BANDS: [(f32, f32, f32); 4] = [
    (0.15, 10.0, 30.0),
    (0.35, 30.0, 60.0),
    (0.35, 60.0, 80.0),
    (0.15, 80.0, 95.0),
];

/// One retained history point: grid KPIs plus the step's rewards.
#[derive(Debug, Clone)]
pub struct HistoryPoint {
    pub step: u64,
    pub elapsed_minutes: f64,
    pub hour: u32,
    pub load_percent: f32,
    pub ev_load_kw: f32,
    pub total_load_kw: f32,
    pub renewable_percent: f32,
    pub price: f32,
    pub rewards: RewardSet,
}

/// The stepping orchestrator: world model plus run bookkeeping.
pub struct Environment {
    config: ScenarioConfig,
    clock: SimClock,
    users: BTreeMap<UserId, User>,
    chargers: BTreeMap<ChargerId, Charger>,
    grid: GridModel,
    history: Vec<HistoryPoint>,
    completed_sessions: Vec<ChargingSession>,
    rng: StdRng,
    horizon_minutes: f64,
}

impl Environment {
    /// Builds the environment and performs the initial reset.
    pub fn new(config: ScenarioConfig) -> Self {
        let sim = &config.simulation;
        let clock = SimClock::new(sim.step_minutes, sim.start_hour, sim.start_month);
        let horizon_minutes = f64::from(sim.days) * 24.0 * 60.0;
        let grid = GridModel::new(config.grid.clone());
        let mut env = Self {
            config,
            clock,
            users: BTreeMap::new(),
            chargers: BTreeMap::new(),
            grid,
            history: Vec::new(),
            completed_sessions: Vec::new(),
            rng: StdRng::seed_from_u64(0),
            horizon_minutes,
        };
        env.reset();
        env
    }

    /// Rebuilds populations from configuration and rewinds the clock.
    ///
    /// Fully deterministic for a given configuration and seed.
    pub fn reset(&mut self) -> SimState {
        info!(
            users = self.config.users.count,
            stations = self.config.chargers.station_count,
            "resetting environment"
        );
        self.rng = StdRng::seed_from_u64(self.config.simulation.seed);
        self.clock.reset();
        self.users = self.build_users();
        self.chargers = self.build_chargers();
        self.grid.reset();
        self.history.clear();
        self.completed_sessions.clear();
        self.state()
    }

    /// Executes one simulation step given the scheduler's decisions.
    ///
    /// Returns `(rewards, new_state, done)`.
    pub fn step(
        &mut self,
        decisions: &BTreeMap<UserId, ChargerId>,
    ) -> (RewardSet, SimState, bool) {
        debug!(step = self.clock.step(), decisions = decisions.len(), "step start");

        // 1. Apply decisions: set targets and plan routes.
        let mut routed = 0;
        for (user_id, charger_id) in decisions {
            let Some(charger_pos) = self.chargers.get(charger_id).map(|c| c.position) else {
                warn!(user = %user_id, charger = %charger_id, "decision references unknown charger");
                continue;
            };
            let Some(user) = self.users.get_mut(user_id) else {
                warn!(user = %user_id, "decision references unknown user");
                continue;
            };
            if user.is_engaged() || user.target_charger.as_ref() == Some(charger_id) {
                continue;
            }
            user.target_charger = Some(charger_id.clone());
            if user.plan_route_to_charger(charger_pos, &mut self.rng) {
                user.status = UserStatus::Traveling;
                routed += 1;
            } else {
                warn!(user = %user_id, charger = %charger_id, "route planning failed, clearing target");
                user.target_charger = None;
            }
        }
        debug!(routed, "decisions applied");

        // 2. Advance users.
        let ctx = UserStepCtx {
            hour: self.clock.hour(),
            month: self.clock.month(),
            step_hours: self.clock.step_hours(),
            bounds: &self.config.map,
            peak_hours: &self.config.grid.peak_hours,
            valley_hours: &self.config.grid.valley_hours,
            min_charge_threshold_percent: self.config.users.min_charge_threshold_percent,
            force_charge_soc_threshold: self.config.users.force_charge_soc_threshold,
        };
        simulate_users(&mut self.users, &ctx, &mut self.rng);

        // 3. Move arrived users into their target charger's queue.
        for (user_id, user) in &mut self.users {
            if user.status != UserStatus::Waiting {
                continue;
            }
            let Some(target_id) = user.target_charger.clone() else {
                continue;
            };
            match self.chargers.get_mut(&target_id) {
                Some(charger) => {
                    if !charger.try_enqueue(user_id) {
                        warn!(
                            user = %user_id,
                            charger = %target_id,
                            capacity = charger.queue_capacity,
                            "queue full, user remains waiting unqueued"
                        );
                    }
                }
                None => {
                    warn!(user = %user_id, charger = %target_id, "waiting user targets unknown charger");
                }
            }
        }

        // 4. Advance chargers.
        let (total_ev_load_kw, completed) = simulate_chargers(
            &mut self.chargers,
            &mut self.users,
            self.clock.elapsed_minutes(),
            self.clock.step_minutes(),
            self.grid.status(),
            &mut self.rng,
        );
        self.completed_sessions.extend(completed);

        // 5. Advance the grid with this step's EV load.
        self.grid.update(self.clock.hour(), total_ev_load_kw);

        // 6. Advance the clock.
        self.clock.advance();

        // 7. Compute rewards over the new state.
        let state = self.state();
        let rewards = metrics::compute(
            &state,
            &self.config.scheduler.weights,
            self.config.simulation.enable_baseline,
            &mut self.rng,
        );

        // 8. Retain a bounded history snapshot.
        self.push_history(&rewards);

        // 9. Done once the horizon is reached (half-step float tolerance).
        let elapsed = self.clock.elapsed_minutes();
        let done = elapsed
            >= self.horizon_minutes - f64::from(self.clock.step_minutes()) / 2.0;
        debug!(elapsed, done, "step end");

        (rewards, state, done)
    }

    /// Snapshot of the complete current state.
    pub fn state(&self) -> SimState {
        SimState {
            step: self.clock.step(),
            elapsed_minutes: self.clock.elapsed_minutes(),
            hour: self.clock.hour(),
            month: self.clock.month(),
            users: self.users.clone(),
            chargers: self.chargers.clone(),
            grid: self.grid.status().clone(),
        }
    }

    pub fn history(&self) -> &[HistoryPoint] {
        &self.history
    }

    pub fn completed_sessions(&self) -> &[ChargingSession] {
        &self.completed_sessions
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    fn push_history(&mut self, rewards: &RewardSet) {
        let grid = self.grid.status();
        self.history.push(HistoryPoint {
            step: self.clock.step(),
            elapsed_minutes: self.clock.elapsed_minutes(),
            hour: self.clock.hour(),
            load_percent: grid.load_percent,
            ev_load_kw: grid.total_ev_load_kw,
            total_load_kw: grid.total_load_kw,
            renewable_percent: grid.renewable_percent,
            price: grid.current_price,
            rewards: rewards.clone(),
        });
        // Keep the most recent 48 hours of points.
        let max_points = (48 * 60 / self.clock.step_minutes().max(1)) as usize;
        if self.history.len() > max_points {
            let excess = self.history.len() - max_points;
            self.history.drain(..excess);
        }
    }

    /// Generates activity hotspots: a central CBD plus grid-cell centers
    /// with normalized weights.
    fn build_hotspots(&mut self) -> Vec<(Point, f32)> {
        let bounds = self.config.map;
        let mut hotspots = vec![(bounds.center(), 0.2f32)];

        let region_count = self.config.grid.region_count.max(1);
        let cells = region_count * 2;
        let rows = (cells as f32).sqrt() as usize;
        let rows = rows.max(1);
        let cols = cells.div_ceil(rows);
        let lat_step = (bounds.lat_max - bounds.lat_min) / rows as f32;
        let lng_step = (bounds.lng_max - bounds.lng_min) / cols as f32;
        let weight = 0.8 / (cells as f32 * 1.5);

        for i in 0..cells.saturating_sub(1) {
            let row = i / cols;
            let col = i % cols;
            let base_lat = bounds.lat_min + lat_step * row as f32;
            let base_lng = bounds.lng_min + lng_step * col as f32;
            let lat = base_lat + self.rng.random_range(0.1..=0.9f32) * lat_step;
            let lng = base_lng + self.rng.random_range(0.1..=0.9f32) * lng_step;
            hotspots.push((Point::new(lat, lng), weight));
        }

        let total: f32 = hotspots.iter().map(|(_, w)| w).sum();
        if total > 0.0 {
            for (_, w) in &mut hotspots {
                *w /= total;
            }
        }
        hotspots
    }

    fn build_users(&mut self) -> BTreeMap<UserId, User> {
        let count = self.config.users.count;
        let hotspots = self.build_hotspots();
        let bounds = self.config.map;

        let classes: Vec<VehicleClass> = self
            .config
            .users
            .vehicle_classes
            .iter()
            .filter_map(|name| VehicleClass::parse(name))
            .collect();
        let classes = if classes.is_empty() {
            warn!("no valid vehicle classes configured, defaulting to sedan");
            vec![VehicleClass::Sedan]
        } else {
            classes
        };

        let mut users = BTreeMap::new();
        for i in 0..count {
            let id = format!("user_{:04}", i + 1);
            let vehicle_class = classes[self.rng.random_range(0..classes.len())];
            let user_type = UserType::ALL[self.rng.random_range(0..UserType::ALL.len())];

            // SoC from the configured band distribution.
            let band_draw: f32 = self.rng.random();
            let mut cumulative = 0.0;
            let mut band = (10.0, 90.0);
            for (p, lo, hi) in SOC_BANDS {
                cumulative += p;
                if band_draw <= cumulative {
                    band = (lo, hi);
                    break;
                }
            }
            let soc = self.rng.random_range(band.0..=band.1);

            // Profile weights depend on user type; low SoC boosts urgency.
            let mut profile_weights = match user_type {
                UserType::Taxi => [0.5, 0.1, 0.3, 0.1],
                UserType::RideHailing => [0.4, 0.2, 0.3, 0.1],
                UserType::Logistics => [0.3, 0.4, 0.2, 0.1],
                UserType::Private => [0.2, 0.3, 0.3, 0.2],
            };
            if soc < 30.0 {
                profile_weights[0] += 0.2;
            }
            let profile =
                UserProfile::ALL[crate::geo::weighted_index(&mut self.rng, &profile_weights)];

            let (battery, max_range, max_power) = vehicle_class.spec();

            // Position: mostly clustered around hotspots.
            let position = if self.rng.random::<f32>() < 0.7 {
                let weights: Vec<f32> = hotspots.iter().map(|(_, w)| *w).collect();
                let (center, _) = hotspots[crate::geo::weighted_index(&mut self.rng, &weights)];
                let radius = crate::geo::gaussian(&mut self.rng, 0.03);
                let angle = self.rng.random_range(0.0..std::f32::consts::TAU);
                bounds.clamp(Point::new(
                    center.lat + radius * angle.cos(),
                    center.lng + radius * angle.sin(),
                ))
            } else {
                bounds.random_point(&mut self.rng)
            };

            // Initial status prior conditioned on SoC.
            let traveling_prob = if soc < 30.0 {
                0.7
            } else if soc < 60.0 {
                0.4
            } else {
                0.3
            };
            let status = if self.rng.random::<f32>() < traveling_prob {
                UserStatus::Traveling
            } else {
                UserStatus::Idle
            };

            let style_idx =
                crate::geo::weighted_index(&mut self.rng, &[0.6, 0.25, 0.15]);
            let driving_style = [DrivingStyle::Normal, DrivingStyle::Aggressive, DrivingStyle::Eco]
                [style_idx];

            let (time_sensitivity, price_sensitivity, range_anxiety) = match profile {
                UserProfile::Urgent => (
                    self.rng.random_range(0.7..=0.9),
                    self.rng.random_range(0.1..=0.3),
                    0.0,
                ),
                UserProfile::Economic => (
                    self.rng.random_range(0.2..=0.4),
                    self.rng.random_range(0.7..=0.9),
                    0.0,
                ),
                UserProfile::Anxious => (
                    self.rng.random_range(0.5..=0.7),
                    self.rng.random_range(0.3..=0.5),
                    self.rng.random_range(0.6..=0.9),
                ),
                UserProfile::Flexible => (0.5, 0.5, 0.0),
            };

            let mut user = User {
                id: id.clone(),
                vehicle_class,
                user_type,
                profile,
                driving_style,
                battery_capacity_kwh: battery,
                soc,
                max_range_km: max_range,
                current_range_km: max_range * soc / 100.0,
                max_charging_power_kw: max_power,
                charging_efficiency: 0.92,
                position,
                status,
                target_charger: None,
                route: None,
                travel_speed_kmh: self.rng.random_range(30.0..=65.0),
                time_sensitivity,
                price_sensitivity,
                range_anxiety,
                needs_charge_decision: false,
                last_destination_kind: None,
                post_charge_timer: None,
                target_soc: None,
                initial_soc: None,
                traveled_km: 0.0,
                charging_history: Vec::new(),
            };

            // Users starting on the move get a random trip.
            if user.status == UserStatus::Traveling {
                let destination = bounds.random_point(&mut self.rng);
                if !user.plan_route_to_destination(destination, &mut self.rng) {
                    user.status = UserStatus::Idle;
                }
            }

            users.insert(id, user);
        }
        info!(count = users.len(), "initialized users");
        users
    }

    fn build_chargers(&mut self) -> BTreeMap<ChargerId, Charger> {
        let cfg = self.config.chargers.clone();
        let bounds = self.config.map;
        let region_count = self.config.grid.region_count.max(1);

        let mut chargers = BTreeMap::new();
        let mut next_id = 1usize;
        for station_idx in 0..cfg.station_count {
            let station_name = format!("station_{:02}", station_idx + 1);
            let station_pos = bounds.random_point(&mut self.rng);

            for _ in 0..cfg.chargers_per_station {
                let id = format!("charger_{:04}", next_id);
                next_id += 1;

                let draw: f32 = self.rng.random();
                let (kind, power_range, price_multiplier) = if draw < cfg.superfast_ratio {
                    (
                        ChargerKind::Superfast,
                        cfg.superfast_power_kw,
                        cfg.superfast_price_multiplier,
                    )
                } else if draw < cfg.superfast_ratio + cfg.fast_ratio {
                    (ChargerKind::Fast, cfg.fast_power_kw, cfg.fast_price_multiplier)
                } else {
                    (
                        ChargerKind::Normal,
                        cfg.normal_power_kw,
                        cfg.normal_price_multiplier,
                    )
                };

                let max_power_kw = self
                    .rng
                    .random_range(power_range[0]..=power_range[1].max(power_range[0]));
                let position = bounds.clamp(Point::new(
                    station_pos.lat + self.rng.random_range(-0.0005..=0.0005f32),
                    station_pos.lng + self.rng.random_range(-0.0005..=0.0005f32),
                ));
                let failed = self.rng.random::<f32>() < cfg.failure_rate;
                let region = format!("region_{}", self.rng.random_range(0..region_count));

                chargers.insert(
                    id.clone(),
                    Charger::new(
                        id,
                        station_name.clone(),
                        kind,
                        (max_power_kw * 10.0).round() / 10.0,
                        position,
                        failed,
                        cfg.queue_capacity,
                        price_multiplier,
                        region,
                    ),
                );
            }
        }
        info!(count = chargers.len(), "initialized chargers");
        chargers
    }
}
