//! User (EV driver) state machine: energy consumption, mobility along
//! planned routes, and the charge-seeking decision model.

use std::collections::BTreeMap;

use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::geo::{KM_PER_DEGREE, MapBounds, Point};
use crate::sim::charger::ChargingSession;
use crate::sim::{ChargerId, UserId};

/// Sigmoid midpoint for the base charging probability (SoC percent).
const SOC_MIDPOINT: f32 = 40.0;
/// Sigmoid steepness for the base charging probability.
const SOC_STEEPNESS: f32 = 0.1;
/// Arrival is declared once the remaining travel time drops below this.
const ARRIVAL_EPSILON_MIN: f32 = 0.1;

/// Lifecycle states of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserStatus {
    Idle,
    Traveling,
    Waiting,
    Charging,
    PostCharge,
}

/// Vehicle classes with built-in physical parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VehicleClass {
    Sedan,
    Suv,
    Compact,
    Truck,
    Luxury,
}

impl VehicleClass {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sedan" => Some(Self::Sedan),
            "suv" => Some(Self::Suv),
            "compact" => Some(Self::Compact),
            "truck" => Some(Self::Truck),
            "luxury" => Some(Self::Luxury),
            _ => None,
        }
    }

    /// `(battery_capacity_kwh, max_range_km, max_charging_power_kw)`.
    pub fn spec(&self) -> (f32, f32, f32) {
        match self {
            Self::Sedan => (60.0, 400.0, 60.0),
            Self::Suv => (85.0, 480.0, 90.0),
            Self::Compact => (45.0, 300.0, 40.0),
            Self::Truck => (120.0, 350.0, 120.0),
            Self::Luxury => (100.0, 550.0, 120.0),
        }
    }

    /// Base idle consumption rate (kWh/h) before seasonal and hourly factors.
    fn idle_rate_kwh_per_hour(&self) -> f32 {
        match self {
            Self::Sedan => 0.8,
            Self::Suv => 1.2,
            Self::Truck => 2.0,
            Self::Luxury => 1.0,
            Self::Compact => 0.6,
        }
    }

    /// Multiplier on per-km travel energy.
    fn travel_energy_factor(&self) -> f32 {
        match self {
            Self::Sedan => 1.2,
            Self::Suv => 1.5,
            Self::Truck => 1.8,
            Self::Luxury | Self::Compact => 1.0,
        }
    }
}

/// Usage category of a user, affecting expectations and charge timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserType {
    Private,
    Taxi,
    RideHailing,
    Logistics,
}

impl UserType {
    pub const ALL: [UserType; 4] = [
        UserType::Private,
        UserType::Taxi,
        UserType::RideHailing,
        UserType::Logistics,
    ];

    /// Additive contribution to the charging probability.
    fn probability_bonus(&self) -> f32 {
        match self {
            Self::Taxi => 0.2,
            Self::RideHailing => 0.15,
            Self::Logistics => 0.1,
            Self::Private => 0.0,
        }
    }

    pub fn is_commercial(&self) -> bool {
        matches!(self, Self::Taxi | Self::RideHailing)
    }
}

/// Charging-behavior profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserProfile {
    Urgent,
    Economic,
    Flexible,
    Anxious,
}

impl UserProfile {
    pub const ALL: [UserProfile; 4] = [
        UserProfile::Urgent,
        UserProfile::Economic,
        UserProfile::Flexible,
        UserProfile::Anxious,
    ];

    /// SoC threshold below which this profile actively seeks a charger.
    pub fn seek_threshold(&self) -> f32 {
        match self {
            Self::Anxious => 50.0,
            Self::Economic => 30.0,
            Self::Urgent | Self::Flexible => 40.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrivingStyle {
    Normal,
    Aggressive,
    Eco,
}

impl DrivingStyle {
    fn energy_factor(&self) -> f32 {
        match self {
            Self::Aggressive => 1.3,
            Self::Eco => 0.9,
            Self::Normal => 1.0,
        }
    }
}

/// What kind of destination the last planned route targeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DestinationKind {
    Charger,
    Random,
}

/// A planned route: perturbed waypoints between start and destination plus
/// a progress cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    /// Full polyline including start and destination.
    pub points: Vec<Point>,
    pub destination: Point,
    /// Index of the segment currently being traversed.
    pub segment: usize,
    /// Estimated remaining travel time in minutes.
    pub time_to_destination_min: f32,
    pub total_km: f32,
}

/// One simulated EV user.
#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub vehicle_class: VehicleClass,
    pub user_type: UserType,
    pub profile: UserProfile,
    pub driving_style: DrivingStyle,
    pub battery_capacity_kwh: f32,
    /// State of charge in percent, kept within [0, 100].
    pub soc: f32,
    pub max_range_km: f32,
    pub current_range_km: f32,
    pub max_charging_power_kw: f32,
    pub charging_efficiency: f32,
    pub position: Point,
    pub status: UserStatus,
    pub target_charger: Option<ChargerId>,
    pub route: Option<Route>,
    pub travel_speed_kmh: f32,
    pub time_sensitivity: f32,
    pub price_sensitivity: f32,
    pub range_anxiety: f32,
    /// Recomputed every step; consumed by the schedulers.
    pub needs_charge_decision: bool,
    pub last_destination_kind: Option<DestinationKind>,
    /// Steps remaining before a post-charge user departs.
    pub post_charge_timer: Option<u32>,
    /// Session target SoC, set while charging.
    pub target_soc: Option<f32>,
    /// SoC when the current session started.
    pub initial_soc: Option<f32>,
    pub traveled_km: f32,
    pub charging_history: Vec<ChargingSession>,
}

impl User {
    /// True when the user is parked at a charger or plugged in.
    pub fn is_engaged(&self) -> bool {
        matches!(self.status, UserStatus::Charging | UserStatus::Waiting)
    }

    /// Plans a route from the current position to `end`, generating 2-4
    /// laterally perturbed waypoints. Returns `false` (leaving the user
    /// unrouted) when the endpoints are unusable.
    pub fn plan_route(&mut self, end: Point, rng: &mut StdRng) -> bool {
        let start = self.position;
        if !start.lat.is_finite()
            || !start.lng.is_finite()
            || !end.lat.is_finite()
            || !end.lng.is_finite()
        {
            warn!(user = %self.id, "cannot plan route from or to a non-finite position");
            return false;
        }

        let dx = end.lng - start.lng;
        let dy = end.lat - start.lat;
        let direct_km = start.distance_km(&end);

        let num_points = rng.random_range(2..=4u32);
        let mut points = Vec::with_capacity(num_points as usize + 1);
        points.push(start);
        for i in 1..num_points {
            let t = i as f32 / num_points as f32;
            let mut lng = start.lng + t * dx;
            let mut lat = start.lat + t * dy;
            // Lateral jitter perpendicular to the direct line.
            let (mut perp_dx, mut perp_dy) = (-dy, dx);
            let perp_len = (perp_dx * perp_dx + perp_dy * perp_dy).sqrt();
            if perp_len > 0.0 {
                perp_dx /= perp_len;
                perp_dy /= perp_len;
            }
            let offset = rng.random_range(-0.1..=0.1f32) * direct_km / KM_PER_DEGREE;
            lng += perp_dx * offset;
            lat += perp_dy * offset;
            points.push(Point::new(lat, lng));
        }
        points.push(end);

        let total_km: f32 = points.windows(2).map(|w| w[0].distance_km(&w[1])).sum();
        let speed = if self.travel_speed_kmh > 0.0 {
            self.travel_speed_kmh
        } else {
            45.0
        };

        self.route = Some(Route {
            points,
            destination: end,
            segment: 0,
            time_to_destination_min: total_km / speed * 60.0,
            total_km,
        });
        true
    }

    /// Plans a route to a charger position and tags the destination kind.
    pub fn plan_route_to_charger(&mut self, charger_pos: Point, rng: &mut StdRng) -> bool {
        self.last_destination_kind = Some(DestinationKind::Charger);
        self.plan_route(charger_pos, rng)
    }

    /// Plans a route to an arbitrary destination, clearing any charger target.
    pub fn plan_route_to_destination(&mut self, destination: Point, rng: &mut StdRng) -> bool {
        self.target_charger = None;
        self.last_destination_kind = Some(DestinationKind::Random);
        self.plan_route(destination, rng)
    }

    /// Moves the user along the planned route by up to `distance_km`,
    /// advancing the segment cursor. Returns the distance actually moved.
    fn advance_along_route(&mut self, distance_km: f32) -> f32 {
        let Some(route) = &mut self.route else {
            return 0.0;
        };
        if route.points.len() < 2 || distance_km <= 0.0 {
            return 0.0;
        }

        let mut remaining_deg = distance_km / KM_PER_DEGREE;
        let mut moved_deg = 0.0;

        while remaining_deg > 1e-9 && route.segment < route.points.len() - 1 {
            let segment_end = route.points[route.segment + 1];
            let dx = segment_end.lng - self.position.lng;
            let dy = segment_end.lat - self.position.lat;
            let dist_to_end = (dx * dx + dy * dy).sqrt();

            if dist_to_end < 1e-9 {
                route.segment += 1;
                continue;
            }

            let step_deg = remaining_deg.min(dist_to_end);
            let fraction = step_deg / dist_to_end;
            self.position.lng += dx * fraction;
            self.position.lat += dy * fraction;
            remaining_deg -= step_deg;
            moved_deg += step_deg;

            if remaining_deg < 1e-9 || (step_deg - dist_to_end).abs() < 1e-9 {
                // Snap to the segment end to avoid drift.
                self.position = segment_end;
                route.segment += 1;
            }
        }

        let moved_km = moved_deg * KM_PER_DEGREE;
        self.traveled_km += moved_km;
        moved_km
    }

    fn has_reached_destination(&self) -> bool {
        self.route
            .as_ref()
            .is_some_and(|r| r.time_to_destination_min <= ARRIVAL_EPSILON_MIN)
    }

    fn update_range(&mut self) {
        self.current_range_km = self.max_range_km * (self.soc / 100.0);
    }
}

/// Per-step inputs for the user simulation, shared across all users.
pub struct UserStepCtx<'a> {
    pub hour: u32,
    pub month: u32,
    pub step_hours: f32,
    pub bounds: &'a MapBounds,
    pub peak_hours: &'a [u32],
    pub valley_hours: &'a [u32],
    /// Charge decisions are skipped when charge-to-full is below this.
    pub min_charge_threshold_percent: f32,
    /// SoC at or below which the decision is forced.
    pub force_charge_soc_threshold: f32,
}

impl UserStepCtx<'_> {
    fn is_peak(&self) -> bool {
        self.peak_hours.contains(&self.hour)
    }

    fn is_valley(&self) -> bool {
        self.valley_hours.contains(&self.hour)
    }
}

/// Advances every user by one step.
///
/// Users who are charging or waiting are frozen except for the
/// needs-charge flag reset; everyone else consumes energy, moves along
/// routes, and re-evaluates the charge decision.
pub fn simulate_users(users: &mut BTreeMap<UserId, User>, ctx: &UserStepCtx, rng: &mut StdRng) {
    for user in users.values_mut() {
        advance_user(user, ctx, rng);
    }
}

fn advance_user(user: &mut User, ctx: &UserStepCtx, rng: &mut StdRng) {
    // Decisions below branch on the state the user entered the step with;
    // transitions made mid-step take full effect next step.
    let status_at_entry = user.status;

    // Post-charge dwell, then a fresh random trip.
    if status_at_entry == UserStatus::PostCharge {
        let timer = *user.post_charge_timer.get_or_insert_with(|| rng.random_range(1..=4));
        if timer > 0 {
            user.post_charge_timer = Some(timer - 1);
        } else {
            let mut destination = ctx.bounds.random_point(rng);
            while user.position.distance_km(&destination) < 0.1 {
                destination = ctx.bounds.random_point(rng);
            }
            user.status = UserStatus::Traveling;
            user.post_charge_timer = None;
            user.needs_charge_decision = false;
            if user.plan_route_to_destination(destination, rng) {
                debug!(user = %user.id, "departing after charge");
            } else {
                warn!(user = %user.id, "post-charge route planning failed, going idle");
                user.status = UserStatus::Idle;
                user.route = None;
            }
        }
    }

    // Parasitic consumption for everyone not plugged in or queued.
    if !matches!(status_at_entry, UserStatus::Charging | UserStatus::Waiting) {
        let mut rate = user.vehicle_class.idle_rate_kwh_per_hour();

        let season_factor = match ctx.month {
            6..=8 => 2.2,
            12 | 1 | 2 => 2.5,
            _ => 1.3,
        };
        rate *= season_factor;

        let time_factor = match ctx.hour {
            6..=8 | 17..=19 => 1.6,
            22..=23 | 0..=4 => 0.8,
            _ => 1.0,
        };
        rate *= time_factor;
        rate *= rng.random_range(0.9..=1.8f32);

        let energy_used = rate * ctx.step_hours;
        if user.battery_capacity_kwh > 0.0 {
            let soc_decrease = energy_used / user.battery_capacity_kwh * 100.0;
            user.soc = (user.soc - soc_decrease).max(0.0);
        }
    }

    // Charge-need re-evaluation.
    user.needs_charge_decision = false;
    if matches!(
        status_at_entry,
        UserStatus::Idle | UserStatus::Traveling | UserStatus::PostCharge
    ) && user.target_charger.is_none()
    {
        let charge_to_full = 100.0 - user.soc;
        if charge_to_full < ctx.min_charge_threshold_percent {
            // Not worth a session.
        } else if user.soc <= ctx.force_charge_soc_threshold {
            user.needs_charge_decision = true;
            debug!(user = %user.id, soc = user.soc, "SoC critical, forcing charge need");
        } else {
            let mut p = charging_probability(user, ctx);
            if status_at_entry == UserStatus::PostCharge
                && user.post_charge_timer.is_some_and(|t| t > 0)
            {
                p *= 0.1;
            }
            if status_at_entry == UserStatus::Traveling
                && user.last_destination_kind == Some(DestinationKind::Random)
            {
                p *= if user.soc > 60.0 { 0.1 } else { 1.2 };
            }
            if user.soc > 75.0 {
                p *= 0.01;
            } else if user.soc > 60.0 {
                p *= 0.1;
            }
            if user.user_type.is_commercial() {
                p *= if user.soc > 50.0 { 0.5 } else { 1.2 };
            }
            if ctx.is_peak() {
                p *= if user.soc > 60.0 { 0.5 } else { 1.2 };
            }
            if user.soc > 20.0 && user.soc <= 35.0 {
                p *= 1.5;
            }
            let p = p.clamp(0.0, 1.0);
            if rng.random::<f32>() < p {
                user.needs_charge_decision = true;
            }
        }
    }

    // A flagged user on a random trip abandons it and waits for dispatch.
    if user.needs_charge_decision
        && status_at_entry == UserStatus::Traveling
        && user.last_destination_kind == Some(DestinationKind::Random)
    {
        debug!(user = %user.id, "stopping random travel to await charge dispatch");
        user.status = UserStatus::Idle;
        user.route = None;
    }

    // Movement along the planned route.
    if status_at_entry == UserStatus::Traveling && user.route.is_some() {
        let speed = if user.travel_speed_kmh > 0.0 {
            user.travel_speed_kmh
        } else {
            45.0
        };
        let distance_this_step = speed * ctx.step_hours;
        let moved_km = user.advance_along_route(distance_this_step);

        // Per-km travel energy with vehicle, style, and condition factors.
        let mut energy_per_km = 0.25 * (1.0 + speed / 80.0);
        energy_per_km *= user.vehicle_class.travel_energy_factor();
        energy_per_km *= user.driving_style.energy_factor();
        let road = rng.random_range(1.0..=1.3f32);
        let weather = rng.random_range(1.0..=1.2f32);
        let traffic = if ctx.is_peak() {
            rng.random_range(1.1..=1.4f32)
        } else {
            1.0
        };
        energy_per_km *= road * weather * traffic;

        if user.battery_capacity_kwh > 0.0 {
            let soc_decrease = moved_km * energy_per_km / user.battery_capacity_kwh * 100.0;
            user.soc = (user.soc - soc_decrease).max(0.0);
        }

        if let Some(route) = &mut user.route {
            let minutes_taken = moved_km / speed * 60.0;
            route.time_to_destination_min = (route.time_to_destination_min - minutes_taken).max(0.0);
        }

        if user.has_reached_destination() {
            let destination = user.route.as_ref().map(|r| r.destination);
            if let Some(dest) = destination {
                user.position = dest;
            }
            user.route = None;

            if user.target_charger.is_some() {
                debug!(user = %user.id, "arrived at target charger, waiting");
                user.status = UserStatus::Waiting;
            } else if user.last_destination_kind == Some(DestinationKind::Charger) {
                warn!(user = %user.id, "arrived at a charger destination without a target id");
                user.status = UserStatus::Waiting;
            } else {
                user.status = UserStatus::Idle;
                user.target_charger = None;
                if user.soc < 70.0 {
                    user.needs_charge_decision = true;
                }
            }
        }
    }

    user.update_range();
}

/// Probability that a user decides to seek a charge this step, before the
/// situational multipliers applied in [`simulate_users`].
pub fn charging_probability(user: &User, ctx: &UserStepCtx) -> f32 {
    let charge_to_full = 100.0 - user.soc;
    if charge_to_full < ctx.min_charge_threshold_percent {
        return 0.0;
    }

    let mut base = 1.0 / (1.0 + (SOC_STEEPNESS * (user.soc - SOC_MIDPOINT)).exp());
    base = base.clamp(0.05, 0.95);
    if user.soc > 75.0 {
        base *= 0.1;
    } else if user.soc > 60.0 {
        base *= 0.3;
    }

    let type_bonus = user.user_type.probability_bonus();

    let preference_bonus = if ctx.is_valley() {
        0.2
    } else if !ctx.is_peak() {
        0.1
    } else {
        0.0
    };

    let profile_bonus = match user.profile {
        UserProfile::Anxious => 0.2,
        UserProfile::Economic => -0.1,
        UserProfile::Urgent | UserProfile::Flexible => 0.0,
    };

    let force = ctx.force_charge_soc_threshold;
    let emergency_boost = if user.soc <= force + 5.0 {
        if user.soc > force {
            0.4 * (1.0 - (user.soc - force) / 5.0)
        } else {
            0.4
        }
    } else {
        0.0
    };

    (base + type_bonus + preference_bonus + profile_bonus + emergency_boost).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    pub(crate) fn test_user(id: &str, soc: f32) -> User {
        let (battery, range, power) = VehicleClass::Sedan.spec();
        User {
            id: id.to_string(),
            vehicle_class: VehicleClass::Sedan,
            user_type: UserType::Private,
            profile: UserProfile::Flexible,
            driving_style: DrivingStyle::Normal,
            battery_capacity_kwh: battery,
            soc,
            max_range_km: range,
            current_range_km: range * soc / 100.0,
            max_charging_power_kw: power,
            charging_efficiency: 0.92,
            position: Point::new(30.75, 114.25),
            status: UserStatus::Idle,
            target_charger: None,
            route: None,
            travel_speed_kmh: 45.0,
            time_sensitivity: 0.5,
            price_sensitivity: 0.5,
            range_anxiety: 0.0,
            needs_charge_decision: false,
            last_destination_kind: None,
            post_charge_timer: None,
            target_soc: None,
            initial_soc: None,
            traveled_km: 0.0,
            charging_history: Vec::new(),
        }
    }

    fn test_ctx<'a>(bounds: &'a MapBounds, peak: &'a [u32], valley: &'a [u32]) -> UserStepCtx<'a> {
        UserStepCtx {
            hour: 12,
            month: 4,
            step_hours: 0.25,
            bounds,
            peak_hours: peak,
            valley_hours: valley,
            min_charge_threshold_percent: 25.0,
            force_charge_soc_threshold: 20.0,
        }
    }

    #[test]
    fn force_threshold_overrides_probability() {
        let bounds = MapBounds::default();
        let ctx = test_ctx(&bounds, &[], &[]);
        let mut rng = StdRng::seed_from_u64(12345);
        let mut user = test_user("user_0001", 15.0);
        advance_user(&mut user, &ctx, &mut rng);
        assert!(user.needs_charge_decision);
    }

    #[test]
    fn nearly_full_user_never_flags() {
        let bounds = MapBounds::default();
        let ctx = test_ctx(&bounds, &[], &[]);
        let mut rng = StdRng::seed_from_u64(99);
        // Charge-to-full of 10% is below the 25% minimum.
        let mut user = test_user("user_0001", 90.0);
        for _ in 0..20 {
            user.soc = 90.0;
            advance_user(&mut user, &ctx, &mut rng);
            assert!(!user.needs_charge_decision);
        }
    }

    #[test]
    fn soc_never_goes_negative() {
        let bounds = MapBounds::default();
        let ctx = test_ctx(&bounds, &[], &[]);
        let mut rng = StdRng::seed_from_u64(5);
        let mut user = test_user("user_0001", 0.3);
        for _ in 0..50 {
            advance_user(&mut user, &ctx, &mut rng);
            assert!(user.soc >= 0.0);
            assert!(user.soc <= 100.0);
        }
    }

    #[test]
    fn planned_route_has_expected_shape() {
        let mut rng = StdRng::seed_from_u64(21);
        let mut user = test_user("user_0001", 80.0);
        let end = Point::new(30.9, 114.4);
        assert!(user.plan_route(end, &mut rng));
        let route = user.route.as_ref();
        let points = route.map(|r| r.points.len());
        // Start + 1..=3 waypoints + destination.
        assert!(points.is_some_and(|n| (3..=5).contains(&n)));
        assert!(route.is_some_and(|r| r.total_km >= user.position.distance_km(&end) - 1e-3));
        assert!(route.is_some_and(|r| r.time_to_destination_min > 0.0));
    }

    #[test]
    fn route_planning_is_deterministic_per_seed() {
        let end = Point::new(30.9, 114.4);
        let mut a = test_user("user_0001", 80.0);
        let mut b = test_user("user_0001", 80.0);
        let mut rng_a = StdRng::seed_from_u64(77);
        let mut rng_b = StdRng::seed_from_u64(77);
        assert!(a.plan_route(end, &mut rng_a));
        assert!(b.plan_route(end, &mut rng_b));
        let pa = a.route.map(|r| r.points);
        let pb = b.route.map(|r| r.points);
        assert_eq!(pa, pb);
    }

    #[test]
    fn route_planning_rejects_non_finite_positions() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut user = test_user("user_0001", 80.0);
        user.position = Point::new(f32::NAN, 114.0);
        assert!(!user.plan_route(Point::new(30.9, 114.4), &mut rng));
        assert!(user.route.is_none());
    }

    #[test]
    fn traveler_reaches_destination_and_goes_idle() {
        let bounds = MapBounds::default();
        let ctx = test_ctx(&bounds, &[], &[]);
        let mut rng = StdRng::seed_from_u64(11);
        let mut user = test_user("user_0001", 95.0);
        // Short hop: ~1.1 km, reachable within one 15-minute step at 45 km/h.
        let end = Point::new(30.755, 114.258);
        assert!(user.plan_route_to_destination(end, &mut rng));
        user.status = UserStatus::Traveling;

        let mut arrived = false;
        for _ in 0..10 {
            advance_user(&mut user, &ctx, &mut rng);
            if user.status != UserStatus::Traveling {
                arrived = true;
                break;
            }
        }
        assert!(arrived);
        assert!(matches!(user.status, UserStatus::Idle));
        assert!(user.route.is_none());
    }

    #[test]
    fn arrival_at_charger_transitions_to_waiting() {
        let bounds = MapBounds::default();
        let ctx = test_ctx(&bounds, &[], &[]);
        let mut rng = StdRng::seed_from_u64(13);
        let mut user = test_user("user_0001", 50.0);
        let charger_pos = Point::new(30.755, 114.252);
        user.target_charger = Some("charger_0001".to_string());
        assert!(user.plan_route_to_charger(charger_pos, &mut rng));
        user.status = UserStatus::Traveling;

        for _ in 0..20 {
            advance_user(&mut user, &ctx, &mut rng);
            if user.status == UserStatus::Waiting {
                break;
            }
        }
        assert_eq!(user.status, UserStatus::Waiting);
        assert_eq!(user.target_charger.as_deref(), Some("charger_0001"));
    }

    #[test]
    fn post_charge_timer_expires_into_travel_or_idle() {
        let bounds = MapBounds::default();
        let ctx = test_ctx(&bounds, &[], &[]);
        let mut rng = StdRng::seed_from_u64(17);
        let mut user = test_user("user_0001", 95.0);
        user.status = UserStatus::PostCharge;
        user.post_charge_timer = Some(1);

        for _ in 0..5 {
            advance_user(&mut user, &ctx, &mut rng);
            if user.status != UserStatus::PostCharge {
                break;
            }
        }
        assert!(matches!(user.status, UserStatus::Traveling | UserStatus::Idle));
        assert!(user.post_charge_timer.is_none());
    }

    #[test]
    fn probability_rises_as_soc_falls() {
        let bounds = MapBounds::default();
        let ctx = test_ctx(&bounds, &[], &[]);
        let low = charging_probability(&test_user("u", 25.0), &ctx);
        let high = charging_probability(&test_user("u", 70.0), &ctx);
        assert!(low > high);
        assert!((0.0..=1.0).contains(&low));
        assert!((0.0..=1.0).contains(&high));
    }

    #[test]
    fn charging_user_does_not_consume() {
        let bounds = MapBounds::default();
        let ctx = test_ctx(&bounds, &[], &[]);
        let mut rng = StdRng::seed_from_u64(31);
        let mut user = test_user("user_0001", 55.0);
        user.status = UserStatus::Charging;
        advance_user(&mut user, &ctx, &mut rng);
        assert_eq!(user.soc, 55.0);
    }
}
