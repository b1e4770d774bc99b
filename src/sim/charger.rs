//! Charger state machine: charging-session lifecycle, queue admission, and
//! revenue/energy accounting.

use std::collections::{BTreeMap, VecDeque};

use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::geo::Point;
use crate::sim::grid::GridSnapshot;
use crate::sim::user::{User, UserStatus};
use crate::sim::{ChargerId, UserId};

/// Sessions end once SoC is within this of the target.
const TARGET_SOC_SLACK: f32 = 0.5;
/// Energy deliveries below this are treated as session completion checks.
const MIN_DELIVERY_KWH: f32 = 0.01;

/// Hardware class of a charger, fixing power band, price multiplier
/// defaults, and the session time cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargerKind {
    Normal,
    Fast,
    Superfast,
}

impl ChargerKind {
    /// Maximum session length before forced termination, in minutes.
    pub fn max_session_minutes(&self) -> f64 {
        match self {
            Self::Superfast => 30.0,
            Self::Fast => 60.0,
            Self::Normal => 180.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargerStatus {
    Available,
    Occupied,
    /// Fixed at initialization; a failed charger accepts no assignments and
    /// drains no queue.
    Failure,
}

/// Why a charging session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEnd {
    TargetReached,
    TimeLimitExceeded,
}

/// Record emitted when a charging session terminates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargingSession {
    pub user_id: UserId,
    pub charger_id: ChargerId,
    /// Simulated minutes since reset at session start.
    pub start_min: f64,
    pub end_min: f64,
    pub duration_min: f64,
    pub initial_soc: f32,
    pub final_soc: f32,
    /// Energy drawn from the grid over the session (kWh).
    pub energy_kwh: f32,
    pub cost: f32,
    pub reason: SessionEnd,
}

/// One charging point.
#[derive(Debug, Clone)]
pub struct Charger {
    pub id: ChargerId,
    /// Station the charger belongs to.
    pub station: String,
    pub kind: ChargerKind,
    pub max_power_kw: f32,
    pub position: Point,
    pub status: ChargerStatus,
    /// Set iff `status == Occupied`.
    pub current_user: Option<UserId>,
    /// Simulated minutes at which the current session started.
    pub charging_start_min: Option<f64>,
    /// FIFO queue of waiting users, bounded by `queue_capacity`.
    pub queue: VecDeque<UserId>,
    pub queue_capacity: usize,
    pub daily_revenue: f32,
    pub daily_energy_kwh: f32,
    /// Counter values at session start, for per-session deltas.
    session_energy_mark: f32,
    session_revenue_mark: f32,
    pub price_multiplier: f32,
    pub region: String,
}

impl Charger {
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        id: ChargerId,
        station: String,
        kind: ChargerKind,
        max_power_kw: f32,
        position: Point,
        failed: bool,
        queue_capacity: usize,
        price_multiplier: f32,
        region: String,
    ) -> Self {
        Self {
            id,
            station,
            kind,
            max_power_kw,
            position,
            status: if failed {
                ChargerStatus::Failure
            } else {
                ChargerStatus::Available
            },
            current_user: None,
            charging_start_min: None,
            queue: VecDeque::new(),
            queue_capacity,
            daily_revenue: 0.0,
            daily_energy_kwh: 0.0,
            session_energy_mark: 0.0,
            session_revenue_mark: 0.0,
            price_multiplier,
            region,
        }
    }

    /// Occupancy plus queue length, the load figure the schedulers use.
    pub fn occupancy_load(&self) -> usize {
        self.queue.len() + usize::from(self.status == ChargerStatus::Occupied)
    }

    /// Admits an arrived user into the waiting queue.
    ///
    /// Returns `false` when the queue is full; duplicate entries are
    /// ignored and reported as success.
    pub fn try_enqueue(&mut self, user_id: &UserId) -> bool {
        if self.queue.contains(user_id) {
            return true;
        }
        if self.queue.len() >= self.queue_capacity {
            return false;
        }
        self.queue.push_back(user_id.clone());
        true
    }

    /// Starts a session for `user`, marking counters for per-session deltas.
    fn begin_session(&mut self, user: &mut User, now_min: f64) {
        self.status = ChargerStatus::Occupied;
        self.current_user = Some(user.id.clone());
        self.charging_start_min = Some(now_min);
        self.session_energy_mark = self.daily_energy_kwh;
        self.session_revenue_mark = self.daily_revenue;

        user.status = UserStatus::Charging;
        user.target_soc = Some((user.soc + 60.0).min(95.0));
        user.initial_soc = Some(user.soc);
    }

    /// Ends the current session, reverting to available and emitting the
    /// session record.
    fn end_session(&mut self, user: &mut User, now_min: f64, reason: SessionEnd, rng: &mut StdRng) -> ChargingSession {
        let start_min = self.charging_start_min.unwrap_or(now_min);
        let session = ChargingSession {
            user_id: user.id.clone(),
            charger_id: self.id.clone(),
            start_min,
            end_min: now_min,
            duration_min: now_min - start_min,
            initial_soc: user.initial_soc.unwrap_or(user.soc),
            final_soc: user.soc,
            energy_kwh: self.daily_energy_kwh - self.session_energy_mark,
            cost: self.daily_revenue - self.session_revenue_mark,
            reason,
        };

        self.status = ChargerStatus::Available;
        self.current_user = None;
        self.charging_start_min = None;
        self.session_energy_mark = self.daily_energy_kwh;
        self.session_revenue_mark = self.daily_revenue;

        user.status = UserStatus::PostCharge;
        user.target_charger = None;
        user.post_charge_timer = Some(rng.random_range(1..=3));
        user.target_soc = None;
        user.initial_soc = None;
        user.charging_history.push(session.clone());

        session
    }
}

/// Power derating as a function of SoC: full rate below 20%, then three
/// progressively steeper taper segments.
pub fn soc_derating(soc: f32) -> f32 {
    let factor = if soc < 20.0 {
        1.0
    } else if soc < 50.0 {
        1.0 - (soc - 20.0) / 30.0 * 0.1
    } else if soc < 80.0 {
        0.9 - (soc - 50.0) / 30.0 * 0.2
    } else {
        0.7 - (soc - 80.0) / 20.0 * 0.5
    };
    factor.max(0.1)
}

/// Advances every charger by one step.
///
/// Returns the total EV load drawn from the grid (kW) and the sessions
/// completed this step.
pub fn simulate_chargers(
    chargers: &mut BTreeMap<ChargerId, Charger>,
    users: &mut BTreeMap<UserId, User>,
    now_min: f64,
    step_minutes: u32,
    grid: &GridSnapshot,
    rng: &mut StdRng,
) -> (f32, Vec<ChargingSession>) {
    let step_hours = step_minutes as f32 / 60.0;
    let mut total_ev_load_kw = 0.0;
    let mut completed = Vec::new();

    for charger in chargers.values_mut() {
        if charger.status == ChargerStatus::Failure {
            continue;
        }

        // Deliver energy to the plugged-in user, if any.
        if charger.status == ChargerStatus::Occupied {
            let Some(user_id) = charger.current_user.clone() else {
                warn!(charger = %charger.id, "occupied without a current user, releasing");
                charger.status = ChargerStatus::Available;
                charger.charging_start_min = None;
                continue;
            };
            let Some(user) = users.get_mut(&user_id) else {
                warn!(charger = %charger.id, user = %user_id, "current user vanished, releasing");
                charger.status = ChargerStatus::Available;
                charger.current_user = None;
                charger.charging_start_min = None;
                continue;
            };

            let target_soc = user.target_soc.unwrap_or(95.0);
            let power_limit_kw = charger.max_power_kw.min(user.max_charging_power_kw);
            let actual_power_kw = power_limit_kw * soc_derating(user.soc);
            let efficiency = user.charging_efficiency;
            let power_to_battery_kw = actual_power_kw * efficiency;

            let soc_needed = (target_soc - user.soc).max(0.0);
            let energy_needed_kwh = soc_needed / 100.0 * user.battery_capacity_kwh;
            let max_energy_kwh = power_to_battery_kw * step_hours;
            let delivered_kwh = energy_needed_kwh.min(max_energy_kwh);
            let from_grid_kwh = if efficiency > 0.0 {
                delivered_kwh / efficiency
            } else {
                delivered_kwh
            };

            if delivered_kwh > MIN_DELIVERY_KWH {
                if user.battery_capacity_kwh > 0.0 {
                    user.soc = (user.soc + delivered_kwh / user.battery_capacity_kwh * 100.0).min(100.0);
                }
                user.current_range_km = user.max_range_km * (user.soc / 100.0);

                if step_hours > 0.0 {
                    total_ev_load_kw += from_grid_kwh / step_hours;
                }
                let revenue = from_grid_kwh * grid.current_price * charger.price_multiplier;
                charger.daily_revenue += revenue;
                charger.daily_energy_kwh += from_grid_kwh;

                let start_min = charger.charging_start_min.unwrap_or(now_min);
                let duration_min = now_min - start_min;
                let max_minutes = charger.kind.max_session_minutes();

                if user.soc >= target_soc - TARGET_SOC_SLACK || duration_min >= max_minutes - 0.1 {
                    let reason = if user.soc >= target_soc - TARGET_SOC_SLACK {
                        SessionEnd::TargetReached
                    } else {
                        SessionEnd::TimeLimitExceeded
                    };
                    info!(
                        charger = %charger.id,
                        user = %user_id,
                        final_soc = user.soc,
                        ?reason,
                        "charging session finished"
                    );
                    completed.push(charger.end_session(user, now_min, reason, rng));
                }
            } else if user.soc >= target_soc - 1.0 {
                // Nothing meaningful left to deliver.
                debug!(charger = %charger.id, user = %user_id, "session complete, negligible delivery");
                completed.push(charger.end_session(user, now_min, SessionEnd::TargetReached, rng));
            }
        }

        // Admit the head of the queue once the plug is free.
        if charger.status == ChargerStatus::Available {
            while let Some(next_id) = charger.queue.front().cloned() {
                match users.get_mut(&next_id) {
                    None => {
                        warn!(charger = %charger.id, user = %next_id, "queued user no longer exists, dropping");
                        charger.queue.pop_front();
                        // Re-examine the new head.
                    }
                    Some(next_user) if next_user.status == UserStatus::Waiting => {
                        info!(charger = %charger.id, user = %next_id, "starting charging from queue");
                        charger.begin_session(next_user, now_min);
                        charger.queue.pop_front();
                        break;
                    }
                    Some(next_user) => {
                        // Left in place for re-evaluation next step.
                        warn!(
                            charger = %charger.id,
                            user = %next_id,
                            status = ?next_user.status,
                            "head of queue is not waiting, skipping this step"
                        );
                        break;
                    }
                }
            }
        }
    }

    (total_ev_load_kw, completed)
}
