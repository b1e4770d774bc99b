//! Uncoordinated baseline: every low-SoC user independently picks the
//! closest tolerable charger in random order, with no global optimization.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{debug, info};

use crate::sim::SimState;
use crate::sim::charger::ChargerStatus;
use crate::sim::user::User;

use super::Decisions;

/// Flat SoC threshold below which users start looking for a charger.
const SOC_THRESHOLD: f32 = 50.0;
/// Below this SoC, distance is the only criterion.
const CRITICAL_SOC: f32 = 20.0;
/// Users walk away from chargers with this many parties already waiting.
const MAX_TOLERATED_QUEUE: usize = 4;
/// Cost weight on distance when the queue also matters.
const DISTANCE_WEIGHT: f32 = 0.7;
/// Cost equivalent of one queued user, in kilometres.
const QUEUE_KM_EQUIVALENT: f32 = 5.0;

/// Produces assignments the way selfish drivers would.
pub fn schedule(state: &SimState, rng: &mut StdRng) -> Decisions {
    let mut decisions = Decisions::new();
    if state.users.is_empty() || state.chargers.is_empty() {
        debug!("uncoordinated: empty state, nothing to schedule");
        return decisions;
    }

    let mut candidates: Vec<&User> = state
        .users
        .values()
        .filter(|u| {
            !u.is_engaged() && (u.needs_charge_decision || u.soc < SOC_THRESHOLD)
        })
        .collect();
    if candidates.is_empty() {
        return decisions;
    }
    // Random decision order stands in for uncoordinated arrival timing.
    candidates.shuffle(rng);

    // What each driver "sees": the real queue plus whoever headed out this
    // round.
    let mut heading_there: BTreeMap<&str, usize> = BTreeMap::new();

    for user in candidates {
        // Equal costs break toward the shorter queue, then the lower id.
        let mut best: Option<(f32, usize, &str)> = None;
        for (charger_id, charger) in &state.chargers {
            if charger.status == ChargerStatus::Failure {
                continue;
            }
            let total_waiting =
                charger.occupancy_load() + heading_there.get(charger_id.as_str()).copied().unwrap_or(0);
            if total_waiting >= MAX_TOLERATED_QUEUE {
                continue;
            }
            let distance = user.position.distance_km(&charger.position);
            if !distance.is_finite() {
                continue;
            }
            let cost = if user.soc < CRITICAL_SOC {
                distance
            } else {
                distance * DISTANCE_WEIGHT + total_waiting as f32 * QUEUE_KM_EQUIVALENT
            };
            let candidate = (cost, total_waiting, charger_id.as_str());
            let better = best.is_none_or(|(c, w, id)| {
                cost < c || (cost == c && (total_waiting, charger_id.as_str()) < (w, id))
            });
            if better {
                best = Some(candidate);
            }
        }

        if let Some((_, _, charger_id)) = best {
            decisions.insert(user.id.clone(), charger_id.to_string());
            *heading_there.entry(charger_id).or_insert(0) += 1;
        }
    }

    info!(assignments = decisions.len(), "uncoordinated schedule complete");
    decisions
}
