//! World model: entities, per-step state snapshot, and the orchestrator.

pub mod charger;
pub mod clock;
pub mod environment;
pub mod grid;
pub mod metrics;
pub mod user;

use std::collections::BTreeMap;

use crate::sim::charger::Charger;
use crate::sim::grid::GridSnapshot;
use crate::sim::user::User;

/// User identifier (`user_0001` style).
pub type UserId = String;
/// Charger identifier (`charger_0001` style).
pub type ChargerId = String;

/// Complete snapshot of the simulation at one step boundary.
///
/// This is the single value exchanged between the scheduler, the
/// environment, and the metrics computation; nothing is shared by
/// back-reference. Entity maps are `BTreeMap` so that iteration order is
/// stable across runs with the same seed.
#[derive(Debug, Clone)]
pub struct SimState {
    /// Steps completed since reset.
    pub step: u64,
    /// Simulated minutes elapsed since reset.
    pub elapsed_minutes: f64,
    /// Hour of day (0-23) at this snapshot.
    pub hour: u32,
    /// Calendar month (1-12), fixed for the run.
    pub month: u32,
    pub users: BTreeMap<UserId, User>,
    pub chargers: BTreeMap<ChargerId, Charger>,
    pub grid: GridSnapshot,
}
