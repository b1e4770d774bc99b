//! Shared test fixtures for integration tests.

use evfleet_sim::config::ScenarioConfig;

/// Small, fast scenario: 1 day, hourly steps, 25 users, 6 chargers.
pub fn small_scenario(algorithm: &str, seed: u64) -> ScenarioConfig {
    let mut cfg = ScenarioConfig::baseline();
    cfg.simulation.days = 1;
    cfg.simulation.step_minutes = 60;
    cfg.simulation.seed = seed;
    cfg.simulation.algorithm = algorithm.to_string();
    cfg.users.count = 25;
    cfg.chargers.station_count = 3;
    cfg.chargers.chargers_per_station = 2;
    cfg
}

/// Scenario with quarter-hour steps, closer to the production default.
pub fn quarter_hour_scenario(algorithm: &str, seed: u64) -> ScenarioConfig {
    let mut cfg = small_scenario(algorithm, seed);
    cfg.simulation.step_minutes = 15;
    cfg
}
