//! TOML-based scenario configuration and preset definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::geo::MapBounds;

/// Top-level scenario configuration parsed from TOML.
///
/// Every section has defaults matching the baseline scenario, so a partial
/// file (or an empty one) is always valid. Load from TOML with
/// [`ScenarioConfig::from_toml_file`] or use [`ScenarioConfig::baseline`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScenarioConfig {
    /// Simulation timing and global parameters.
    pub simulation: SimulationConfig,
    /// Map rectangle in degrees.
    pub map: MapBounds,
    /// User population parameters.
    pub users: UsersConfig,
    /// Charging-station population parameters.
    pub chargers: ChargersConfig,
    /// Scheduler weights and rule-based tuning.
    pub scheduler: SchedulerConfig,
    /// MARL hyperparameters and action-space tuning.
    pub marl: MarlConfig,
    /// Regional grid profiles, prices, and peak/valley hours.
    pub grid: GridConfig,
}

/// Simulation timing and global parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Number of simulated days (must be > 0).
    pub days: u32,
    /// Length of one step in minutes (must divide an hour evenly is not
    /// required, but must be > 0).
    pub step_minutes: u32,
    /// Hour of day at which the simulation clock starts (0-23).
    pub start_hour: u32,
    /// Calendar month used for seasonal consumption factors (1-12).
    pub start_month: u32,
    /// Master random seed.
    pub seed: u64,
    /// Scheduling algorithm: `"rule_based"`, `"uncoordinated"`,
    /// `"coordinated_mas"`, or `"marl"`.
    pub algorithm: String,
    /// Whether metrics include the analytical uncoordinated baseline.
    pub enable_baseline: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            days: 7,
            step_minutes: 15,
            start_hour: 0,
            start_month: 1,
            seed: 42,
            algorithm: "rule_based".to_string(),
            enable_baseline: true,
        }
    }
}

/// User population parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UsersConfig {
    /// Number of simulated users (must be > 0).
    pub count: usize,
    /// Vehicle classes drawn from uniformly at population build time.
    /// Known classes: `sedan`, `suv`, `compact`, `truck`, `luxury`.
    pub vehicle_classes: Vec<String>,
    /// Scheduling is skipped for users whose charge-to-full is below this.
    pub min_charge_threshold_percent: f32,
    /// SoC at or below which a charge decision is forced.
    pub force_charge_soc_threshold: f32,
}

impl Default for UsersConfig {
    fn default() -> Self {
        Self {
            count: 1000,
            vehicle_classes: vec!["sedan".to_string(), "suv".to_string()],
            min_charge_threshold_percent: 25.0,
            force_charge_soc_threshold: 20.0,
        }
    }
}

/// Charging-station population parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChargersConfig {
    /// Number of stations placed on the map (must be > 0).
    pub station_count: usize,
    /// Chargers generated per station (must be > 0).
    pub chargers_per_station: usize,
    /// Waiting-queue capacity per charger.
    pub queue_capacity: usize,
    /// Probability that a charger is permanently failed at initialization.
    pub failure_rate: f32,
    /// Fraction of chargers that are superfast.
    pub superfast_ratio: f32,
    /// Fraction of chargers that are fast.
    pub fast_ratio: f32,
    /// Power range [min, max] kW for superfast chargers.
    pub superfast_power_kw: [f32; 2],
    /// Power range [min, max] kW for fast chargers.
    pub fast_power_kw: [f32; 2],
    /// Power range [min, max] kW for normal chargers.
    pub normal_power_kw: [f32; 2],
    /// Price multiplier for superfast chargers.
    pub superfast_price_multiplier: f32,
    /// Price multiplier for fast chargers.
    pub fast_price_multiplier: f32,
    /// Price multiplier for normal chargers.
    pub normal_price_multiplier: f32,
}

impl Default for ChargersConfig {
    fn default() -> Self {
        Self {
            station_count: 20,
            chargers_per_station: 10,
            queue_capacity: 5,
            failure_rate: 0.0,
            superfast_ratio: 0.1,
            fast_ratio: 0.4,
            superfast_power_kw: [250.0, 400.0],
            fast_power_kw: [60.0, 120.0],
            normal_power_kw: [7.0, 20.0],
            superfast_price_multiplier: 1.5,
            fast_price_multiplier: 1.2,
            normal_price_multiplier: 1.0,
        }
    }
}

/// Objective weights shared by the rule-based scheduler, the coordinator,
/// and the metrics total.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizationWeights {
    pub user_satisfaction: f32,
    pub operator_profit: f32,
    pub grid_friendliness: f32,
}

impl Default for OptimizationWeights {
    fn default() -> Self {
        Self {
            user_satisfaction: 0.33,
            operator_profit: 0.33,
            grid_friendliness: 0.34,
        }
    }
}

/// Scheduler weights and rule-based tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Base objective weights before time-of-day adjustment.
    pub weights: OptimizationWeights,
    /// Rule-based: number of nearest chargers evaluated per candidate.
    pub candidate_limit: usize,
    /// Rule-based: score penalty per queued user.
    pub queue_penalty: f32,
    /// Rule-based: maximum tolerated charger load during peak hours.
    pub max_queue_peak: usize,
    /// Rule-based: maximum tolerated charger load during valley hours.
    pub max_queue_valley: usize,
    /// Rule-based: maximum tolerated charger load otherwise.
    pub max_queue_shoulder: usize,
    /// Rule-based: base SoC threshold that makes a user a candidate.
    pub default_charge_soc_threshold: f32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            weights: OptimizationWeights::default(),
            candidate_limit: 15,
            queue_penalty: 0.05,
            max_queue_peak: 3,
            max_queue_valley: 12,
            max_queue_shoulder: 6,
            default_charge_soc_threshold: 40.0,
        }
    }
}

/// MARL hyperparameters and action-space tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MarlConfig {
    /// Q-table row width; action 0 is idle, 1..size map to users.
    pub action_space_size: usize,
    /// Q-learning step size.
    pub learning_rate: f32,
    /// Q-learning discount factor.
    pub discount_factor: f32,
    /// Epsilon-greedy exploration rate.
    pub exploration_rate: f32,
    /// Q-table persistence path. A path with an extension is a single JSON
    /// blob; a path without one is a directory with one file per charger.
    /// Empty disables persistence.
    pub q_table_path: String,
    /// Squared candidate radius in degrees (0.15 deg ~ 16.6 km).
    pub candidate_max_dist_sq: f32,
    /// Priority weight on (1 - SoC/100).
    pub priority_w_soc: f32,
    /// Priority weight on (1 - normalized distance).
    pub priority_w_dist: f32,
    /// Priority weight on urgency.
    pub priority_w_urgency: f32,
}

impl Default for MarlConfig {
    fn default() -> Self {
        Self {
            action_space_size: 6,
            learning_rate: 0.01,
            discount_factor: 0.95,
            exploration_rate: 0.1,
            q_table_path: String::new(),
            candidate_max_dist_sq: 0.0225,
            priority_w_soc: 0.5,
            priority_w_dist: 0.4,
            priority_w_urgency: 0.1,
        }
    }
}

/// Per-region 24-hour profiles and capacity.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegionConfig {
    /// Hourly base load profile (kW), 24 entries expected.
    pub base_load: Vec<f32>,
    /// Hourly solar generation profile (kW), 24 entries expected.
    pub solar: Vec<f32>,
    /// Hourly wind generation profile (kW), 24 entries expected.
    pub wind: Vec<f32>,
    /// Regional system capacity (kW).
    pub capacity_kw: Option<f32>,
}

/// Regional grid profiles, prices, and peak/valley hours.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GridConfig {
    /// Hours billed at `peak_price`.
    pub peak_hours: Vec<u32>,
    /// Hours billed at `valley_price`.
    pub valley_hours: Vec<u32>,
    /// Price outside peak and valley hours.
    pub normal_price: f32,
    /// Price during peak hours.
    pub peak_price: f32,
    /// Price during valley hours.
    pub valley_price: f32,
    /// Number of synthetic regions generated when `regions` is empty.
    pub region_count: usize,
    /// Named regional profiles; missing or short profiles fall back to
    /// documented defaults with a logged warning instead of failing.
    pub regions: BTreeMap<String, RegionConfig>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            peak_hours: vec![7, 8, 9, 10, 18, 19, 20, 21],
            valley_hours: vec![0, 1, 2, 3, 4, 5],
            normal_price: 0.85,
            peak_price: 1.2,
            valley_price: 0.4,
            region_count: 5,
            regions: BTreeMap::new(),
        }
    }
}

/// Configuration error with field path and constraint description.
#[derive(Debug, Error)]
#[error("config error: {field} — {message}")]
pub struct ConfigError {
    /// Dotted field path (e.g., `"simulation.step_minutes"`).
    pub field: String,
    /// Human-readable constraint description.
    pub message: String,
}

impl ConfigError {
    fn new(field: &str, message: impl fmt::Display) -> Self {
        Self {
            field: field.to_string(),
            message: message.to_string(),
        }
    }
}

impl ScenarioConfig {
    /// Returns the baseline scenario.
    pub fn baseline() -> Self {
        Self::default()
    }

    /// Dense-city preset: more users per charger, some failed units.
    pub fn urban_dense() -> Self {
        Self {
            users: UsersConfig {
                count: 2000,
                ..UsersConfig::default()
            },
            chargers: ChargersConfig {
                station_count: 25,
                chargers_per_station: 8,
                failure_rate: 0.02,
                ..ChargersConfig::default()
            },
            ..Self::default()
        }
    }

    /// MARL preset: higher exploration, shorter horizon for training loops.
    pub fn marl_training() -> Self {
        Self {
            simulation: SimulationConfig {
                days: 3,
                algorithm: "marl".to_string(),
                ..SimulationConfig::default()
            },
            marl: MarlConfig {
                exploration_rate: 0.2,
                ..MarlConfig::default()
            },
            ..Self::default()
        }
    }

    /// Available preset names.
    pub const PRESETS: &[&str] = &["baseline", "urban_dense", "marl_training"];

    /// Loads a scenario from a named preset.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the preset name is unknown.
    pub fn from_preset(name: &str) -> Result<Self, ConfigError> {
        match name {
            "baseline" => Ok(Self::baseline()),
            "urban_dense" => Ok(Self::urban_dense()),
            "marl_training" => Ok(Self::marl_training()),
            _ => Err(ConfigError::new(
                "preset",
                format!(
                    "unknown preset \"{name}\", available: {}",
                    Self::PRESETS.join(", ")
                ),
            )),
        }
    }

    /// Parses a scenario from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the TOML is
    /// invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| {
            ConfigError::new("scenario", format!("cannot read \"{}\": {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses a scenario from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the TOML is invalid or contains unknown
    /// fields.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError::new("toml", e))
    }

    /// Validates all fields and returns a list of errors.
    ///
    /// Returns an empty vector if the configuration is valid. Regional
    /// profile defects are deliberately not errors: the grid model recovers
    /// from them with documented defaults at reset time.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let s = &self.simulation;

        if s.days == 0 {
            errors.push(ConfigError::new("simulation.days", "must be > 0"));
        }
        if s.step_minutes == 0 {
            errors.push(ConfigError::new("simulation.step_minutes", "must be > 0"));
        }
        if s.start_hour >= 24 {
            errors.push(ConfigError::new("simulation.start_hour", "must be in 0..=23"));
        }
        if !(1..=12).contains(&s.start_month) {
            errors.push(ConfigError::new("simulation.start_month", "must be in 1..=12"));
        }
        if crate::sched::Algorithm::parse(&s.algorithm).is_none() {
            errors.push(ConfigError::new(
                "simulation.algorithm",
                format!(
                    "must be one of rule_based, uncoordinated, coordinated_mas, marl; got \"{}\"",
                    s.algorithm
                ),
            ));
        }

        if self.map.lat_min >= self.map.lat_max {
            errors.push(ConfigError::new("map.lat_min", "must be < map.lat_max"));
        }
        if self.map.lng_min >= self.map.lng_max {
            errors.push(ConfigError::new("map.lng_min", "must be < map.lng_max"));
        }

        if self.users.count == 0 {
            errors.push(ConfigError::new("users.count", "must be > 0"));
        }
        if self.users.vehicle_classes.is_empty() {
            errors.push(ConfigError::new("users.vehicle_classes", "must not be empty"));
        }
        for class in &self.users.vehicle_classes {
            if crate::sim::user::VehicleClass::parse(class).is_none() {
                errors.push(ConfigError::new(
                    "users.vehicle_classes",
                    format!("unknown vehicle class \"{class}\""),
                ));
            }
        }

        let c = &self.chargers;
        if c.station_count == 0 {
            errors.push(ConfigError::new("chargers.station_count", "must be > 0"));
        }
        if c.chargers_per_station == 0 {
            errors.push(ConfigError::new("chargers.chargers_per_station", "must be > 0"));
        }
        if !(0.0..=1.0).contains(&c.failure_rate) {
            errors.push(ConfigError::new("chargers.failure_rate", "must be in [0.0, 1.0]"));
        }
        if c.superfast_ratio + c.fast_ratio > 1.0 {
            errors.push(ConfigError::new(
                "chargers.superfast_ratio",
                "superfast_ratio + fast_ratio must be <= 1.0",
            ));
        }
        for (field, range) in [
            ("chargers.superfast_power_kw", c.superfast_power_kw),
            ("chargers.fast_power_kw", c.fast_power_kw),
            ("chargers.normal_power_kw", c.normal_power_kw),
        ] {
            if range[0] <= 0.0 || range[1] < range[0] {
                errors.push(ConfigError::new(field, "must be a positive [min, max] range"));
            }
        }

        let w = &self.scheduler.weights;
        if w.user_satisfaction + w.operator_profit + w.grid_friendliness <= 0.0 {
            errors.push(ConfigError::new(
                "scheduler.weights",
                "weights must sum to a positive value",
            ));
        }

        let m = &self.marl;
        if m.action_space_size < 2 {
            errors.push(ConfigError::new("marl.action_space_size", "must be >= 2"));
        }
        if !(0.0..=1.0).contains(&m.exploration_rate) {
            errors.push(ConfigError::new("marl.exploration_rate", "must be in [0.0, 1.0]"));
        }
        if !(0.0..=1.0).contains(&m.discount_factor) {
            errors.push(ConfigError::new("marl.discount_factor", "must be in [0.0, 1.0]"));
        }
        if m.learning_rate <= 0.0 || m.learning_rate > 1.0 {
            errors.push(ConfigError::new("marl.learning_rate", "must be in (0.0, 1.0]"));
        }

        let g = &self.grid;
        if g.peak_hours.iter().chain(&g.valley_hours).any(|h| *h >= 24) {
            errors.push(ConfigError::new("grid.peak_hours", "hours must be in 0..=23"));
        }
        if g.peak_hours.iter().any(|h| g.valley_hours.contains(h)) {
            errors.push(ConfigError::new(
                "grid.peak_hours",
                "must not overlap grid.valley_hours",
            ));
        }

        errors
    }

    /// Total number of steps in the configured horizon.
    pub fn total_steps(&self) -> u64 {
        let minutes = u64::from(self.simulation.days) * 24 * 60;
        minutes.div_ceil(u64::from(self.simulation.step_minutes.max(1)))
    }
}
