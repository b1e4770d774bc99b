//! Regionalized power-grid model: exogenous load/generation profiles,
//! EV-load distribution, and the tiered price signal.

use std::collections::BTreeMap;

use tracing::{error, info, warn};

use crate::config::GridConfig;

/// Hours in a daily profile.
const PROFILE_LEN: usize = 24;

/// Fallback hourly base load when a regional profile is missing or short (kW).
const DEFAULT_BASE_LOAD_KW: f32 = 1000.0;
/// Fallback hourly solar generation (kW).
const DEFAULT_SOLAR_KW: f32 = 0.0;
/// Fallback hourly wind generation (kW).
const DEFAULT_WIND_KW: f32 = 100.0;
/// Fallback regional system capacity (kW).
const DEFAULT_CAPACITY_KW: f32 = 10_000.0;

/// Per-region daily profiles resolved at reset time.
#[derive(Debug, Clone)]
struct RegionProfiles {
    base_load: [f32; PROFILE_LEN],
    solar: [f32; PROFILE_LEN],
    wind: [f32; PROFILE_LEN],
    capacity_kw: f32,
}

/// Current derived values for one region.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionStatus {
    pub base_load_kw: f32,
    pub solar_kw: f32,
    pub wind_kw: f32,
    /// EV load apportioned to this region for the current step.
    pub ev_load_kw: f32,
    pub total_load_kw: f32,
    pub capacity_kw: f32,
    /// `total_load / capacity * 100`, 0 when capacity is 0.
    pub load_percent: f32,
    /// `(solar + wind) / total_load * 100`, 0 when total load is 0.
    pub renewable_percent: f32,
}

/// Immutable grid snapshot embedded in the per-step simulation state.
#[derive(Debug, Clone)]
pub struct GridSnapshot {
    pub regions: BTreeMap<String, RegionStatus>,
    pub peak_hours: Vec<u32>,
    pub valley_hours: Vec<u32>,
    pub normal_price: f32,
    pub peak_price: f32,
    pub valley_price: f32,
    /// Global price for the current hour.
    pub current_price: f32,
    /// Total EV load produced by the charger simulation this step (kW).
    pub total_ev_load_kw: f32,
    /// Sum of regional total loads (kW).
    pub total_load_kw: f32,
    /// Sum of regional capacities (kW).
    pub total_capacity_kw: f32,
    /// System-wide load percentage.
    pub load_percent: f32,
    /// System-wide renewable share of load, in percent.
    pub renewable_percent: f32,
}

impl GridSnapshot {
    pub fn is_peak(&self, hour: u32) -> bool {
        self.peak_hours.contains(&hour)
    }

    pub fn is_valley(&self, hour: u32) -> bool {
        self.valley_hours.contains(&hour)
    }

    /// Price tier for the given hour.
    pub fn price_at(&self, hour: u32) -> f32 {
        if self.is_peak(hour) {
            self.peak_price
        } else if self.is_valley(hour) {
            self.valley_price
        } else {
            self.normal_price
        }
    }
}

/// Regional grid simulator.
///
/// Malformed or missing regional configuration never fails: each defect is
/// replaced by a documented default and logged as a warning.
#[derive(Debug)]
pub struct GridModel {
    config: GridConfig,
    profiles: BTreeMap<String, RegionProfiles>,
    status: GridSnapshot,
}

impl GridModel {
    pub fn new(config: GridConfig) -> Self {
        let mut model = Self {
            config,
            profiles: BTreeMap::new(),
            status: GridSnapshot {
                regions: BTreeMap::new(),
                peak_hours: Vec::new(),
                valley_hours: Vec::new(),
                normal_price: 0.0,
                peak_price: 0.0,
                valley_price: 0.0,
                current_price: 0.0,
                total_ev_load_kw: 0.0,
                total_load_kw: 0.0,
                total_capacity_kw: 0.0,
                load_percent: 0.0,
                renewable_percent: 0.0,
            },
        };
        model.reset();
        model
    }

    /// Region identifiers, resolved at the last reset.
    pub fn region_ids(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }

    /// Re-derives all regional profiles from configuration and sets hour-0
    /// current values.
    pub fn reset(&mut self) {
        let region_ids = self.resolve_region_ids();
        info!(regions = region_ids.len(), "resetting grid model");

        self.profiles.clear();
        for region_id in &region_ids {
            let cfg = self.config.regions.get(region_id);
            let base_load = resolve_profile(
                region_id,
                "base_load",
                cfg.map(|r| r.base_load.as_slice()),
                DEFAULT_BASE_LOAD_KW,
            );
            let solar = resolve_profile(
                region_id,
                "solar",
                cfg.map(|r| r.solar.as_slice()),
                DEFAULT_SOLAR_KW,
            );
            let wind = resolve_profile(
                region_id,
                "wind",
                cfg.map(|r| r.wind.as_slice()),
                DEFAULT_WIND_KW,
            );
            let capacity_kw = match cfg.and_then(|r| r.capacity_kw) {
                Some(c) if c.is_finite() && c >= 0.0 => c,
                Some(c) => {
                    warn!(region = %region_id, value = c, "invalid capacity_kw, using default");
                    DEFAULT_CAPACITY_KW
                }
                None => {
                    warn!(region = %region_id, "missing capacity_kw, using default");
                    DEFAULT_CAPACITY_KW
                }
            };
            self.profiles.insert(
                region_id.clone(),
                RegionProfiles {
                    base_load,
                    solar,
                    wind,
                    capacity_kw,
                },
            );
        }

        self.status = GridSnapshot {
            regions: BTreeMap::new(),
            peak_hours: self.config.peak_hours.clone(),
            valley_hours: self.config.valley_hours.clone(),
            normal_price: self.config.normal_price,
            peak_price: self.config.peak_price,
            valley_price: self.config.valley_price,
            current_price: 0.0,
            total_ev_load_kw: 0.0,
            total_load_kw: 0.0,
            total_capacity_kw: 0.0,
            load_percent: 0.0,
            renewable_percent: 0.0,
        };
        self.update(0, 0.0);
    }

    /// Distributes `ev_load_total_kw` across regions proportionally to each
    /// region's capacity share, recomputes regional and aggregate derived
    /// values, and re-derives the price for `hour`.
    pub fn update(&mut self, hour: u32, ev_load_total_kw: f32) {
        let hour = if hour < 24 {
            hour
        } else {
            error!(hour, "invalid hour for grid update, using 0");
            0
        };
        let idx = hour as usize;

        let total_capacity: f32 = self.profiles.values().map(|p| p.capacity_kw).sum();
        if total_capacity == 0.0 && ev_load_total_kw > 0.0 {
            warn!("total system capacity is 0, EV load cannot be distributed");
        }

        let mut regions = BTreeMap::new();
        let mut total_load = 0.0;
        let mut total_renewable = 0.0;

        for (region_id, profile) in &self.profiles {
            let share = if total_capacity > 0.0 {
                profile.capacity_kw / total_capacity
            } else {
                0.0
            };
            let ev_load_kw = ev_load_total_kw * share;
            let base_load_kw = profile.base_load[idx];
            let solar_kw = profile.solar[idx];
            let wind_kw = profile.wind[idx];
            let total_load_kw = base_load_kw + ev_load_kw;
            let load_percent = if profile.capacity_kw > 0.0 {
                total_load_kw / profile.capacity_kw * 100.0
            } else {
                0.0
            };
            let renewable_kw = solar_kw + wind_kw;
            let renewable_percent = if total_load_kw > 0.0 {
                renewable_kw / total_load_kw * 100.0
            } else {
                0.0
            };

            total_load += total_load_kw;
            total_renewable += renewable_kw;
            regions.insert(
                region_id.clone(),
                RegionStatus {
                    base_load_kw,
                    solar_kw,
                    wind_kw,
                    ev_load_kw,
                    total_load_kw,
                    capacity_kw: profile.capacity_kw,
                    load_percent,
                    renewable_percent,
                },
            );
        }

        self.status.regions = regions;
        self.status.total_ev_load_kw = ev_load_total_kw;
        self.status.total_load_kw = total_load;
        self.status.total_capacity_kw = total_capacity;
        self.status.load_percent = if total_capacity > 0.0 {
            total_load / total_capacity * 100.0
        } else {
            0.0
        };
        self.status.renewable_percent = if total_load > 0.0 {
            total_renewable / total_load * 100.0
        } else {
            0.0
        };
        self.status.current_price = self.status.price_at(hour);
    }

    /// Current immutable snapshot.
    pub fn status(&self) -> &GridSnapshot {
        &self.status
    }

    /// Region list: configured names first, then a synthesized
    /// `region_0..n` fallback, then a single-region last resort.
    fn resolve_region_ids(&self) -> Vec<String> {
        if !self.config.regions.is_empty() {
            return self.config.regions.keys().cloned().collect();
        }
        if self.config.region_count > 0 {
            warn!(
                count = self.config.region_count,
                "no [grid.regions] configured, synthesizing default regions"
            );
            return (0..self.config.region_count)
                .map(|i| format!("region_{i}"))
                .collect();
        }
        error!("no regions configured and region_count is 0, falling back to a single region");
        vec!["region_0".to_string()]
    }
}

/// Resolves one 24-hour profile, substituting a flat default when the entry
/// is missing or not exactly 24 values.
fn resolve_profile(
    region_id: &str,
    name: &str,
    values: Option<&[f32]>,
    default: f32,
) -> [f32; PROFILE_LEN] {
    match values {
        Some(v) if v.len() == PROFILE_LEN => {
            let mut out = [0.0; PROFILE_LEN];
            out.copy_from_slice(v);
            out
        }
        Some(v) if !v.is_empty() => {
            warn!(
                region = %region_id,
                profile = name,
                len = v.len(),
                "profile is not 24 hours, using default"
            );
            [default; PROFILE_LEN]
        }
        _ => {
            warn!(region = %region_id, profile = name, "profile missing, using default");
            [default; PROFILE_LEN]
        }
    }
}
