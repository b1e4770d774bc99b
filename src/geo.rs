//! Geographic helpers shared by the world model and the schedulers.
//!
//! The map is a small lat/lng rectangle; distances use a flat
//! Euclidean-degree approximation at 111 km per degree, which is accurate
//! enough at city scale and keeps every distance computation branch-free.

use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

/// Kilometres per degree of latitude (and, approximately, longitude at the
/// latitudes the presets cover).
pub const KM_PER_DEGREE: f32 = 111.0;

/// A geographic point in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub lat: f32,
    pub lng: f32,
}

impl Point {
    pub fn new(lat: f32, lng: f32) -> Self {
        Self { lat, lng }
    }

    /// Approximate distance to `other` in kilometres.
    pub fn distance_km(&self, other: &Point) -> f32 {
        let dlat = self.lat - other.lat;
        let dlng = self.lng - other.lng;
        (dlat * dlat + dlng * dlng).sqrt() * KM_PER_DEGREE
    }

    /// Squared distance in degrees, for cheap radius filtering.
    pub fn distance_sq_deg(&self, other: &Point) -> f32 {
        let dlat = self.lat - other.lat;
        let dlng = self.lng - other.lng;
        dlat * dlat + dlng * dlng
    }
}

/// Rectangular map bounds in degrees.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MapBounds {
    pub lat_min: f32,
    pub lat_max: f32,
    pub lng_min: f32,
    pub lng_max: f32,
}

impl Default for MapBounds {
    fn default() -> Self {
        Self {
            lat_min: 30.5,
            lat_max: 31.0,
            lng_min: 114.0,
            lng_max: 114.5,
        }
    }
}

impl MapBounds {
    /// Uniformly random point inside the bounds.
    pub fn random_point(&self, rng: &mut StdRng) -> Point {
        Point {
            lat: rng.random_range(self.lat_min..=self.lat_max),
            lng: rng.random_range(self.lng_min..=self.lng_max),
        }
    }

    /// Clamps a point into the bounds.
    pub fn clamp(&self, p: Point) -> Point {
        Point {
            lat: p.lat.clamp(self.lat_min, self.lat_max),
            lng: p.lng.clamp(self.lng_min, self.lng_max),
        }
    }

    pub fn center(&self) -> Point {
        Point {
            lat: (self.lat_min + self.lat_max) / 2.0,
            lng: (self.lng_min + self.lng_max) / 2.0,
        }
    }
}

/// Gaussian noise via the Box-Muller transform (mean 0).
pub fn gaussian(rng: &mut StdRng, std_dev: f32) -> f32 {
    if std_dev <= 0.0 {
        return 0.0;
    }

    let u1: f32 = rng.random::<f32>().clamp(1e-6, 1.0);
    let u2: f32 = rng.random::<f32>();
    let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos();
    z0 * std_dev
}

/// Picks an index from `weights` proportionally to its weight.
///
/// Non-positive total weight falls back to index 0.
pub fn weighted_index(rng: &mut StdRng, weights: &[f32]) -> usize {
    let total: f32 = weights.iter().copied().filter(|w| *w > 0.0).sum();
    if total <= 0.0 || weights.is_empty() {
        return 0;
    }
    let draw = rng.random_range(0.0..total);
    let mut cumulative = 0.0;
    for (i, w) in weights.iter().enumerate() {
        if *w <= 0.0 {
            continue;
        }
        cumulative += w;
        if draw < cumulative {
            return i;
        }
    }
    weights.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn distance_is_symmetric_and_scaled() {
        let a = Point::new(30.5, 114.0);
        let b = Point::new(30.5, 114.1);
        assert!((a.distance_km(&b) - 11.1).abs() < 1e-3);
        assert_eq!(a.distance_km(&b), b.distance_km(&a));
    }

    #[test]
    fn distance_to_self_is_zero() {
        let p = Point::new(30.7, 114.2);
        assert_eq!(p.distance_km(&p), 0.0);
    }

    #[test]
    fn random_point_stays_inside_bounds() {
        let bounds = MapBounds::default();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let p = bounds.random_point(&mut rng);
            assert!(p.lat >= bounds.lat_min && p.lat <= bounds.lat_max);
            assert!(p.lng >= bounds.lng_min && p.lng <= bounds.lng_max);
        }
    }

    #[test]
    fn clamp_pulls_outliers_back() {
        let bounds = MapBounds::default();
        let p = bounds.clamp(Point::new(99.0, -10.0));
        assert_eq!(p.lat, bounds.lat_max);
        assert_eq!(p.lng, bounds.lng_min);
    }

    #[test]
    fn weighted_index_respects_zero_weights() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            let i = weighted_index(&mut rng, &[0.0, 1.0, 0.0]);
            assert_eq!(i, 1);
        }
    }

    #[test]
    fn weighted_index_degenerate_input() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(weighted_index(&mut rng, &[0.0, 0.0]), 0);
        assert_eq!(weighted_index(&mut rng, &[]), 0);
    }

    #[test]
    fn gaussian_zero_std_is_zero() {
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(gaussian(&mut rng, 0.0), 0.0);
    }
}
