use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Mean Earth radius used for great-circle distances.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A validated WGS84 position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    /// Returns `None` for non-finite or out-of-range values.
    pub fn new(latitude: f64, longitude: f64) -> Option<Self> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        valid.then_some(Self {
            latitude,
            longitude,
        })
    }

    pub fn from_optional(latitude: Option<f64>, longitude: Option<f64>) -> Option<Self> {
        Self::new(latitude?, longitude?)
    }
}

fn haversine_km(from: Coordinates, to: Coordinates) -> f64 {
    let (lat1_rad, lon1_rad) = (from.latitude.to_radians(), from.longitude.to_radians());
    let (lat2_rad, lon2_rad) = (to.latitude.to_radians(), to.longitude.to_radians());
    let dlat = lat2_rad - lat1_rad;
    let dlon = lon2_rad - lon1_rad;
    let a = (dlat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().min(1.0).asin();
    EARTH_RADIUS_KM * c
}

/// Great-circle distance between stores.
#[derive(Debug, Clone, Copy, Default)]
pub struct DistanceCalculator;

impl DistanceCalculator {
    pub fn new() -> Self {
        Self
    }

    pub fn distance_km(&self, from: Coordinates, to: Coordinates) -> f64 {
        haversine_km(from, to)
    }

    /// Distances from `origin` to every target, keyed by target id.
    pub fn distances_from(
        &self,
        origin: Coordinates,
        targets: &[(i64, Coordinates)],
    ) -> HashMap<i64, f64> {
        targets
            .iter()
            .map(|(id, coords)| (*id, haversine_km(origin, *coords)))
            .collect()
    }
}
