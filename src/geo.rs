//! Coarse user location and proximity measures
//!
//! Locations come from the client (or an upstream geolocation lookup) and are
//! always optional. Two measures are derived from a pair of locations:
//! - great-circle distance, when both sides carry coordinates
//! - a locality tier, when they do not

use serde::{Deserialize, Serialize};

/// Mean Earth radius used by the Haversine formula
pub const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    /// Latitude in [-90, 90], longitude in [-180, 180], both finite
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lat: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lon: Option<f64>,
}

impl Location {
    /// Precise coordinates, if both halves are present and in range
    pub fn coordinates(&self) -> Option<Coordinates> {
        let coords = Coordinates {
            lat: self.lat?,
            lon: self.lon?,
        };
        coords.is_valid().then_some(coords)
    }

    /// Copy without coordinates, safe to show to a partner
    pub fn coarse(&self) -> Location {
        Location {
            country: self.country.clone(),
            region: self.region.clone(),
            city: self.city.clone(),
            lat: None,
            lon: None,
        }
    }
}

/// Great-circle distance in kilometres (Haversine)
pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// Locality tiers, ordered worst to best
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalityTier {
    Anywhere,
    SameCountry,
    SameRegion,
    SameCity,
}

impl LocalityTier {
    /// Tier shared by two optional locations
    ///
    /// Region and city only count within the same country. Unknown or blank
    /// names never match anything.
    pub fn between(a: Option<&Location>, b: Option<&Location>) -> LocalityTier {
        let (Some(a), Some(b)) = (a, b) else {
            return LocalityTier::Anywhere;
        };

        if !same_place(&a.country, &b.country) {
            return LocalityTier::Anywhere;
        }
        if !same_place(&a.region, &b.region) {
            // City names without a matching region are too ambiguous to trust
            return LocalityTier::SameCountry;
        }
        if same_place(&a.city, &b.city) {
            LocalityTier::SameCity
        } else {
            LocalityTier::SameRegion
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            LocalityTier::Anywhere => "anywhere",
            LocalityTier::SameCountry => "same_country",
            LocalityTier::SameRegion => "same_region",
            LocalityTier::SameCity => "same_city",
        }
    }
}

fn same_place(a: &Option<String>, b: &Option<String>) -> bool {
    match (normalized(a), normalized(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn normalized(name: &Option<String>) -> Option<String> {
    let name = name.as_deref()?.trim();
    if name.is_empty() || name.eq_ignore_ascii_case("unknown") {
        return None;
    }
    Some(name.to_lowercase())
}
