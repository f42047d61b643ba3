//! Severity and location enrichment.
//!
//! Severity is a fixed linear scaling of magnitude. It is a placeholder policy
//! with no per-source calibration; keep it pure and total.

use geohash::Coord;
use serde_json::Value;

use crate::types::RawPayload;

/// Severity assigned to reports that carry no usable magnitude.
pub const DEFAULT_SEVERITY: f64 = 0.3;
/// Longest geohash the encoder supports.
pub const MAX_GEO_RESOLUTION: usize = 12;

pub fn derive_severity(payload: &RawPayload) -> f64 {
    severity_from_magnitude(payload.magnitude)
}

pub fn severity_from_magnitude(magnitude: Option<f64>) -> f64 {
    match magnitude {
        Some(m) if m.is_finite() => (m / 10.0).clamp(0.0, 1.0),
        _ => DEFAULT_SEVERITY,
    }
}

/// Geohash cell containing the point, `resolution` characters long. Missing or
/// out-of-range coordinates produce `None`.
pub fn derive_geo_bucket(lat: Option<f64>, lon: Option<f64>, resolution: usize) -> Option<String> {
    let (lat, lon) = (lat?, lon?);
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return None;
    }
    if resolution == 0 || resolution > MAX_GEO_RESOLUTION {
        return None;
    }
    geohash::encode(Coord { x: lon, y: lat }, resolution).ok()
}

/// Human readable place name, when the producer sent one.
pub fn derive_location_text(payload: &RawPayload) -> String {
    ["place", "location"]
        .iter()
        .find_map(|field| match payload.extra.get(*field) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        })
        .unwrap_or_default()
}
