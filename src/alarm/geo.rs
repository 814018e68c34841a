use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use geohash::Coord;
use regex::Regex;

/// Characters of precision in generated geohashes.
pub const GEOHASH_LEN: usize = 12;

fn iso_coordinate() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Signed decimal degrees.
    RE.get_or_init(|| Regex::new(r"[+-]\d+(?:\.\d*)?").expect("valid coordinate pattern"))
}

/// Converts an ISO 6709 decimal-degree location (`+40.7128-074.0060/`) to a geohash.
pub fn location_to_geohash(location: &str) -> Result<String> {
    let mut coords = iso_coordinate().find_iter(location).map(|m| m.as_str());

    let (Some(lat), Some(lon)) = (coords.next(), coords.next()) else {
        bail!("location {location:?} does not contain a latitude and longitude");
    };

    let lat: f64 = lat
        .parse()
        .with_context(|| format!("parsing latitude {lat:?}"))?;
    let lon: f64 = lon
        .parse()
        .with_context(|| format!("parsing longitude {lon:?}"))?;

    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        bail!("coordinates ({lat}, {lon}) are out of range");
    }

    geohash::encode(Coord { x: lon, y: lat }, GEOHASH_LEN)
        .map_err(|e| anyhow::anyhow!("encoding geohash: {e}"))
}
