//! # Geographic Utilities
//!
//! Distance and bounding-box helpers shared by the track model.
//!
//! Distances use the geodesic on the WGS84 ellipsoid (Karney's algorithm via
//! the `geo` crate), which matches what GPS tooling reports for track length.

use geo::{Distance, Geodesic, Point};

use crate::Extremes;

/// Geodesic distance in kilometres between two (lat, lon) pairs.
///
/// Degenerate inputs that make the geodesic non-finite yield 0 so a single
/// bad leg never poisons a cumulative sum.
pub fn geodesic_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let a = Point::new(lon1, lat1);
    let b = Point::new(lon2, lat2);
    let meters = Geodesic::distance(a, b);
    if meters.is_finite() {
        meters.abs() / 1000.0
    } else {
        0.0
    }
}

/// Bounding extremes of a sequence of (lat, lon) pairs.
///
/// Returns `None` for an empty sequence.
pub fn compute_extremes<I>(coords: I) -> Option<Extremes>
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let mut iter = coords.into_iter();
    let (lat, lon) = iter.next()?;
    let mut extremes = Extremes {
        lat_min: lat,
        lat_max: lat,
        lon_min: lon,
        lon_max: lon,
    };
    for (lat, lon) in iter {
        extremes.lat_min = extremes.lat_min.min(lat);
        extremes.lat_max = extremes.lat_max.max(lat);
        extremes.lon_min = extremes.lon_min.min(lon);
        extremes.lon_max = extremes.lon_max.max(lon);
    }
    Some(extremes)
}
