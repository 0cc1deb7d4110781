//! # Track Editor
//!
//! Editing engine for GPS track recordings (GPX) and the slippy-map tile
//! cache that backs their map display.
//!
//! This library provides:
//! - A segmented track model with derived distance and elevation columns
//!   that stay consistent under reverse, divide, reorder and remove edits
//! - Steep-zone elevation repair (cubic interpolation / moving average)
//! - GPX loading and saving
//! - Tile math, an SQLite-backed tile registry and a validating tile fetcher
//!
//! ## Features
//!
//! - **`persistence`** - SQLite tile store (default)
//! - **`http`** - Blocking HTTP tile fetcher (default)
//! - **`parallel`** - Fetch tiles across a rayon pool
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use track_editor::{GpxPoint, Track};
//!
//! let points = vec![
//!     GpxPoint::new(0.0, 0.0).with_elevation(100.0),
//!     GpxPoint::new(0.0, 1.0).with_elevation(100.0),
//!     GpxPoint::new(0.0, 2.0).with_elevation(100.0),
//! ];
//!
//! let mut track = Track::new();
//! track.add_source(points, "source-hash").unwrap();
//! assert_eq!(track.size(), 1);
//! assert!(track.total_distance() > 222.0);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, TrackEditError};

// Tunables (file size limit, zoom, steep thresholds...)
pub mod config;
pub use config::{EditorConfig, ElevationFixConfig, GpxConfig, MapConfig};

// Geographic utilities (geodesic distance, extremes)
pub mod geo_utils;

// Slippy-map tile math
pub mod tiles;
pub use tiles::{auto_zoom, deg_to_tile, tile_span_adjust, tile_to_deg, TileKey, TileRange, MAX_ZOOM};

// Steep-zone elevation repair
pub mod elevation;

// Segmented track model and structural edits
pub mod track;
pub use track::{recompute, reduce_points, Derived, LoadedTrack, Track, TrackSnapshot};

// GPX file input/output
pub mod gpx_io;
pub use gpx_io::{load_gpx, LoadedGpx};

// SQLite registry of cached tiles
#[cfg(feature = "persistence")]
pub mod tile_store;
#[cfg(feature = "persistence")]
pub use tile_store::{Tile, TileStore};

// Tile fetching over HTTP
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::{ReqwestTileClient, TileClient, TileFetcher, TileResponse};

// Map grid planning
pub mod map;
pub use map::{display_segments, plan_map, MapPlan};
#[cfg(feature = "http")]
pub use map::{prepare_map, PreparedMap};

/// Initialize logging from `RUST_LOG`. Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

// ============================================================================
// Core Types
// ============================================================================

/// Integer id of a segment. Ids are 1-based and assigned in load order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(pub u32);

impl SegmentId {
    /// The id directly above this one.
    pub fn next(self) -> Self {
        SegmentId(self.0 + 1)
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One recorded sample, as produced by the GPX parser.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpxPoint {
    pub latitude: f64,
    pub longitude: f64,
    /// Elevation in meters
    pub elevation: Option<f64>,
    pub time: Option<DateTime<Utc>>,
}

impl GpxPoint {
    /// Create a point with no elevation or time.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            elevation: None,
            time: None,
        }
    }

    pub fn with_elevation(mut self, elevation: f64) -> Self {
        self.elevation = Some(elevation);
        self
    }

    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A point in the track backing store, tagged with its segment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: Option<f64>,
    pub time: Option<DateTime<Utc>>,
    pub segment: SegmentId,
    /// Slot of the ingested source in `loaded_files`
    #[serde(default)]
    pub source: usize,
}

impl TrackPoint {
    pub fn from_gpx(point: GpxPoint, segment: SegmentId) -> Self {
        Self {
            latitude: point.latitude,
            longitude: point.longitude,
            elevation: point.elevation,
            time: point.time,
            segment,
            source: 0,
        }
    }

    pub fn with_source(mut self, source: usize) -> Self {
        self.source = source;
        self
    }
}

/// A track point with its derived columns, as handed to renderers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackRow {
    /// Global row index in the track
    pub index: usize,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: Option<f64>,
    pub time: Option<DateTime<Utc>>,
    pub segment: SegmentId,
    /// Cumulative distance from the first point, km
    pub distance: f64,
    /// Cumulative elevation gain, m
    pub ele_pos_cum: f64,
    /// Cumulative elevation loss (non-positive), m
    pub ele_neg_cum: f64,
}

/// Bounding extremes of a track. The empty value is all zeros.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Extremes {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
}
