//! Editor configuration.
//!
//! All tunables live in plain structs with sensible defaults. A partial JSON
//! document can override any subset of fields; missing fields keep their
//! defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackEditError};
use crate::tiles::MAX_ZOOM;

/// Tool identification used in the tile user agent and GPX metadata.
pub const TOOL_NAME: &str = "TrackEditor";
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const CONTACT_EMAIL: &str = "trackeditor@example.org";

/// GPX loading options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpxConfig {
    /// Files at or above this size (bytes) are rejected before parsing
    pub max_file_size: u64,
}

impl Default for GpxConfig {
    fn default() -> Self {
        Self {
            max_file_size: 10_000_000,
        }
    }
}

/// Map background and tile cache options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Deepest zoom level considered by auto-zoom
    pub max_zoom: u8,
    /// Width and height of the displayed tile grid, in tiles
    pub map_size: u32,
    /// Extra tiles fetched around the grid on each side
    pub extra_tiles: u32,
    /// Cap on points handed to the renderer per segment
    pub max_displayed_points: usize,
    /// Root directory of the on-disk tile cache
    pub tile_root: PathBuf,
    /// SQLite file backing the tile store
    pub tile_db: PathBuf,
    /// Tile provider host, without scheme
    pub provider_host: String,
    /// User agent sent with every tile request
    pub user_agent: String,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            max_zoom: 16,
            map_size: 2,
            extra_tiles: 0,
            max_displayed_points: 100,
            tile_root: PathBuf::from("tiles"),
            tile_db: PathBuf::from("db_track_editor.sqlite"),
            provider_host: "a.tile.openstreetmap.org".to_string(),
            user_agent: default_user_agent(),
            request_timeout_secs: 30,
        }
    }
}

/// Steep-zone detection thresholds for the elevation fixer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElevationFixConfig {
    /// Elevation jump (m) between consecutive points that marks a steep point
    pub steep_gap: f64,
    /// Distance (km) after a steep point that is still considered steep
    pub steep_distance: f64,
    /// Window of the trailing moving average used for unresolved tails
    pub steep_k_moving_average: usize,
}

impl Default for ElevationFixConfig {
    fn default() -> Self {
        Self {
            steep_gap: 0.6,
            steep_distance: 0.2,
            steep_k_moving_average: 20,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    pub gpx: GpxConfig,
    pub map: MapConfig,
    pub elevation: ElevationFixConfig,
}

impl EditorConfig {
    /// Parse a (possibly partial) JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the tile math cannot represent.
    pub fn validate(&self) -> Result<()> {
        if self.map.max_zoom > MAX_ZOOM {
            return Err(TrackEditError::precondition(format!(
                "map.max_zoom {} is above {}",
                self.map.max_zoom, MAX_ZOOM
            )));
        }
        Ok(())
    }

    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| TrackEditError::LoadFailure {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let config = Self::from_json_str(&content)?;
        log::info!("[Config] Loaded configuration from {}", path.display());
        Ok(config)
    }
}

/// `"{tool} {version} {email}"`, as requested by the OSM tile usage policy.
pub fn default_user_agent() -> String {
    format!("{} v{} {}", TOOL_NAME, TOOL_VERSION, CONTACT_EMAIL)
}
