//! Tile fetching over HTTP.
//!
//! [`TileFetcher`] keeps the on-disk tile cache and the [`TileStore`]
//! registry in step: a tile is requested only when it is missing on disk or
//! registered with size 0, and it is registered as valid only when the
//! provider answered 2xx and the advertised `Content-Length` matches the
//! bytes written.
//!
//! The HTTP layer sits behind [`TileClient`] so tests can count requests.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use reqwest::header::CONTENT_LENGTH;

use crate::config::MapConfig;
use crate::error::{Result, TrackEditError};
use crate::tile_store::TileStore;
use crate::tiles::{tile_path, tile_range, TileKey, TileRange};
use crate::Extremes;

/// Raw provider answer for one tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileResponse {
    pub status: u16,
    /// Value of the `Content-Length` header, if present and numeric
    pub content_length: Option<u64>,
    pub body: Vec<u8>,
}

impl TileResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Blocking GET used by the fetcher.
pub trait TileClient: Send + Sync {
    /// Fetch a URL. `Err` means the transport failed; any HTTP status,
    /// including errors, comes back as `Ok`.
    fn get(&self, url: &str) -> Result<TileResponse>;
}

/// Production client backed by `reqwest::blocking`.
#[derive(Clone)]
pub struct ReqwestTileClient {
    client: reqwest::blocking::Client,
}

impl ReqwestTileClient {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;
        Ok(Self { client })
    }
}

impl TileClient for ReqwestTileClient {
    fn get(&self, url: &str) -> Result<TileResponse> {
        let response = self.client.get(url).send()?;
        let status = response.status().as_u16();
        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        let body = response.bytes()?.to_vec();
        Ok(TileResponse {
            status,
            content_length,
            body,
        })
    }
}

/// Downloads tiles into `{tile_root}/{zoom}/{x}/{y}.png` and registers them.
pub struct TileFetcher<C: TileClient> {
    client: C,
    tile_root: PathBuf,
    provider_host: String,
}

impl TileFetcher<ReqwestTileClient> {
    /// Fetcher with a reqwest client built from the map configuration.
    pub fn from_config(config: &MapConfig) -> Result<Self> {
        let client = ReqwestTileClient::new(
            &config.user_agent,
            Duration::from_secs(config.request_timeout_secs),
        )?;
        Ok(Self::new(
            client,
            config.tile_root.clone(),
            config.provider_host.clone(),
        ))
    }
}

impl<C: TileClient> TileFetcher<C> {
    pub fn new(client: C, tile_root: impl Into<PathBuf>, provider_host: impl Into<String>) -> Self {
        Self {
            client,
            tile_root: tile_root.into(),
            provider_host: provider_host.into(),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn tile_root(&self) -> &Path {
        &self.tile_root
    }

    /// Local cache path of a tile.
    pub fn tile_path(&self, key: TileKey) -> PathBuf {
        tile_path(&self.tile_root, key)
    }

    /// Provider URL of a tile.
    pub fn tile_url(&self, key: TileKey) -> String {
        format!(
            "https://{}/{}/{}/{}.png",
            self.provider_host, key.zoom, key.x, key.y
        )
    }

    /// Make sure a valid copy of the tile is cached.
    ///
    /// Returns `Ok(())` when the tile is valid. A tile the provider failed to
    /// deliver is still written and registered (as invalid) before
    /// [`TrackEditError::TileFetchFailure`] is returned, so the next call
    /// retries it.
    pub fn try_ensure_tile(&self, store: &TileStore, key: TileKey) -> Result<()> {
        let path = self.tile_path(key);

        if path.exists() && store.tile_size(key)? > 0 {
            debug!("[TileFetcher] Tile {:?} cached", key);
            return Ok(());
        }

        if store.tile(key)?.is_some() {
            store.remove_tile(key)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let url = self.tile_url(key);
        let response = match self.client.get(&url) {
            Ok(response) => response,
            Err(e) => {
                std::fs::write(&path, b"")?;
                store.record_tile(key, false, &path, 0)?;
                return Err(fetch_failure(key, format!("GET {} failed: {}", url, e)));
            }
        };

        std::fs::write(&path, &response.body)?;
        let on_disk = std::fs::metadata(&path)?.len();
        let valid = response.is_success() && response.content_length == Some(on_disk);
        store.record_tile(key, valid, &path, on_disk)?;

        if valid {
            debug!("[TileFetcher] Fetched {:?} ({} bytes)", key, on_disk);
            Ok(())
        } else {
            Err(fetch_failure(
                key,
                format!(
                    "status {}, content-length {:?}, {} bytes on disk",
                    response.status, response.content_length, on_disk
                ),
            ))
        }
    }

    /// [`TileFetcher::try_ensure_tile`] with failures logged and folded into
    /// `false`.
    pub fn ensure_tile(&self, store: &TileStore, key: TileKey) -> bool {
        match self.try_ensure_tile(store, key) {
            Ok(()) => true,
            Err(e) => {
                warn!("[TileFetcher] {}", e);
                false
            }
        }
    }

    /// Ensure every tile of a range. Returns the number of valid tiles.
    pub fn ensure_tiles(&self, store: &TileStore, range: &TileRange) -> usize {
        let valid = range.iter().filter(|&key| self.ensure_tile(store, key)).count();
        debug!(
            "[TileFetcher] Zoom {}: {}/{} tiles valid",
            range.zoom,
            valid,
            range.len()
        );
        valid
    }

    /// Ensure the tiles covering a bounding box on every zoom `0..=max_zoom`.
    /// Returns the number of valid tiles.
    pub fn ensure_area(&self, store: &TileStore, bbox: &Extremes, max_zoom: u8, extra_tiles: u32) -> usize {
        let valid: usize = (0..=max_zoom)
            .map(|zoom| self.ensure_tiles(store, &tile_range(bbox, zoom, extra_tiles)))
            .sum();
        info!(
            "[TileFetcher] Area ready up to zoom {}: {} valid tiles",
            max_zoom, valid
        );
        valid
    }

    /// Parallel [`TileFetcher::ensure_area`] over the rayon pool.
    #[cfg(feature = "parallel")]
    pub fn ensure_area_parallel(
        &self,
        store: &TileStore,
        bbox: &Extremes,
        max_zoom: u8,
        extra_tiles: u32,
    ) -> usize {
        use rayon::prelude::*;

        let keys: Vec<TileKey> = (0..=max_zoom)
            .flat_map(|zoom| tile_range(bbox, zoom, extra_tiles).iter().collect::<Vec<_>>())
            .collect();
        let valid = keys
            .par_iter()
            .filter(|&&key| self.ensure_tile(store, key))
            .count();
        info!(
            "[TileFetcher] Area ready up to zoom {} (parallel): {}/{} valid tiles",
            max_zoom,
            valid,
            keys.len()
        );
        valid
    }
}

fn fetch_failure(key: TileKey, message: String) -> TrackEditError {
    TrackEditError::TileFetchFailure {
        zoom: key.zoom,
        x: key.x,
        y: key.y,
        message,
    }
}
