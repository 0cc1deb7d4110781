//! # Tile Store
//!
//! SQLite registry of cached map tiles: one row per tile with its validity,
//! local path and size on disk.
//!
//! The `tiles` table has no unique constraint on `(zoom, x, y)`. Duplicate
//! rows can only appear through external writes; they are reported as
//! corruption and the first row wins on reads.
//!
//! The store is an explicit value. Every per-key read-modify-write runs under
//! one lock acquisition and one transaction, so a `&TileStore` can be shared
//! between fetch workers.

use std::path::Path;
use std::sync::Mutex;

use log::{debug, error, info, warn};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::config::MapConfig;
use crate::error::{Result, TrackEditError};
use crate::tiles::TileKey;

/// One registered tile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tile {
    pub key: TileKey,
    pub valid: bool,
    pub path: String,
    /// Bytes on disk; 0 for invalid tiles
    pub size: u64,
}

/// SQLite-backed tile registry.
pub struct TileStore {
    conn: Mutex<Option<Connection>>,
}

impl TileStore {
    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Open (or create) the store at the given database path.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path).map_err(|e| TrackEditError::StoreUnavailable {
            message: format!("{}: {}", db_path.display(), e),
        })?;
        Self::init_schema(&conn)?;
        info!("[TileStore] Opened {}", db_path.display());
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Open the store configured in [`MapConfig::tile_db`].
    pub fn from_config(config: &MapConfig) -> Result<Self> {
        Self::open(&config.tile_db)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tiles (
                zoom INTEGER,
                x INTEGER,
                y INTEGER,
                status BOOLEAN,
                path TEXT,
                size INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_tiles_key ON tiles(zoom, x, y);
            "#,
        )?;
        Ok(())
    }

    /// Close the underlying connection. Later calls fail with
    /// [`TrackEditError::StoreUnavailable`].
    pub fn close(&self) -> Result<()> {
        let mut guard = self.lock()?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| TrackEditError::from(e))?;
            info!("[TileStore] Closed");
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<Connection>>> {
        self.conn.lock().map_err(|_| TrackEditError::StoreUnavailable {
            message: "tile store lock poisoned".to_string(),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.lock()?;
        let conn = guard
            .as_mut()
            .ok_or_else(|| TrackEditError::StoreUnavailable {
                message: "tile store is closed".to_string(),
            })?;
        f(conn)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Register a tile unless a row already exists for its key.
    ///
    /// Invalid tiles are stored with size 0. Returns whether a row was added.
    pub fn record_tile(&self, key: TileKey, valid: bool, path: &Path, size: u64) -> Result<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if row_count(&tx, key)? > 0 {
                debug!("[TileStore] Tile {:?} already registered", key);
                return Ok(false);
            }
            let size = if valid { size } else { 0 };
            tx.execute(
                "INSERT INTO tiles (zoom, x, y, status, path, size) VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    key.zoom,
                    key.x,
                    key.y,
                    valid,
                    path.to_string_lossy(),
                    size as i64
                ],
            )?;
            tx.commit()?;
            debug!("[TileStore] Recorded {:?} valid={} size={}", key, valid, size);
            Ok(true)
        })
    }

    /// Overwrite validity and size of an existing tile.
    pub fn update_status(&self, key: TileKey, valid: bool, size: u64) -> Result<()> {
        self.with_conn(|conn| {
            let size = if valid { size } else { 0 };
            let changed = conn.execute(
                "UPDATE tiles SET status = ?, size = ? WHERE zoom = ? AND x = ? AND y = ?",
                params![valid, size as i64, key.zoom, key.x, key.y],
            )?;
            if changed == 0 {
                warn!("[TileStore] update_status: tile {:?} not registered", key);
            }
            Ok(())
        })
    }

    /// Delete a tile's row(s). Returns `false` if none existed.
    pub fn remove_tile(&self, key: TileKey) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM tiles WHERE zoom = ? AND x = ? AND y = ?",
                params![key.zoom, key.x, key.y],
            )?;
            if removed == 0 {
                warn!("[TileStore] remove_tile: tile {:?} not registered", key);
                return Ok(false);
            }
            Ok(true)
        })
    }

    /// Delete every row.
    pub fn clear(&self) -> Result<()> {
        self.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM tiles", [])?;
            info!("[TileStore] Cleared {} tiles", removed);
            Ok(())
        })
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Row for a key, or `None` if the tile is not registered.
    pub fn tile(&self, key: TileKey) -> Result<Option<Tile>> {
        self.with_conn(|conn| {
            if row_count(conn, key)? == 0 {
                return Ok(None);
            }
            let tile = conn
                .query_row(
                    "SELECT status, path, size FROM tiles
                     WHERE zoom = ? AND x = ? AND y = ? ORDER BY rowid LIMIT 1",
                    params![key.zoom, key.x, key.y],
                    |row| {
                        Ok(Tile {
                            key,
                            valid: row.get(0)?,
                            path: row.get(1)?,
                            size: row.get::<_, i64>(2)?.max(0) as u64,
                        })
                    },
                )
                .optional()?;
            Ok(tile)
        })
    }

    /// Recorded size, 0 when absent.
    pub fn tile_size(&self, key: TileKey) -> Result<u64> {
        Ok(self.tile(key)?.map(|t| t.size).unwrap_or(0))
    }

    /// Recorded validity, `false` when absent.
    pub fn tile_valid(&self, key: TileKey) -> Result<bool> {
        Ok(self.tile(key)?.map(|t| t.valid).unwrap_or(false))
    }

    /// All rows, ordered by zoom, x, y.
    pub fn tiles(&self) -> Result<Vec<Tile>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT zoom, x, y, status, path, size FROM tiles ORDER BY zoom, x, y, rowid",
            )?;
            let tiles = stmt
                .query_map([], |row| {
                    Ok(Tile {
                        key: TileKey::new(row.get(0)?, row.get(1)?, row.get(2)?),
                        valid: row.get(3)?,
                        path: row.get(4)?,
                        size: row.get::<_, i64>(5)?.max(0) as u64,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(tiles)
        })
    }
}

/// Number of rows for a key. More than one is logged as corruption.
fn row_count(conn: &Connection, key: TileKey) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tiles WHERE zoom = ? AND x = ? AND y = ?",
        params![key.zoom, key.x, key.y],
        |row| row.get(0),
    )?;
    if count > 1 {
        error!(
            "[TileStore] Corruption: {} rows registered for tile {:?}",
            count, key
        );
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key() -> TileKey {
        TileKey::new(10, 501, 386)
    }

    #[test]
    fn test_record_and_read() {
        let store = TileStore::in_memory().unwrap();
        assert_eq!(store.tile_size(key()).unwrap(), 0);
        assert!(!store.tile_valid(key()).unwrap());
        assert!(store.tile(key()).unwrap().is_none());

        assert!(store
            .record_tile(key(), true, Path::new("tiles/10/501/386.png"), 1234)
            .unwrap());
        assert_eq!(store.tile_size(key()).unwrap(), 1234);
        assert!(store.tile_valid(key()).unwrap());
        assert_eq!(store.tile(key()).unwrap().unwrap().path, "tiles/10/501/386.png");
    }

    #[test]
    fn test_from_config_opens_tile_db() {
        let tmp_dir = TempDir::new().unwrap();
        let config = MapConfig {
            tile_db: tmp_dir.path().join("configured.sqlite"),
            ..MapConfig::default()
        };
        let store = TileStore::from_config(&config).unwrap();
        store.record_tile(key(), true, Path::new("a.png"), 10).unwrap();
        store.close().unwrap();

        assert!(config.tile_db.exists());
        let reopened = TileStore::from_config(&config).unwrap();
        assert_eq!(reopened.tile_size(key()).unwrap(), 10);
    }

    #[test]
    fn test_existing_row_wins() {
        let store = TileStore::in_memory().unwrap();
        store.record_tile(key(), true, Path::new("a.png"), 10).unwrap();
        assert!(!store.record_tile(key(), false, Path::new("b.png"), 0).unwrap());
        let tile = store.tile(key()).unwrap().unwrap();
        assert!(tile.valid);
        assert_eq!(tile.path, "a.png");
        assert_eq!(store.tiles().unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_tile_has_zero_size() {
        let store = TileStore::in_memory().unwrap();
        store.record_tile(key(), false, Path::new("a.png"), 999).unwrap();
        assert_eq!(store.tile_size(key()).unwrap(), 0);
        assert!(!store.tile_valid(key()).unwrap());
    }

    #[test]
    fn test_update_status() {
        let store = TileStore::in_memory().unwrap();
        store.record_tile(key(), false, Path::new("a.png"), 0).unwrap();
        store.update_status(key(), true, 512).unwrap();
        assert_eq!(store.tile_size(key()).unwrap(), 512);
        assert!(store.tile_valid(key()).unwrap());
        store.update_status(TileKey::new(1, 0, 0), true, 1).unwrap();
    }

    #[test]
    fn test_remove_tile() {
        let store = TileStore::in_memory().unwrap();
        assert!(!store.remove_tile(key()).unwrap());
        store.record_tile(key(), true, Path::new("a.png"), 10).unwrap();
        assert!(store.remove_tile(key()).unwrap());
        assert!(store.tile(key()).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_rows_read_as_existing() {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = TileStore::in_memory().unwrap();
        store
            .with_conn(|conn| {
                for size in [100i64, 200] {
                    conn.execute(
                        "INSERT INTO tiles (zoom, x, y, status, path, size) VALUES (?, ?, ?, 1, 'p', ?)",
                        params![key().zoom, key().x, key().y, size],
                    )?;
                }
                Ok(())
            })
            .unwrap();

        assert_eq!(store.tile_size(key()).unwrap(), 100);
        assert!(!store.record_tile(key(), true, Path::new("q"), 1).unwrap());
        assert_eq!(store.tiles().unwrap().len(), 2);
    }

    #[test]
    fn test_clear() {
        let store = TileStore::in_memory().unwrap();
        store.record_tile(key(), true, Path::new("a"), 1).unwrap();
        store.record_tile(TileKey::new(0, 0, 0), true, Path::new("b"), 1).unwrap();
        let tiles = store.tiles().unwrap();
        assert_eq!(tiles[0].key, TileKey::new(0, 0, 0));
        store.clear().unwrap();
        assert!(store.tiles().unwrap().is_empty());
    }

    #[test]
    fn test_closed_store_is_unavailable() {
        let store = TileStore::in_memory().unwrap();
        store.close().unwrap();
        assert!(!store.is_open());
        assert!(matches!(
            store.tile_size(key()),
            Err(TrackEditError::StoreUnavailable { .. })
        ));
        assert!(matches!(
            store.record_tile(key(), true, Path::new("a"), 1),
            Err(TrackEditError::StoreUnavailable { .. })
        ));
        store.close().unwrap();
    }

    #[test]
    fn test_reopen_persists() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("tiles.sqlite");
        {
            let store = TileStore::open(&db).unwrap();
            store.record_tile(key(), true, Path::new("a"), 42).unwrap();
        }
        let store = TileStore::open(&db).unwrap();
        assert_eq!(store.tile_size(key()).unwrap(), 42);
    }
}
