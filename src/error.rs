//! Unified error handling for the track editor.
//!
//! Every fallible operation in the crate returns [`Result`]. Expected empty
//! states (no track loaded, tile not cached yet) are modelled as values, so
//! the variants below are reserved for real failures and rejected input.

use std::path::Path;

use thiserror::Error;

/// Unified error type for track editor operations.
#[derive(Debug, Clone, Error)]
pub enum TrackEditError {
    /// Source file too large, unreadable or unparsable
    #[error("Failed to load '{path}': {message}")]
    LoadFailure { path: String, message: String },

    /// Caller passed input that the operation does not accept
    #[error("Precondition violated: {message}")]
    PreconditionViolation { message: String },

    /// Network or validation failure for one tile
    #[error("Tile ({zoom},{x},{y}) fetch failed: {message}")]
    TileFetchFailure {
        zoom: u8,
        x: u32,
        y: u32,
        message: String,
    },

    /// Tile store not open
    #[error("Tile store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// Saving a track requires every point to carry a timestamp
    #[error("Point {index} has no timestamp")]
    MissingTimestamp { index: usize },

    /// SQLite error
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Filesystem error
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON (de)serialization error
    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl TrackEditError {
    /// Build a precondition error from any displayable message.
    pub fn precondition(message: impl Into<String>) -> Self {
        TrackEditError::PreconditionViolation {
            message: message.into(),
        }
    }

    /// Build a load error for the given path.
    pub fn load(path: &Path, message: impl Into<String>) -> Self {
        TrackEditError::LoadFailure {
            path: path.display().to_string(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for TrackEditError {
    fn from(e: std::io::Error) -> Self {
        TrackEditError::Io {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for TrackEditError {
    fn from(e: serde_json::Error) -> Self {
        TrackEditError::Serialization {
            message: e.to_string(),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for TrackEditError {
    fn from(e: rusqlite::Error) -> Self {
        TrackEditError::Storage {
            message: e.to_string(),
        }
    }
}

impl From<gpx::errors::GpxError> for TrackEditError {
    fn from(e: gpx::errors::GpxError) -> Self {
        TrackEditError::Serialization {
            message: e.to_string(),
        }
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for TrackEditError {
    fn from(e: reqwest::Error) -> Self {
        TrackEditError::Io {
            message: e.to_string(),
        }
    }
}

/// Result type alias for track editor operations.
pub type Result<T> = std::result::Result<T, TrackEditError>;

/// Extension trait for converting Option to TrackEditError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a precondition error.
    fn ok_or_precondition(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_precondition(self, message: &str) -> Result<T> {
        self.ok_or_else(|| TrackEditError::precondition(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrackEditError::TileFetchFailure {
            zoom: 3,
            x: 4,
            y: 2,
            message: "size mismatch".to_string(),
        };
        assert!(err.to_string().contains("(3,4,2)"));
        assert!(err.to_string().contains("size mismatch"));

        let err = TrackEditError::load(Path::new("/tmp/a.gpx"), "too large");
        assert!(err.to_string().contains("/tmp/a.gpx"));
    }

    #[test]
    fn test_option_ext() {
        let none: Option<i32> = None;
        let result = none.ok_or_precondition("segment 4 not found");
        assert!(matches!(
            result,
            Err(TrackEditError::PreconditionViolation { .. })
        ));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: TrackEditError = io.into();
        assert!(matches!(err, TrackEditError::Io { .. }));
    }
}
