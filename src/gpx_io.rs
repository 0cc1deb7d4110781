//! GPX file loading and saving.
//!
//! Loading flattens every track and segment of a file into one point list
//! and fingerprints the raw bytes so the track model can reject sources it
//! already holds. Saving writes one `<trkseg>` per segment id.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;

use chrono::{DateTime, Utc};
use geo::Point;
use gpx::{Gpx, GpxVersion, Metadata, Track as GpxTrack, TrackSegment, Waypoint};
use log::{debug, info};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::config::{TOOL_NAME, TOOL_VERSION};
use crate::error::{Result, TrackEditError};
use crate::{GpxPoint, SegmentId, TrackPoint};

/// Points of one GPX file plus the hex SHA-256 of its bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedGpx {
    pub points: Vec<GpxPoint>,
    pub hash: String,
}

/// Lowercase hex SHA-256 of a byte buffer.
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Load a GPX file.
///
/// Files of `max_file_size` bytes or more are rejected before they are
/// read. Unparsable files and files without any track point fail with
/// [`TrackEditError::LoadFailure`].
pub fn load_gpx(path: &Path, max_file_size: u64) -> Result<LoadedGpx> {
    let size = std::fs::metadata(path)
        .map_err(|e| TrackEditError::load(path, e.to_string()))?
        .len();
    if size >= max_file_size {
        return Err(TrackEditError::load(
            path,
            format!("file is {} bytes, limit is {}", size, max_file_size),
        ));
    }

    let data = std::fs::read(path).map_err(|e| TrackEditError::load(path, e.to_string()))?;
    let points = parse_gpx(&data).map_err(|e| TrackEditError::load(path, e.to_string()))?;
    if points.is_empty() {
        return Err(TrackEditError::load(path, "no track points found"));
    }

    let hash = content_hash(&data);
    info!(
        "[GpxIo] Loaded {} points from {} ({})",
        points.len(),
        path.display(),
        &hash[..12]
    );
    Ok(LoadedGpx { points, hash })
}

/// Parse GPX bytes into a flat point list, tracks then segments in order.
pub fn parse_gpx(data: &[u8]) -> Result<Vec<GpxPoint>> {
    let gpx: Gpx = gpx::read(Cursor::new(data))?;

    let points: Vec<GpxPoint> = gpx
        .tracks
        .iter()
        .flat_map(|t| t.segments.iter())
        .flat_map(|seg| seg.points.iter())
        .map(|wp| {
            let point = wp.point();
            GpxPoint {
                latitude: point.y(),
                longitude: point.x(),
                elevation: wp.elevation,
                time: wp.time.and_then(|t| to_chrono(OffsetDateTime::from(t))),
            }
        })
        .collect();

    debug!(
        "[GpxIo] Parsed {} tracks, {} points",
        gpx.tracks.len(),
        points.len()
    );
    Ok(points)
}

/// Write track points as GPX 1.1, one segment per id in ascending order.
///
/// Every point must carry a timestamp; the first one without fails the
/// whole save with [`TrackEditError::MissingTimestamp`] before any file is
/// created.
pub fn save_gpx(points: &[TrackPoint], path: &Path) -> Result<()> {
    let mut segments: BTreeMap<SegmentId, Vec<Waypoint>> = BTreeMap::new();
    for (index, p) in points.iter().enumerate() {
        let time = p.time.ok_or(TrackEditError::MissingTimestamp { index })?;
        let mut wp = Waypoint::new(Point::new(p.longitude, p.latitude));
        wp.elevation = p.elevation;
        wp.time = Some(gpx::Time::from(to_offset(time)?));
        segments.entry(p.segment).or_default().push(wp);
    }

    let mut track = GpxTrack::new();
    track.segments = segments
        .into_values()
        .map(|points| TrackSegment { points })
        .collect();

    let gpx = Gpx {
        version: GpxVersion::Gpx11,
        creator: Some(format!("{} {}", TOOL_NAME, TOOL_VERSION)),
        metadata: Some(Metadata {
            description: Some(format!(
                "This activity has been updated with {} {}",
                TOOL_NAME, TOOL_VERSION
            )),
            ..Default::default()
        }),
        tracks: vec![track],
        ..Default::default()
    };

    let file = std::fs::File::create(path)?;
    gpx::write(&gpx, file)?;
    info!(
        "[GpxIo] Saved {} points to {}",
        points.len(),
        path.display()
    );
    Ok(())
}

fn to_chrono(t: OffsetDateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(t.unix_timestamp(), t.nanosecond())
}

fn to_offset(t: DateTime<Utc>) -> Result<OffsetDateTime> {
    let base = OffsetDateTime::from_unix_timestamp(t.timestamp()).map_err(|e| {
        TrackEditError::Serialization {
            message: format!("timestamp {} out of range: {}", t, e),
        }
    })?;
    Ok(base + time::Duration::nanoseconds(t.timestamp_subsec_nanos() as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx version="1.1" creator="test" xmlns="http://www.topografix.com/GPX/1/1">
  <trk>
    <trkseg>
      <trkpt lat="40.0" lon="-3.0"><ele>650.0</ele><time>2021-05-01T10:00:00Z</time></trkpt>
      <trkpt lat="40.001" lon="-3.0"><ele>652.5</ele><time>2021-05-01T10:00:10Z</time></trkpt>
    </trkseg>
    <trkseg>
      <trkpt lat="40.002" lon="-3.0"></trkpt>
    </trkseg>
  </trk>
</gpx>"#;

    fn write_file(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_parse_flattens_segments() {
        let points = parse_gpx(SAMPLE.as_bytes()).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].latitude, 40.0);
        assert_eq!(points[0].longitude, -3.0);
        assert_eq!(points[1].elevation, Some(652.5));
        assert_eq!(
            points[0].time,
            Some(Utc.with_ymd_and_hms(2021, 5, 1, 10, 0, 0).unwrap())
        );
        assert_eq!(points[2].elevation, None);
        assert_eq!(points[2].time, None);
    }

    #[test]
    fn test_load_hashes_content() {
        let dir = TempDir::new().unwrap();
        let a = write_file(&dir, "a.gpx", SAMPLE);
        let b = write_file(&dir, "b.gpx", SAMPLE);

        let la = load_gpx(&a, 10_000_000).unwrap();
        let lb = load_gpx(&b, 10_000_000).unwrap();
        assert_eq!(la.hash, lb.hash);
        assert_eq!(la.hash.len(), 64);
        assert!(la.hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_load_rejects_large_file() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "big.gpx", SAMPLE);
        let result = load_gpx(&path, 16);
        assert!(matches!(result, Err(TrackEditError::LoadFailure { .. })));
    }

    #[test]
    fn test_load_rejects_garbage_and_empty() {
        let dir = TempDir::new().unwrap();
        let garbage = write_file(&dir, "bad.gpx", "this is not xml");
        assert!(matches!(
            load_gpx(&garbage, 10_000_000),
            Err(TrackEditError::LoadFailure { .. })
        ));

        let empty = write_file(
            &dir,
            "empty.gpx",
            r#"<?xml version="1.0"?><gpx version="1.1" creator="t" xmlns="http://www.topografix.com/GPX/1/1"></gpx>"#,
        );
        assert!(matches!(
            load_gpx(&empty, 10_000_000),
            Err(TrackEditError::LoadFailure { .. })
        ));
    }

    #[test]
    fn test_save_requires_timestamps() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.gpx");
        let start = Utc.with_ymd_and_hms(2021, 5, 1, 10, 0, 0).unwrap();
        let points = vec![
            TrackPoint::from_gpx(GpxPoint::new(1.0, 2.0).with_time(start), SegmentId(1)),
            TrackPoint::from_gpx(GpxPoint::new(1.1, 2.0), SegmentId(1)),
        ];
        let result = save_gpx(&points, &path);
        assert!(matches!(result, Err(TrackEditError::MissingTimestamp { index: 1 })));
        assert!(!path.exists());
    }

    #[test]
    fn test_save_writes_segments() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.gpx");
        let start = Utc.with_ymd_and_hms(2021, 5, 1, 10, 0, 0).unwrap();
        let points: Vec<TrackPoint> = (0..4)
            .map(|i| {
                let p = GpxPoint::new(45.0 + i as f64 * 0.001, 7.0)
                    .with_elevation(300.0 + i as f64)
                    .with_time(start + chrono::Duration::seconds(i));
                TrackPoint::from_gpx(p, SegmentId(1 + (i as u32) / 2))
            })
            .collect();

        save_gpx(&points, &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains(&format!("{} {}", TOOL_NAME, TOOL_VERSION)));

        let gpx: Gpx = gpx::read(Cursor::new(content.as_bytes())).unwrap();
        assert_eq!(gpx.tracks.len(), 1);
        assert_eq!(gpx.tracks[0].segments.len(), 2);

        let reloaded = parse_gpx(content.as_bytes()).unwrap();
        assert_eq!(reloaded.len(), 4);
        assert_eq!(reloaded[3].time, points[3].time);
        assert_eq!(reloaded[2].elevation, Some(302.0));
    }
}
