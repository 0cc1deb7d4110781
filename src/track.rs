//! # Track Model
//!
//! Segmented point sequence with derived per-point metrics.
//!
//! ## Storage
//!
//! A loaded track is a row sequence of [`TrackPoint`]s, each tagged with its
//! [`SegmentId`], plus a [`Derived`] block computed by [`recompute`]:
//! cumulative distance, cumulative elevation gain/loss, extremes and totals.
//! Every point also remembers the `loaded_files` slot of the source it came
//! from; a slot is cleared once no point of that source remains, whatever
//! the segment ids have become after divides and reorders.
//!
//! Derived columns always span the whole track, including the legs that
//! join consecutive segments, and are rebuilt after every structural or
//! elevation edit. Edits either apply fully or return an error without
//! touching the track.
//!
//! ## States
//!
//! [`Track::Empty`] is the normal "nothing loaded" state: summaries read as
//! zero and edits that need a segment are rejected with a precondition
//! error. Removing the last segment returns the track to `Empty`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::ElevationFixConfig;
use crate::error::{OptionExt, Result, TrackEditError};
use crate::{elevation, geo_utils, gpx_io};
use crate::{Extremes, GpxPoint, SegmentId, TrackPoint, TrackRow};

// ============================================================================
// Derived Columns
// ============================================================================

/// Columns and summaries derived from the ordered points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Derived {
    /// Cumulative distance from the first point, km
    pub distance: Vec<f64>,
    /// Cumulative positive elevation deltas, m
    pub ele_pos_cum: Vec<f64>,
    /// Cumulative negative elevation deltas, m (non-positive)
    pub ele_neg_cum: Vec<f64>,
    pub extremes: Extremes,
    pub total_distance: f64,
    pub total_uphill: f64,
    pub total_downhill: f64,
}

/// Rebuild every derived column from the ordered points.
///
/// Pipeline: positive elevation cumulative, negative elevation cumulative,
/// point-to-point geodesic distance and its cumulative sum, extremes, and
/// finally the totals taken from the last row. Elevation deltas involving a
/// missing elevation count as 0, as do non-finite distance legs.
pub fn recompute(points: &[TrackPoint]) -> Derived {
    let n = points.len();
    if n == 0 {
        return Derived::default();
    }

    let deltas: Vec<f64> = std::iter::once(0.0)
        .chain(points.windows(2).map(|w| match (w[0].elevation, w[1].elevation) {
            (Some(a), Some(b)) if (b - a).is_finite() => b - a,
            _ => 0.0,
        }))
        .collect();

    let ele_pos_cum = cumulative(deltas.iter().map(|d| d.max(0.0)));
    let ele_neg_cum = cumulative(deltas.iter().map(|d| d.min(0.0)));

    let legs = std::iter::once(0.0).chain(points.windows(2).map(|w| {
        geo_utils::geodesic_km(w[0].latitude, w[0].longitude, w[1].latitude, w[1].longitude)
    }));
    let distance = cumulative(legs);

    let extremes = geo_utils::compute_extremes(points.iter().map(|p| (p.latitude, p.longitude)))
        .unwrap_or_default();

    Derived {
        total_distance: distance[n - 1],
        total_uphill: ele_pos_cum[n - 1],
        total_downhill: ele_neg_cum[n - 1],
        distance,
        ele_pos_cum,
        ele_neg_cum,
        extremes,
    }
}

fn cumulative(values: impl Iterator<Item = f64>) -> Vec<f64> {
    values
        .scan(0.0, |acc, v| {
            *acc += v;
            Some(*acc)
        })
        .collect()
}

// ============================================================================
// Loaded Track
// ============================================================================

/// A track holding at least one point.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedTrack {
    points: Vec<TrackPoint>,
    derived: Derived,
    /// Number of segments currently in the track
    size: usize,
    /// Content hash per ingested source, in load order; `None` once removed
    loaded_files: Vec<Option<String>>,
}

impl LoadedTrack {
    fn refresh(&mut self) {
        self.derived = recompute(&self.points);
    }

    fn row(&self, index: usize) -> TrackRow {
        let p = &self.points[index];
        TrackRow {
            index,
            latitude: p.latitude,
            longitude: p.longitude,
            elevation: p.elevation,
            time: p.time,
            segment: p.segment,
            distance: self.derived.distance[index],
            ele_pos_cum: self.derived.ele_pos_cum[index],
            ele_neg_cum: self.derived.ele_neg_cum[index],
        }
    }

    fn segment_ids(&self) -> BTreeSet<SegmentId> {
        self.points.iter().map(|p| p.segment).collect()
    }

    fn segment_indices(&self, id: SegmentId) -> Result<Vec<usize>> {
        let indices: Vec<usize> = self
            .points
            .iter()
            .enumerate()
            .filter(|(_, p)| p.segment == id)
            .map(|(i, _)| i)
            .collect();
        if indices.is_empty() {
            return Err(TrackEditError::precondition(format!(
                "segment {} not found",
                id
            )));
        }
        Ok(indices)
    }

    fn contains_source(&self, hash: &str) -> bool {
        self.loaded_files.iter().flatten().any(|h| h == hash)
    }

    fn append_source(&mut self, points: Vec<GpxPoint>, hash: String) -> SegmentId {
        let id = self
            .points
            .iter()
            .map(|p| p.segment)
            .max()
            .map(SegmentId::next)
            .unwrap_or(SegmentId(1));
        let slot = self.loaded_files.len();
        self.points.extend(
            points
                .into_iter()
                .map(|p| TrackPoint::from_gpx(p, id).with_source(slot)),
        );
        self.loaded_files.push(Some(hash));
        self.size += 1;
        self.refresh();
        id
    }

    fn reverse_segment(&mut self, id: SegmentId) -> Result<()> {
        let indices = self.segment_indices(id)?;
        let coords: Vec<(f64, f64, Option<f64>)> = indices
            .iter()
            .rev()
            .map(|&i| {
                let p = &self.points[i];
                (p.latitude, p.longitude, p.elevation)
            })
            .collect();
        for (&i, (lat, lon, ele)) in indices.iter().zip(coords) {
            let p = &mut self.points[i];
            p.latitude = lat;
            p.longitude = lon;
            p.elevation = ele;
        }
        self.refresh();
        Ok(())
    }

    fn divide_segment(&mut self, split_index: usize) -> Result<SegmentId> {
        let id = self
            .points
            .get(split_index)
            .map(|p| p.segment)
            .ok_or_precondition("split index out of range")?;
        let first = self
            .points
            .iter()
            .position(|p| p.segment == id)
            .ok_or_precondition("segment vanished")?;
        if split_index == first {
            return Err(TrackEditError::precondition(format!(
                "splitting segment {} at its first point would leave it empty",
                id
            )));
        }

        for (i, p) in self.points.iter_mut().enumerate() {
            if p.segment > id || (p.segment == id && i >= split_index) {
                p.segment = p.segment.next();
            }
        }
        self.size += 1;
        self.refresh();
        Ok(id.next())
    }

    fn change_order(&mut self, new_order: &BTreeMap<SegmentId, SegmentId>) -> Result<()> {
        let existing = self.segment_ids();
        let keys: BTreeSet<SegmentId> = new_order.keys().copied().collect();
        let values: BTreeSet<SegmentId> = new_order.values().copied().collect();

        if keys != existing {
            return Err(TrackEditError::precondition(format!(
                "order map keys {:?} do not match segments {:?}",
                keys, existing
            )));
        }
        if values != existing || values.len() != new_order.len() {
            return Err(TrackEditError::precondition(format!(
                "order map values {:?} are not a permutation of {:?}",
                new_order.values().collect::<Vec<_>>(),
                existing
            )));
        }

        for p in self.points.iter_mut() {
            p.segment = new_order[&p.segment];
        }
        // Stable: keeps the original row order inside each segment
        self.points.sort_by_key(|p| p.segment);
        self.refresh();
        Ok(())
    }

    /// Drop one segment's rows and free the source slots no row uses anymore.
    fn remove_rows(&mut self, id: SegmentId) {
        let sources: BTreeSet<usize> = self
            .points
            .iter()
            .filter(|p| p.segment == id)
            .map(|p| p.source)
            .collect();
        self.points.retain(|p| p.segment != id);
        self.size = self.size.saturating_sub(1);

        for source in sources {
            if self.points.iter().any(|p| p.source == source) {
                continue;
            }
            if let Some(slot) = self.loaded_files.get_mut(source) {
                *slot = None;
            }
        }
    }

    fn insert_timestamp(&mut self, initial: DateTime<Utc>, speed_kmh: f64) -> Result<()> {
        // All or nothing: a schedule that leaves the datetime range keeps
        // the current timestamps.
        let times = self
            .derived
            .distance
            .iter()
            .map(|&distance| offset_time(initial, distance, speed_kmh))
            .collect::<Result<Vec<_>>>()?;
        for (p, time) in self.points.iter_mut().zip(times) {
            p.time = Some(time);
        }
        Ok(())
    }

    fn fix_elevation(&mut self, id: SegmentId, config: &ElevationFixConfig) -> Result<()> {
        let indices = self.segment_indices(id)?;
        let raw: Vec<Option<f64>> = indices.iter().map(|&i| self.points[i].elevation).collect();
        let Some(elevation) = elevation::fill_missing(&raw) else {
            warn!("[Track] Segment {} has no elevation data, nothing to fix", id);
            return Ok(());
        };
        let distance: Vec<f64> = indices.iter().map(|&i| self.derived.distance[i]).collect();

        let fixed = elevation::fix_elevation(&elevation, &distance, config);
        for (&i, value) in indices.iter().zip(fixed) {
            self.points[i].elevation = Some(value);
        }
        self.refresh();
        Ok(())
    }
}

// ============================================================================
// Track
// ============================================================================

/// The editable track: either nothing loaded yet, or a loaded point sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Track {
    #[default]
    Empty,
    Loaded(LoadedTrack),
}

impl Track {
    /// Create an empty track.
    pub fn new() -> Self {
        Track::Empty
    }

    fn loaded_mut(&mut self) -> Result<&mut LoadedTrack> {
        match self {
            Track::Loaded(t) => Ok(t),
            Track::Empty => Err(TrackEditError::precondition("no track loaded")),
        }
    }

    fn loaded(&self) -> Result<&LoadedTrack> {
        match self {
            Track::Loaded(t) => Ok(t),
            Track::Empty => Err(TrackEditError::precondition("no track loaded")),
        }
    }

    // ========================================================================
    // Edits
    // ========================================================================

    /// Append one source as a new segment.
    ///
    /// A source whose hash is already loaded is ignored and `Ok(false)` is
    /// returned. Empty or invalid point lists are rejected.
    pub fn add_source(&mut self, points: Vec<GpxPoint>, source_hash: impl Into<String>) -> Result<bool> {
        let hash = source_hash.into();

        if let Track::Loaded(t) = self {
            if t.contains_source(&hash) {
                debug!("[Track] Source {} already loaded, skipping", hash);
                return Ok(false);
            }
        }
        if points.is_empty() {
            return Err(TrackEditError::LoadFailure {
                path: format!("source {}", hash),
                message: "source contains no points".to_string(),
            });
        }
        if let Some(i) = points.iter().position(|p| !p.is_valid()) {
            return Err(TrackEditError::LoadFailure {
                path: format!("source {}", hash),
                message: format!("point {} has invalid coordinates", i),
            });
        }

        let count = points.len();
        if self.is_empty() {
            *self = Track::Loaded(LoadedTrack {
                points: Vec::with_capacity(count),
                derived: Derived::default(),
                size: 0,
                loaded_files: Vec::new(),
            });
        }
        let track = self.loaded_mut()?;
        let id = track.append_source(points, hash);
        info!(
            "[Track] Added segment {} ({} points), total {:.3} km",
            id, count, track.derived.total_distance
        );
        Ok(true)
    }

    /// Reverse the point order of one segment. Timestamps stay in place.
    pub fn reverse_segment(&mut self, id: SegmentId) -> Result<()> {
        self.loaded_mut()?.reverse_segment(id)?;
        info!("[Track] Reversed segment {}", id);
        Ok(())
    }

    /// Split the segment holding row `split_index` so that the row starts a
    /// new segment. Later segment ids shift up by one.
    ///
    /// Returns the id of the new segment.
    pub fn divide_segment(&mut self, split_index: usize) -> Result<SegmentId> {
        let new_id = self.loaded_mut()?.divide_segment(split_index)?;
        info!("[Track] Divided at row {}, new segment {}", split_index, new_id);
        Ok(new_id)
    }

    /// Relabel segments through a permutation of the existing ids and reorder
    /// rows by their new id.
    pub fn change_order(&mut self, new_order: &BTreeMap<SegmentId, SegmentId>) -> Result<()> {
        self.loaded_mut()?.change_order(new_order)?;
        info!("[Track] Segment order changed: {:?}", new_order);
        Ok(())
    }

    /// Drop a segment. Returns the remaining segment count; at 0 the track
    /// is back to [`Track::Empty`].
    pub fn remove_segment(&mut self, id: SegmentId) -> Result<usize> {
        let track = self.loaded_mut()?;
        track.segment_indices(id)?;
        track.remove_rows(id);

        if track.points.is_empty() {
            *self = Track::Empty;
            info!("[Track] Removed segment {}, track is now empty", id);
            return Ok(0);
        }

        track.refresh();
        let size = track.size;
        info!("[Track] Removed segment {}, {} remaining", id, size);
        Ok(size)
    }

    /// Assign a constant-speed schedule: each point gets
    /// `initial + distance / speed_kmh` hours.
    pub fn insert_timestamp(&mut self, initial: DateTime<Utc>, speed_kmh: f64) -> Result<()> {
        if !(speed_kmh.is_finite() && speed_kmh > 0.0) {
            return Err(TrackEditError::precondition(format!(
                "speed must be positive, got {}",
                speed_kmh
            )));
        }
        self.loaded_mut()?.insert_timestamp(initial, speed_kmh)?;
        info!("[Track] Timestamps inserted from {} at {} km/h", initial, speed_kmh);
        Ok(())
    }

    /// Repair elevation spikes in one segment and rebuild derived columns.
    pub fn fix_elevation(&mut self, id: SegmentId, config: &ElevationFixConfig) -> Result<()> {
        self.loaded_mut()?.fix_elevation(id, config)?;
        info!("[Track] Elevation fixed for segment {}", id);
        Ok(())
    }

    /// Write the track as GPX, one `<trkseg>` per segment.
    ///
    /// Fails with [`TrackEditError::MissingTimestamp`] if any point has no time.
    pub fn save_as_gpx(&self, path: &Path) -> Result<()> {
        gpx_io::save_gpx(self.loaded()?.points.as_slice(), path)
    }

    // ========================================================================
    // Views
    // ========================================================================

    pub fn is_empty(&self) -> bool {
        matches!(self, Track::Empty)
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points().len()
    }

    /// Backing point sequence.
    pub fn points(&self) -> &[TrackPoint] {
        match self {
            Track::Loaded(t) => &t.points,
            Track::Empty => &[],
        }
    }

    /// Derived columns, if loaded.
    pub fn derived(&self) -> Option<&Derived> {
        match self {
            Track::Loaded(t) => Some(&t.derived),
            Track::Empty => None,
        }
    }

    /// Ordered rows of one segment with their derived values.
    pub fn get_segment(&self, id: SegmentId) -> Result<Vec<TrackRow>> {
        let track = self.loaded()?;
        Ok(track
            .segment_indices(id)?
            .into_iter()
            .map(|i| track.row(i))
            .collect())
    }

    /// All rows in order.
    pub fn rows(&self) -> Vec<TrackRow> {
        match self {
            Track::Loaded(t) => (0..t.points.len()).map(|i| t.row(i)).collect(),
            Track::Empty => Vec::new(),
        }
    }

    /// Segment ids present, ascending.
    pub fn segment_ids(&self) -> Vec<SegmentId> {
        match self {
            Track::Loaded(t) => t.segment_ids().into_iter().collect(),
            Track::Empty => Vec::new(),
        }
    }

    pub fn extremes(&self) -> Extremes {
        self.derived().map(|d| d.extremes).unwrap_or_default()
    }

    pub fn total_distance(&self) -> f64 {
        self.derived().map(|d| d.total_distance).unwrap_or(0.0)
    }

    pub fn total_uphill(&self) -> f64 {
        self.derived().map(|d| d.total_uphill).unwrap_or(0.0)
    }

    pub fn total_downhill(&self) -> f64 {
        self.derived().map(|d| d.total_downhill).unwrap_or(0.0)
    }

    /// Number of segments currently loaded.
    pub fn size(&self) -> usize {
        match self {
            Track::Loaded(t) => t.size,
            Track::Empty => 0,
        }
    }

    pub fn loaded_files(&self) -> &[Option<String>] {
        match self {
            Track::Loaded(t) => &t.loaded_files,
            Track::Empty => &[],
        }
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Capture the persisted fields of the track.
    pub fn snapshot(&self) -> TrackSnapshot {
        TrackSnapshot {
            points: self.points().to_vec(),
            size: self.size(),
            extremes: self.extremes(),
            total_distance: self.total_distance(),
            total_uphill: self.total_uphill(),
            total_downhill: self.total_downhill(),
            loaded_files: self.loaded_files().to_vec(),
        }
    }

    /// Rebuild a track from a snapshot. Derived columns are recomputed from
    /// the points; stored summaries that disagree are logged and replaced.
    pub fn from_snapshot(snapshot: TrackSnapshot) -> Result<Self> {
        if snapshot.points.is_empty() {
            return Ok(Track::Empty);
        }
        if let Some(i) = snapshot
            .points
            .iter()
            .position(|p| !GpxPoint::new(p.latitude, p.longitude).is_valid())
        {
            return Err(TrackEditError::precondition(format!(
                "snapshot point {} has invalid coordinates",
                i
            )));
        }

        let derived = recompute(&snapshot.points);
        if (derived.total_distance - snapshot.total_distance).abs() > 1e-6 {
            warn!(
                "[Track] Snapshot total distance {} differs from recomputed {}",
                snapshot.total_distance, derived.total_distance
            );
        }
        let segments = snapshot
            .points
            .iter()
            .map(|p| p.segment)
            .collect::<BTreeSet<_>>()
            .len();

        Ok(Track::Loaded(LoadedTrack {
            points: snapshot.points,
            derived,
            size: segments,
            loaded_files: snapshot.loaded_files,
        }))
    }

    /// Serialize the snapshot as JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    /// Restore from JSON produced by [`Track::to_json`].
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: TrackSnapshot = serde_json::from_str(json)?;
        Self::from_snapshot(snapshot)
    }
}

/// Persisted fields of a track, for session storage collaborators.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub points: Vec<TrackPoint>,
    pub size: usize,
    pub extremes: Extremes,
    pub total_distance: f64,
    pub total_uphill: f64,
    pub total_downhill: f64,
    pub loaded_files: Vec<Option<String>>,
}

/// Time reached after `distance_km` at a constant `speed_kmh`.
fn offset_time(initial: DateTime<Utc>, distance_km: f64, speed_kmh: f64) -> Result<DateTime<Utc>> {
    let micros = (distance_km / speed_kmh * 3_600_000_000.0).round();
    let out_of_range = || {
        TrackEditError::precondition(format!(
            "{:.3} km at {} km/h leaves the supported time range",
            distance_km, speed_kmh
        ))
    };
    if !micros.is_finite() || micros.abs() >= i64::MAX as f64 {
        return Err(out_of_range());
    }
    initial
        .checked_add_signed(chrono::Duration::microseconds(micros as i64))
        .ok_or_else(out_of_range)
}

/// Evenly thin rows for display, keeping at most `cap` of them.
///
/// Positions are `linspace(0, n - 1, cap)` truncated to integers, with
/// duplicates dropped, so first and last rows are always kept.
pub fn reduce_points(rows: &[TrackRow], cap: usize) -> Vec<TrackRow> {
    let n = rows.len();
    if n == 0 || cap == 0 {
        return Vec::new();
    }
    if cap == 1 {
        return vec![rows[0]];
    }

    let positions: BTreeSet<usize> = (0..cap)
        .map(|k| ((n - 1) as f64 * k as f64 / (cap - 1) as f64) as usize)
        .collect();
    positions.into_iter().map(|i| rows[i]).collect()
}
