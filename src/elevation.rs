//! # Elevation Fixer
//!
//! Repairs GPS elevation spikes within one segment.
//!
//! ## Algorithm
//!
//! 1. Mark a point *steep* when its elevation jumps more than `steep_gap`
//!    from the previous point, or when it lies within `steep_distance` (km,
//!    along the cumulative distance) after the latest jump.
//! 2. Each steep run is bridged by a least-squares cubic fitted through up to
//!    [`ANCHOR_WINDOW`] non-steep samples before the run and up to
//!    [`ANCHOR_WINDOW`] non-steep samples after it. Steep points of a later
//!    run never anchor an earlier one; a bridged run counts as clean for
//!    the runs that follow.
//! 3. A run still open when the segment ends has no "after" anchor; its tail
//!    is replaced by a trailing moving average starting at the last clean
//!    sample.
//!
//! The regression uses the point *index* as its independent variable, not
//! the distance. This assumes near-uniform sampling and loses precision on
//! tracks with very irregular sample spacing.
//!
//! Functions here are pure. Callers own writing the result back and
//! recomputing any derived columns.

use log::debug;

use crate::config::ElevationFixConfig;

/// Samples captured on each side of a steep run.
pub const ANCHOR_WINDOW: usize = 10;

/// Polynomial fitted on a normalized abscissa.
///
/// `x` is mapped to `(x - offset) / scale` before evaluation, which keeps
/// the normal equations well conditioned for large row indices.
#[derive(Debug, Clone, PartialEq)]
pub struct Polynomial {
    /// Coefficients, lowest degree first
    pub coeffs: Vec<f64>,
    offset: f64,
    scale: f64,
}

impl Polynomial {
    /// Evaluate at `x` (Horner).
    pub fn eval(&self, x: f64) -> f64 {
        let t = (x - self.offset) / self.scale;
        self.coeffs.iter().rev().fold(0.0, |acc, c| acc * t + c)
    }

    pub fn degree(&self) -> usize {
        self.coeffs.len().saturating_sub(1)
    }
}

/// Ordinary least-squares polynomial fit of the given degree.
///
/// Returns `None` when there are no samples or the system is singular
/// (e.g. fewer distinct abscissas than coefficients).
pub fn polyfit(xs: &[f64], ys: &[f64], degree: usize) -> Option<Polynomial> {
    let n = xs.len().min(ys.len());
    if n == 0 {
        return None;
    }

    let min = xs[..n].iter().cloned().fold(f64::INFINITY, f64::min);
    let max = xs[..n].iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let offset = (min + max) / 2.0;
    let scale = if max > min { (max - min) / 2.0 } else { 1.0 };

    let m = degree + 1;
    // Normal equations A^T A c = A^T y, as an augmented m x (m+1) matrix
    let mut sys = vec![vec![0.0; m + 1]; m];
    for k in 0..n {
        let t = (xs[k] - offset) / scale;
        let mut powers = vec![1.0; 2 * m - 1];
        for p in 1..powers.len() {
            powers[p] = powers[p - 1] * t;
        }
        for (r, row) in sys.iter_mut().enumerate() {
            for c in 0..m {
                row[c] += powers[r + c];
            }
            row[m] += powers[r] * ys[k];
        }
    }

    let coeffs = solve_linear(sys)?;
    Some(Polynomial {
        coeffs,
        offset,
        scale,
    })
}

/// Gaussian elimination with partial pivoting on an augmented matrix.
fn solve_linear(mut sys: Vec<Vec<f64>>) -> Option<Vec<f64>> {
    let m = sys.len();
    for col in 0..m {
        let pivot = (col..m).max_by(|&a, &b| {
            sys[a][col]
                .abs()
                .partial_cmp(&sys[b][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if sys[pivot][col].abs() < 1e-12 {
            return None;
        }
        sys.swap(col, pivot);

        for row in (col + 1)..m {
            let factor = sys[row][col] / sys[col][col];
            for k in col..=m {
                sys[row][k] -= factor * sys[col][k];
            }
        }
    }

    let mut solution = vec![0.0; m];
    for row in (0..m).rev() {
        let tail: f64 = ((row + 1)..m).map(|k| sys[row][k] * solution[k]).sum();
        solution[row] = (sys[row][m] - tail) / sys[row][row];
    }
    Some(solution)
}

/// Trailing moving average with the window truncated at the start.
///
/// Output has the same length as the input; element `k` is the mean of
/// `values[k + 1 - window ..= k]` (or of everything up to `k` when fewer
/// samples are available).
pub fn trailing_moving_average(values: &[f64], window: usize) -> Vec<f64> {
    let window = window.max(1);
    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for (k, v) in values.iter().enumerate() {
        sum += v;
        if k >= window {
            sum -= values[k - window];
        }
        let count = (k + 1).min(window);
        out.push(sum / count as f64);
    }
    out
}

/// Fill missing elevations by linear interpolation between known
/// neighbours (edges copy the nearest known value).
///
/// Returns `None` when no elevation is known at all.
pub fn fill_missing(elevation: &[Option<f64>]) -> Option<Vec<f64>> {
    let known: Vec<(usize, f64)> = elevation
        .iter()
        .enumerate()
        .filter_map(|(i, e)| match *e {
            Some(v) if v.is_finite() => Some((i, v)),
            _ => None,
        })
        .collect();
    let (&(first_i, first_v), &(last_i, last_v)) = (known.first()?, known.last()?);

    let mut out = vec![0.0; elevation.len()];
    for slot in out.iter_mut().take(first_i + 1) {
        *slot = first_v;
    }
    for w in known.windows(2) {
        let (i0, v0) = w[0];
        let (i1, v1) = w[1];
        for (j, slot) in out.iter_mut().enumerate().take(i1 + 1).skip(i0) {
            let t = (j - i0) as f64 / (i1 - i0) as f64;
            *slot = v0 + t * (v1 - v0);
        }
    }
    for slot in out.iter_mut().skip(last_i) {
        *slot = last_v;
    }
    Some(out)
}

/// Classify each point as steep (see module docs).
pub fn steep_mask(elevation: &[f64], distance: &[f64], config: &ElevationFixConfig) -> Vec<bool> {
    let n = elevation.len().min(distance.len());
    let mut steep = vec![false; n];
    let mut last_steep: Option<f64> = None;

    for i in 1..n {
        if (elevation[i] - elevation[i - 1]).abs() > config.steep_gap {
            steep[i] = true;
            last_steep = Some(distance[i]);
        } else if let Some(last) = last_steep {
            steep[i] = distance[i] - last < config.steep_distance;
        }
    }
    steep
}

/// Up to [`ANCHOR_WINDOW`] non-steep indices before `entry`, ascending.
fn clean_before(steep: &[bool], entry: usize) -> Vec<usize> {
    let mut anchors: Vec<usize> = (0..entry)
        .rev()
        .filter(|&j| !steep[j])
        .take(ANCHOR_WINDOW)
        .collect();
    anchors.reverse();
    anchors
}

/// Up to [`ANCHOR_WINDOW`] non-steep indices from `exit` on.
fn clean_after(steep: &[bool], exit: usize) -> Vec<usize> {
    (exit..steep.len()).filter(|&j| !steep[j]).take(ANCHOR_WINDOW).collect()
}

/// Repair steep zones in one segment's elevation profile.
///
/// `distance` is the cumulative distance (km) of the same points. The
/// returned vector has the same length as `elevation`.
pub fn fix_elevation(elevation: &[f64], distance: &[f64], config: &ElevationFixConfig) -> Vec<f64> {
    let n = elevation.len().min(distance.len());
    let mut fixed = elevation[..n].to_vec();
    if n < 2 {
        return fixed;
    }

    let mut steep = steep_mask(elevation, distance, config);
    let steep_count = steep.iter().filter(|s| **s).count();
    let mut before: Vec<usize> = Vec::new();
    let mut open_run = false;
    let mut bridged = 0usize;

    for i in 1..n {
        if !steep[i - 1] && steep[i] {
            before = clean_before(&steep, i);
            open_run = true;
        }

        if steep[i - 1] && !steep[i] {
            let after = clean_after(&steep, i);
            let xs: Vec<f64> = before.iter().chain(after.iter()).map(|&j| j as f64).collect();
            let ys: Vec<f64> = before.iter().chain(after.iter()).map(|&j| fixed[j]).collect();
            let degree = 3.min(xs.len().saturating_sub(1));
            let start = before.last().map(|&b| b + 1).unwrap_or(0);

            if let Some(poly) = polyfit(&xs, &ys, degree) {
                for (j, value) in fixed.iter_mut().enumerate().take(i).skip(start) {
                    *value = poly.eval(j as f64);
                }
                // A bridged run is clean and may anchor the next one
                for flag in steep.iter_mut().take(i).skip(start) {
                    *flag = false;
                }
                bridged += 1;
            }
            open_run = false;
        }
    }

    if open_run {
        let start = before.last().copied().unwrap_or(0);
        let smoothed = trailing_moving_average(&fixed[start..n], config.steep_k_moving_average);
        fixed[start..n].copy_from_slice(&smoothed);
        debug!(
            "[fix_elevation] Unresolved tail from {} smoothed with window {}",
            start, config.steep_k_moving_average
        );
    }

    debug!(
        "[fix_elevation] {} points, {} steep, {} zones bridged",
        n, steep_count, bridged
    );
    fixed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn std_dev(values: &[f64]) -> f64 {
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
    }

    fn max_abs(values: &[f64]) -> f64 {
        values.iter().fold(0.0, |m, v| m.max(v.abs()))
    }

    #[test]
    fn test_polyfit_recovers_cubic() {
        let xs: Vec<f64> = (0..20).map(|i| i as f64 + 500.0).collect();
        let ys: Vec<f64> = xs.iter().map(|x| 0.001 * x * x * x - 2.0 * x + 7.0).collect();
        let poly = polyfit(&xs, &ys, 3).unwrap();
        for (x, y) in xs.iter().zip(&ys) {
            assert!((poly.eval(*x) - y).abs() < 1e-3 * y.abs().max(1.0));
        }
    }

    #[test]
    fn test_polyfit_underdetermined() {
        assert!(polyfit(&[1.0, 1.0], &[2.0, 3.0], 3).is_none());
        assert!(polyfit(&[], &[], 1).is_none());
        let constant = polyfit(&[4.0], &[9.0], 0).unwrap();
        assert_eq!(constant.eval(100.0), 9.0);
    }

    #[test]
    fn test_trailing_moving_average() {
        let out = trailing_moving_average(&[1.0, 2.0, 3.0, 4.0], 2);
        assert_eq!(out, vec![1.0, 1.5, 2.5, 3.5]);
    }

    #[test]
    fn test_fill_missing() {
        let out = fill_missing(&[None, Some(10.0), None, Some(20.0), None]).unwrap();
        assert_eq!(out, vec![10.0, 10.0, 15.0, 20.0, 20.0]);
        assert!(fill_missing(&[None, None]).is_none());
    }

    #[test]
    fn test_steep_mask_extends_over_distance() {
        let ele = vec![100.0, 100.0, 110.0, 110.0, 110.0, 110.0];
        let dist = vec![0.0, 0.05, 0.10, 0.15, 0.25, 0.40];
        let mask = steep_mask(&ele, &dist, &ElevationFixConfig::default());
        assert_eq!(mask, vec![false, false, true, true, true, false]);
    }

    #[test]
    fn test_spike_removed() {
        let n = 60;
        let mut ele: Vec<f64> = (0..n).map(|i| 100.0 + 0.1 * i as f64).collect();
        let dist: Vec<f64> = (0..n).map(|i| i as f64 * 0.05).collect();
        ele[30] = 150.0;

        let fixed = fix_elevation(&ele, &dist, &ElevationFixConfig::default());

        assert_eq!(fixed.len(), n);
        assert!((fixed[30] - 103.0).abs() < 1e-6, "got {}", fixed[30]);
        assert!(std_dev(&fixed) < std_dev(&ele));
        assert!(max_abs(&fixed) < max_abs(&ele));
        // Points outside the zone are untouched
        assert_eq!(fixed[10], ele[10]);
        assert_eq!(fixed[50], ele[50]);
    }

    #[test]
    fn test_close_spikes_use_clean_anchors() {
        // Two spikes eight samples apart: the second one sits inside the
        // first run's after-window and must not pull the bridge upwards.
        let n = 80;
        let mut ele: Vec<f64> = (0..n).map(|i| 100.0 + 0.1 * i as f64).collect();
        let dist: Vec<f64> = (0..n).map(|i| i as f64 * 0.05).collect();
        ele[30] = 150.0;
        ele[38] = 400.0;

        let fixed = fix_elevation(&ele, &dist, &ElevationFixConfig::default());

        for j in 28..50 {
            let expected = 100.0 + 0.1 * j as f64;
            assert!((fixed[j] - expected).abs() < 1e-4, "fixed[{}] = {}", j, fixed[j]);
        }
        assert!(max_abs(&fixed) < 110.0);
    }

    #[test]
    fn test_anchor_windows_skip_steep_samples() {
        let steep = [false, false, true, true, false, true, false, false];
        assert_eq!(clean_before(&steep, 2), vec![0, 1]);
        assert_eq!(clean_after(&steep, 4), vec![4, 6, 7]);
        assert!(clean_before(&steep, 0).is_empty());
    }

    #[test]
    fn test_unresolved_tail_is_smoothed() {
        let n = 40;
        let mut ele: Vec<f64> = vec![100.0; n];
        let dist: Vec<f64> = (0..n).map(|i| i as f64 * 0.05).collect();
        // Alternating noise at the very end keeps the run open
        for (k, e) in ele.iter_mut().enumerate().skip(34) {
            *e = if k % 2 == 0 { 130.0 } else { 70.0 };
        }

        let fixed = fix_elevation(&ele, &dist, &ElevationFixConfig::default());

        assert!(std_dev(&fixed) < std_dev(&ele));
        assert!(max_abs(&fixed) < max_abs(&ele));
        assert_eq!(fixed[20], 100.0);
    }

    #[test]
    fn test_short_inputs() {
        let config = ElevationFixConfig::default();
        assert!(fix_elevation(&[], &[], &config).is_empty());
        assert_eq!(fix_elevation(&[5.0], &[0.0], &config), vec![5.0]);
    }
}
