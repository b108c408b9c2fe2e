// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Mask and threshold heuristics. Everything here is a pure function over
//! images, scalars and histories; numerically degenerate inputs (zero RMS,
//! empty island lists, zero flux) produce a well-defined "stop" decision
//! instead of an error, so one bad cycle can't take down a multi-target run.

#[cfg(test)]
mod tests;

use itertools::Itertools;
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use crate::image::{CleanMask, Image};

/// The convergence tolerances. These are configuration rather than constants
/// because the right values are empirical and vary with the array and the
/// field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerances {
    /// The noise floor is this many times the non-cleaned residual RMS.
    pub noise_sigma: f64,
    /// Applied to the candidate threshold when its relative decrease is
    /// below `threshold_decay_trigger`, so the decay can't stall.
    pub threshold_decay: f64,
    pub threshold_decay_trigger: f64,
    /// Cleaning continues only while the accepted threshold decreases by
    /// more than this relative amount per cycle.
    pub threshold_stop_rel: f64,
    /// Cleaning continues only while the cumulative model flux grows by
    /// more than this relative amount per cycle.
    pub flux_stop_rel: f64,
    /// Two islands are "the same" if their peaks are within this many
    /// pixels.
    pub island_position: f64,
    /// Islands fainter than this many times the non-cleaned RMS are dropped
    /// before mask growth. The brightest island is exempt.
    pub island_rejection_sigma: f64,
    /// Stop once the in-mask residual RMS falls below this fraction of the
    /// out-of-mask RMS; the mask region has been cleaned into the noise.
    pub cleaned_rms_floor_frac: f64,
    /// Absolute non-cleaned RMS below which cleaning stops immediately.
    /// Zero disables the check.
    pub rms_stop: f64,
}

impl Default for Tolerances {
    fn default() -> Tolerances {
        Tolerances {
            noise_sigma: 2.0,
            threshold_decay: 0.8,
            threshold_decay_trigger: 0.1,
            threshold_stop_rel: 0.02,
            flux_stop_rel: 0.03,
            island_position: 2.0,
            island_rejection_sigma: 7.0,
            cleaned_rms_floor_frac: 0.8,
            rms_stop: 0.0,
        }
    }
}

/// One connected region of residual above the active threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IslandPeak {
    /// (row, column) of the peak pixel.
    pub position: (usize, usize),
    pub peak_value: f64,
    pub region_id: usize,
    /// Half-width estimate of the region, used to grow the next mask around
    /// it.
    pub extent: usize,
}

/// Ratio of the PSF's strongest sidelobe peak to its main-lobe peak.
///
/// The main lobe is taken as the 8-connected region around the peak above
/// half maximum, dilated by its own bounding-box radius; the strongest
/// absolute pixel outside that region is the sidelobe peak. Computed once
/// per target and cached by the box worker.
pub fn sidelobe_ratio(psf: &Image) -> f64 {
    let (nrows, ncols) = psf.dim();
    if nrows == 0 || ncols == 0 {
        return 0.0;
    }

    let mut peak = f64::NEG_INFINITY;
    let mut peak_pos = (0, 0);
    for ((row, col), &p) in psf.indexed_iter() {
        if p > peak {
            peak = p;
            peak_pos = (row, col);
        }
    }
    if !(peak > 0.0) {
        return 0.0;
    }

    let main_lobe = flood_fill(psf, peak_pos, 0.5 * peak);
    let (mut row_min, mut row_max) = (peak_pos.0, peak_pos.0);
    let (mut col_min, mut col_max) = (peak_pos.1, peak_pos.1);
    for ((row, col), &in_lobe) in main_lobe.indexed_iter() {
        if in_lobe {
            row_min = row_min.min(row);
            row_max = row_max.max(row);
            col_min = col_min.min(col);
            col_max = col_max.max(col);
        }
    }
    // Dilate the exclusion box by the lobe's own radius; the first sidelobe
    // sits right against the main lobe's skirt.
    let radius = ((row_max - row_min).max(col_max - col_min) + 1) / 2 + 1;
    let row_excl = row_min.saturating_sub(radius)..(row_max + radius + 1).min(nrows);
    let col_excl = col_min.saturating_sub(radius)..(col_max + radius + 1).min(ncols);

    let mut sidelobe = 0.0_f64;
    for ((row, col), &p) in psf.indexed_iter() {
        if row_excl.contains(&row) && col_excl.contains(&col) {
            continue;
        }
        sidelobe = sidelobe.max(p.abs());
    }
    (sidelobe / peak).clamp(0.0, 1.0)
}

/// Scan the residual for 8-connected regions whose pixels exceed
/// `threshold`. Region ids follow row-major discovery order, so detection is
/// deterministic: the same residual and threshold always yield the same
/// island set.
pub fn detect_islands(residual: &Image, threshold: f64) -> Vec<IslandPeak> {
    if !threshold.is_finite() {
        return vec![];
    }

    let (nrows, ncols) = residual.dim();
    let mut visited = Array2::from_elem((nrows, ncols), false);
    let mut islands = vec![];

    for row in 0..nrows {
        for col in 0..ncols {
            if visited[(row, col)] || residual[(row, col)] <= threshold {
                continue;
            }

            // Flood-fill this region, tracking its peak and bounding box.
            let mut stack = vec![(row, col)];
            visited[(row, col)] = true;
            let mut peak_value = residual[(row, col)];
            let mut position = (row, col);
            let (mut row_min, mut row_max) = (row, row);
            let (mut col_min, mut col_max) = (col, col);
            while let Some((r, c)) = stack.pop() {
                let p = residual[(r, c)];
                if p > peak_value {
                    peak_value = p;
                    position = (r, c);
                }
                row_min = row_min.min(r);
                row_max = row_max.max(r);
                col_min = col_min.min(c);
                col_max = col_max.max(c);
                for (nr, nc) in neighbours((r, c), (nrows, ncols)) {
                    if !visited[(nr, nc)] && residual[(nr, nc)] > threshold {
                        visited[(nr, nc)] = true;
                        stack.push((nr, nc));
                    }
                }
            }

            let extent = (((row_max - row_min).max(col_max - col_min) + 1) / 2).max(1);
            islands.push(IslandPeak {
                position,
                peak_value,
                region_id: islands.len(),
                extent,
            });
        }
    }
    islands
}

/// Drop islands too faint or too large to be credible emission. The
/// brightest island is exempt from the brightness veto: it is what triggered
/// detection in the first place.
pub fn vet_islands(
    islands: Vec<IslandPeak>,
    non_cleaned_rms: f64,
    shape: (usize, usize),
    tolerances: &Tolerances,
) -> Vec<IslandPeak> {
    let brightest = islands
        .iter()
        .map(|i| i.peak_value)
        .fold(f64::NEG_INFINITY, f64::max);
    let floor = tolerances.island_rejection_sigma * non_cleaned_rms;
    islands
        .into_iter()
        .filter(|island| {
            // The grown box is 4 extents plus the peak pixel wide.
            let oversized = 4 * island.extent + 1 > (3 * shape.0.min(shape.1)) / 4;
            let faint = island.peak_value < floor && island.peak_value < brightest;
            !oversized && !faint
        })
        .collect()
}

/// Build the next clean mask: a box of ±2 extents around each island peak.
/// No islands means an empty mask; the caller decides the fallback region.
pub fn grow_mask(shape: (usize, usize), islands: &[IslandPeak]) -> CleanMask {
    let mut mask = CleanMask::empty(shape);
    for island in islands {
        let (row, col) = island.position;
        let half = 2 * island.extent;
        mask.add_box(
            row.saturating_sub(half)..row + half + 1,
            col.saturating_sub(half)..col + half + 1,
        );
    }
    mask
}

/// Derive the next cleaning threshold and the candidate islands for the next
/// mask.
///
/// The threshold is the larger of a noise floor (`noise_sigma` times the
/// non-cleaned RMS, decayed so it can't stall) and a sidelobe floor (the
/// sidelobe ratio times the residual peak, below which cleaning would dig
/// into the PSF's own sidelobes). From the second cycle on it is clamped to
/// never exceed the previously accepted threshold; `old_threshold` is `None`
/// on the first cycle.
pub fn threshold_and_mask(
    residual: &Image,
    old_threshold: Option<f64>,
    sidelobe_ratio: f64,
    non_cleaned_rms: f64,
    tolerances: &Tolerances,
) -> (f64, Vec<IslandPeak>) {
    let residual_max = residual.iter().copied().fold(0.0_f64, f64::max);

    let noise_floor = tolerances.noise_sigma * non_cleaned_rms;
    let mut candidate = match old_threshold {
        Some(old) if old > 0.0 => {
            let mut candidate = old.min(noise_floor);
            let change = (old - candidate) / old;
            if change < tolerances.threshold_decay_trigger {
                candidate *= tolerances.threshold_decay;
            }
            candidate
        }
        _ => noise_floor,
    };

    let sidelobe_floor = sidelobe_ratio * residual_max;
    candidate = candidate.max(sidelobe_floor);
    let new_threshold = match old_threshold {
        Some(old) if old > 0.0 => candidate.min(old),
        _ => candidate,
    };

    let islands = vet_islands(
        detect_islands(residual, new_threshold),
        non_cleaned_rms,
        residual.dim(),
        tolerances,
    );
    (new_threshold, islands)
}

/// The convergence oracle: decide whether another clean cycle is worthwhile.
///
/// Cleaning continues only while *all* of these hold: the threshold is still
/// decreasing, the model flux is still growing, the island set has not
/// stabilised, the mask region has not been cleaned into the noise, the
/// in-mask RMS is not rising (clean running amok), and the cycle cap has not
/// been reached. Operates purely on scalars and histories; no hidden state.
#[allow(clippy::too_many_arguments)]
pub fn clean_more(
    cycle: u32,
    max_cycles: u32,
    old_threshold: f64,
    new_threshold: f64,
    non_cleaned_rms: f64,
    island_history: &[Vec<IslandPeak>],
    flux_history: &[f64],
    cleaned_rms_history: &[f64],
    tolerances: &Tolerances,
) -> bool {
    // Hard cap, regardless of anything below.
    if cycle >= max_cycles {
        return false;
    }

    // Already at the configured noise tolerance.
    if tolerances.rms_stop > 0.0 && non_cleaned_rms <= tolerances.rms_stop {
        return false;
    }

    // Threshold no longer decreasing meaningfully.
    if old_threshold > 0.0 {
        let change = (old_threshold - new_threshold) / old_threshold;
        if change <= tolerances.threshold_stop_rel {
            return false;
        }
    } else if new_threshold <= 0.0 {
        // Nothing measurable to clean towards.
        return false;
    }

    // Flux no longer growing meaningfully.
    if let Some((&latest, &previous)) = flux_history.iter().rev().next_tuple() {
        if previous > 0.0 {
            let growth = (latest - previous) / previous;
            if growth <= tolerances.flux_stop_rel {
                return false;
            }
        } else if latest <= 0.0 {
            return false;
        }
    }

    // In-mask residual cleaned down into the noise, or rising again.
    if let Some((&latest, &previous)) = cleaned_rms_history.iter().rev().next_tuple() {
        if latest < tolerances.cleaned_rms_floor_frac * non_cleaned_rms {
            return false;
        }
        if latest > previous {
            return false;
        }
    }

    // Island set stable (or gone) across the last two cycles.
    match island_history {
        [] => true,
        [.., latest] if latest.is_empty() => false,
        [.., previous, latest] => !islands_stable(previous, latest, tolerances.island_position),
        _ => true,
    }
}

/// Whether two island sets have the same count and approximately the same
/// peak positions.
pub(crate) fn islands_stable(
    previous: &[IslandPeak],
    latest: &[IslandPeak],
    position_tolerance: f64,
) -> bool {
    if previous.len() != latest.len() {
        return false;
    }
    latest.iter().all(|island| {
        previous.iter().any(|other| {
            let dr = island.position.0 as f64 - other.position.0 as f64;
            let dc = island.position.1 as f64 - other.position.1 as f64;
            (dr * dr + dc * dc).sqrt() <= position_tolerance
        })
    })
}

/// One-shot iteration budget for calibrator-type targets: enough minor
/// cycles to take the residual peak down through the PSF's sidelobe level,
/// without the threshold-decay loop. The budget is the number of
/// factor-of-sidelobe-ratio steps between the peak and the sidelobe floor,
/// times the per-cycle budget, capped at ten cycles' worth.
pub fn niter_and_mask(
    psf: &Image,
    residual: &Image,
    candidate_mask: &CleanMask,
    cycle_niter: u32,
) -> (u32, CleanMask) {
    let mask = if candidate_mask.is_empty() {
        CleanMask::central_quarter(residual.dim())
    } else {
        candidate_mask.clone()
    };

    let peak = residual.iter().copied().fold(0.0_f64, f64::max);
    if !(peak > 0.0) {
        // Nothing to clean.
        return (0, mask);
    }

    let ratio = sidelobe_ratio(psf);
    if !(ratio > 0.0) || ratio >= 1.0 {
        return (cycle_niter, mask);
    }

    let steps = (-ratio.ln() / std::f64::consts::LN_2).ceil().max(1.0) as u32;
    ((steps * cycle_niter).min(10 * cycle_niter), mask)
}

/// Scale the per-cycle iteration budget with the dynamic range still left in
/// the residual: a peak far above the threshold needs more minor cycles.
pub fn niter_correction(cycle_niter: u32, residual_max: f64, threshold: f64) -> u32 {
    if !(threshold > 0.0) || residual_max <= threshold {
        return cycle_niter;
    }
    let scale = (residual_max / threshold).log2().ceil().max(1.0) as u32;
    (scale * cycle_niter).min(10 * cycle_niter)
}

fn flood_fill(image: &Image, start: (usize, usize), level: f64) -> Array2<bool> {
    let shape = image.dim();
    let mut region = Array2::from_elem(shape, false);
    if image[start] < level {
        return region;
    }
    let mut stack = vec![start];
    region[start] = true;
    while let Some(pos) = stack.pop() {
        for neighbour in neighbours(pos, shape) {
            if !region[neighbour] && image[neighbour] >= level {
                region[neighbour] = true;
                stack.push(neighbour);
            }
        }
    }
    region
}

fn neighbours(
    (row, col): (usize, usize),
    (nrows, ncols): (usize, usize),
) -> impl Iterator<Item = (usize, usize)> {
    let row_range = row.saturating_sub(1)..=(row + 1).min(nrows - 1);
    row_range.cartesian_product(col.saturating_sub(1)..=(col + 1).min(ncols - 1))
        .filter(move |&pos| pos != (row, col))
}
