// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Raster types shared by the statistics extractor, the heuristics and the
//! box workers.

use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

/// A single-plane image raster. The deconvolution engine owns the physical
/// storage of its images; everything in this crate works on these in-memory
/// planes fetched through an [`ImageStore`](crate::engine::ImageStore).
pub type Image = Array2<f64>;

/// The central-quarter pixel range of one axis. Axes of 10 pixels or fewer
/// are used whole, matching the statistics fallback region.
pub(crate) fn central_quarter_range(len: usize) -> std::ops::Range<usize> {
    if len > 10 {
        len / 4..(3 * len) / 4
    } else {
        0..len
    }
}

/// A boolean raster marking where the deconvolution engine is allowed to
/// place flux. A mask is built once per cycle and superseded, never mutated,
/// by the next cycle's mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanMask {
    pixels: Array2<bool>,
}

impl CleanMask {
    /// A mask with no permitted pixels.
    pub fn empty(shape: (usize, usize)) -> CleanMask {
        CleanMask {
            pixels: Array2::from_elem(shape, false),
        }
    }

    /// A mask permitting the whole image.
    pub fn full(shape: (usize, usize)) -> CleanMask {
        CleanMask {
            pixels: Array2::from_elem(shape, true),
        }
    }

    /// A mask permitting only the central quarter of the image, the default
    /// region when nothing better is known.
    pub fn central_quarter(shape: (usize, usize)) -> CleanMask {
        let mut mask = CleanMask::empty(shape);
        mask.add_box(
            central_quarter_range(shape.0),
            central_quarter_range(shape.1),
        );
        mask
    }

    pub fn from_pixels(pixels: Array2<bool>) -> CleanMask {
        CleanMask { pixels }
    }

    /// Permit a rectangular region. Out-of-bounds coordinates are clipped to
    /// the image edge.
    pub fn add_box(&mut self, rows: std::ops::Range<usize>, cols: std::ops::Range<usize>) {
        let (nrows, ncols) = self.pixels.dim();
        let rows = rows.start.min(nrows)..rows.end.min(nrows);
        let cols = cols.start.min(ncols)..cols.end.min(ncols);
        self.pixels.slice_mut(s![rows, cols]).fill(true);
    }

    pub fn shape(&self) -> (usize, usize) {
        self.pixels.dim()
    }

    pub fn pixels(&self) -> ArrayView2<'_, bool> {
        self.pixels.view()
    }

    /// Whether no pixels are permitted. An empty mask makes the statistics
    /// extractor fall back to the central quarter.
    pub fn is_empty(&self) -> bool {
        !self.pixels.iter().any(|&p| p)
    }

    pub fn num_masked(&self) -> usize {
        self.pixels.iter().filter(|&&p| p).count()
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        self.pixels.get((row, col)).copied().unwrap_or(false)
    }

    pub fn summary(&self) -> MaskSummary {
        let (nrows, ncols) = self.pixels.dim();
        let total = nrows * ncols;
        let masked = self.num_masked();
        MaskSummary {
            num_pixels: masked,
            total_pixels: total,
            fraction: if total > 0 {
                masked as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// A compact description of a mask for the iteration log; the full raster is
/// deliberately not serialized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MaskSummary {
    pub num_pixels: usize,
    pub total_pixels: usize,
    pub fraction: f64,
}
