// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Scalar statistics extracted from one cycle's images. Everything the
//! convergence heuristics decide on comes from here.


use ndarray::prelude::*;
use ndarray::Zip;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::{CleanProducts, ImageStore};
use crate::image::{central_quarter_range, CleanMask, Image};

/// The per-cycle statistics record. Computed fresh each cycle and never
/// mutated afterwards; the box worker keeps them only as immutable history
/// entries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageStatistics {
    /// Total flux in the model image \[Jy\].
    pub model_flux_sum: f64,
    /// RMS of the residual inside the clean mask, or inside the central
    /// quarter when no mask exists yet.
    pub cleaned_rms: f64,
    /// RMS of the residual outside the clean mask: the region assumed free
    /// of real emission, and the primary noise proxy downstream.
    pub non_cleaned_rms: f64,
    pub residual_max: f64,
    pub residual_min: f64,
    /// RMS of the central quarter of the residual.
    pub rms_2d: f64,
    /// Peak of the restored image.
    pub image_max: f64,
}

#[derive(Error, Debug)]
pub enum StatsError {
    #[error("Expected image {id} could not be located")]
    ImageMissing { id: String },

    #[error("Image {id} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        id: String,
        expected: (usize, usize),
        actual: (usize, usize),
    },
}

/// Compute the statistics for one cycle's products, optionally restricted by
/// the cycle's clean mask. Pure apart from reads through the store; an
/// all-zero or fully-masked image yields zero sentinels rather than an
/// error, which is the legitimate state of the dirty pass.
pub fn analyse(
    store: &dyn ImageStore,
    products: &CleanProducts,
    mask: Option<&CleanMask>,
) -> Result<ImageStatistics, StatsError> {
    let model = fetch(store, &products.model)?;
    let restored = fetch(store, &products.restored)?;
    let residual = fetch(store, &products.residual)?;
    let sensitivity = fetch(store, &products.sensitivity)?;

    // Pixels with no sensitivity coverage carry no information and are
    // excluded from every region.
    let covered = sensitivity.mapv(|s| s > 0.0);

    let model_flux_sum = model.sum();

    let (inside, outside) = match mask {
        Some(mask) if !mask.is_empty() => {
            let inside = Zip::from(mask.pixels())
                .and(&covered)
                .map_collect(|&m, &c| m && c);
            let outside = Zip::from(mask.pixels())
                .and(&covered)
                .map_collect(|&m, &c| !m && c);
            (inside, outside)
        }
        // No mask yet: fall back to the central quarter and its complement.
        _ => {
            let quarter = central_quarter_selection(residual.dim());
            let inside = Zip::from(&quarter)
                .and(&covered)
                .map_collect(|&q, &c| q && c);
            let outside = Zip::from(&quarter)
                .and(&covered)
                .map_collect(|&q, &c| !q && c);
            (inside, outside)
        }
    };

    let cleaned_rms = region_rms(&residual, &inside);
    let non_cleaned_rms = region_rms(&residual, &outside);
    let rms_2d = region_rms(&residual, &central_quarter_selection(residual.dim()));

    let (residual_min, residual_max) = extrema(&residual);
    let image_max = extrema(&restored).1;

    Ok(ImageStatistics {
        model_flux_sum,
        cleaned_rms,
        non_cleaned_rms,
        residual_max,
        residual_min,
        rms_2d,
        image_max,
    })
}

fn fetch(store: &dyn ImageStore, id: &str) -> Result<Image, StatsError> {
    store.read_image(id).ok_or_else(|| StatsError::ImageMissing {
        id: id.to_string(),
    })
}

fn central_quarter_selection(shape: (usize, usize)) -> Array2<bool> {
    let mut selection = Array2::from_elem(shape, false);
    selection
        .slice_mut(s![
            central_quarter_range(shape.0),
            central_quarter_range(shape.1)
        ])
        .fill(true);
    selection
}

/// RMS over the selected pixels. An empty selection reports 0.
fn region_rms(image: &Image, selection: &Array2<bool>) -> f64 {
    let (sum_sq, count) = Zip::from(image).and(selection).par_fold(
        || (0.0_f64, 0_usize),
        |(sum_sq, count), &pixel, &selected| {
            if selected {
                (sum_sq + pixel * pixel, count + 1)
            } else {
                (sum_sq, count)
            }
        },
        |(s1, n1), (s2, n2)| (s1 + s2, n1 + n2),
    );
    if count == 0 {
        0.0
    } else {
        (sum_sq / count as f64).sqrt()
    }
}

/// (min, max) over the whole image; (0, 0) for an empty image.
fn extrema(image: &Image) -> (f64, f64) {
    if image.is_empty() {
        return (0.0, 0.0);
    }
    image
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), &p| {
            (min.min(p), max.max(p))
        })
}
