// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-target cleaning parameters.

use serde::{Deserialize, Serialize};

use crate::engine::{DataSelection, GridSpec};
use crate::heuristics::Tolerances;

/// How the clean mask is chosen each cycle.
#[derive(Debug, Clone, PartialEq, Eq, strum_macros::Display, Serialize, Deserialize)]
pub enum MaskPolicy {
    /// No mask; the engine may place flux anywhere.
    None,
    /// A fixed box over the central quarter of the image.
    CentralQuarter,
    /// A user-supplied mask image, looked up in the image store by id.
    Manual(String),
    /// Masks grown automatically around residual islands, thresholded
    /// against the PSF sidelobe level.
    SidelobeAuto,
}

/// Target classification. Calibrators are typically point-like and get a
/// one-shot iteration budget instead of the full threshold-decay loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, Serialize, Deserialize)]
pub enum TargetKind {
    Science,
    Calibrator,
}

/// Everything the clean controller needs to run one target.
#[derive(Debug, Clone)]
pub struct CleanParams {
    /// Naming prefix for this target's image products. Must be unique among
    /// concurrently running targets.
    pub target: String,
    pub selection: DataSelection,
    pub grid: GridSpec,
    pub mask_policy: MaskPolicy,
    pub target_kind: TargetKind,

    /// Hard cap on the number of clean cycles, dirty pass excluded.
    pub max_cycles: u32,
    /// Per-cycle minor-iteration budget handed to the engine.
    pub cycle_niter: u32,
    /// Multiplier applied to the sensitivity estimate to form the initial
    /// threshold guess.
    pub tlimit: f64,
    /// An advisory theoretical sensitivity \[Jy\], if one is known.
    pub sensitivity: Option<f64>,
    /// Whether to estimate the noise empirically from the orthogonal
    /// polarization product before cycling.
    pub estimate_noise: bool,

    pub tolerances: Tolerances,
}

impl CleanParams {
    pub fn new(target: &str, selection: DataSelection, grid: GridSpec) -> CleanParams {
        CleanParams {
            target: target.to_string(),
            selection,
            grid,
            mask_policy: MaskPolicy::CentralQuarter,
            target_kind: TargetKind::Science,
            max_cycles: 10,
            cycle_niter: 1000,
            tlimit: 2.0,
            sensitivity: None,
            estimate_noise: false,
            tolerances: Tolerances::default(),
        }
    }

    /// The naming root for one cycle's products.
    pub(crate) fn image_root(&self, cycle: u32) -> String {
        format!("{}.iter{}", self.target, cycle)
    }
}
