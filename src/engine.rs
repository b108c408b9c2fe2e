// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Interfaces to the external collaborators: the deconvolution engine and the
//! image store. Both are injected into the clean controller so that one
//! target's run owns exactly the handles it needs; nothing here is ambient
//! state.

use thiserror::Error;

use crate::image::{CleanMask, Image};

/// The visibility selection for one imaging target. The storage layer behind
/// it is the engine's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSelection {
    pub field: String,
    pub spw: String,
}

impl std::fmt::Display for DataSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "field {} spw {}", self.field, self.spw)
    }
}

/// The spatial grid the engine images onto.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    pub nx: usize,
    pub ny: usize,
    /// Cell size \[arcsec\].
    pub cell: f64,
}

impl GridSpec {
    pub fn shape(&self) -> (usize, usize) {
        (self.ny, self.nx)
    }
}

/// The polarization product to image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum Stokes {
    I,
    Q,
    U,
    /// The orthogonal-hand product assumed source-free; used as the noise
    /// proxy.
    V,
}

/// One request to the deconvolution engine.
#[derive(Debug, Clone)]
pub struct CleanRequest {
    pub selection: DataSelection,
    pub grid: GridSpec,
    pub stokes: Stokes,
    /// No mask means the engine may place flux anywhere.
    pub mask: Option<CleanMask>,
    pub niter: u32,
    /// Residual amplitude at which the engine stops adding flux \[Jy\].
    pub threshold: f64,
    /// The naming root for this cycle's products, e.g. `3c286.spw17.iter2`.
    /// Roots are unique per target and per cycle so that concurrently
    /// running targets never collide in shared storage.
    pub image_root: String,
}

/// The image ids produced by one engine invocation. The rasters themselves
/// live in the [`ImageStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanProducts {
    pub model: String,
    pub restored: String,
    pub residual: String,
    pub psf: String,
    pub sensitivity: String,
}

impl CleanProducts {
    /// The conventional product ids for a naming root.
    pub fn for_root(root: &str) -> CleanProducts {
        CleanProducts {
            model: format!("{root}.model"),
            restored: format!("{root}.image"),
            residual: format!("{root}.residual"),
            psf: format!("{root}.psf"),
            sensitivity: format!("{root}.pb"),
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    /// The selection produced no usable visibilities. No dirty image can be
    /// formed, so callers should skip the target rather than retry.
    #[error("No valid data for {selection}")]
    NoValidData { selection: String },

    #[error("Deconvolution engine failed: {0}")]
    Failed(String),

    /// Treated by callers identically to [`EngineError::Failed`].
    #[error("Deconvolution engine timed out after {seconds} s")]
    Timeout { seconds: u64 },
}

impl EngineError {
    /// Whether the error is the distinguishable "no usable visibilities"
    /// condition rather than a generic failure.
    pub fn is_no_valid_data(&self) -> bool {
        matches!(self, EngineError::NoValidData { .. })
    }
}

/// The deconvolution engine. Given a data selection, a grid, a mask, an
/// iteration budget and a threshold, it produces the model, restored,
/// residual, PSF and sensitivity images for the cycle, writing the rasters
/// into the supplied store under the request's naming root.
///
/// An invocation is long-running and blocking; the control loop treats it as
/// its only suspension point. Given identical mask/threshold/niter and the
/// same accumulated model state, `clean` must be idempotent.
pub trait DeconvolveEngine {
    fn clean(
        &mut self,
        request: &CleanRequest,
        store: &mut dyn ImageStore,
    ) -> Result<CleanProducts, EngineError>;
}

/// Storage for image rasters, keyed by id. Backed by shared filesystem
/// storage in production; per-target per-cycle naming roots are the only
/// collision protection required.
pub trait ImageStore {
    fn read_image(&self, id: &str) -> Option<Image>;
    fn write_image(&mut self, id: &str, image: Image);
    fn image_exists(&self, id: &str) -> bool;
}
