// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Shared test doubles: an in-memory image store and a scriptable
//! deconvolution engine.

use std::collections::{HashMap, VecDeque};

use ndarray::prelude::*;

use crate::engine::{CleanProducts, CleanRequest, DeconvolveEngine, EngineError, ImageStore};
use crate::image::Image;

#[derive(Default)]
pub(crate) struct MemStore {
    images: HashMap<String, Image>,
}

impl ImageStore for MemStore {
    fn read_image(&self, id: &str) -> Option<Image> {
        self.images.get(id).cloned()
    }

    fn write_image(&mut self, id: &str, image: Image) {
        self.images.insert(id.to_string(), image);
    }

    fn image_exists(&self, id: &str) -> bool {
        self.images.contains_key(id)
    }
}

/// The raster set one scripted engine call writes to the store.
pub(crate) struct ImageSet {
    pub model: Image,
    pub restored: Image,
    pub residual: Image,
    pub psf: Image,
    pub sensitivity: Image,
}

impl ImageSet {
    /// A complete product set over a flat unit-sensitivity grid.
    pub fn new(model: Image, restored: Image, residual: Image, psf: Image) -> ImageSet {
        let shape = residual.dim();
        ImageSet {
            model,
            restored,
            residual,
            psf,
            sensitivity: flat(shape, 1.0),
        }
    }

    pub fn write(self, store: &mut dyn ImageStore, root: &str) -> CleanProducts {
        let products = CleanProducts::for_root(root);
        store.write_image(&products.model, self.model);
        store.write_image(&products.restored, self.restored);
        store.write_image(&products.residual, self.residual);
        store.write_image(&products.psf, self.psf);
        store.write_image(&products.sensitivity, self.sensitivity);
        products
    }
}

pub(crate) enum EngineStep {
    Produce(ImageSet),
    NoValidData,
    Fail,
}

/// A deconvolution engine that replays a fixed script, recording every
/// request it receives.
pub(crate) struct ScriptedEngine {
    script: VecDeque<EngineStep>,
    pub calls: Vec<CleanRequest>,
}

impl ScriptedEngine {
    pub fn new(script: Vec<EngineStep>) -> ScriptedEngine {
        ScriptedEngine {
            script: script.into(),
            calls: vec![],
        }
    }
}

impl DeconvolveEngine for ScriptedEngine {
    fn clean(
        &mut self,
        request: &CleanRequest,
        store: &mut dyn ImageStore,
    ) -> Result<CleanProducts, EngineError> {
        self.calls.push(request.clone());
        match self.script.pop_front().expect("engine script exhausted") {
            EngineStep::Produce(images) => Ok(images.write(store, &request.image_root)),
            EngineStep::NoValidData => Err(EngineError::NoValidData {
                selection: request.selection.to_string(),
            }),
            EngineStep::Fail => Err(EngineError::Failed("scripted failure".to_string())),
        }
    }
}

pub(crate) fn flat(shape: (usize, usize), value: f64) -> Image {
    Array2::from_elem(shape, value)
}

/// A flat background with point sources added on top.
pub(crate) fn with_peaks(
    shape: (usize, usize),
    background: f64,
    peaks: &[(usize, usize, f64)],
) -> Image {
    let mut image = flat(shape, background);
    for &(row, col, amp) in peaks {
        image[(row, col)] = amp;
    }
    image
}

/// A PSF with a unit main lobe at the image centre (peak plus its immediate
/// neighbours at 0.6) and a single sidelobe of the given amplitude 10 pixels
/// along the row axis.
pub(crate) fn psf_with_sidelobe(shape: (usize, usize), sidelobe: f64) -> Image {
    let mut psf = flat(shape, 0.0);
    let centre = (shape.0 / 2, shape.1 / 2);
    psf[centre] = 1.0;
    for (dr, dc) in [(0_i64, 1_i64), (0, -1), (1, 0), (-1, 0)] {
        let row = (centre.0 as i64 + dr) as usize;
        let col = (centre.1 as i64 + dc) as usize;
        psf[(row, col)] = 0.6;
    }
    psf[(centre.0 + 10, centre.1)] = sidelobe;
    psf
}
