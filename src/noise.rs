// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Empirical noise estimation from the orthogonal polarization product.
//!
//! The astrophysical source is assumed unpolarized in the orthogonal-hand
//! product, so a zero-iteration image of it contains pure noise and its
//! residual RMS is an empirical sensitivity estimate for the target.

use log::{debug, warn};

use crate::engine::{CleanRequest, DeconvolveEngine, ImageStore, Stokes};
use crate::params::CleanParams;
use crate::stats;

/// Image the orthogonal polarization product with zero clean iterations and
/// measure the non-cleaned residual RMS.
///
/// Failure here is degraded service, not an error: the caller proceeds with
/// the dirty-image RMS instead, at lower confidence. Exactly one warning is
/// logged when no estimate can be formed.
pub fn estimate_noise(
    engine: &mut dyn DeconvolveEngine,
    store: &mut dyn ImageStore,
    params: &CleanParams,
) -> Option<f64> {
    let request = CleanRequest {
        selection: params.selection.clone(),
        grid: params.grid,
        stokes: Stokes::V,
        mask: None,
        niter: 0,
        threshold: 0.0,
        image_root: format!("{}.noise", params.target),
    };

    let products = match engine.clean(&request, store) {
        Ok(products) => products,
        Err(e) => {
            warn!(
                "{}: no noise estimate from the orthogonal polarization product ({e}); \
                 falling back to the dirty-image RMS",
                params.target
            );
            return None;
        }
    };

    match stats::analyse(store, &products, None) {
        Ok(stats) => {
            debug!(
                "{}: empirical noise estimate {:.3e} Jy",
                params.target, stats.non_cleaned_rms
            );
            Some(stats.non_cleaned_rms)
        }
        Err(e) => {
            warn!(
                "{}: no noise estimate from the orthogonal polarization product ({e}); \
                 falling back to the dirty-image RMS",
                params.target
            );
            None
        }
    }
}
