// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The top-level clean controller for one imaging target: dirty pass,
//! optional noise estimate, box-worker selection, and the cycle loop.
//!
//! Controllers for distinct targets share nothing and may run concurrently;
//! each owns its worker, its history and its cached sidelobe ratio, and its
//! image products are namespaced by target and cycle.


use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::boxworker::{BoxWorker, IterationRecord, WorkerMode, WorkerState};
use crate::engine::{
    CleanProducts, CleanRequest, DeconvolveEngine, EngineError, ImageStore, Stokes,
};
use crate::image::{CleanMask, MaskSummary};
use crate::noise;
use crate::params::{CleanParams, MaskPolicy, TargetKind};
use crate::stats::{ImageStatistics, StatsError};

/// Why the cycle loop ended. The cap and cancellation are normal terminal
/// states, not errors; operators need to tell "good enough" from "gave up".
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display, Serialize, Deserialize)]
pub enum StopReason {
    Converged,
    CycleCapReached,
    Failed,
    Cancelled,
}

/// Errors that prevent a target from producing any image at all. Failures
/// after a successful dirty pass are not errors; they terminate the loop
/// with the best images so far (see [`StopReason::Failed`]).
#[derive(Error, Debug)]
pub enum CleanError {
    /// The selection has no usable visibilities; skip this target.
    #[error("Target {target}: {source}")]
    NoValidData {
        target: String,
        #[source]
        source: EngineError,
    },

    #[error("Target {target}: dirty pass failed: {source}")]
    DirtyPass {
        target: String,
        #[source]
        source: EngineError,
    },

    #[error(transparent)]
    Stats(#[from] StatsError),
}

/// One row of the structured iteration log, the externally consumable
/// artifact of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationLogEntry {
    pub cycle: u32,
    pub threshold: f64,
    pub niter_budget: u32,
    pub mask: Option<MaskSummary>,
    pub num_islands: usize,
    pub stats: ImageStatistics,
}

impl From<&IterationRecord> for IterationLogEntry {
    fn from(record: &IterationRecord) -> IterationLogEntry {
        IterationLogEntry {
            cycle: record.cycle,
            threshold: record.threshold,
            niter_budget: record.niter_budget,
            mask: record.mask.as_ref().map(|m| m.summary()),
            num_islands: record.islands.len(),
            stats: record.stats,
        }
    }
}

/// The result of one target's run: the last good cycle's image products and
/// the full per-cycle history.
#[derive(Debug)]
pub struct CleanOutcome {
    pub products: CleanProducts,
    pub stop_reason: StopReason,
    pub worker_state: WorkerState,
    pub sidelobe_ratio: f64,
    /// The empirical noise estimate, if one was formed.
    pub noise_estimate: Option<f64>,
    pub history: Vec<IterationRecord>,
}

impl CleanOutcome {
    pub fn iteration_log(&self) -> Vec<IterationLogEntry> {
        self.history.iter().map(IterationLogEntry::from).collect()
    }

    pub fn iteration_log_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.iteration_log())
    }
}

pub struct CleanController<'a, E, S> {
    engine: &'a mut E,
    store: &'a mut S,
    params: CleanParams,
    cancel: Option<Arc<AtomicBool>>,
}

impl<'a, E: DeconvolveEngine, S: ImageStore> CleanController<'a, E, S> {
    pub fn new(engine: &'a mut E, store: &'a mut S, params: CleanParams) -> Self {
        CleanController {
            engine,
            store,
            params,
            cancel: None,
        }
    }

    /// Cancellation is honored only at cycle boundaries, before the next
    /// engine invocation; a cancelled run still returns the best images
    /// obtained so far.
    pub fn set_cancel_flag(&mut self, cancel: Arc<AtomicBool>) {
        self.cancel = Some(cancel);
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Run the whole control loop for this target.
    pub fn run(mut self) -> Result<CleanOutcome, CleanError> {
        let params = self.params.clone();
        info!(
            "Cleaning {} ({}, {} policy, {})",
            params.target, params.selection, params.mask_policy, params.target_kind
        );

        // The dirty pass: zero iterations, no mask. The only stage whose
        // failure leaves us with nothing to return.
        info!("Computing the dirty image");
        let dirty_products = self
            .clean_cycle(0, None, 0, 0.0)
            .map_err(|source| match source {
                EngineError::NoValidData { .. } => CleanError::NoValidData {
                    target: params.target.clone(),
                    source,
                },
                source => CleanError::DirtyPass {
                    target: params.target.clone(),
                    source,
                },
            })?;

        let mut worker = match self.select_worker(&params) {
            Ok(worker) => worker,
            Err(e) => {
                // A broken mask policy (e.g. missing manual mask image)
                // still leaves the dirty image worth returning.
                warn!("{}: {e}; not cleaning", params.target);
                let mut worker =
                    BoxWorker::new(WorkerMode::Iterative, params.max_cycles, params.cycle_niter, params.tolerances);
                let _ = worker.iteration_result(0, &*self.store, &dirty_products, 0.0, 0);
                worker.fail();
                return Ok(self.outcome(dirty_products, StopReason::Failed, worker, None));
            }
        };

        let dirty_stats = worker.iteration_result(0, &*self.store, &dirty_products, 0.0, 0)?;
        info!("Dirty image stats");
        info!("    Residual rms: {:.4e}", dirty_stats.non_cleaned_rms);
        info!("    Residual max: {:.4e}", dirty_stats.residual_max);
        info!("    Residual min: {:.4e}", dirty_stats.residual_min);

        // Advisory only: a failed estimate falls back to the dirty-image
        // RMS and never blocks the loop.
        let noise_estimate = if params.estimate_noise {
            noise::estimate_noise(&mut *self.engine, &mut *self.store, &params)
        } else {
            None
        };
        let noise_rms = noise_estimate.unwrap_or(dirty_stats.non_cleaned_rms);

        // Seed the threshold from the best sensitivity figure available,
        // raised when the dirty dynamic range says the sidelobes will
        // dominate the noise.
        let sensitivity = params.sensitivity.unwrap_or(noise_rms);
        let seed_threshold = if sensitivity > 0.0 {
            let dynamic_range = dirty_stats.residual_max / sensitivity;
            let dr_factor = (dynamic_range / 150.0).clamp(1.0, 10.0);
            params.tlimit * sensitivity * dr_factor
        } else {
            0.0
        };
        debug!(
            "{}: threshold seed {seed_threshold:.4e} Jy (sensitivity {sensitivity:.4e})",
            params.target
        );
        worker.set_initial_threshold(seed_threshold);

        let mut best_products = dirty_products;
        let stop_reason = loop {
            if self.cancelled() {
                info!("{}: cancelled at cycle boundary", params.target);
                break StopReason::Cancelled;
            }

            let residual = match self.store.read_image(&best_products.residual) {
                Some(residual) => residual,
                None => {
                    warn!(
                        "{}: residual {} went missing; stopping",
                        params.target, best_products.residual
                    );
                    worker.fail();
                    break StopReason::Failed;
                }
            };

            let decision = worker.prepare(&residual);
            if !decision.proceed {
                break match worker.state() {
                    WorkerState::Capped => {
                        info!(
                            "{}: cycle cap ({}) reached before convergence",
                            params.target, params.max_cycles
                        );
                        StopReason::CycleCapReached
                    }
                    _ => {
                        info!("{}: converged after {} cycles", params.target, decision.cycle);
                        StopReason::Converged
                    }
                };
            }

            info!("Iteration {}: clean control parameters", decision.cycle);
            info!(
                "    Mask: {}",
                decision
                    .mask
                    .as_ref()
                    .map(|m| format!("{} px", m.num_masked()))
                    .unwrap_or_else(|| "unrestricted".to_string())
            );
            info!("    Threshold: {:.4e} Jy", decision.threshold);
            info!("    Niter: {}", decision.niter);

            worker.new_cleanmask(decision.mask.clone());
            let products = match self.clean_cycle(
                decision.cycle,
                decision.mask,
                decision.niter,
                decision.threshold,
            ) {
                Ok(products) => products,
                Err(e) => {
                    warn!(
                        "{}: engine failed on cycle {} ({e}); returning cycle {} results",
                        params.target,
                        decision.cycle,
                        decision.cycle - 1
                    );
                    worker.fail();
                    break StopReason::Failed;
                }
            };

            match worker.iteration_result(
                decision.cycle,
                &*self.store,
                &products,
                decision.threshold,
                decision.niter,
            ) {
                Ok(stats) => {
                    info!("Clean image iter {} stats", decision.cycle);
                    info!("    Residual non-cleanmask area rms: {:.4e}", stats.non_cleaned_rms);
                    info!("    Residual cleanmask area rms: {:.4e}", stats.cleaned_rms);
                    info!("    Residual max: {:.4e}", stats.residual_max);
                    info!("    Model flux sum: {:.4e}", stats.model_flux_sum);
                    best_products = products;
                }
                Err(e) => {
                    warn!(
                        "{}: cycle {} produced unreadable images ({e}); returning cycle {} results",
                        params.target,
                        decision.cycle,
                        decision.cycle - 1
                    );
                    worker.fail();
                    break StopReason::Failed;
                }
            }
        };

        Ok(self.outcome(best_products, stop_reason, worker, noise_estimate))
    }

    fn outcome(
        &self,
        products: CleanProducts,
        stop_reason: StopReason,
        worker: BoxWorker,
        noise_estimate: Option<f64>,
    ) -> CleanOutcome {
        CleanOutcome {
            products,
            stop_reason,
            worker_state: worker.state(),
            sidelobe_ratio: worker.sidelobe_ratio().unwrap_or(0.0),
            noise_estimate,
            history: worker.into_history(),
        }
    }

    fn clean_cycle(
        &mut self,
        cycle: u32,
        mask: Option<CleanMask>,
        niter: u32,
        threshold: f64,
    ) -> Result<CleanProducts, EngineError> {
        let request = CleanRequest {
            selection: self.params.selection.clone(),
            grid: self.params.grid,
            stokes: Stokes::I,
            mask,
            niter,
            threshold,
            image_root: self.params.image_root(cycle),
        };
        self.engine.clean(&request, &mut *self.store)
    }

    /// Pick the box worker variant from the target classification and the
    /// masking policy.
    fn select_worker(&self, params: &CleanParams) -> Result<BoxWorker, StatsError> {
        let mode = match (params.target_kind, &params.mask_policy) {
            (TargetKind::Calibrator, _) => WorkerMode::Calibrator,
            (TargetKind::Science, MaskPolicy::SidelobeAuto) => WorkerMode::Iterative,
            (TargetKind::Science, policy) => WorkerMode::Simple(derive_mask(
                policy,
                &*self.store,
                (params.grid.ny, params.grid.nx),
            )?),
        };
        Ok(BoxWorker::new(
            mode,
            params.max_cycles,
            params.cycle_niter,
            params.tolerances,
        ))
    }
}

/// Resolve a fixed masking policy into a concrete mask. `SidelobeAuto` never
/// reaches here; its masks are derived per cycle by the iterative worker.
fn derive_mask(
    policy: &MaskPolicy,
    store: &dyn ImageStore,
    shape: (usize, usize),
) -> Result<Option<CleanMask>, StatsError> {
    match policy {
        MaskPolicy::None => Ok(None),
        MaskPolicy::CentralQuarter => Ok(Some(CleanMask::central_quarter(shape))),
        MaskPolicy::Manual(id) => {
            let image = store.read_image(id).ok_or_else(|| StatsError::ImageMissing {
                id: id.clone(),
            })?;
            // A mask on the wrong grid would blow up the statistics zips.
            if image.dim() != shape {
                return Err(StatsError::ShapeMismatch {
                    id: id.clone(),
                    expected: shape,
                    actual: image.dim(),
                });
            }
            Ok(Some(CleanMask::from_pixels(image.mapv(|p| p > 0.5))))
        }
        MaskPolicy::SidelobeAuto => Ok(None),
    }
}
