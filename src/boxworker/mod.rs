// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The box worker: the stateful controller that accumulates per-cycle
//! statistics and island history for one target and decides, cycle after
//! cycle, what mask, threshold and iteration budget the next deconvolution
//! call gets, and whether there should be one at all.


use log::debug;

use crate::engine::{CleanProducts, ImageStore};
use crate::heuristics::{self, IslandPeak, Tolerances};
use crate::image::{CleanMask, Image};
use crate::stats::{self, ImageStatistics, StatsError};

/// Everything known about one completed cycle. Appended to the worker's
/// history once per cycle and never mutated afterwards, except that the
/// cycle's islands are filled in when the following `prepare` call detects
/// them from this cycle's residual.
#[derive(Debug, Clone)]
pub struct IterationRecord {
    /// 0 is the dirty pass.
    pub cycle: u32,
    /// The mask the engine was given for this cycle; the dirty pass has
    /// none.
    pub mask: Option<CleanMask>,
    pub threshold: f64,
    pub niter_budget: u32,
    pub stats: ImageStatistics,
    /// Islands detected in this cycle's residual.
    pub islands: Vec<IslandPeak>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum WorkerState {
    Init,
    Accumulating,
    Converged,
    /// The hard cycle cap stopped the loop before convergence.
    Capped,
    Failed,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkerState::Converged | WorkerState::Capped | WorkerState::Failed
        )
    }
}

/// Which control policy the worker runs.
#[derive(Debug, Clone)]
pub enum WorkerMode {
    /// One clean pass with a fixed mask and threshold; no threshold decay.
    /// `None` means the engine is unrestricted.
    Simple(Option<CleanMask>),
    /// The full threshold-decay/convergence loop with automatic,
    /// sidelobe-driven masks.
    Iterative,
    /// Point-like targets: a one-shot iteration budget from the PSF
    /// sidelobe ratio, at most one refinement cycle.
    Calibrator,
}

/// The worker's verdict for the next cycle.
#[derive(Debug, Clone)]
pub struct CycleDecision {
    /// False means the loop is over; the other fields are then the last
    /// accepted values and must not drive another engine call.
    pub proceed: bool,
    pub cycle: u32,
    pub threshold: f64,
    pub niter: u32,
    pub mask: Option<CleanMask>,
}

pub struct BoxWorker {
    mode: WorkerMode,
    max_cycles: u32,
    cycle_niter: u32,
    tolerances: Tolerances,

    state: WorkerState,
    /// Computed from the PSF on the first `iteration_result` call, cached
    /// for the rest of the run.
    sidelobe_ratio: Option<f64>,
    psf: Option<Image>,
    /// The mask handed over for the cycle currently being cleaned.
    current_mask: Option<CleanMask>,
    history: Vec<IterationRecord>,
    /// Threshold seed from the controller (sensitivity-derived); used by the
    /// simple policy and as a fallback when statistics are degenerate.
    initial_threshold: f64,
}

impl BoxWorker {
    pub fn new(
        mode: WorkerMode,
        max_cycles: u32,
        cycle_niter: u32,
        tolerances: Tolerances,
    ) -> BoxWorker {
        BoxWorker {
            mode,
            max_cycles,
            cycle_niter,
            tolerances,
            state: WorkerState::Init,
            sidelobe_ratio: None,
            psf: None,
            current_mask: None,
            history: vec![],
            initial_threshold: 0.0,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Read-only view of the per-cycle history, ordered by cycle index.
    pub fn history(&self) -> &[IterationRecord] {
        &self.history
    }

    pub fn sidelobe_ratio(&self) -> Option<f64> {
        self.sidelobe_ratio
    }

    /// Consume the worker and hand the per-cycle history to the caller.
    pub fn into_history(self) -> Vec<IterationRecord> {
        self.history
    }

    /// Seed the threshold from the controller's sensitivity estimate.
    pub fn set_initial_threshold(&mut self, threshold: f64) {
        self.initial_threshold = threshold;
    }

    /// Hand over the mask the next cycle will be cleaned with. Called by the
    /// controller after it has derived a mask from the previous cycle's
    /// islands (or from a fixed policy).
    pub fn new_cleanmask(&mut self, mask: Option<CleanMask>) {
        self.current_mask = mask;
    }

    /// Ingest one cycle's products: compute the statistics and append the
    /// cycle's record. The PSF sidelobe ratio is computed and cached on the
    /// first call.
    pub fn iteration_result(
        &mut self,
        cycle: u32,
        store: &dyn ImageStore,
        products: &CleanProducts,
        threshold: f64,
        niter: u32,
    ) -> Result<ImageStatistics, StatsError> {
        if self.sidelobe_ratio.is_none() {
            let psf = store
                .read_image(&products.psf)
                .ok_or_else(|| StatsError::ImageMissing {
                    id: products.psf.clone(),
                })?;
            let ratio = heuristics::sidelobe_ratio(&psf);
            debug!("PSF sidelobe ratio: {ratio:.4}");
            self.sidelobe_ratio = Some(ratio);
            self.psf = Some(psf);
        }

        let statistics = stats::analyse(store, products, self.current_mask.as_ref())?;
        self.history.push(IterationRecord {
            cycle,
            mask: self.current_mask.clone(),
            threshold,
            niter_budget: niter,
            stats: statistics,
            islands: vec![],
        });
        self.state = WorkerState::Accumulating;
        Ok(statistics)
    }

    /// The engine failed this cycle; the loop is over and the last good
    /// cycle's results stand.
    pub fn fail(&mut self) {
        self.state = WorkerState::Failed;
    }

    /// The per-cycle decision step: detect islands in the latest residual,
    /// derive the next threshold/mask/budget, and decide whether to go
    /// around again.
    pub fn prepare(&mut self, residual: &Image) -> CycleDecision {
        let completed_cycles = self.history.len().saturating_sub(1) as u32;
        if self.state.is_terminal() || self.history.is_empty() {
            return self.stop_decision(completed_cycles);
        }

        match self.mode.clone() {
            WorkerMode::Simple(mask) => self.prepare_simple(residual, mask),
            WorkerMode::Iterative => self.prepare_iterative(residual),
            WorkerMode::Calibrator => self.prepare_calibrator(residual),
        }
    }

    fn prepare_simple(&mut self, residual: &Image, mask: Option<CleanMask>) -> CycleDecision {
        let latest = self.history.last().expect("history is non-empty");
        let threshold = if self.initial_threshold > 0.0 {
            self.initial_threshold
        } else {
            self.tolerances.noise_sigma * latest.stats.non_cleaned_rms
        };

        // Complete the latest record's islands for diagnostics.
        let islands = heuristics::vet_islands(
            heuristics::detect_islands(residual, threshold),
            latest.stats.non_cleaned_rms,
            residual.dim(),
            &self.tolerances,
        );
        let residual_max = latest.stats.residual_max;
        self.complete_latest_islands(islands);

        // A fixed policy cleans exactly once, straight down to its
        // threshold.
        let proceed = self.history.len() == 1 && residual_max > threshold;
        if !proceed {
            self.state = WorkerState::Converged;
        }
        CycleDecision {
            proceed,
            cycle: self.history.len() as u32,
            threshold,
            niter: heuristics::niter_correction(self.cycle_niter, residual_max, threshold),
            mask,
        }
    }

    fn prepare_iterative(&mut self, residual: &Image) -> CycleDecision {
        let latest = self.history.last().expect("history is non-empty");
        let non_cleaned_rms = latest.stats.non_cleaned_rms;
        let residual_max = latest.stats.residual_max;
        let old_threshold = if self.history.len() >= 2 {
            Some(latest.threshold)
        } else {
            None
        };

        let (new_threshold, islands) = heuristics::threshold_and_mask(
            residual,
            old_threshold,
            self.sidelobe_ratio.unwrap_or(0.0),
            non_cleaned_rms,
            &self.tolerances,
        );
        // The sensitivity-derived seed floors the first cycle only; after
        // that the decay owns the threshold.
        let new_threshold = if old_threshold.is_none() {
            new_threshold.max(self.initial_threshold)
        } else {
            new_threshold
        };
        let mask = {
            let grown = heuristics::grow_mask(residual.dim(), &islands);
            if grown.is_empty() {
                CleanMask::central_quarter(residual.dim())
            } else {
                grown
            }
        };
        self.complete_latest_islands(islands);

        let completed_cycles = self.history.len() as u32 - 1;
        let flux_history: Vec<f64> = self.history.iter().map(|r| r.stats.model_flux_sum).collect();
        let cleaned_rms_history: Vec<f64> =
            self.history.iter().map(|r| r.stats.cleaned_rms).collect();
        let island_history: Vec<Vec<IslandPeak>> =
            self.history.iter().map(|r| r.islands.clone()).collect();

        let proceed = heuristics::clean_more(
            completed_cycles,
            self.max_cycles,
            old_threshold.unwrap_or(0.0),
            new_threshold,
            non_cleaned_rms,
            &island_history,
            &flux_history,
            &cleaned_rms_history,
            &self.tolerances,
        );
        if !proceed {
            self.state = if completed_cycles >= self.max_cycles {
                WorkerState::Capped
            } else {
                WorkerState::Converged
            };
        }
        CycleDecision {
            proceed,
            cycle: self.history.len() as u32,
            threshold: new_threshold,
            niter: heuristics::niter_correction(self.cycle_niter, residual_max, new_threshold),
            mask: Some(mask),
        }
    }

    fn prepare_calibrator(&mut self, residual: &Image) -> CycleDecision {
        let latest = self.history.last().expect("history is non-empty");
        let non_cleaned_rms = latest.stats.non_cleaned_rms;
        let residual_max = latest.stats.residual_max;

        let (threshold, islands) = heuristics::threshold_and_mask(
            residual,
            None,
            self.sidelobe_ratio.unwrap_or(0.0),
            non_cleaned_rms,
            &self.tolerances,
        );
        let candidate = heuristics::grow_mask(residual.dim(), &islands);
        self.complete_latest_islands(islands);

        let psf = self.psf.as_ref().expect("PSF cached by iteration_result");
        let (niter, mask) =
            heuristics::niter_and_mask(psf, residual, &candidate, self.cycle_niter);

        // At most one refinement cycle; calibrators are point-like.
        let proceed = self.history.len() == 1 && niter > 0 && residual_max > threshold;
        if !proceed {
            self.state = WorkerState::Converged;
        }
        CycleDecision {
            proceed,
            cycle: self.history.len() as u32,
            threshold,
            niter,
            mask: Some(mask),
        }
    }

    fn stop_decision(&self, completed_cycles: u32) -> CycleDecision {
        let latest = self.history.last();
        CycleDecision {
            proceed: false,
            cycle: completed_cycles,
            threshold: latest.map(|r| r.threshold).unwrap_or(0.0),
            niter: 0,
            mask: latest.and_then(|r| r.mask.clone()),
        }
    }

    fn complete_latest_islands(&mut self, islands: Vec<IslandPeak>) {
        if let Some(latest) = self.history.last_mut() {
            latest.islands = islands;
        }
    }
}
