// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
Iterative clean control for radio-interferometric imaging: per-cycle mask and
threshold heuristics, convergence decisions, and the controller that drives a
deconvolution engine through the loop.
 */

pub mod boxworker;
pub mod controller;
pub mod engine;
mod error;
pub mod heuristics;
pub mod image;
pub mod noise;
pub mod params;
pub mod stats;

#[cfg(test)]
mod tests;

// Re-exports.
pub use boxworker::{BoxWorker, CycleDecision, IterationRecord, WorkerMode, WorkerState};
pub use controller::{CleanController, CleanError, CleanOutcome, IterationLogEntry, StopReason};
pub use engine::{
    CleanProducts, CleanRequest, DataSelection, DeconvolveEngine, EngineError, GridSpec,
    ImageStore, Stokes,
};
pub use error::HypercleanError;
pub use heuristics::{IslandPeak, Tolerances};
pub use image::{CleanMask, Image, MaskSummary};
pub use params::{CleanParams, MaskPolicy, TargetKind};
pub use stats::{ImageStatistics, StatsError};
