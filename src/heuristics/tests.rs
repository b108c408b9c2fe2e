// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Mask/threshold heuristics tests.

use approx::assert_abs_diff_eq;

use super::*;
use crate::tests::{flat, psf_with_sidelobe, with_peaks};

const SHAPE: (usize, usize) = (64, 64);

fn island_at(position: (usize, usize), peak_value: f64) -> IslandPeak {
    IslandPeak {
        position,
        peak_value,
        region_id: 0,
        extent: 1,
    }
}

#[test]
fn sidelobe_ratio_finds_strongest_sidelobe() {
    let psf = psf_with_sidelobe(SHAPE, 0.15);
    assert_abs_diff_eq!(sidelobe_ratio(&psf), 0.15, epsilon = 1e-12);

    // Negative sidelobes count by magnitude.
    let psf = psf_with_sidelobe(SHAPE, -0.2);
    assert_abs_diff_eq!(sidelobe_ratio(&psf), 0.2, epsilon = 1e-12);
}

#[test]
fn sidelobe_ratio_degenerate_psf_is_zero() {
    assert_eq!(sidelobe_ratio(&flat(SHAPE, 0.0)), 0.0);
    assert_eq!(sidelobe_ratio(&flat((0, 0), 0.0)), 0.0);
}

#[test]
fn detect_islands_finds_separated_peaks() {
    let residual = with_peaks(SHAPE, 0.0, &[(10, 10, 1.0), (40, 40, 0.5)]);
    let islands = detect_islands(&residual, 0.2);
    assert_eq!(islands.len(), 2);
    assert_eq!(islands[0].position, (10, 10));
    assert_abs_diff_eq!(islands[0].peak_value, 1.0);
    assert_eq!(islands[1].position, (40, 40));
    assert_abs_diff_eq!(islands[1].peak_value, 0.5);

    // Region ids follow discovery order.
    assert_eq!(islands[0].region_id, 0);
    assert_eq!(islands[1].region_id, 1);
}

#[test]
fn detect_islands_is_deterministic() {
    let residual = with_peaks(SHAPE, 0.01, &[(10, 10, 1.0), (40, 40, 0.5), (20, 50, 0.3)]);
    let first = detect_islands(&residual, 0.1);
    let second = detect_islands(&residual, 0.1);
    assert_eq!(first, second);
}

#[test]
fn detect_islands_merges_connected_pixels() {
    // An extended blob is one island with the peak at its brightest pixel.
    let mut residual = flat(SHAPE, 0.0);
    residual.slice_mut(ndarray::s![20..25, 20..25]).fill(0.5);
    residual[(22, 22)] = 0.9;
    let islands = detect_islands(&residual, 0.2);
    assert_eq!(islands.len(), 1);
    assert_eq!(islands[0].position, (22, 22));
    assert_abs_diff_eq!(islands[0].peak_value, 0.9);
    assert_eq!(islands[0].extent, 2);
}

#[test]
fn detect_islands_nothing_above_threshold() {
    let residual = with_peaks(SHAPE, 0.0, &[(10, 10, 0.1)]);
    assert!(detect_islands(&residual, 0.5).is_empty());
    assert!(detect_islands(&residual, f64::NAN).is_empty());
}

#[test]
fn vet_islands_drops_faint_but_keeps_brightest() {
    let islands = vec![island_at((10, 10), 1.0), island_at((40, 40), 0.05)];
    // Floor is 7 * 0.02 = 0.14: the second island is faint, the first is
    // fainter than nothing and always kept.
    let vetted = vet_islands(islands, 0.02, SHAPE, &Tolerances::default());
    assert_eq!(vetted.len(), 1);
    assert_eq!(vetted[0].position, (10, 10));
}

#[test]
fn vet_islands_drops_oversized_regions() {
    let mut big = island_at((32, 32), 5.0);
    big.extent = 30;
    let vetted = vet_islands(vec![big], 0.0, SHAPE, &Tolerances::default());
    assert!(vetted.is_empty());
}

#[test]
fn oversize_veto_tracks_the_grown_box_width() {
    // On a 64 px image the limit is 48 px: a box of 4 * 11 + 1 = 45 px
    // fits, 4 * 12 + 1 = 49 px does not.
    let mut fits = island_at((32, 32), 5.0);
    fits.extent = 11;
    let mut too_big = island_at((20, 20), 5.0);
    too_big.extent = 12;
    let vetted = vet_islands(vec![fits, too_big], 0.0, SHAPE, &Tolerances::default());
    assert_eq!(vetted.len(), 1);
    assert_eq!(vetted[0].extent, 11);
}

#[test]
fn grow_mask_boxes_islands() {
    let mut island = island_at((30, 30), 1.0);
    island.extent = 2;
    let mask = grow_mask(SHAPE, &[island]);
    // Box is position +/- 2 extents.
    assert!(mask.contains(26, 26));
    assert!(mask.contains(34, 34));
    assert!(!mask.contains(25, 30));
    assert_eq!(mask.num_masked(), 81);

    assert!(grow_mask(SHAPE, &[]).is_empty());
}

#[test]
fn grow_mask_clips_at_image_edge() {
    let mut island = island_at((1, 1), 1.0);
    island.extent = 3;
    let mask = grow_mask(SHAPE, &[island]);
    assert!(mask.contains(0, 0));
    assert!(mask.contains(7, 7));
    assert!(!mask.contains(8, 8));
}

#[test]
fn first_cycle_threshold_respects_sidelobe_floor() {
    // Dirty-pass scenario: non-cleaned RMS 0.01, sidelobe ratio 0.15,
    // residual peak 1.0. The noise floor would be 0.02, but the sidelobe
    // floor wins: the threshold must be at least 0.15 * peak.
    let residual = with_peaks(SHAPE, 0.0, &[(32, 32, 1.0)]);
    let (threshold, islands) =
        threshold_and_mask(&residual, None, 0.15, 0.01, &Tolerances::default());
    assert_abs_diff_eq!(threshold, 0.15, epsilon = 1e-12);
    assert_eq!(islands.len(), 1);
    assert_eq!(islands[0].position, (32, 32));
}

#[test]
fn threshold_decays_when_noise_floor_stalls() {
    // The noise floor equals the previous threshold, so the decay kicks in.
    let residual = flat(SHAPE, 0.0);
    let (threshold, _) =
        threshold_and_mask(&residual, Some(0.1), 0.0, 0.05, &Tolerances::default());
    assert_abs_diff_eq!(threshold, 0.08, epsilon = 1e-12);
}

#[test]
fn threshold_never_increases_across_cycles() {
    let tolerances = Tolerances::default();
    let residual = with_peaks(SHAPE, 0.0, &[(32, 32, 1.0)]);
    let mut old = None;
    let mut rms = 0.2;
    for _ in 0..10 {
        let (new, _) = threshold_and_mask(&residual, old, 0.1, rms, &tolerances);
        if let Some(old) = old {
            assert!(new <= old, "threshold rose: {new} > {old}");
        }
        old = Some(new);
        // Noise estimate wobbles upward; the accepted threshold still must
        // not rise.
        rms *= 1.1;
    }
}

#[test]
fn clean_more_is_pure() {
    let tolerances = Tolerances::default();
    let island_history = vec![vec![island_at((10, 10), 1.0)], vec![island_at((10, 10), 0.6)]];
    let args = (
        2_u32,
        10_u32,
        0.2,
        0.1,
        0.05,
        &island_history,
        &[0.0, 1.0, 1.5][..],
        &[0.5, 0.3][..],
        &tolerances,
    );
    let first = clean_more(
        args.0, args.1, args.2, args.3, args.4, args.5, args.6, args.7, args.8,
    );
    let second = clean_more(
        args.0, args.1, args.2, args.3, args.4, args.5, args.6, args.7, args.8,
    );
    assert_eq!(first, second);
}

#[test]
fn clean_more_honours_cycle_cap() {
    let tolerances = Tolerances::default();
    // Everything else says continue, but the cap has been reached.
    assert!(!clean_more(
        10,
        10,
        0.2,
        0.1,
        0.05,
        &[vec![island_at((10, 10), 1.0)]],
        &[0.0, 1.0],
        &[0.5, 0.3],
        &tolerances,
    ));
}

#[test]
fn clean_more_stops_at_the_absolute_rms_tolerance() {
    // Everything says continue, but the residual RMS is already below the
    // configured noise tolerance.
    let tolerances = Tolerances {
        rms_stop: 0.1,
        ..Tolerances::default()
    };
    let island_history = vec![vec![island_at((10, 10), 1.0)], vec![island_at((40, 40), 0.6)]];
    assert!(!clean_more(
        2,
        10,
        0.2,
        0.1,
        0.05,
        &island_history,
        &[1.0, 2.0],
        &[0.5, 0.3],
        &tolerances,
    ));

    // Above the tolerance the same run keeps going.
    let tolerances = Tolerances {
        rms_stop: 0.01,
        ..tolerances
    };
    assert!(clean_more(
        2,
        10,
        0.2,
        0.1,
        0.05,
        &island_history,
        &[1.0, 2.0],
        &[0.5, 0.3],
        &tolerances,
    ));
}

#[test]
fn clean_more_stops_when_threshold_stalls() {
    let tolerances = Tolerances::default();
    // Fast-converge scenario: tiny residual RMS, flux unchanged, threshold
    // unchanged. Must stop on cycle 1.
    assert!(!clean_more(
        1,
        10,
        0.1,
        0.1,
        1e-6,
        &[vec![island_at((10, 10), 1.0)]],
        &[1.0, 1.0],
        &[0.5, 0.5],
        &tolerances,
    ));
}

#[test]
fn clean_more_stops_when_flux_stalls() {
    let tolerances = Tolerances::default();
    assert!(!clean_more(
        2,
        10,
        0.2,
        0.1,
        0.05,
        &[vec![island_at((10, 10), 1.0)], vec![island_at((40, 40), 0.6)]],
        // 2% growth is inside the 3% tolerance.
        &[1.0, 1.02],
        &[0.5, 0.3],
        &tolerances,
    ));
}

#[test]
fn clean_more_stops_when_cleaning_runs_amok() {
    let tolerances = Tolerances::default();
    // In-mask RMS rising cycle-over-cycle.
    assert!(!clean_more(
        2,
        10,
        0.2,
        0.1,
        0.05,
        &[vec![island_at((10, 10), 1.0)], vec![island_at((40, 40), 0.6)]],
        &[1.0, 2.0],
        &[0.3, 0.5],
        &tolerances,
    ));
}

#[test]
fn clean_more_stops_when_islands_stabilise() {
    let tolerances = Tolerances::default();
    let island_history = vec![
        vec![island_at((10, 10), 1.0), island_at((40, 40), 0.5)],
        // Same count, positions within 2 px.
        vec![island_at((11, 10), 0.8), island_at((40, 41), 0.4)],
    ];
    assert!(!clean_more(
        2,
        10,
        0.2,
        0.1,
        0.05,
        &island_history,
        &[1.0, 2.0],
        &[0.5, 0.3],
        &tolerances,
    ));
}

#[test]
fn clean_more_stops_when_no_islands_remain() {
    let tolerances = Tolerances::default();
    assert!(!clean_more(
        2,
        10,
        0.2,
        0.1,
        0.05,
        &[vec![island_at((10, 10), 1.0)], vec![]],
        &[1.0, 2.0],
        &[0.5, 0.3],
        &tolerances,
    ));
}

#[test]
fn clean_more_continues_while_everything_improves() {
    let tolerances = Tolerances::default();
    assert!(clean_more(
        2,
        10,
        0.2,
        0.1,
        0.05,
        &[vec![island_at((10, 10), 1.0)], vec![island_at((40, 40), 0.6)]],
        &[1.0, 2.0],
        &[0.5, 0.3],
        &tolerances,
    ));
}

#[test]
fn clean_more_degenerate_inputs_stop_cleanly() {
    let tolerances = Tolerances::default();
    // Zero thresholds, zero flux, no islands, zero RMS: stop, don't panic.
    assert!(!clean_more(1, 10, 0.0, 0.0, 0.0, &[vec![]], &[0.0, 0.0], &[0.0, 0.0], &tolerances));
}

#[test]
fn islands_stable_compares_count_and_position() {
    let a = vec![island_at((10, 10), 1.0)];
    let b = vec![island_at((11, 11), 0.9)];
    let c = vec![island_at((20, 20), 0.9)];
    assert!(islands_stable(&a, &b, 2.0));
    assert!(!islands_stable(&a, &c, 2.0));
    assert!(!islands_stable(&a, &[], 2.0));
}

#[test]
fn niter_and_mask_scales_with_sidelobe_depth() {
    let psf = psf_with_sidelobe(SHAPE, 0.15);
    let residual = with_peaks(SHAPE, 0.0, &[(32, 32, 1.0)]);
    let candidate = CleanMask::central_quarter(SHAPE);
    // ceil(ln(1/0.15) / ln 2) = 3 sidelobe-ratio steps.
    let (niter, mask) = niter_and_mask(&psf, &residual, &candidate, 1000);
    assert_eq!(niter, 3000);
    assert_eq!(mask, candidate);
}

#[test]
fn niter_and_mask_degenerate_cases() {
    let psf = psf_with_sidelobe(SHAPE, 0.15);
    let candidate = CleanMask::empty(SHAPE);

    // Nothing to clean.
    let (niter, mask) = niter_and_mask(&psf, &flat(SHAPE, 0.0), &candidate, 1000);
    assert_eq!(niter, 0);
    // An empty candidate falls back to the central quarter.
    assert_eq!(mask, CleanMask::central_quarter(SHAPE));

    // A featureless PSF gets a single cycle's budget.
    let residual = with_peaks(SHAPE, 0.0, &[(32, 32, 1.0)]);
    let (niter, _) = niter_and_mask(&flat(SHAPE, 0.0), &residual, &candidate, 1000);
    assert_eq!(niter, 1000);
}

#[test]
fn niter_correction_scales_with_dynamic_range() {
    // log2(1.0 / 0.1) rounds up to 4.
    assert_eq!(niter_correction(1000, 1.0, 0.1), 4000);
    assert_eq!(niter_correction(1000, 0.05, 0.1), 1000);
    assert_eq!(niter_correction(1000, 1.0, 0.0), 1000);
    // Capped at ten cycles' worth.
    assert_eq!(niter_correction(1000, 1e9, 1e-9), 10_000);
}
