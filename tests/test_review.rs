mod common;
use ajdc::{
    begin_review, fit, read_review_request, resume, write_review_request, AjdcError,
    CalibrationConfig, CalibrationWindow, DimensionalityReduction, ReviewResponse, SuppressionSet,
};
use common::{annotated_mixture, most_peaked};

fn window() -> CalibrationWindow {
    let raw = annotated_mixture(5, 40.0, 51);
    CalibrationWindow::from_annotation(&raw, " 16", 5.0, 20.0).unwrap()
}

fn full_rank() -> CalibrationConfig {
    CalibrationConfig {
        dim_red: DimensionalityReduction::Components(5),
        ..CalibrationConfig::default()
    }
}

#[test]
fn request_describes_every_source() {
    let w = window();
    let request = begin_review(&w, fit(&w, &full_rank()).unwrap()).unwrap();
    let n = request.decomposition.n_sources();

    assert_eq!(request.sources.ch_names, vec!["S00", "S01", "S02", "S03", "S04"]);
    assert_eq!(request.sources.n_times(), w.signal.n_times());
    assert_eq!(request.sources.first_samp, w.signal.first_samp);
    assert_eq!(request.spectra.nrows(), n);
    assert_eq!(request.spectra.ncols(), request.freqs.len());
    assert_eq!(request.topographies().dim(), (5, n));

    assert!(request.freqs.iter().all(|&f| (1.0..=80.0).contains(&f)));
    for row in request.spectra.rows() {
        let norm: f64 = row.iter().map(|v| v * v).sum::<f64>().sqrt();
        approx::assert_abs_diff_eq!(norm, 1.0, epsilon = 1e-12);
    }
}

#[test]
fn calibration_window_follows_annotation() {
    let w = window();
    // stimulus " 16" at 5 s → window [10, 30] s, inclusive end sample
    assert_eq!(w.signal.first_samp, (10.0 * common::SFREQ) as i64);
    assert_eq!(w.signal.n_times(), (20.0 * common::SFREQ) as usize + 1);
}

#[test]
fn request_survives_the_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("review").join("sub-S002.review.safetensors");

    let w = window();
    let request = begin_review(&w, fit(&w, &CalibrationConfig::default()).unwrap()).unwrap();
    write_review_request(&request, &path).unwrap();
    let back = read_review_request(&path).unwrap();
    assert_eq!(back, request);
}

#[test]
fn resume_attaches_selection() {
    let w = window();
    let request = begin_review(&w, fit(&w, &full_rank()).unwrap()).unwrap();
    let params = resume(&request, &ReviewResponse::from_prompt("1 x 1", "0 -3")).unwrap();

    assert_eq!(params.blink_indices().iter().copied().collect::<Vec<_>>(), vec![1]);
    assert_eq!(params.saccade_indices().iter().copied().collect::<Vec<_>>(), vec![0]);
    assert_eq!(params.suppression_set(), [0, 1].into_iter().collect::<SuppressionSet>());
    assert_eq!(params.forward_filter(), request.decomposition.forward_filter());
}

#[test]
fn resume_rejects_unknown_source() {
    let w = window();
    let request = begin_review(&w, fit(&w, &full_rank()).unwrap()).unwrap();
    let r = resume(&request, &ReviewResponse::from_prompt("0", "9"));
    assert!(matches!(r, Err(AjdcError::Index { index: 9, n_sources: 5 })));
}

#[test]
fn corrected_calibration_removes_selected_sources() {
    let w = window();
    let request = begin_review(&w, fit(&w, &full_rank()).unwrap()).unwrap();

    let untouched = resume(&request, &ReviewResponse::default()).unwrap();
    let same = request.corrected_calibration(&untouched).unwrap();
    let scale = w.signal.data.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    for (a, b) in same.data.iter().zip(w.signal.data.iter()) {
        approx::assert_abs_diff_eq!(*a, *b, epsilon = 1e-8 * scale);
    }
    assert_eq!(same.ch_names, w.signal.ch_names);
    assert_eq!(same.annotations, w.signal.annotations);

    let picked = most_peaked(&request.spectra, 2);
    let response = ReviewResponse { blink: picked, saccade: vec![] };
    let params = resume(&request, &response).unwrap();
    let corrected = request.corrected_calibration(&params).unwrap();
    let before = common::band_power(&w.signal.data, common::SFREQ, 2.0, 8.0);
    let after = common::band_power(&corrected.data, common::SFREQ, 2.0, 8.0);
    assert!(after < 0.1 * before);
}
