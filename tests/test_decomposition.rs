mod common;
use ajdc::{
    begin_review, denoise, fit, AjdcError, CalibrationConfig, CalibrationWindow,
    DimensionalityReduction, FrequencyBand, RawSignal, SuppressionSet,
};
use common::{band_power, mixing, mixture, most_peaked, names, peak_frequency, sources, OCULAR_HZ, SFREQ};
use ndarray::Array2;

fn full_rank(n: usize) -> CalibrationConfig {
    CalibrationConfig {
        dim_red: DimensionalityReduction::Components(n),
        ..CalibrationConfig::default()
    }
}

fn max_abs(a: &Array2<f64>) -> f64 {
    a.iter().fold(0.0, |m, v| m.max(v.abs()))
}

fn max_abs_diff(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    assert_eq!(a.dim(), b.dim());
    a.iter().zip(b.iter()).fold(0.0, |m, (x, y)| m.max((x - y).abs()))
}

#[test]
fn full_rank_round_trip_reproduces_input() {
    let raw = mixture(5, 30.0, 11);
    let window = CalibrationWindow::whole(raw.clone());
    let params = fit(&window, &full_rank(5)).unwrap();
    assert_eq!(params.n_sources(), 5);

    let sources = params.transform(raw.data.view()).unwrap();
    let back = params.inverse_transform(sources.view(), &SuppressionSet::new()).unwrap();
    assert!(
        max_abs_diff(&back, &raw.data) <= 1e-8 * max_abs(&raw.data),
        "round trip error {}",
        max_abs_diff(&back, &raw.data)
    );
}

#[test]
fn suppression_is_idempotent() {
    let raw = mixture(5, 30.0, 12);
    let params = fit(&CalibrationWindow::whole(raw.clone()), &CalibrationConfig::default()).unwrap();
    let set: SuppressionSet = [0].into_iter().collect();

    let once = params
        .inverse_transform(params.transform(raw.data.view()).unwrap().view(), &set)
        .unwrap();
    let twice = params
        .inverse_transform(params.transform(once.view()).unwrap().view(), &set)
        .unwrap();
    assert!(max_abs_diff(&once, &twice) <= 1e-8 * max_abs(&raw.data));
}

#[test]
fn sources_never_exceed_channels() {
    // 6 channels spanned by 4 sources.
    let n_t = (20.0 * SFREQ) as usize;
    let s = sources(4, n_t, 5.0, 21);
    let a = mixing(6, 22).slice(ndarray::s![.., 0..4]).to_owned();
    let raw = RawSignal::new(a.dot(&s), names(6), SFREQ).unwrap();

    let params = fit(&CalibrationWindow::whole(raw), &full_rank(6)).unwrap();
    assert_eq!(params.n_channels(), 6);
    assert_eq!(params.n_sources(), 4);
    assert_eq!(params.forward_filter().dim(), (4, 6));
    assert_eq!(params.backward_filter().dim(), (6, 4));
}

/// `seconds` of fresh sources through the same mixing as `mixture(5, _, seed)`.
fn held_out(seconds: f64, seed: u64, source_seed: u64) -> RawSignal {
    let n_t = (seconds * SFREQ) as usize;
    let x = mixing(5, seed + 1).dot(&sources(5, n_t, 5.0, source_seed));
    RawSignal::new(x, names(5), SFREQ).unwrap()
}

#[test]
fn fit_is_deterministic() {
    let window = CalibrationWindow::whole(mixture(5, 20.0, 13));
    let a = fit(&window, &full_rank(5)).unwrap();
    let b = fit(&window, &full_rank(5)).unwrap();
    assert_eq!(a, b);

    // judged on a recording the fit never saw
    let test = held_out(12.0, 13, 99);
    let scale = max_abs(&test.data);
    let replay = |p: &ajdc::DecompositionParameters, set: &SuppressionSet| -> Array2<f64> {
        denoise(&test, p, set).unwrap().data
    };

    let none = SuppressionSet::new();
    let (ra, rb) = (replay(&a, &none), replay(&b, &none));
    assert!(max_abs_diff(&ra, &rb) <= 1e-10 * scale);
    assert!(max_abs_diff(&ra, &test.data) <= 1e-8 * scale);

    let all: SuppressionSet = (0..a.n_sources()).collect();
    let (ra, rb) = (replay(&a, &all), replay(&b, &all));
    assert!(max_abs_diff(&ra, &rb) <= 1e-10 * scale);
    assert!(max_abs(&ra) <= 1e-8 * scale);

    // sources picked by content, not by index
    let pick = |p: &ajdc::DecompositionParameters| -> SuppressionSet {
        let request = begin_review(&window, p.clone()).unwrap();
        most_peaked(&request.spectra, 2).into_iter().collect()
    };
    let (ra, rb) = (replay(&a, &pick(&a)), replay(&b, &pick(&b)));
    assert!(max_abs_diff(&ra, &rb) <= 1e-10 * scale);
}

#[test]
fn source_power_normalised_and_sorted() {
    let raw = mixture(5, 30.0, 14);
    let params = fit(&CalibrationWindow::whole(raw), &full_rank(5)).unwrap();
    let energy: Vec<f64> = (0..params.n_sources())
        .map(|s| params.backward_filter().column(s).iter().map(|x| x * x).sum())
        .collect();
    for w in energy.windows(2) {
        assert!(w[0] >= w[1], "energies not decreasing: {energy:?}");
    }
    // Each topography's largest entry is positive.
    for s in 0..params.n_sources() {
        let col = params.backward_filter().column(s);
        let dominant = col.iter().copied().max_by(|a, b| a.abs().total_cmp(&b.abs())).unwrap();
        assert!(dominant > 0.0);
    }
}

#[test]
fn ocular_sources_suppressed_end_to_end() {
    let raw = mixture(5, 30.0, 7);
    let window = CalibrationWindow::whole(raw.clone());
    let cfg = CalibrationConfig { band: FrequencyBand::new(1, 80), ..full_rank(5) };
    let request = begin_review(&window, fit(&window, &cfg).unwrap()).unwrap();

    let picked = most_peaked(&request.spectra, 2);
    let mut peaks: Vec<f64> = picked
        .iter()
        .map(|&s| peak_frequency(&request.freqs, &request.spectra, s))
        .collect();
    peaks.sort_by(f64::total_cmp);
    for (peak, expected) in peaks.iter().zip(OCULAR_HZ) {
        assert!((peak - expected).abs() <= 0.5, "peaks {peaks:?}");
    }

    let set: SuppressionSet = picked.iter().copied().collect();
    let clean = denoise(&raw, &request.decomposition, &set).unwrap();
    let truncated = raw.data.slice(ndarray::s![.., ..clean.n_times()]).to_owned();

    let before = band_power(&truncated, SFREQ, 2.0, 8.0);
    let after = band_power(&clean.data, SFREQ, 2.0, 8.0);
    let drop_db = 10.0 * (before / after).log10();
    assert!(drop_db >= 10.0, "2–8 Hz power dropped by only {drop_db:.1} dB");

    // Broadband activity is left largely in place.
    let hi_before = band_power(&truncated, SFREQ, 20.0, 60.0);
    let hi_after = band_power(&clean.data, SFREQ, 20.0, 60.0);
    assert!(hi_after > 0.5 * hi_before, "20–60 Hz: {hi_before} → {hi_after}");
}

#[test]
fn band_above_nyquist_is_configuration_error() {
    let raw = mixture(3, 10.0, 1);
    let cfg = CalibrationConfig { band: FrequencyBand::new(1, 200), ..CalibrationConfig::default() };
    let r = fit(&CalibrationWindow::whole(raw), &cfg);
    assert!(matches!(r, Err(AjdcError::Configuration(_))));
}

#[test]
fn inverted_band_is_configuration_error() {
    let raw = mixture(3, 10.0, 2);
    let cfg = CalibrationConfig { band: FrequencyBand::new(40, 10), ..CalibrationConfig::default() };
    let r = fit(&CalibrationWindow::whole(raw), &cfg);
    assert!(matches!(r, Err(AjdcError::Configuration(_))));
}

#[test]
fn window_shorter_than_analysis_window_is_configuration_error() {
    let raw = mixture(3, 0.5, 3);
    let r = fit(&CalibrationWindow::whole(raw), &CalibrationConfig::default());
    assert!(matches!(r, Err(AjdcError::Configuration(_))));
}

#[test]
fn transform_rejects_wrong_channel_count() {
    let raw = mixture(4, 10.0, 4);
    let params = fit(&CalibrationWindow::whole(raw), &CalibrationConfig::default()).unwrap();
    let r = params.transform(Array2::<f64>::zeros((3, 100)).view());
    assert!(matches!(r, Err(AjdcError::ChannelMismatch { .. })));
}

#[test]
fn out_of_range_suppression_is_index_error() {
    let raw = mixture(4, 10.0, 5);
    let params = fit(&CalibrationWindow::whole(raw.clone()), &full_rank(4)).unwrap();
    let sources = params.transform(raw.data.view()).unwrap();
    let set: SuppressionSet = [params.n_sources()].into_iter().collect();
    let r = params.inverse_transform(sources.view(), &set);
    assert!(matches!(r, Err(AjdcError::Index { .. })));
}
