/// Shared helpers: seeded synthetic EEG-like mixtures.
use ajdc::{Annotation, RawSignal};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;

pub const SFREQ: f64 = 256.0;

/// Frequencies of the two oscillatory sources in [`mixture`].
pub const OCULAR_HZ: [f64; 2] = [3.0, 6.0];

#[allow(unused)]
pub fn names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("E{i:02}")).collect()
}

/// Unit-variance AR(1) noise with coefficient `rho`.
fn ar1(rng: &mut StdRng, n: usize, rho: f64) -> Vec<f64> {
    let gain = (1.0 - rho * rho).sqrt();
    let mut out = Vec::with_capacity(n);
    let mut prev = 0.0;
    for _ in 0..n {
        // sum of uniforms, close enough to Gaussian for a spectrum
        let e: f64 = (0..6).map(|_| rng.gen::<f64>() - 0.5).sum::<f64>() * 2.0_f64.sqrt();
        prev = rho * prev + gain * e;
        out.push(prev);
    }
    out
}

/// `[n_sources, T]` sources: 3 Hz and 6 Hz sinusoids of amplitude
/// `amplitude` over a weak white floor, then AR(1) noise sources with distinct spectral tilts.
#[allow(unused)]
pub fn sources(n_sources: usize, n_t: usize, amplitude: f64, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let rhos = [0.5, 0.0, -0.5, 0.25, -0.25, 0.7];
    let mut s = Array2::<f64>::zeros((n_sources, n_t));
    for k in 0..n_sources {
        let row: Vec<f64> = if k < OCULAR_HZ.len() {
            let phase = rng.gen::<f64>() * 2.0 * PI;
            // broadband floor keeps every cospectrum positive definite
            let floor = ar1(&mut rng, n_t, 0.0);
            (0..n_t)
                .map(|t| {
                    amplitude * (2.0 * PI * OCULAR_HZ[k] * t as f64 / SFREQ + phase).sin()
                        + 0.3 * floor[t]
                })
                .collect()
        } else {
            ar1(&mut rng, n_t, rhos[(k - OCULAR_HZ.len()) % rhos.len()])
        };
        s.row_mut(k).assign(&ndarray::Array1::from(row));
    }
    s
}

/// Well-conditioned random `[n, n]` mixing matrix.
#[allow(unused)]
pub fn mixing(n: usize, seed: u64) -> Array2<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((n, n), |(i, j)| {
        let r = rng.gen::<f64>() - 0.5;
        if i == j { 1.5 + r } else { 0.5 * r }
    })
}

/// `seconds` of a `n_ch`-channel mixture of [`sources`] at [`SFREQ`].
#[allow(unused)]
pub fn mixture(n_ch: usize, seconds: f64, seed: u64) -> RawSignal {
    let n_t = (seconds * SFREQ).round() as usize;
    let s = sources(n_ch, n_t, 5.0, seed);
    let x = mixing(n_ch, seed.wrapping_add(1)).dot(&s);
    RawSignal::new(x, names(n_ch), SFREQ).unwrap()
}

/// Same as [`mixture`] with a stimulus annotation every 5 s.
#[allow(unused)]
pub fn annotated_mixture(n_ch: usize, seconds: f64, seed: u64) -> RawSignal {
    let annots = (0..(seconds / 5.0) as usize)
        .map(|i| Annotation::new(i as f64 * 5.0, 0.0, format!("Stimulus/S {}", if i == 1 { 16 } else { 2 })))
        .collect();
    mixture(n_ch, seconds, seed).with_annotations(annots)
}

/// Mean Welch power of every channel within `[lo, hi]` Hz.
#[allow(unused)]
pub fn band_power(data: &Array2<f64>, sfreq: f64, lo: f64, hi: f64) -> f64 {
    let mut total = 0.0;
    for row in data.rows() {
        let (freqs, psd) = ajdc::spectral::welch_psd(&row.to_vec(), sfreq, 512);
        total += freqs
            .iter()
            .zip(&psd)
            .filter(|(f, _)| **f >= lo && **f <= hi)
            .map(|(_, p)| p)
            .sum::<f64>();
    }
    total / data.nrows() as f64
}

/// Indices of the `k` sources whose normalised spectrum is most peaked.
#[allow(unused)]
pub fn most_peaked(spectra: &Array2<f64>, k: usize) -> Vec<usize> {
    let mut peaks: Vec<(usize, f64)> = spectra
        .rows()
        .into_iter()
        .enumerate()
        .map(|(s, row)| (s, row.iter().copied().fold(0.0, f64::max)))
        .collect();
    peaks.sort_by(|a, b| b.1.total_cmp(&a.1));
    peaks.into_iter().take(k).map(|(s, _)| s).collect()
}

/// Frequency of the spectral maximum of source `s`.
#[allow(unused)]
pub fn peak_frequency(freqs: &[f64], spectra: &Array2<f64>, s: usize) -> f64 {
    let row = spectra.row(s);
    let (i, _) = row
        .iter()
        .enumerate()
        .fold((0, f64::MIN), |best, (i, &v)| if v > best.1 { (i, v) } else { best });
    freqs[i]
}
