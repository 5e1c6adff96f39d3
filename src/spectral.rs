//! Windowed FFT estimators: cospectral matrices and Welch power spectra.
//!
//! `cospectra` matches pyRiemann's `CoSpectra(window, overlap, fmin, fmax, fs)`:
//!   1. Cut `[C, T]` into windows of `window` samples every `step` samples.
//!   2. Taper each window with a symmetric Hann window and take its FFT.
//!   3. For every bin `f ∈ [fmin, fmax]`:
//!      `C(f) = Re( Σ_w X_w(f) X_w(f)ᴴ ) / (n_windows · Σ win²)`.
//!
//! `welch_psd` matches `scipy.signal.welch(x, fs, nperseg, noverlap=nperseg/2)`
//! with its defaults (periodic Hann, constant detrend, one-sided density).
use ndarray::{s, Array2, Array3, ArrayView2};
use rustfft::{num_complex::Complex, FftPlanner};
use std::f64::consts::PI;

use crate::config::FrequencyBand;
use crate::error::{AjdcError, Result};

/// Hann window of length `n`.  `periodic` drops the last point of an
/// `n + 1` symmetric window (the `fftbins=True` convention).
pub fn hann(n: usize, periodic: bool) -> Vec<f64> {
    if n <= 1 {
        return vec![1.0; n];
    }
    let denom = if periodic { n } else { n - 1 } as f64;
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / denom).cos())
        .collect()
}

/// Frequencies of the one-sided spectrum of an `n`-point FFT.
pub fn rfft_freqs(n: usize, sfreq: f64) -> Vec<f64> {
    (0..=n / 2).map(|k| k as f64 * sfreq / n as f64).collect()
}

/// One cospectral matrix per retained frequency bin.
#[derive(Debug, Clone)]
pub struct Cospectra {
    /// Bin centre frequencies in Hz, increasing.
    pub freqs: Vec<f64>,
    /// `[C, C]` symmetric positive semi-definite matrices, one per bin.
    pub matrices: Vec<Array2<f64>>,
    /// Number of analysis windows averaged.
    pub n_windows: usize,
}

/// Estimate cospectra of `data` (`[C, T]`).
///
/// # Errors
///
/// [`AjdcError::Configuration`] when `T < window`, when the band lies
/// outside `[0, sfreq/2]`, or when no FFT bin falls inside the band.
pub fn cospectra(
    data: ArrayView2<'_, f64>,
    window: usize,
    step: usize,
    sfreq: f64,
    band: FrequencyBand,
) -> Result<Cospectra> {
    let (n_ch, n_t) = data.dim();
    band.validate(sfreq)?;
    if window < 2 || n_t < window {
        return Err(AjdcError::config(format!(
            "calibration window of {n_t} samples is shorter than one analysis window ({window})"
        )));
    }
    let step = step.max(1);
    let n_windows = (n_t - window) / step + 1;

    let bins: Vec<usize> = rfft_freqs(window, sfreq)
        .iter()
        .enumerate()
        .filter(|(_, f)| **f >= band.fmin as f64 && **f <= band.fmax as f64)
        .map(|(k, _)| k)
        .collect();
    if bins.is_empty() {
        return Err(AjdcError::config(format!(
            "no frequency bin of a {window}-point FFT at {sfreq} Hz lies in [{}, {}] Hz",
            band.fmin, band.fmax
        )));
    }

    let win = hann(window, false);
    let mut planner: FftPlanner<f64> = FftPlanner::new();
    let fft = planner.plan_fft_forward(window);

    // [bin, channel, window] real and imaginary parts.
    let mut re = Array3::<f64>::zeros((bins.len(), n_ch, n_windows));
    let mut im = Array3::<f64>::zeros((bins.len(), n_ch, n_windows));
    let mut buf = vec![Complex::default(); window];

    for w in 0..n_windows {
        let start = w * step;
        for c in 0..n_ch {
            let seg = data.slice(s![c, start..start + window]);
            for ((b, &x), &h) in buf.iter_mut().zip(seg.iter()).zip(win.iter()) {
                *b = Complex { re: x * h, im: 0.0 };
            }
            fft.process(&mut buf);
            for (bi, &k) in bins.iter().enumerate() {
                re[[bi, c, w]] = buf[k].re;
                im[[bi, c, w]] = buf[k].im;
            }
        }
    }

    let norm = 1.0 / (n_windows as f64 * win.iter().map(|h| h * h).sum::<f64>());
    let matrices = (0..bins.len())
        .map(|bi| {
            let r = re.slice(s![bi, .., ..]);
            let i = im.slice(s![bi, .., ..]);
            (r.dot(&r.t()) + i.dot(&i.t())) * norm
        })
        .collect();

    let all_freqs = rfft_freqs(window, sfreq);
    Ok(Cospectra {
        freqs: bins.iter().map(|&k| all_freqs[k]).collect(),
        matrices,
        n_windows,
    })
}

/// Welch power spectral density of one signal.
///
/// Returns `(freqs, psd)` for the one-sided spectrum.  When the signal is
/// shorter than `nperseg` a single segment spanning the whole signal is used.
pub fn welch_psd(x: &[f64], sfreq: f64, nperseg: usize) -> (Vec<f64>, Vec<f64>) {
    let n = x.len();
    if n == 0 {
        return (vec![], vec![]);
    }
    let nperseg = nperseg.min(n).max(1);
    let step = (nperseg - nperseg / 2).max(1);
    let n_seg = (n - nperseg) / step + 1;

    let win = hann(nperseg, true);
    let scale = 1.0 / (sfreq * win.iter().map(|h| h * h).sum::<f64>());
    let mut planner: FftPlanner<f64> = FftPlanner::new();
    let fft = planner.plan_fft_forward(nperseg);

    let n_freq = nperseg / 2 + 1;
    let mut psd = vec![0.0; n_freq];
    let mut buf = vec![Complex::default(); nperseg];
    for s_idx in 0..n_seg {
        let seg = &x[s_idx * step..s_idx * step + nperseg];
        let mean = seg.iter().sum::<f64>() / nperseg as f64;
        for ((b, &v), &h) in buf.iter_mut().zip(seg).zip(win.iter()) {
            *b = Complex { re: (v - mean) * h, im: 0.0 };
        }
        fft.process(&mut buf);
        for (k, p) in psd.iter_mut().enumerate() {
            *p += buf[k].norm_sqr() * scale;
        }
    }

    for (k, p) in psd.iter_mut().enumerate() {
        *p /= n_seg as f64;
        let is_nyquist = nperseg % 2 == 0 && k == n_freq - 1;
        if k != 0 && !is_nyquist {
            *p *= 2.0;
        }
    }
    (rfft_freqs(nperseg, sfreq), psd)
}

/// Band-limited, L2-normalised Welch spectrum as shown to the operator.
pub fn normalized_band_spectrum(
    x: &[f64],
    sfreq: f64,
    band: FrequencyBand,
) -> (Vec<f64>, Vec<f64>) {
    let (freqs, psd) = welch_psd(x, sfreq, 1024);
    let (f, mut p): (Vec<f64>, Vec<f64>) = freqs
        .into_iter()
        .zip(psd)
        .filter(|(f, _)| *f >= band.fmin as f64 && *f <= band.fmax as f64)
        .unzip();
    let norm = p.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        p.iter_mut().for_each(|v| *v /= norm);
    }
    (f, p)
}
