//! Calibration and replay configuration.
//!
//! [`CalibrationConfig`] holds every tunable parameter of the decomposition
//! fit and [`DenoiseConfig`] those of the replay stage.  The defaults are the
//! settings of the BetaPark study: 1 s analysis windows with 50 % overlap, a
//! 1–80 Hz band, 99 % explained variance and 500 ms replay epochs.
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AjdcError, Result};

/// Integer frequency band `[fmin, fmax]` in Hz.
///
/// The band is part of the parameter-store key, so it is kept integral to
/// give stable directory names (`band_1_80`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrequencyBand {
    pub fmin: u32,
    pub fmax: u32,
}

impl FrequencyBand {
    pub fn new(fmin: u32, fmax: u32) -> Self {
        Self { fmin, fmax }
    }

    /// Check the band against the spectrum representable at `sfreq`.
    pub fn validate(&self, sfreq: f64) -> Result<()> {
        if self.fmin >= self.fmax {
            return Err(AjdcError::config(format!(
                "fmin ({}) must be below fmax ({})",
                self.fmin, self.fmax
            )));
        }
        let nyquist = sfreq / 2.0;
        if self.fmax as f64 > nyquist {
            return Err(AjdcError::config(format!(
                "fmax ({} Hz) exceeds the Nyquist frequency ({nyquist} Hz)",
                self.fmax
            )));
        }
        Ok(())
    }
}

impl Default for FrequencyBand {
    fn default() -> Self {
        Self { fmin: 1, fmax: 80 }
    }
}

impl fmt::Display for FrequencyBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "band_{}_{}", self.fmin, self.fmax)
    }
}

/// How many sources the decomposition keeps.
///
/// Applied to the eigenvalues of the weighted mean cospectrum, sorted in
/// decreasing order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum DimensionalityReduction {
    /// Keep exactly this many sources (clamped to the channel count).
    Components(usize),
    /// Keep the smallest subspace whose eigenvalues explain at least this
    /// fraction of the total variance.  `1.0` keeps every positive direction.
    ExplainedVariance(f64),
    /// Keep the largest subspace whose condition number `λ₀ / λₖ` stays at
    /// or below this bound.
    MaxConditionNumber(f64),
}

impl Default for DimensionalityReduction {
    fn default() -> Self {
        Self::ExplainedVariance(0.99)
    }
}

/// Configuration for the spectral joint-diagonalization fit.
///
/// All fields are `pub` so you can construct one with struct-update syntax:
///
/// ```
/// use ajdc::{CalibrationConfig, DimensionalityReduction};
///
/// let cfg = CalibrationConfig {
///     dim_red: DimensionalityReduction::MaxConditionNumber(100.0),
///     ..CalibrationConfig::default()
/// };
/// assert_eq!(cfg.band.fmax, 80);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Length of each cospectral analysis window in seconds.
    ///
    /// The window length in samples, `round(window_length × sfreq)`, is also
    /// the FFT size, so the bin spacing is `1 / window_length` Hz.
    ///
    /// Default: `1.0` s.
    pub window_length: f64,

    /// Fraction of overlap between consecutive analysis windows, in `[0, 1)`.
    ///
    /// Default: `0.5`.
    pub overlap: f64,

    /// Frequency band whose bins enter the joint diagonalization.
    ///
    /// Default: 1–80 Hz.
    pub band: FrequencyBand,

    /// Dimensionality reduction applied before whitening.
    ///
    /// Default: 99 % explained variance.
    pub dim_red: DimensionalityReduction,

    /// Maximum number of Jacobi-like sweeps of the joint diagonalizer.
    ///
    /// Default: `200`.
    pub max_iter: usize,

    /// Convergence tolerance of the joint diagonalizer, per source pair.
    ///
    /// Default: `1e-6`.
    pub tolerance: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            window_length: 1.0,
            overlap: 0.5,
            band: FrequencyBand::default(),
            dim_red: DimensionalityReduction::default(),
            max_iter: 200,
            tolerance: 1e-6,
        }
    }
}

impl CalibrationConfig {
    /// Analysis window length in samples at `sfreq`.
    ///
    /// ```
    /// use ajdc::CalibrationConfig;
    /// assert_eq!(CalibrationConfig::default().window_samples(256.0), 256);
    /// ```
    pub fn window_samples(&self, sfreq: f64) -> usize {
        (self.window_length * sfreq).round() as usize
    }

    /// Hop between analysis windows in samples (at least one).
    pub fn step_samples(&self, sfreq: f64) -> usize {
        let window = self.window_samples(sfreq);
        let overlap = (self.overlap * window as f64) as usize;
        window.saturating_sub(overlap).max(1)
    }

    pub fn validate(&self, sfreq: f64) -> Result<()> {
        if !(sfreq > 0.0) {
            return Err(AjdcError::config(format!("invalid sampling rate {sfreq}")));
        }
        if !(0.0..1.0).contains(&self.overlap) {
            return Err(AjdcError::config(format!(
                "overlap must lie in [0, 1), got {}",
                self.overlap
            )));
        }
        if self.window_samples(sfreq) < 2 {
            return Err(AjdcError::config(format!(
                "analysis window of {} s is shorter than two samples at {sfreq} Hz",
                self.window_length
            )));
        }
        self.band.validate(sfreq)
    }
}

/// Configuration for replay denoising.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DenoiseConfig {
    /// Duration of each independently denoised epoch in seconds.
    ///
    /// Default: `0.5` s.
    pub epoch_duration: f64,

    /// Denoise epochs on the rayon thread pool.  Output order is unchanged.
    ///
    /// Default: `false`.
    pub parallel: bool,
}

impl Default for DenoiseConfig {
    fn default() -> Self {
        Self { epoch_duration: 0.5, parallel: false }
    }
}

impl DenoiseConfig {
    /// Epoch length in samples, `epoch_duration × sfreq`.
    ///
    /// Not necessarily whole: at 125 Hz a 500 ms epoch spans 62.5 samples,
    /// and [`crate::epoch::epoch_bounds`] alternates 62- and 63-sample
    /// epochs so that the count stays `floor(duration / epoch_duration)`.
    ///
    /// ```
    /// use ajdc::DenoiseConfig;
    /// assert_eq!(DenoiseConfig::default().epoch_length(256.0), 128.0);
    /// assert_eq!(DenoiseConfig::default().epoch_length(125.0), 62.5);
    /// ```
    pub fn epoch_length(&self, sfreq: f64) -> f64 {
        self.epoch_duration * sfreq
    }
}
