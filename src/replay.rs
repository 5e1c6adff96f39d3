//! Replay denoising: apply a stored decomposition to a full recording.
//!
//! ```text
//! recording [C, T]
//!   │
//!   ├─ validate              channel names/order and sampling rate
//!   ├─ epoch                 consecutive 500 ms windows from sample 0,
//!   │                        trailing partial window dropped
//!   ├─ per epoch             transform → zero suppressed sources → inverse
//!   └─ concatenate           chronological order, metadata reattached
//! ```
//!
//! Every epoch is processed independently with the calibration filters, so
//! the reconstructed signal may be discontinuous at epoch seams.
use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;

use crate::config::DenoiseConfig;
use crate::decomposition::DecompositionParameters;
use crate::epoch::{concatenate, epoch_views};
use crate::error::{AjdcError, Result};
use crate::signal::RawSignal;
use crate::suppression::SuppressionSet;

/// Relative tolerance when comparing sampling rates.
const SFREQ_RTOL: f64 = 1e-6;

/// Denoise `recording` with the default [`DenoiseConfig`] (500 ms epochs,
/// sequential).
pub fn denoise(
    recording: &RawSignal,
    params: &DecompositionParameters,
    suppression: &SuppressionSet,
) -> Result<RawSignal> {
    denoise_with(recording, params, suppression, &DenoiseConfig::default())
}

/// Denoise `recording` epoch by epoch.
///
/// The output keeps the recording's channel names, sampling rate,
/// `meas_date`, `first_samp` and annotations verbatim, and lasts
/// `floor(duration / epoch) · epoch` seconds.
///
/// # Errors
///
/// * [`AjdcError::Configuration`] when the channel layout or sampling rate
///   differs from the calibration, or the epoch is shorter than one sample.
/// * [`AjdcError::Index`] when `suppression` names a source that does not
///   exist.
pub fn denoise_with(
    recording: &RawSignal,
    params: &DecompositionParameters,
    suppression: &SuppressionSet,
    cfg: &DenoiseConfig,
) -> Result<RawSignal> {
    check_compatible(recording, params)?;
    suppression.check_range(params.n_sources())?;

    let epoch_len = cfg.epoch_length(recording.sfreq);
    if !(epoch_len.is_finite() && epoch_len >= 1.0) {
        return Err(AjdcError::config(format!(
            "epoch of {} s is shorter than one sample at {} Hz",
            cfg.epoch_duration, recording.sfreq
        )));
    }

    let epochs = epoch_views(recording.data.view(), epoch_len);
    let kept: usize = epochs.iter().map(|e| e.ncols()).sum();
    log::info!(
        "replay: {} epochs of {epoch_len} samples, suppressing {:?}, \
         {} trailing samples dropped",
        epochs.len(),
        suppression.iter().collect::<Vec<_>>(),
        recording.n_times() - kept
    );

    let clean = |ep: &ArrayView2<'_, f64>| -> Result<Array2<f64>> {
        let sources = params.transform(ep.view())?;
        params.inverse_transform(sources.view(), suppression)
    };
    let cleaned: Vec<Array2<f64>> = if cfg.parallel {
        epochs.par_iter().map(clean).collect::<Result<_>>()?
    } else {
        epochs.iter().map(clean).collect::<Result<_>>()?
    };

    recording.with_data(concatenate(&cleaned, recording.n_channels()))
}

/// Layout and sampling-rate check against the calibration.
pub fn check_compatible(recording: &RawSignal, params: &DecompositionParameters) -> Result<()> {
    if recording.ch_names != params.ch_names() {
        return Err(AjdcError::config(format!(
            "recording channels [{}] differ from calibration channels [{}]",
            recording.ch_names.join(","),
            params.ch_names().join(",")
        )));
    }
    let (a, b) = (recording.sfreq, params.sfreq());
    if (a - b).abs() > SFREQ_RTOL * a.abs().max(b.abs()) {
        return Err(AjdcError::config(format!(
            "recording sampled at {a} Hz, calibration at {b} Hz"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrequencyBand;
    use std::collections::BTreeSet;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("E{i}")).collect()
    }

    /// Two-channel decomposition whose second source is the channel
    /// difference.
    fn params() -> DecompositionParameters {
        let fwd = ndarray::array![[0.5, 0.5], [0.5, -0.5]];
        let bwd = ndarray::array![[1.0, 1.0], [1.0, -1.0]];
        DecompositionParameters::new(
            names(2),
            100.0,
            FrequencyBand::new(1, 40),
            1.0,
            0.5,
            fwd,
            bwd,
            BTreeSet::new(),
            BTreeSet::new(),
        )
        .unwrap()
    }

    fn recording(n_t: usize) -> RawSignal {
        let data = Array2::from_shape_fn((2, n_t), |(c, t)| if c == 0 { t as f64 } else { -(t as f64) });
        RawSignal::new(data, names(2), 100.0).unwrap()
    }

    #[test]
    fn output_is_truncated_to_whole_epochs() {
        let out = denoise(&recording(1030), &params(), &SuppressionSet::new()).unwrap();
        assert_eq!(out.n_times(), 1000);
    }

    #[test]
    fn suppressing_difference_source_leaves_common_mode() {
        let set: SuppressionSet = [1].into_iter().collect();
        let out = denoise(&recording(200), &params(), &set).unwrap();
        for v in out.data.iter() {
            approx::assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn parallel_matches_sequential() {
        let set: SuppressionSet = [0].into_iter().collect();
        let rec = recording(1234);
        let seq = denoise(&rec, &params(), &set).unwrap();
        let cfg = DenoiseConfig { parallel: true, ..DenoiseConfig::default() };
        let par = denoise_with(&rec, &params(), &set, &cfg).unwrap();
        assert_eq!(seq, par);
    }

    #[test]
    fn renamed_channel_is_configuration_error() {
        let mut rec = recording(100);
        rec.ch_names[1] = "Fz".into();
        let r = denoise(&rec, &params(), &SuppressionSet::new());
        assert!(matches!(r, Err(AjdcError::Configuration(_))));
    }

    #[test]
    fn sampling_rate_mismatch_is_configuration_error() {
        let mut rec = recording(100);
        rec.sfreq = 250.0;
        let r = denoise(&rec, &params(), &SuppressionSet::new());
        assert!(matches!(r, Err(AjdcError::Configuration(_))));
    }

    #[test]
    fn shorter_than_one_epoch_gives_empty_signal() {
        let out = denoise(&recording(30), &params(), &SuppressionSet::new()).unwrap();
        assert_eq!(out.data.dim(), (2, 0));
    }
}
