//! # ajdc: calibrated ocular-artifact removal for EEG
//!
//! `ajdc` separates a multichannel EEG recording into sources by
//! approximate joint diagonalization of its cospectral matrices, lets an
//! operator label the blink and saccade sources of a short calibration
//! window, and replays the stored filters over whole recordings to remove
//! them.
//!
//! ## Pipeline overview
//!
//! ```text
//! calibration recording
//!   │
//!   ├─ CalibrationWindow      annotation-anchored or fixed crop
//!   ├─ spectral::cospectra    Hann-windowed FFT, real cross-spectra per bin in [fmin, fmax]
//!   ├─ whitening              weighted mean cospectrum → eigh → rank reduction
//!   ├─ ajd::ajd_pham          weighted joint diagonalization of the whitened set
//!   └─ DecompositionParameters   forward [S, C], backward [C, S]
//!        │
//!        ├─ review::begin_review   sources, spectra, topographies  ──┐
//!        │                                                        operator
//!        ├─ review::resume        blink / saccade indices  ◄─────────┘
//!        └─ ParameterStore::save  one record per (subject, condition, band)
//!
//! any recording of that subject
//!   │
//!   └─ replay::denoise        500 ms epochs: transform → zero suppressed → inverse
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use ajdc::{
//!     begin_review, denoise, fit, read_signal, resume, CalibrationConfig,
//!     CalibrationWindow, ParameterKey, ParameterStore, ReviewResponse,
//! };
//! use std::path::Path;
//!
//! # fn main() -> ajdc::Result<()> {
//! let calib = read_signal(Path::new("sub-S002/run_2-1.safetensors"))?;
//! let window = CalibrationWindow::from_annotation(&calib, " 16", 5.0, 20.0)?;
//!
//! let cfg = CalibrationConfig::default();
//! let request = begin_review(&window, fit(&window, &cfg)?)?;
//! // … show request.sources / request.spectra / request.topographies() …
//! let params = resume(&request, &ReviewResponse::from_prompt("0", "2"))?;
//!
//! let store = ParameterStore::new("out");
//! store.save(&params, &ParameterKey::new("sub-S002", "_CLEAN_", cfg.band))?;
//!
//! let run = read_signal(Path::new("sub-S002/run_3-1.safetensors"))?;
//! let clean = denoise(&run, &params, &params.suppression_set())?;
//! # let _ = clean;
//! # Ok(())
//! # }
//! ```

pub mod ajd;
pub mod config;
pub mod decomposition;
pub mod epoch;
pub mod error;
pub mod io;
pub mod replay;
pub mod review;
pub mod signal;
pub mod spectral;
pub mod store;
pub mod study;
pub mod suppression;

// ── Crate-root re-exports ─────────────────────────────────────────────────

// config
pub use config::{CalibrationConfig, DenoiseConfig, DimensionalityReduction, FrequencyBand};

// errors
pub use error::{AjdcError, Result};

// signals
pub use signal::{Annotation, CalibrationWindow, RawSignal};

// calibration
pub use decomposition::{fit, DecompositionParameters};
pub use suppression::{parse_indices, SuppressionSet};

// review boundary
pub use review::{
    begin_review, read_review_request, resume, write_review_request, ReviewRequest,
    ReviewResponse,
};

// persistence: parameter records and signal files
pub use io::{read_signal, write_signal, StFile, StWriter};
pub use store::{read_parameters, write_parameters, ParameterKey, ParameterStore};

// replay
pub use replay::{denoise, denoise_with};

// study driver
pub use study::{EntryOutcome, StageReport, StudyConfig, StudyEntry};

/// Fit a decomposition on `window` and prepare it for operator review.
///
/// Shorthand for [`fit`] followed by [`begin_review`].
pub fn calibrate(window: &CalibrationWindow, cfg: &CalibrationConfig) -> Result<ReviewRequest> {
    begin_review(window, fit(window, cfg)?)
}
