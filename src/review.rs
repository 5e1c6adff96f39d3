//! Operator review boundary.
//!
//! Calibration stops after the fit and emits a [`ReviewRequest`] holding
//! everything an operator needs to label sources (waveforms on the
//! calibration window, band-limited spectra, topographies).  Whoever renders
//! it answers with a [`ReviewResponse`]; [`resume`] turns the pair into the
//! final [`DecompositionParameters`].  The request can be written to disk so
//! the answer may arrive in a later, independent process.
use ndarray::Array2;
use std::path::Path;

use crate::decomposition::DecompositionParameters;
use crate::error::{AjdcError, Result};
use crate::io::{StFile, StWriter};
use crate::signal::{Annotation, CalibrationWindow, RawSignal};
use crate::spectral::normalized_band_spectrum;
use crate::store::{decode_record, encode_record};
use crate::suppression::{parse_indices, SuppressionSet};

pub const REVIEW_FORMAT: &str = "ajdc-review/1";

/// Source data shown to the operator.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewRequest {
    /// Fitted decomposition, no selection yet.
    pub decomposition: DecompositionParameters,
    /// `[n_sources, T]` calibration window in source space, named `S00..`,
    /// with the window's timestamp and annotations.
    pub sources: RawSignal,
    /// Frequencies of `spectra`, within the decomposition band.
    pub freqs: Vec<f64>,
    /// `[n_sources, n_freqs]` L2-normalised Welch spectra.
    pub spectra: Array2<f64>,
}

impl ReviewRequest {
    /// `[n_channels, n_sources]` scalp pattern of every source.
    pub fn topographies(&self) -> &Array2<f64> {
        self.decomposition.backward_filter()
    }

    /// The calibration window reconstructed with `params`' selection
    /// removed, carrying the window's metadata.
    pub fn corrected_calibration(&self, params: &DecompositionParameters) -> Result<RawSignal> {
        let data = params.inverse_transform(self.sources.data.view(), &params.suppression_set())?;
        let mut out = RawSignal::new(data, params.ch_names().to_vec(), self.sources.sfreq)?;
        out.meas_date = self.sources.meas_date;
        out.first_samp = self.sources.first_samp;
        out.annotations = self.sources.annotations.clone();
        Ok(out)
    }
}

/// The operator's answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewResponse {
    pub blink: Vec<usize>,
    pub saccade: Vec<usize>,
}

impl ReviewResponse {
    /// Parse the two prompt answers; see [`parse_indices`].
    pub fn from_prompt(blink: &str, saccade: &str) -> Self {
        Self { blink: parse_indices(blink), saccade: parse_indices(saccade) }
    }

    pub fn suppression_set(&self) -> SuppressionSet {
        SuppressionSet::from_selections(&self.blink, &self.saccade)
    }
}

/// Build the review request for a fitted decomposition.
pub fn begin_review(
    window: &CalibrationWindow,
    decomposition: DecompositionParameters,
) -> Result<ReviewRequest> {
    let signal = &window.signal;
    let data = decomposition.transform_signal(signal)?;

    let band = decomposition.band();
    let spectra: Vec<(Vec<f64>, Vec<f64>)> = data
        .rows()
        .into_iter()
        .map(|row| normalized_band_spectrum(&row.to_vec(), signal.sfreq, band))
        .collect();
    let freqs = spectra.first().map(|(f, _)| f.clone()).unwrap_or_default();
    let n_freqs = freqs.len();
    let flat: Vec<f64> = spectra.into_iter().flat_map(|(_, p)| p).collect();
    let spectra = Array2::from_shape_vec((decomposition.n_sources(), n_freqs), flat)?;

    let mut sources = RawSignal::new(data, decomposition.source_names(), signal.sfreq)?;
    sources.meas_date = signal.meas_date;
    sources.first_samp = signal.first_samp;
    sources.annotations = signal.annotations.clone();

    log::info!(
        "review requested for {} sources over {:.1} s",
        decomposition.n_sources(),
        signal.duration()
    );
    Ok(ReviewRequest { decomposition, sources, freqs, spectra })
}

/// Attach the operator's selection.
///
/// # Errors
///
/// [`AjdcError::Index`] when the answer names a source that does not exist.
pub fn resume(request: &ReviewRequest, response: &ReviewResponse) -> Result<DecompositionParameters> {
    let params = request
        .decomposition
        .with_selection(&response.blink, &response.saccade)?;
    log::info!(
        "review resumed: blink {:?}, saccade {:?}",
        params.blink_indices(),
        params.saccade_indices()
    );
    Ok(params)
}

pub fn write_review_request(request: &ReviewRequest, path: &Path) -> Result<()> {
    let mut w = StWriter::new();
    encode_record(&mut w, &request.decomposition)?;
    w.add_f64_arr2("sources", &request.sources.data);
    w.add_f64("freqs", &request.freqs, &[request.freqs.len()]);
    w.add_f64_arr2("spectra", &request.spectra);
    w.set_metadata("format", REVIEW_FORMAT);
    w.set_metadata("first_samp", request.sources.first_samp.to_string());
    w.set_metadata("annotations", serde_json::to_string(&request.sources.annotations)?);
    if let Some(date) = request.sources.meas_date {
        w.set_metadata("meas_date", date.to_rfc3339());
    }
    w.write(path)
}

pub fn read_review_request(path: &Path) -> Result<ReviewRequest> {
    if !path.is_file() {
        return Err(AjdcError::NotFound { path: path.to_path_buf() });
    }
    let st = StFile::load(path)?;
    if st.metadata("format") != Some(REVIEW_FORMAT) {
        return Err(AjdcError::format(format!("{} is not a review request", path.display())));
    }
    let decomposition = decode_record(&st)?;

    let mut sources = RawSignal::new(
        st.array2("sources")?,
        decomposition.source_names(),
        decomposition.sfreq(),
    )?;
    if let Some(first) = st.metadata("first_samp") {
        sources.first_samp = first
            .parse()
            .map_err(|e| AjdcError::format(format!("first_samp {first:?}: {e}")))?;
    }
    if let Some(json) = st.metadata("annotations") {
        sources.annotations = serde_json::from_str::<Vec<Annotation>>(json)?;
    }
    if let Some(date) = st.metadata("meas_date") {
        let parsed = chrono::DateTime::parse_from_rfc3339(date)
            .map_err(|e| AjdcError::format(format!("meas_date {date:?}: {e}")))?;
        sources.meas_date = Some(parsed.into());
    }

    Ok(ReviewRequest {
        decomposition,
        sources,
        freqs: st.f64s("freqs")?,
        spectra: st.array2("spectra")?,
    })
}
