//! Continuous multichannel recordings and calibration windows.
//!
//! A [`RawSignal`] is the exchange format between every stage: the sample
//! array plus the metadata (channel layout, sampling rate, reference
//! timestamp, annotations) that must survive transform and replay verbatim.
use chrono::{DateTime, Utc};
use ndarray::{s, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{AjdcError, Result};

/// A labelled time span, in seconds relative to the first sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub onset: f64,
    pub duration: f64,
    pub description: String,
}

impl Annotation {
    pub fn new(onset: f64, duration: f64, description: impl Into<String>) -> Self {
        Self { onset, duration, description: description.into() }
    }
}

/// Continuous recording, `data` is `[C, T]`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSignal {
    pub data: Array2<f64>,
    pub ch_names: Vec<String>,
    pub sfreq: f64,
    /// Wall-clock time of the acquisition start, when known.
    pub meas_date: Option<DateTime<Utc>>,
    /// Index of the first sample relative to the acquisition start.
    pub first_samp: i64,
    pub annotations: Vec<Annotation>,
}

impl RawSignal {
    /// Build a signal with no timestamp and no annotations.
    ///
    /// Fails if the channel names do not match the row count or repeat.
    pub fn new(data: Array2<f64>, ch_names: Vec<String>, sfreq: f64) -> Result<Self> {
        if ch_names.len() != data.nrows() {
            return Err(AjdcError::config(format!(
                "{} channel names for {} data rows",
                ch_names.len(),
                data.nrows()
            )));
        }
        for (i, name) in ch_names.iter().enumerate() {
            if ch_names[..i].contains(name) {
                return Err(AjdcError::config(format!("duplicate channel name {name:?}")));
            }
        }
        if !(sfreq > 0.0) {
            return Err(AjdcError::config(format!("invalid sampling rate {sfreq}")));
        }
        Ok(Self {
            data,
            ch_names,
            sfreq,
            meas_date: None,
            first_samp: 0,
            annotations: Vec::new(),
        })
    }

    pub fn with_annotations(mut self, annotations: Vec<Annotation>) -> Self {
        self.annotations = annotations;
        self
    }

    pub fn with_meas_date(mut self, meas_date: Option<DateTime<Utc>>) -> Self {
        self.meas_date = meas_date;
        self
    }

    pub fn n_channels(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_times(&self) -> usize {
        self.data.ncols()
    }

    /// Duration in seconds (`n_times / sfreq`).
    pub fn duration(&self) -> f64 {
        self.n_times() as f64 / self.sfreq
    }

    /// Same metadata, new samples. Used to attach processed data to the
    /// layout, timestamp and annotations of its source.
    pub fn with_data(&self, data: Array2<f64>) -> Result<Self> {
        if data.nrows() != self.n_channels() {
            return Err(AjdcError::ChannelMismatch {
                expected: format!("{} channels", self.n_channels()),
                found: format!("{} channels", data.nrows()),
            });
        }
        Ok(Self {
            data,
            ch_names: self.ch_names.clone(),
            sfreq: self.sfreq,
            meas_date: self.meas_date,
            first_samp: self.first_samp,
            annotations: self.annotations.clone(),
        })
    }

    /// Keep samples in `[tmin, tmax]` seconds (inclusive, MNE style).
    ///
    /// `first_samp` advances by the number of dropped leading samples.
    /// Annotations are re-timed and those entirely outside the kept span are
    /// removed.
    pub fn crop(&self, tmin: f64, tmax: f64) -> Result<Self> {
        if tmin < 0.0 || tmax < tmin || tmax > self.duration() {
            return Err(AjdcError::config(format!(
                "crop range [{tmin}, {tmax}] s outside recording of {:.3} s",
                self.duration()
            )));
        }
        let start = (tmin * self.sfreq).round() as usize;
        let stop = ((tmax * self.sfreq).round() as usize + 1).min(self.n_times());
        let t0 = start as f64 / self.sfreq;
        let t1 = stop as f64 / self.sfreq;

        let annotations = self
            .annotations
            .iter()
            .filter(|a| a.onset + a.duration >= t0 && a.onset < t1)
            .map(|a| Annotation { onset: a.onset - t0, ..a.clone() })
            .collect();

        Ok(Self {
            data: self.data.slice(s![.., start..stop]).to_owned(),
            ch_names: self.ch_names.clone(),
            sfreq: self.sfreq,
            meas_date: self.meas_date,
            first_samp: self.first_samp + start as i64,
            annotations,
        })
    }

    /// Subtract the per-timepoint mean across channels.
    ///
    /// Matches `raw.set_eeg_reference('average', projection=False)`.
    pub fn average_reference_inplace(&mut self) {
        if let Some(means) = self.data.mean_axis(Axis(0)) {
            for mut row in self.data.rows_mut() {
                row -= &means;
            }
        }
    }

    /// Fail with [`AjdcError::ChannelMismatch`] unless the names and their
    /// order equal `expected`.
    pub fn check_layout(&self, expected: &[String]) -> Result<()> {
        if self.ch_names != expected {
            return Err(AjdcError::ChannelMismatch {
                expected: expected.join(","),
                found: self.ch_names.join(","),
            });
        }
        Ok(())
    }
}

/// The recording segment a decomposition is fitted on.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationWindow {
    pub signal: RawSignal,
}

impl CalibrationWindow {
    /// Use a whole prepared signal as the calibration window.
    pub fn whole(signal: RawSignal) -> Self {
        Self { signal }
    }

    /// Crop `[tmin, tmax]` seconds.
    pub fn from_bounds(signal: &RawSignal, tmin: f64, tmax: f64) -> Result<Self> {
        Ok(Self { signal: signal.crop(tmin, tmax)? })
    }

    /// Crop `duration` seconds starting `offset` seconds after the onset of
    /// the last annotation whose description contains `label`.
    pub fn from_annotation(
        signal: &RawSignal,
        label: &str,
        offset: f64,
        duration: f64,
    ) -> Result<Self> {
        let annot = signal
            .annotations
            .iter()
            .rev()
            .find(|a| a.description.contains(label))
            .ok_or_else(|| {
                AjdcError::config(format!("no annotation matching {label:?} in recording"))
            })?;
        let tmin = annot.onset + offset;
        log::debug!(
            "calibration window from annotation {:?}: [{tmin:.3}, {:.3}] s",
            annot.description,
            tmin + duration
        );
        Self::from_bounds(signal, tmin, tmin + duration)
    }

    pub fn sfreq(&self) -> f64 {
        self.signal.sfreq
    }
}
