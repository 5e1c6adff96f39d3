//! Parameter store: one decomposition record per (subject, condition, band).
//!
//! Records are safetensors files:
//!
//! ```text
//! <root>/parameters/band_<fmin>_<fmax>/<condition>/<subject>.ajdc.safetensors
//!
//!   n_channels       I64 [1]
//!   n_sources        I64 [1]
//!   sampling_rate    F64 [1]
//!   fmin, fmax       I32 [1]
//!   window           F64 [1]    analysis window, seconds
//!   overlap          F64 [1]
//!   forward_filter   F64 [n_sources, n_channels]
//!   backward_filter  F64 [n_channels, n_sources]
//!   blink_indices    I64 [k]
//!   saccade_indices  I64 [m]
//!   __metadata__     ch_names (JSON list), format = "ajdc-parameters/1"
//! ```
//!
//! Saving replaces the whole record atomically; loading never refits.
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::FrequencyBand;
use crate::decomposition::DecompositionParameters;
use crate::error::{AjdcError, Result};
use crate::io::{StFile, StWriter};

pub const PARAMETERS_FORMAT: &str = "ajdc-parameters/1";
const RECORD_SUFFIX: &str = ".ajdc.safetensors";

/// Identifies one calibration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParameterKey {
    pub subject: String,
    pub condition: String,
    pub band: FrequencyBand,
}

impl ParameterKey {
    pub fn new(subject: impl Into<String>, condition: impl Into<String>, band: FrequencyBand) -> Self {
        Self { subject: subject.into(), condition: condition.into(), band }
    }

    fn validate(&self) -> Result<()> {
        for (what, part) in [("subject", &self.subject), ("condition", &self.condition)] {
            if part.is_empty()
                || part == "."
                || part == ".."
                || part.contains(['/', '\\'])
            {
                return Err(AjdcError::config(format!("invalid {what} name {part:?}")));
            }
        }
        Ok(())
    }
}

impl fmt::Display for ParameterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.subject, self.condition, self.band)
    }
}

/// Directory-backed store of [`DecompositionParameters`].
#[derive(Debug, Clone)]
pub struct ParameterStore {
    root: PathBuf,
}

impl ParameterStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding the record for `key`.
    pub fn path_for(&self, key: &ParameterKey) -> PathBuf {
        self.root
            .join("parameters")
            .join(key.band.to_string())
            .join(&key.condition)
            .join(format!("{}{RECORD_SUFFIX}", key.subject))
    }

    pub fn contains(&self, key: &ParameterKey) -> bool {
        self.path_for(key).is_file()
    }

    /// Persist `params` under `key`, replacing any previous record.
    ///
    /// The key's band must be the band the parameters were fitted on.
    pub fn save(&self, params: &DecompositionParameters, key: &ParameterKey) -> Result<PathBuf> {
        key.validate()?;
        if params.band() != key.band {
            return Err(AjdcError::config(format!(
                "parameters fitted on {} cannot be stored under {}",
                params.band(),
                key.band
            )));
        }
        let path = self.path_for(key);
        write_parameters(params, &path)?;
        log::info!("saved decomposition {key} → {}", path.display());
        Ok(path)
    }

    /// Load the record for `key`.
    ///
    /// # Errors
    ///
    /// [`AjdcError::NotFound`] when no calibration exists for `key`.
    pub fn load(&self, key: &ParameterKey) -> Result<DecompositionParameters> {
        key.validate()?;
        let path = self.path_for(key);
        if !path.is_file() {
            return Err(AjdcError::NotFound { path });
        }
        let params = read_parameters(&path)?;
        if params.band() != key.band {
            return Err(AjdcError::format(format!(
                "{} holds parameters for {}",
                path.display(),
                params.band()
            )));
        }
        log::debug!("loaded decomposition {key} from {}", path.display());
        Ok(params)
    }

    /// Subjects with a stored record for `condition` and `band`, sorted.
    pub fn subjects(&self, condition: &str, band: FrequencyBand) -> Result<Vec<String>> {
        let dir = self.root.join("parameters").join(band.to_string()).join(condition);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let name = entry?.file_name();
            if let Some(subject) = name.to_str().and_then(|n| n.strip_suffix(RECORD_SUFFIX)) {
                out.push(subject.to_string());
            }
        }
        out.sort();
        Ok(out)
    }
}

/// Write one record to `path`.
pub fn write_parameters(params: &DecompositionParameters, path: &Path) -> Result<()> {
    let mut w = StWriter::new();
    encode_record(&mut w, params)?;
    w.set_metadata("format", PARAMETERS_FORMAT);
    w.write(path)
}

/// Read one record from `path`.
pub fn read_parameters(path: &Path) -> Result<DecompositionParameters> {
    if !path.is_file() {
        return Err(AjdcError::NotFound { path: path.to_path_buf() });
    }
    let st = StFile::load(path)?;
    match st.metadata("format") {
        Some(PARAMETERS_FORMAT) | None => decode_record(&st),
        Some(other) => Err(AjdcError::format(format!(
            "{} is a {other:?} file, not {PARAMETERS_FORMAT:?}",
            path.display()
        ))),
    }
}

/// Add the record tensors and `ch_names` metadata to `w`.
pub(crate) fn encode_record(w: &mut StWriter, params: &DecompositionParameters) -> Result<()> {
    let band = params.band();
    w.add_i64("n_channels", &[params.n_channels() as i64], &[1]);
    w.add_i64("n_sources", &[params.n_sources() as i64], &[1]);
    w.add_f64("sampling_rate", &[params.sfreq()], &[1]);
    w.add_i32("fmin", &[band.fmin as i32], &[1]);
    w.add_i32("fmax", &[band.fmax as i32], &[1]);
    w.add_f64("window", &[params.window_length()], &[1]);
    w.add_f64("overlap", &[params.overlap()], &[1]);
    w.add_f64_arr2("forward_filter", params.forward_filter());
    w.add_f64_arr2("backward_filter", params.backward_filter());
    let blink: Vec<i64> = params.blink_indices().iter().map(|&i| i as i64).collect();
    let saccade: Vec<i64> = params.saccade_indices().iter().map(|&i| i as i64).collect();
    w.add_i64("blink_indices", &blink, &[blink.len()]);
    w.add_i64("saccade_indices", &saccade, &[saccade.len()]);
    w.set_metadata("ch_names", serde_json::to_string(params.ch_names())?);
    Ok(())
}

/// Inverse of [`encode_record`].
pub(crate) fn decode_record(st: &StFile) -> Result<DecompositionParameters> {
    let ch_names: Vec<String> = serde_json::from_str(
        st.metadata("ch_names")
            .ok_or_else(|| AjdcError::format("record has no channel names"))?,
    )?;
    let n_channels = st.scalar_i64("n_channels")?;
    let n_sources = st.scalar_i64("n_sources")?;
    if n_channels != ch_names.len() as i64 {
        return Err(AjdcError::format(format!(
            "record declares {n_channels} channels but names {}",
            ch_names.len()
        )));
    }

    let forward = st.array2("forward_filter")?;
    if forward.nrows() as i64 != n_sources {
        return Err(AjdcError::format(format!(
            "record declares {n_sources} sources, forward filter has {}",
            forward.nrows()
        )));
    }
    let band = FrequencyBand::new(to_u32(st.scalar_i64("fmin")?)?, to_u32(st.scalar_i64("fmax")?)?);

    DecompositionParameters::new(
        ch_names,
        st.scalar_f64("sampling_rate")?,
        band,
        st.scalar_f64("window")?,
        st.scalar_f64("overlap")?,
        forward,
        st.array2("backward_filter")?,
        index_set(st, "blink_indices")?,
        index_set(st, "saccade_indices")?,
    )
}

fn index_set(st: &StFile, name: &str) -> Result<BTreeSet<usize>> {
    st.i64s(name)?
        .into_iter()
        .map(|i| {
            usize::try_from(i).map_err(|_| AjdcError::format(format!("negative index {i} in {name}")))
        })
        .collect()
}

fn to_u32(v: i64) -> Result<u32> {
    u32::try_from(v).map_err(|_| AjdcError::format(format!("frequency {v} out of range")))
}
