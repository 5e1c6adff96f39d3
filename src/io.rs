//! Safetensors I/O for signals, review requests and parameter records.
//!
//! A small self-contained reader/writer: 8-byte little-endian header length,
//! a JSON header (`dtype`, `shape`, `data_offsets` per tensor plus an
//! optional `__metadata__` string map), then the raw little-endian tensor
//! bytes.  Supported dtypes: `F64`, `F32`, `I64`, `I32`, `U8`.
use chrono::DateTime;
use ndarray::Array2;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::error::{AjdcError, Result};
use crate::signal::{Annotation, RawSignal};

const METADATA_KEY: &str = "__metadata__";

// ── Reader ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Entry {
    dtype: String,
    shape: Vec<usize>,
    start: usize,
    end: usize,
}

/// A parsed safetensors buffer.
#[derive(Debug)]
pub struct StFile {
    bytes: Vec<u8>,
    data_start: usize,
    entries: HashMap<String, Entry>,
    metadata: HashMap<String, String>,
}

impl StFile {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(AjdcError::format("safetensors file too small"));
        }
        let mut len = [0u8; 8];
        len.copy_from_slice(&bytes[..8]);
        let data_start = usize::try_from(u64::from_le_bytes(len))
            .ok()
            .and_then(|n| n.checked_add(8))
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| AjdcError::format("safetensors header truncated"))?;
        let header: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(&bytes[8..data_start])?;

        let mut entries = HashMap::new();
        let mut metadata = HashMap::new();
        for (key, val) in header {
            if key == METADATA_KEY {
                metadata = serde_json::from_value(val)?;
                continue;
            }
            let entry = parse_entry(&key, &val)?;
            let in_bounds = data_start
                .checked_add(entry.end)
                .is_some_and(|end| end <= bytes.len() && entry.start <= entry.end);
            if !in_bounds {
                return Err(AjdcError::format(format!("tensor {key:?} out of bounds")));
            }
            if let Some(width) = dtype_width(&entry.dtype) {
                let expected = entry
                    .shape
                    .iter()
                    .try_fold(width, |acc, &d| acc.checked_mul(d));
                if expected != Some(entry.end - entry.start) {
                    return Err(AjdcError::format(format!(
                        "tensor {key:?}: {} bytes do not hold {} of shape {:?}",
                        entry.end - entry.start,
                        entry.dtype,
                        entry.shape
                    )));
                }
            }
            entries.insert(key, entry);
        }
        Ok(Self { bytes, data_start, entries, metadata })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn shape(&self, name: &str) -> Result<&[usize]> {
        Ok(&self.entry(name)?.shape)
    }

    /// Tensor values widened to `f64` (accepts `F32` and `F64`).
    pub fn f64s(&self, name: &str) -> Result<Vec<f64>> {
        let entry = self.entry(name)?;
        let raw = self.raw(entry);
        match entry.dtype.as_str() {
            "F64" => Ok(raw
                .chunks_exact(8)
                .map(|b| f64::from_le_bytes(le8(b)))
                .collect()),
            "F32" => Ok(raw
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64)
                .collect()),
            other => Err(dtype_error(name, other, "float")),
        }
    }

    /// Tensor values widened to `i64` (accepts `I32` and `I64`).
    pub fn i64s(&self, name: &str) -> Result<Vec<i64>> {
        let entry = self.entry(name)?;
        let raw = self.raw(entry);
        match entry.dtype.as_str() {
            "I64" => Ok(raw
                .chunks_exact(8)
                .map(|b| i64::from_le_bytes(le8(b)))
                .collect()),
            "I32" => Ok(raw
                .chunks_exact(4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as i64)
                .collect()),
            other => Err(dtype_error(name, other, "integer")),
        }
    }

    pub fn bytes_of(&self, name: &str) -> Result<&[u8]> {
        let entry = self.entry(name)?;
        match entry.dtype.as_str() {
            "U8" => Ok(self.raw(entry)),
            other => Err(dtype_error(name, other, "U8")),
        }
    }

    pub fn scalar_f64(&self, name: &str) -> Result<f64> {
        self.f64s(name)?
            .first()
            .copied()
            .ok_or_else(|| AjdcError::format(format!("tensor {name:?} is empty")))
    }

    pub fn scalar_i64(&self, name: &str) -> Result<i64> {
        self.i64s(name)?
            .first()
            .copied()
            .ok_or_else(|| AjdcError::format(format!("tensor {name:?} is empty")))
    }

    /// Two-dimensional float tensor as an `Array2<f64>`.
    pub fn array2(&self, name: &str) -> Result<Array2<f64>> {
        let shape = self.shape(name)?.to_vec();
        if shape.len() != 2 {
            return Err(AjdcError::format(format!(
                "tensor {name:?} has shape {shape:?}, expected 2-D"
            )));
        }
        Ok(Array2::from_shape_vec((shape[0], shape[1]), self.f64s(name)?)?)
    }

    fn entry(&self, name: &str) -> Result<&Entry> {
        self.entries
            .get(name)
            .ok_or_else(|| AjdcError::format(format!("missing tensor {name:?}")))
    }

    fn raw(&self, entry: &Entry) -> &[u8] {
        &self.bytes[self.data_start + entry.start..self.data_start + entry.end]
    }
}

fn parse_entry(key: &str, val: &serde_json::Value) -> Result<Entry> {
    let bad = || AjdcError::format(format!("malformed header entry {key:?}"));
    let dtype = val["dtype"].as_str().ok_or_else(bad)?.to_string();
    let shape = val["shape"]
        .as_array()
        .ok_or_else(bad)?
        .iter()
        .map(|v| v.as_u64().map(|d| d as usize).ok_or_else(bad))
        .collect::<Result<Vec<_>>>()?;
    let offsets = val["data_offsets"].as_array().ok_or_else(bad)?;
    if offsets.len() != 2 {
        return Err(bad());
    }
    let start = offsets[0].as_u64().ok_or_else(bad)? as usize;
    let end = offsets[1].as_u64().ok_or_else(bad)? as usize;
    Ok(Entry { dtype, shape, start, end })
}

/// Bytes per element, `None` for dtypes this reader never decodes.
fn dtype_width(dtype: &str) -> Option<usize> {
    match dtype {
        "F64" | "I64" => Some(8),
        "F32" | "I32" => Some(4),
        "U8" => Some(1),
        _ => None,
    }
}

fn le8(b: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(b);
    out
}

fn dtype_error(name: &str, found: &str, wanted: &str) -> AjdcError {
    AjdcError::format(format!("tensor {name:?} has dtype {found}, expected {wanted}"))
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Safetensors writer for F64, I64, I32 and U8 tensors plus string metadata.
///
/// ```rust,no_run
/// use ajdc::io::StWriter;
/// use std::path::Path;
/// let mut w = StWriter::new();
/// w.add_f64("signal", &[1.0, 2.0, 3.0], &[1, 3]);
/// w.add_i64("n_sources", &[3], &[1]);
/// w.set_metadata("format", "example");
/// w.write(Path::new("/tmp/out.safetensors")).unwrap();
/// ```
#[derive(Debug, Default)]
pub struct StWriter {
    entries: Vec<(String, Vec<u8>, &'static str, Vec<usize>)>,
    metadata: BTreeMap<String, String>,
}

impl StWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_f64(&mut self, name: &str, data: &[f64], shape: &[usize]) {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.entries.push((name.to_string(), bytes, "F64", shape.to_vec()));
    }

    /// Row-major copy of a 2-D array.
    pub fn add_f64_arr2(&mut self, name: &str, arr: &Array2<f64>) {
        let data: Vec<f64> = arr.iter().copied().collect();
        self.add_f64(name, &data, &[arr.nrows(), arr.ncols()]);
    }

    pub fn add_i64(&mut self, name: &str, data: &[i64], shape: &[usize]) {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.entries.push((name.to_string(), bytes, "I64", shape.to_vec()));
    }

    pub fn add_i32(&mut self, name: &str, data: &[i32], shape: &[usize]) {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.entries.push((name.to_string(), bytes, "I32", shape.to_vec()));
    }

    pub fn add_u8(&mut self, name: &str, data: &[u8]) {
        self.entries.push((name.to_string(), data.to_vec(), "U8", vec![data.len()]));
    }

    pub fn set_metadata(&mut self, key: &str, value: impl Into<String>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut header_map = serde_json::Map::new();
        if !self.metadata.is_empty() {
            header_map.insert(METADATA_KEY.to_string(), serde_json::to_value(&self.metadata)?);
        }
        let mut offset: usize = 0;
        for (name, data, dtype, shape) in &self.entries {
            header_map.insert(name.clone(), serde_json::json!({
                "dtype": dtype,
                "shape": shape,
                "data_offsets": [offset, offset + data.len()],
            }));
            offset += data.len();
        }
        let hdr_bytes = serde_json::to_vec(&header_map)?;
        let pad = (8 - hdr_bytes.len() % 8) % 8;

        let mut out = Vec::with_capacity(8 + hdr_bytes.len() + pad + offset);
        out.extend_from_slice(&((hdr_bytes.len() + pad) as u64).to_le_bytes());
        out.extend_from_slice(&hdr_bytes);
        out.extend(std::iter::repeat(b' ').take(pad));
        for (_, data, _, _) in &self.entries {
            out.extend_from_slice(data);
        }
        Ok(out)
    }

    /// Write to `path` through a sibling temporary file and a rename, so
    /// readers never observe a partially written file.
    pub fn write(&self, path: &Path) -> Result<()> {
        let bytes = self.to_bytes()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".partial");
        let tmp = std::path::PathBuf::from(tmp);
        std::fs::write(&tmp, &bytes)?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }
}

// ── Signals ───────────────────────────────────────────────────────────────────

/// Read a recording.
///
/// Accepts the upstream `raw.safetensors` layout (`data` F32 `[C, T]`,
/// `sfreq`, newline-joined `ch_names` U8 blob) as well as files written by
/// [`write_signal`], which keep names, timestamp, `first_samp` and
/// annotations in the metadata.  Channels without names are called
/// `CH000`, `CH001`, ...
pub fn read_signal(path: &Path) -> Result<RawSignal> {
    let st = StFile::load(path)?;
    let data = st.array2("data")?;
    let sfreq = st.scalar_f64("sfreq")?;

    let ch_names: Vec<String> = if let Some(json) = st.metadata("ch_names") {
        serde_json::from_str(json)?
    } else if st.contains("ch_names") {
        std::str::from_utf8(st.bytes_of("ch_names")?)
            .map_err(|e| AjdcError::format(format!("ch_names: {e}")))?
            .split('\n')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    } else {
        (0..data.nrows()).map(|i| format!("CH{i:03}")).collect()
    };

    let mut signal = RawSignal::new(data, ch_names, sfreq)?;
    if let Some(date) = st.metadata("meas_date") {
        let parsed = DateTime::parse_from_rfc3339(date)
            .map_err(|e| AjdcError::format(format!("meas_date {date:?}: {e}")))?;
        signal.meas_date = Some(parsed.into());
    }
    if let Some(first) = st.metadata("first_samp") {
        signal.first_samp = first
            .parse()
            .map_err(|e| AjdcError::format(format!("first_samp {first:?}: {e}")))?;
    }
    if let Some(json) = st.metadata("annotations") {
        signal.annotations = serde_json::from_str::<Vec<Annotation>>(json)?;
    }
    Ok(signal)
}

/// Write a recording as F64 samples with its full metadata.
pub fn write_signal(signal: &RawSignal, path: &Path) -> Result<()> {
    let mut w = StWriter::new();
    w.add_f64_arr2("data", &signal.data);
    w.add_f64("sfreq", &[signal.sfreq], &[1]);
    w.set_metadata("ch_names", serde_json::to_string(&signal.ch_names)?);
    w.set_metadata("first_samp", signal.first_samp.to_string());
    w.set_metadata("annotations", serde_json::to_string(&signal.annotations)?);
    if let Some(date) = signal.meas_date {
        w.set_metadata("meas_date", date.to_rfc3339());
    }
    w.write(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn mixed_dtypes_read_back() {
        let mut w = StWriter::new();
        w.add_f64("m", &[1.5, -2.25, 3.0, 4.0], &[2, 2]);
        w.add_i32("k", &[7], &[1]);
        w.add_i64("idx", &[], &[0]);
        w.set_metadata("format", "test/1");
        let st = StFile::from_bytes(w.to_bytes().unwrap()).unwrap();

        assert_eq!(st.array2("m").unwrap()[[1, 0]], 3.0);
        assert_eq!(st.scalar_i64("k").unwrap(), 7);
        assert!(st.i64s("idx").unwrap().is_empty());
        assert_eq!(st.metadata("format"), Some("test/1"));
    }

    #[test]
    fn wrong_dtype_is_format_error() {
        let mut w = StWriter::new();
        w.add_i32("k", &[7], &[1]);
        let st = StFile::from_bytes(w.to_bytes().unwrap()).unwrap();
        assert!(matches!(st.f64s("k"), Err(AjdcError::Format(_))));
        assert!(matches!(st.f64s("absent"), Err(AjdcError::Format(_))));
    }

    #[test]
    fn truncated_file_rejected() {
        assert!(StFile::from_bytes(vec![1, 2, 3]).is_err());
        let mut bytes = (1000u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(b"{}");
        assert!(StFile::from_bytes(bytes).is_err());
    }

    fn raw_file(header: &str, payload: &[u8]) -> Vec<u8> {
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn huge_header_length_is_format_error() {
        let mut bytes = u64::MAX.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"{}");
        assert!(matches!(StFile::from_bytes(bytes), Err(AjdcError::Format(_))));
    }

    #[test]
    fn overflowing_offsets_are_format_error() {
        let header = format!(r#"{{"t":{{"dtype":"F64","shape":[1],"data_offsets":[0,{}]}}}}"#, u64::MAX);
        let r = StFile::from_bytes(raw_file(&header, &[0; 8]));
        assert!(matches!(r, Err(AjdcError::Format(_))));
    }

    #[test]
    fn byte_count_must_match_shape() {
        let header = r#"{"t":{"dtype":"F64","shape":[2],"data_offsets":[0,8]}}"#;
        let r = StFile::from_bytes(raw_file(header, &[0; 8]));
        assert!(matches!(r, Err(AjdcError::Format(_))));

        let header = r#"{"t":{"dtype":"F64","shape":[1],"data_offsets":[0,8]}}"#;
        let st = StFile::from_bytes(raw_file(header, &1.5f64.to_le_bytes())).unwrap();
        assert_eq!(st.scalar_f64("t").unwrap(), 1.5);
    }

    #[test]
    fn signal_metadata_survives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sig.safetensors");
        let data = Array2::from_shape_fn((2, 5), |(c, t)| c as f64 + 0.1 * t as f64);
        let mut sig = RawSignal::new(data, vec!["Fp1".into(), "Fp2".into()], 500.0)
            .unwrap()
            .with_annotations(vec![Annotation::new(0.002, 0.0, "Stimulus/S 16")])
            .with_meas_date(Some(chrono::Utc.with_ymd_and_hms(2024, 6, 3, 9, 30, 0).unwrap()));
        sig.first_samp = 1234;

        write_signal(&sig, &path).unwrap();
        let back = read_signal(&path).unwrap();
        assert_eq!(back, sig);
    }

    #[test]
    fn upstream_layout_with_name_blob() {
        let mut w = StWriter::new();
        let data: Vec<f64> = (0..6).map(|v| v as f64).collect();
        w.add_f64("data", &data, &[3, 2]);
        w.add_f64("sfreq", &[256.0], &[1]);
        w.add_u8("ch_names", b"Fp1\nFp2\nFz\n");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.safetensors");
        w.write(&path).unwrap();

        let sig = read_signal(&path).unwrap();
        assert_eq!(sig.ch_names, vec!["Fp1", "Fp2", "Fz"]);
        assert_eq!(sig.sfreq, 256.0);
        assert!(sig.annotations.is_empty());
    }
}
