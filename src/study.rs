//! Batch driver over a declarative subject × condition table.
//!
//! A study is described by a JSON [`StudyConfig`].  [`StudyConfig::plan`]
//! expands it into ordered [`StudyEntry`] rows, and each stage walks the
//! plan with the same loop: a failing entry is logged and reported in the
//! [`StageReport`], never aborting the rest of the batch.
//!
//! ```text
//! <raw_data>/<subject>/*<calibration_file>*<extension>
//!   │
//!   ├─ run_calibration   fit → <output>/review/<band>/<condition>/<subject>.review.safetensors
//!   ├─ run_review        operator answer → <output>/parameters/<band>/<condition>/<subject>.ajdc.safetensors
//!   └─ run_denoising     every <raw_data>/<subject>/*<extension>
//!                          → <output>/denoised/<band>/<condition>/<subject>/<stem>_denoised.safetensors
//! ```
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::{CalibrationConfig, DenoiseConfig, FrequencyBand};
use crate::decomposition::fit;
use crate::io::{read_signal, write_signal};
use crate::replay::denoise_with;
use crate::review::{begin_review, read_review_request, resume, write_review_request, ReviewRequest, ReviewResponse};
use crate::signal::{CalibrationWindow, RawSignal};
use crate::store::{ParameterKey, ParameterStore};

/// How the calibration window is cut out of the calibration recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WindowSelection {
    /// `duration` seconds starting `offset` seconds after the last
    /// annotation whose description contains `label`.
    Annotation { label: String, offset: f64, duration: f64 },
    /// Fixed `[tmin, tmax]` seconds.
    Bounds { tmin: f64, tmax: f64 },
    /// The whole recording.
    Whole,
}

impl WindowSelection {
    pub fn select(&self, signal: &RawSignal) -> crate::Result<CalibrationWindow> {
        match self {
            Self::Annotation { label, offset, duration } => {
                CalibrationWindow::from_annotation(signal, label, *offset, *duration)
            }
            Self::Bounds { tmin, tmax } => CalibrationWindow::from_bounds(signal, *tmin, *tmax),
            Self::Whole => Ok(CalibrationWindow::whole(signal.clone())),
        }
    }
}

/// One experimental condition with its own calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub name: String,
    pub window: WindowSelection,
}

/// Study description.
///
/// ```json
/// {
///   "raw_data": "/data/betapark/raw",
///   "output": "/data/betapark/ajdc",
///   "calibration_file": "2-1",
///   "subjects": ["sub-S002", "sub-S003"],
///   "unavailable": ["sub-S009"],
///   "conditions": [
///     { "name": "_HAND_OBSERVATION_",
///       "window": { "kind": "annotation", "label": " 16", "offset": 5.0, "duration": 20.0 } },
///     { "name": "_CLEAN_", "window": { "kind": "bounds", "tmin": 12.0, "tmax": 42.0 } }
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyConfig {
    /// Directory holding one sub-directory of recordings per subject.
    pub raw_data: PathBuf,
    /// Root of every file the study writes.
    pub output: PathBuf,
    /// Substring identifying the calibration recording of a subject.
    pub calibration_file: String,
    /// Suffix of recording files.
    #[serde(default = "default_extension")]
    pub extension: String,
    pub subjects: Vec<String>,
    pub conditions: Vec<Condition>,
    /// Subjects listed in `subjects` whose data is missing; planned as skips.
    #[serde(default)]
    pub unavailable: Vec<String>,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub denoise: DenoiseConfig,
    /// Re-reference every recording to the channel average before replay.
    #[serde(default = "default_true")]
    pub average_reference: bool,
    /// Write the corrected calibration window next to the review request
    /// once the operator has answered.
    #[serde(default)]
    pub save_corrected_calibration: bool,
}

fn default_extension() -> String {
    ".safetensors".into()
}

fn default_true() -> bool {
    true
}

/// What the driver does with one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Process,
    Skip(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudyEntry {
    pub subject: String,
    pub condition: String,
    pub action: Action,
}

impl fmt::Display for StudyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.subject, self.condition)
    }
}

/// Result of one row of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    /// Files written.
    Done(Vec<PathBuf>),
    Skipped(String),
    Failed(String),
}

/// Outcomes of one stage, in plan order.
#[derive(Debug, Clone, Default)]
pub struct StageReport {
    pub rows: Vec<(StudyEntry, EntryOutcome)>,
}

impl StageReport {
    pub fn done(&self) -> usize {
        self.rows.iter().filter(|(_, o)| matches!(o, EntryOutcome::Done(_))).count()
    }

    pub fn skipped(&self) -> usize {
        self.rows.iter().filter(|(_, o)| matches!(o, EntryOutcome::Skipped(_))).count()
    }

    pub fn failed(&self) -> usize {
        self.rows.iter().filter(|(_, o)| matches!(o, EntryOutcome::Failed(_))).count()
    }
}

impl StudyConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading study config {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing study config {}", path.display()))?;
        Ok(cfg)
    }

    pub fn band(&self) -> FrequencyBand {
        self.calibration.band
    }

    pub fn store(&self) -> ParameterStore {
        ParameterStore::new(&self.output)
    }

    /// Rows in condition-major order.
    pub fn plan(&self) -> Vec<StudyEntry> {
        let mut rows = Vec::with_capacity(self.conditions.len() * self.subjects.len());
        for condition in &self.conditions {
            for subject in &self.subjects {
                let action = if self.unavailable.contains(subject) {
                    Action::Skip("data not available".into())
                } else {
                    Action::Process
                };
                rows.push(StudyEntry {
                    subject: subject.clone(),
                    condition: condition.name.clone(),
                    action,
                });
            }
        }
        rows
    }

    pub fn condition(&self, name: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.name == name)
    }

    pub fn key(&self, entry: &StudyEntry) -> ParameterKey {
        ParameterKey::new(&entry.subject, &entry.condition, self.band())
    }

    pub fn subject_dir(&self, subject: &str) -> PathBuf {
        self.raw_data.join(subject)
    }

    pub fn review_path(&self, entry: &StudyEntry) -> PathBuf {
        self.output
            .join("review")
            .join(self.band().to_string())
            .join(&entry.condition)
            .join(format!("{}.review.safetensors", entry.subject))
    }

    pub fn corrected_calibration_path(&self, entry: &StudyEntry) -> PathBuf {
        self.output
            .join("review")
            .join(self.band().to_string())
            .join(&entry.condition)
            .join(format!("{}.corrected.safetensors", entry.subject))
    }

    pub fn denoised_path(&self, entry: &StudyEntry, recording: &Path) -> PathBuf {
        let stem = file_stem(recording, &self.extension);
        self.output
            .join("denoised")
            .join(self.band().to_string())
            .join(&entry.condition)
            .join(&entry.subject)
            .join(format!("{stem}_denoised.safetensors"))
    }

    /// Recordings of `subject`, sorted by file name.
    pub fn recordings(&self, subject: &str) -> anyhow::Result<Vec<PathBuf>> {
        let dir = self.subject_dir(subject);
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("listing recordings in {}", dir.display()))?
        {
            let path = entry?.path();
            let is_recording = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(&self.extension) && !n.contains("_denoised"));
            if is_recording && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// The calibration recording of `subject`.
    pub fn calibration_recording(&self, subject: &str) -> anyhow::Result<PathBuf> {
        self.recordings(subject)?
            .into_iter()
            .find(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.contains(&self.calibration_file))
            })
            .with_context(|| {
                format!(
                    "no recording matching {:?} in {}",
                    self.calibration_file,
                    self.subject_dir(subject).display()
                )
            })
    }
}

/// File name without directory and recording extension.
fn file_stem(path: &Path, extension: &str) -> String {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    name.strip_suffix(extension).unwrap_or(name).to_string()
}

/// Walk the plan, isolating every row's failure.
fn drive<F>(study: &StudyConfig, stage: &str, mut step: F) -> StageReport
where
    F: FnMut(&StudyEntry) -> anyhow::Result<EntryOutcome>,
{
    let mut report = StageReport::default();
    for entry in study.plan() {
        let outcome = match &entry.action {
            Action::Skip(reason) => {
                log::info!("{stage} {entry}: skipped, {reason}");
                EntryOutcome::Skipped(reason.clone())
            }
            Action::Process => match step(&entry) {
                Ok(outcome) => {
                    if let EntryOutcome::Done(files) = &outcome {
                        log::info!("{stage} {entry}: {} file(s) written", files.len());
                    }
                    outcome
                }
                Err(e) => {
                    log::warn!("{stage} {entry}: {e:#}");
                    EntryOutcome::Failed(format!("{e:#}"))
                }
            },
        };
        report.rows.push((entry, outcome));
    }
    log::info!(
        "{stage}: {} done, {} skipped, {} failed",
        report.done(),
        report.skipped(),
        report.failed()
    );
    report
}

/// Fit every planned entry and write its review request.
pub fn run_calibration(study: &StudyConfig) -> StageReport {
    drive(study, "calibration", |entry| calibrate_entry(study, entry))
}

fn calibrate_entry(study: &StudyConfig, entry: &StudyEntry) -> anyhow::Result<EntryOutcome> {
    let condition = study
        .condition(&entry.condition)
        .with_context(|| format!("unknown condition {}", entry.condition))?;
    let path = study.calibration_recording(&entry.subject)?;
    let signal = read_signal(&path).with_context(|| format!("reading {}", path.display()))?;
    let window = condition
        .window
        .select(&signal)
        .with_context(|| format!("selecting calibration window in {}", path.display()))?;
    let decomposition = fit(&window, &study.calibration)?;
    let request = begin_review(&window, decomposition)?;

    let out = study.review_path(entry);
    write_review_request(&request, &out)?;
    Ok(EntryOutcome::Done(vec![out]))
}

/// Resume every pending review with `answer` and store the final parameters.
///
/// `answer` is called once per entry that has a review request; it may
/// prompt an operator or look the answer up elsewhere.
pub fn run_review<F>(study: &StudyConfig, mut answer: F) -> StageReport
where
    F: FnMut(&StudyEntry, &ReviewRequest) -> anyhow::Result<ReviewResponse>,
{
    let store = study.store();
    drive(study, "review", |entry| {
        let path = study.review_path(entry);
        if !path.is_file() {
            bail!("no review request at {}, run calibration first", path.display());
        }
        let request = read_review_request(&path)?;
        let response = answer(entry, &request)?;
        let params = resume(&request, &response)?;

        let mut written = vec![store.save(&params, &study.key(entry))?];
        if study.save_corrected_calibration {
            let corrected = request.corrected_calibration(&params)?;
            let out = study.corrected_calibration_path(entry);
            write_signal(&corrected, &out)?;
            written.push(out);
        }
        Ok(EntryOutcome::Done(written))
    })
}

/// Denoise every recording of every planned entry with its stored parameters.
pub fn run_denoising(study: &StudyConfig) -> StageReport {
    let store = study.store();
    drive(study, "denoising", |entry| {
        let params = store.load(&study.key(entry))?;
        let suppression = params.suppression_set();
        let recordings = study.recordings(&entry.subject)?;
        if recordings.is_empty() {
            return Ok(EntryOutcome::Skipped("no recordings".into()));
        }

        let mut written = Vec::with_capacity(recordings.len());
        for path in recordings {
            let mut signal =
                read_signal(&path).with_context(|| format!("reading {}", path.display()))?;
            if study.average_reference {
                signal.average_reference_inplace();
            }
            let clean = denoise_with(&signal, &params, &suppression, &study.denoise)
                .with_context(|| format!("denoising {}", path.display()))?;
            let out = study.denoised_path(entry, &path);
            write_signal(&clean, &out)?;
            written.push(out);
        }
        Ok(EntryOutcome::Done(written))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn study() -> StudyConfig {
        serde_json::from_str(
            r#"{
                "raw_data": "/raw",
                "output": "/out",
                "calibration_file": "2-1",
                "subjects": ["sub-S002", "sub-S009", "sub-S011"],
                "unavailable": ["sub-S009"],
                "conditions": [
                    { "name": "_HAND_OBSERVATION_",
                      "window": { "kind": "annotation", "label": " 16", "offset": 5.0, "duration": 20.0 } },
                    { "name": "_CLEAN_", "window": { "kind": "bounds", "tmin": 1.0, "tmax": 31.0 } }
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn defaults_fill_omitted_fields() {
        let s = study();
        assert_eq!(s.extension, ".safetensors");
        assert!(s.average_reference);
        assert!(!s.save_corrected_calibration);
        assert_eq!(s.calibration, CalibrationConfig::default());
        assert_eq!(s.band(), FrequencyBand::new(1, 80));
    }

    #[test]
    fn plan_is_condition_major_with_skips() {
        let plan = study().plan();
        assert_eq!(plan.len(), 6);
        assert_eq!(plan[0].condition, "_HAND_OBSERVATION_");
        assert_eq!(plan[3].condition, "_CLEAN_");
        assert_eq!(plan[1].subject, "sub-S009");
        assert_eq!(plan[1].action, Action::Skip("data not available".into()));
        assert_eq!(plan[2].action, Action::Process);
    }

    #[test]
    fn output_layout() {
        let s = study();
        let entry = s.plan().remove(0);
        assert_eq!(
            s.review_path(&entry),
            PathBuf::from("/out/review/band_1_80/_HAND_OBSERVATION_/sub-S002.review.safetensors")
        );
        assert_eq!(
            s.denoised_path(&entry, Path::new("/raw/sub-S002/run_3-1.safetensors")),
            PathBuf::from(
                "/out/denoised/band_1_80/_HAND_OBSERVATION_/sub-S002/run_3-1_denoised.safetensors"
            )
        );
        assert_eq!(
            s.store().path_for(&s.key(&entry)),
            PathBuf::from("/out/parameters/band_1_80/_HAND_OBSERVATION_/sub-S002.ajdc.safetensors")
        );
    }

    #[test]
    fn missing_subject_directory_fails_only_that_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = study();
        s.raw_data = dir.path().join("raw");
        s.output = dir.path().join("out");
        let report = run_calibration(&s);
        assert_eq!(report.rows.len(), 6);
        assert_eq!(report.skipped(), 2);
        assert_eq!(report.failed(), 4);
        assert_eq!(report.done(), 0);
    }
}
