//! Spectral joint-diagonalization decomposition (AJDC).
//!
//! Fit, following Congedo, Gouy-Pailler & Jutten (2008) and pyRiemann's
//! `AJDC`:
//!
//! ```text
//! calibration window [C, T]
//!   │
//!   ├─ cospectra             one [C, C] matrix per bin in [fmin, fmax]
//!   ├─ non-diag weights      w_f, weighted mean  C̄ = Σ w_f C(f)
//!   ├─ eigh(C̄)               keep n_sources eigenpairs (dim. reduction)
//!   ├─ whitening             W = P Λ^-½,  W⁻ = P Λ^½
//!   ├─ ajd_pham(Wᵀ C(f) W)    V  (n_sources × n_sources)
//!   ├─ forward  = V Wᵀ        [n_sources, C]
//!   ├─ backward = W⁻ V⁻¹      [C, n_sources]
//!   └─ normalise + sort       unit mean source power, decreasing
//!                             channel-space energy ‖backward[:, s]‖²
//! ```
//!
//! The fitted [`DecompositionParameters`] are a plain value: `transform` and
//! `inverse_transform` are pure functions of it.
use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{Array2, ArrayView2};
use std::collections::BTreeSet;

use crate::ajd::{ajd_pham, mean_diagonal, nondiagonality_weights, weighted_mean};
use crate::config::{CalibrationConfig, DimensionalityReduction, FrequencyBand};
use crate::error::{AjdcError, Result};
use crate::signal::{CalibrationWindow, RawSignal};
use crate::spectral::cospectra;
use crate::suppression::SuppressionSet;

/// Eigenvalues below `λ₀ · RANK_TOL` are treated as zero.
const RANK_TOL: f64 = 1e-10;

/// Fitted decomposition plus the operator's artifact selection.
///
/// Immutable once built; every constructor checks the invariants
/// (`n_sources ≤ n_channels`, filter shapes, indices in range).
#[derive(Debug, Clone, PartialEq)]
pub struct DecompositionParameters {
    ch_names: Vec<String>,
    sfreq: f64,
    band: FrequencyBand,
    window_length: f64,
    overlap: f64,
    forward_filter: Array2<f64>,
    backward_filter: Array2<f64>,
    blink_indices: BTreeSet<usize>,
    saccade_indices: BTreeSet<usize>,
}

impl DecompositionParameters {
    /// Assemble and validate a parameter set.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ch_names: Vec<String>,
        sfreq: f64,
        band: FrequencyBand,
        window_length: f64,
        overlap: f64,
        forward_filter: Array2<f64>,
        backward_filter: Array2<f64>,
        blink_indices: BTreeSet<usize>,
        saccade_indices: BTreeSet<usize>,
    ) -> Result<Self> {
        let n_ch = ch_names.len();
        let (n_src, fwd_ch) = forward_filter.dim();
        if fwd_ch != n_ch || backward_filter.dim() != (n_ch, n_src) {
            return Err(AjdcError::format(format!(
                "filter shapes {:?} / {:?} inconsistent with {n_ch} channels",
                forward_filter.dim(),
                backward_filter.dim()
            )));
        }
        if n_src == 0 || n_src > n_ch {
            return Err(AjdcError::format(format!(
                "{n_src} sources for {n_ch} channels"
            )));
        }
        let params = Self {
            ch_names,
            sfreq,
            band,
            window_length,
            overlap,
            forward_filter,
            backward_filter,
            blink_indices,
            saccade_indices,
        };
        params.suppression_set().check_range(n_src)?;
        Ok(params)
    }

    /// Same filters, new artifact selection.
    pub fn with_selection(&self, blink: &[usize], saccade: &[usize]) -> Result<Self> {
        let mut out = self.clone();
        out.blink_indices = blink.iter().copied().collect();
        out.saccade_indices = saccade.iter().copied().collect();
        out.suppression_set().check_range(self.n_sources())?;
        Ok(out)
    }

    pub fn ch_names(&self) -> &[String] {
        &self.ch_names
    }

    pub fn n_channels(&self) -> usize {
        self.ch_names.len()
    }

    pub fn n_sources(&self) -> usize {
        self.forward_filter.nrows()
    }

    pub fn sfreq(&self) -> f64 {
        self.sfreq
    }

    pub fn band(&self) -> FrequencyBand {
        self.band
    }

    pub fn window_length(&self) -> f64 {
        self.window_length
    }

    pub fn overlap(&self) -> f64 {
        self.overlap
    }

    /// `[n_sources, n_channels]`, channel space → source space.
    pub fn forward_filter(&self) -> &Array2<f64> {
        &self.forward_filter
    }

    /// `[n_channels, n_sources]`, source space → channel space.
    pub fn backward_filter(&self) -> &Array2<f64> {
        &self.backward_filter
    }

    pub fn blink_indices(&self) -> &BTreeSet<usize> {
        &self.blink_indices
    }

    pub fn saccade_indices(&self) -> &BTreeSet<usize> {
        &self.saccade_indices
    }

    /// Blink ∪ saccade.
    pub fn suppression_set(&self) -> SuppressionSet {
        self.blink_indices
            .iter()
            .chain(&self.saccade_indices)
            .copied()
            .collect()
    }

    /// Source names as shown to the operator: `S00`, `S01`, ...
    pub fn source_names(&self) -> Vec<String> {
        (0..self.n_sources()).map(|s| format!("S{s:02}")).collect()
    }

    /// Project `[n_channels, T]` data into source space (`[n_sources, T]`).
    pub fn transform(&self, data: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        if data.nrows() != self.n_channels() {
            return Err(AjdcError::ChannelMismatch {
                expected: format!("{} channels", self.n_channels()),
                found: format!("{} channels", data.nrows()),
            });
        }
        Ok(self.forward_filter.dot(&data))
    }

    /// [`transform`](Self::transform) after checking channel names and order.
    pub fn transform_signal(&self, signal: &RawSignal) -> Result<Array2<f64>> {
        signal.check_layout(&self.ch_names)?;
        self.transform(signal.data.view())
    }

    /// Reconstruct channel-space data from sources, zeroing the suppressed
    /// sources first.
    ///
    /// # Errors
    ///
    /// [`AjdcError::Index`] when a suppressed index is `>= n_sources`,
    /// [`AjdcError::ChannelMismatch`] when `sources` has the wrong row count.
    pub fn inverse_transform(
        &self,
        sources: ArrayView2<'_, f64>,
        suppression: &SuppressionSet,
    ) -> Result<Array2<f64>> {
        if sources.nrows() != self.n_sources() {
            return Err(AjdcError::ChannelMismatch {
                expected: format!("{} sources", self.n_sources()),
                found: format!("{} sources", sources.nrows()),
            });
        }
        suppression.check_range(self.n_sources())?;
        let mut kept = sources.to_owned();
        for s in suppression.iter() {
            kept.row_mut(s).fill(0.0);
        }
        Ok(self.backward_filter.dot(&kept))
    }
}

/// Fit the decomposition on a calibration window.
///
/// The returned parameters carry empty blink/saccade selections; the
/// operator's choice is attached later through the review boundary.
///
/// # Errors
///
/// * [`AjdcError::Configuration`] if the band lies outside `[0, sfreq/2]`,
///   the window is shorter than one analysis window, or the overlap is
///   invalid.
/// * [`AjdcError::Numerical`] if the band carries no variance, the
///   diagonalizer is singular, or it does not converge within
///   `cfg.max_iter` sweeps.
pub fn fit(window: &CalibrationWindow, cfg: &CalibrationConfig) -> Result<DecompositionParameters> {
    let signal = &window.signal;
    let sfreq = signal.sfreq;
    cfg.validate(sfreq)?;
    let n_ch = signal.n_channels();

    let cosp = cospectra(
        signal.data.view(),
        cfg.window_samples(sfreq),
        cfg.step_samples(sfreq),
        sfreq,
        cfg.band,
    )?;
    let weights = nondiagonality_weights(&cosp.matrices);

    // Dimension reduction on the weighted mean cospectrum.
    let mean = weighted_mean(&cosp.matrices, &weights);
    let (eigvals, eigvecs) = sorted_eigh(&mean);
    let n_sources = select_sources(&eigvals, cfg.dim_red)?;

    let mut whit = Array2::<f64>::zeros((n_ch, n_sources));
    let mut whit_inv = Array2::<f64>::zeros((n_ch, n_sources));
    for k in 0..n_sources {
        let sq = eigvals[k].sqrt();
        for c in 0..n_ch {
            whit[[c, k]] = eigvecs[[c, k]] / sq;
            whit_inv[[c, k]] = eigvecs[[c, k]] * sq;
        }
    }

    let whitened: Vec<Array2<f64>> = cosp
        .matrices
        .iter()
        .map(|m| whit.t().dot(m).dot(&whit))
        .collect();
    let jd = ajd_pham(&whitened, &weights, cfg.max_iter, cfg.tolerance)?;

    let v = to_nalgebra(&jd.diagonalizer);
    let v_inv = v
        .try_inverse()
        .ok_or_else(|| AjdcError::numerical("joint diagonalizer is singular"))?;
    let mut forward = jd.diagonalizer.dot(&whit.t());
    let mut backward = whit_inv.dot(&from_nalgebra(&v_inv));

    // Unit mean source power; sign fixed by the dominant topography entry.
    let power = mean_diagonal(&jd.diagonalized, &weights);
    for (s, &p) in power.iter().enumerate() {
        if !(p > 0.0) || !p.is_finite() {
            return Err(AjdcError::numerical(format!(
                "source {s} has non-positive power {p}"
            )));
        }
        let col = backward.column(s);
        let dominant = col
            .iter()
            .copied()
            .max_by(|a, b| a.abs().total_cmp(&b.abs()))
            .unwrap_or(1.0);
        let sign = if dominant < 0.0 { -1.0 } else { 1.0 };
        let scale = p.sqrt();
        forward.row_mut(s).mapv_inplace(|x| sign * x / scale);
        backward.column_mut(s).mapv_inplace(|x| sign * x * scale);
    }

    // Decreasing channel-space energy.  With unit-power sources, ‖backward[:, s]‖²
    // is the share of the channel diagonal (total power) that source s carries.
    let energy: Vec<f64> = (0..n_sources)
        .map(|s| backward.column(s).iter().map(|x| x * x).sum())
        .collect();
    let mut order: Vec<usize> = (0..n_sources).collect();
    order.sort_by(|&a, &b| energy[b].total_cmp(&energy[a]));
    let forward = forward.select(ndarray::Axis(0), &order);
    let backward = backward.select(ndarray::Axis(1), &order);

    if forward.iter().chain(backward.iter()).any(|x| !x.is_finite()) {
        return Err(AjdcError::numerical("non-finite filter coefficients"));
    }

    log::info!(
        "AJDC fit: {n_ch} channels → {n_sources} sources, {} bins in [{}, {}] Hz, \
         {} windows, {} sweeps",
        cosp.freqs.len(),
        cfg.band.fmin,
        cfg.band.fmax,
        cosp.n_windows,
        jd.n_sweeps
    );

    DecompositionParameters::new(
        signal.ch_names.clone(),
        sfreq,
        cfg.band,
        cfg.window_length,
        cfg.overlap,
        forward,
        backward,
        BTreeSet::new(),
        BTreeSet::new(),
    )
}

/// Eigen-decomposition of a symmetric matrix, eigenvalues decreasing.
/// Returns `(λ, P)` with eigenvectors in the columns of `P`.
fn sorted_eigh(m: &Array2<f64>) -> (Vec<f64>, Array2<f64>) {
    let n = m.nrows();
    // Symmetrise to remove rounding asymmetry.
    let sym = DMatrix::from_fn(n, n, |i, j| 0.5 * (m[[i, j]] + m[[j, i]]));
    let eig = SymmetricEigen::new(sym);
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));

    let vals = order.iter().map(|&k| eig.eigenvalues[k]).collect();
    let vecs = Array2::from_shape_fn((n, n), |(i, k)| eig.eigenvectors[(i, order[k])]);
    (vals, vecs)
}

/// Number of sources retained by `dim_red` for decreasing eigenvalues.
fn select_sources(eigvals: &[f64], dim_red: DimensionalityReduction) -> Result<usize> {
    let top = eigvals.first().copied().unwrap_or(0.0);
    if !(top > 0.0) || !top.is_finite() {
        return Err(AjdcError::numerical(
            "calibration window carries no variance in the frequency band",
        ));
    }
    let positive: Vec<f64> = eigvals
        .iter()
        .copied()
        .take_while(|&l| l > top * RANK_TOL)
        .collect();
    let rank = positive.len();

    let n = match dim_red {
        DimensionalityReduction::Components(k) => {
            if k == 0 {
                return Err(AjdcError::config("at least one source must be kept"));
            }
            k.min(rank)
        }
        DimensionalityReduction::ExplainedVariance(p) => {
            if !(p > 0.0 && p <= 1.0) {
                return Err(AjdcError::config(format!(
                    "explained variance must lie in (0, 1], got {p}"
                )));
            }
            if p >= 1.0 {
                rank
            } else {
                let total: f64 = positive.iter().sum();
                let mut cum = 0.0;
                positive
                    .iter()
                    .position(|&l| {
                        cum += l;
                        cum / total >= p
                    })
                    .map(|i| i + 1)
                    .unwrap_or(rank)
            }
        }
        DimensionalityReduction::MaxConditionNumber(c) => {
            if !(c >= 1.0) {
                return Err(AjdcError::config(format!(
                    "maximum condition number must be at least 1, got {c}"
                )));
            }
            positive.iter().take_while(|&&l| top / l <= c).count()
        }
    };
    log::debug!("dimension reduction {dim_red:?}: rank {rank}, keeping {n}");
    Ok(n.max(1))
}

fn to_nalgebra(a: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

fn from_nalgebra(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}
