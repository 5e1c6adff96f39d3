//! Approximate joint diagonalization of symmetric positive definite matrices.
//!
//! Pham's algorithm (D.-T. Pham, "Joint approximate diagonalization of
//! positive definite Hermitian matrices", SIAM J. Matrix Anal. Appl. 2001),
//! restricted to real matrices and weighted, as in pyRiemann's `ajd_pham`:
//!
//! ```text
//! for each sweep, for each pair (i, j), j < i:
//!     g12 = Σ_k w_k C_k[i,j] / C_k[i,i]     ω21 = Σ_k w_k C_k[i,i] / C_k[j,j]
//!     g21 = Σ_k w_k C_k[i,j] / C_k[j,j]     ω12 = Σ_k w_k C_k[j,j] / C_k[i,i]
//!     solve the 2×2 Newton step (h12, h21), T = [[1, -h12/t], [-h21/t, 1]]
//!     C_k ← T C_k Tᵀ  on rows/columns (i, j);   V ← T V  on rows (i, j)
//! stop when Σ n_mats (g12 h12 + g21 h21) / 2  ≤  n (n-1) · tol
//! ```
use ndarray::Array2;

use crate::error::{AjdcError, Result};

/// Output of [`ajd_pham`].
#[derive(Debug, Clone)]
pub struct JointDiagonalization {
    /// `V` such that `V C_k Vᵀ` is approximately diagonal for every `k`.
    pub diagonalizer: Array2<f64>,
    /// The transformed matrices `V C_k Vᵀ`.
    pub diagonalized: Vec<Array2<f64>>,
    pub n_sweeps: usize,
}

/// Non-diagonality weight of each matrix (pyRiemann `get_nondiag_weight`).
///
/// After trace normalisation, `w = (‖X‖²_F / Σ X_ii² − 1) / (n − 1)`: zero
/// for diagonal matrices, larger for matrices carrying more cross-channel
/// structure.  Matrices with a non-positive trace get weight zero.
pub fn nondiagonality_weights(mats: &[Array2<f64>]) -> Vec<f64> {
    mats.iter()
        .map(|m| {
            let n = m.nrows();
            let tr = m.diag().sum();
            if n < 2 || !(tr > 0.0) {
                return 0.0;
            }
            let x2 = m.mapv(|v| (v / tr).powi(2));
            let diag = x2.diag().sum();
            let norm = x2.sum();
            if diag > 0.0 {
                (norm / diag - 1.0) / (n as f64 - 1.0)
            } else {
                0.0
            }
        })
        .collect()
}

/// Weights scaled to sum to one; uniform when they are all zero.
pub fn normalize_weights(weights: &[f64]) -> Vec<f64> {
    let total: f64 = weights.iter().sum();
    if total > f64::EPSILON {
        weights.iter().map(|w| w / total).collect()
    } else {
        vec![1.0 / weights.len().max(1) as f64; weights.len()]
    }
}

/// Weighted mean of a set of equally sized matrices.
pub fn weighted_mean(mats: &[Array2<f64>], weights: &[f64]) -> Array2<f64> {
    let w = normalize_weights(weights);
    let (n, m) = mats.first().map(|a| a.dim()).unwrap_or((0, 0));
    mats.iter()
        .zip(w)
        .fold(Array2::zeros((n, m)), |acc, (a, wk)| acc + a * wk)
}

/// Jointly diagonalize `mats` (all `n × n`, symmetric positive definite).
///
/// # Errors
///
/// [`AjdcError::Numerical`] if the iteration produces non-finite values or
/// does not reach `tol` within `max_iter` sweeps.
pub fn ajd_pham(
    mats: &[Array2<f64>],
    weights: &[f64],
    max_iter: usize,
    tol: f64,
) -> Result<JointDiagonalization> {
    let n = match mats.first() {
        Some(m) => m.nrows(),
        None => return Err(AjdcError::numerical("no matrices to diagonalize")),
    };
    if mats.iter().any(|m| m.dim() != (n, n)) {
        return Err(AjdcError::numerical("matrices differ in shape"));
    }
    let n_mats = mats.len() as f64;
    let w = normalize_weights(weights);
    let mut c: Vec<Array2<f64>> = mats.to_vec();
    let mut v = Array2::<f64>::eye(n);
    let epsilon = (n * n.saturating_sub(1)) as f64 * tol;

    for sweep in 1..=max_iter {
        let mut crit = 0.0;
        for i in 1..n {
            for j in 0..i {
                let (mut g12, mut g21, mut o12, mut o21) = (0.0, 0.0, 0.0, 0.0);
                for (m, &wk) in c.iter().zip(&w) {
                    let (c1, c2, cij) = (m[[i, i]], m[[j, j]], m[[i, j]]);
                    g12 += wk * cij / c1;
                    g21 += wk * cij / c2;
                    o21 += wk * c1 / c2;
                    o12 += wk * c2 / c1;
                }
                let omega = (o12 * o21).sqrt();
                let tmp = (o21 / o12).sqrt();
                let tmp1 = (tmp * g12 + g21) / (omega + 1.0);
                let tmp2 = (tmp * g12 - g21) / (omega - 1.0).max(1e-9);
                let h12 = tmp1 + tmp2;
                let h21 = (tmp1 - tmp2) / tmp;
                crit += n_mats * (g12 * h12 + g21 * h21) / 2.0;

                let t = 1.0 + (1.0 - h12 * h21).max(0.0).sqrt();
                let (a, b) = (-h12 / t, -h21 / t);
                for m in c.iter_mut() {
                    rotate_rows(m, i, j, a, b);
                    rotate_cols(m, i, j, a, b);
                }
                rotate_rows(&mut v, i, j, a, b);
            }
        }

        if !crit.is_finite() || v.iter().any(|x| !x.is_finite()) {
            return Err(AjdcError::numerical(format!(
                "joint diagonalization diverged at sweep {sweep}"
            )));
        }
        log::trace!("ajd sweep {sweep}: criterion {crit:.3e}");
        if crit <= epsilon {
            return Ok(JointDiagonalization { diagonalizer: v, diagonalized: c, n_sweeps: sweep });
        }
    }

    Err(AjdcError::numerical(format!(
        "joint diagonalization did not converge within {max_iter} sweeps"
    )))
}

/// `row_i ← row_i + a·row_j`, `row_j ← b·row_i + row_j`.
fn rotate_rows(m: &mut Array2<f64>, i: usize, j: usize, a: f64, b: f64) {
    let ri = m.row(i).to_owned();
    let rj = m.row(j).to_owned();
    m.row_mut(i).assign(&(&ri + &(&rj * a)));
    m.row_mut(j).assign(&(&ri * b + &rj));
}

/// Same transform applied to columns `i` and `j`.
fn rotate_cols(m: &mut Array2<f64>, i: usize, j: usize, a: f64, b: f64) {
    let ci = m.column(i).to_owned();
    let cj = m.column(j).to_owned();
    m.column_mut(i).assign(&(&ci + &(&cj * a)));
    m.column_mut(j).assign(&(&ci * b + &cj));
}

/// Sum over matrices of squared off-diagonal entries relative to squared
/// diagonal entries.  `0` for an exactly diagonal set.
pub fn off_diagonal_ratio(mats: &[Array2<f64>]) -> f64 {
    let (mut off, mut on) = (0.0, 0.0);
    for m in mats {
        let d2: f64 = m.diag().iter().map(|v| v * v).sum();
        off += m.iter().map(|v| v * v).sum::<f64>() - d2;
        on += d2;
    }
    if on > 0.0 { off / on } else { 0.0 }
}

/// Row-wise mean of the diagonals, weighted: `Σ_k w_k C_k[s,s]` per `s`.
pub fn mean_diagonal(mats: &[Array2<f64>], weights: &[f64]) -> Vec<f64> {
    let w = normalize_weights(weights);
    let n = mats.first().map(|m| m.nrows()).unwrap_or(0);
    let mut out = vec![0.0; n];
    for (m, wk) in mats.iter().zip(w) {
        for (o, d) in out.iter_mut().zip(m.diag().iter()) {
            *o += wk * d;
        }
    }
    out
}
