//! Fixed-duration epoching.
//!
//! Splits continuous [C, T] data into consecutive, non-overlapping windows
//! of `epoch_len` samples starting at sample 0, dropping any trailing
//! incomplete window.  `epoch_len` may be fractional (500 ms at 125 Hz is
//! 62.5 samples): epoch `k` spans `round(k·len)..round((k+1)·len)`, so
//! epochs differ by at most one sample and the count is always
//! `floor(T / len)`.  With a whole `epoch_len` this matches
//! `mne.make_fixed_length_epochs(raw, duration)` with `baseline=None`.
use ndarray::{s, Array2, ArrayView2};
use std::ops::Range;

/// Slack for `T / len` landing a rounding error below a whole number.
const COUNT_EPS: f64 = 1e-9;

/// Number of complete epochs in `n_times` samples.
pub fn n_epochs(n_times: usize, epoch_len: f64) -> usize {
    if !(epoch_len.is_finite() && epoch_len >= 1.0) {
        0
    } else {
        (n_times as f64 / epoch_len + COUNT_EPS).floor() as usize
    }
}

/// Sample ranges of the complete epochs, in chronological order.
pub fn epoch_bounds(n_times: usize, epoch_len: f64) -> Vec<Range<usize>> {
    let edge = |k: usize| ((k as f64 * epoch_len).round() as usize).min(n_times);
    (0..n_epochs(n_times, epoch_len))
        .map(|k| edge(k)..edge(k + 1))
        .collect()
}

/// Borrowed `[C, ·]` views over [`epoch_bounds`].
pub fn epoch_views(data: ArrayView2<'_, f64>, epoch_len: f64) -> Vec<ArrayView2<'_, f64>> {
    epoch_bounds(data.ncols(), epoch_len)
        .into_iter()
        .map(|r| data.clone().slice_move(s![.., r]))
        .collect()
}

/// Concatenate `[C, n_e]` epochs back into `[C, Σ n_e]`.
///
/// `n_ch` sizes the empty result when there are no epochs.
pub fn concatenate(epochs: &[Array2<f64>], n_ch: usize) -> Array2<f64> {
    let n_t: usize = epochs.iter().map(|e| e.ncols()).sum();
    let mut out = Array2::<f64>::zeros((n_ch, n_t));
    let mut start = 0;
    for ep in epochs {
        let stop = start + ep.ncols();
        out.slice_mut(s![.., start..stop]).assign(ep);
        start = stop;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn epoch_count_and_shape() {
        let data = Array2::from_elem((12, 3840), 1.0_f64);
        let epochs = epoch_views(data.view(), 128.0);
        assert_eq!(epochs.len(), 30);
        assert!(epochs.iter().all(|e| e.dim() == (12, 128)));
    }

    #[test]
    fn trailing_samples_dropped() {
        // 1300 samples with 128-sample epochs → 10 epochs (20 trailing samples dropped).
        let data = Array2::from_elem((4, 1300), 0.5_f64);
        assert_eq!(epoch_views(data.view(), 128.0).len(), 10);
    }

    #[test]
    fn fractional_length_keeps_every_epoch() {
        // 10.5 s at 125 Hz
        let bounds = epoch_bounds(1313, 62.5);
        assert_eq!(bounds.len(), 21);
        assert_eq!(bounds[0], 0..63);
        assert_eq!(bounds[1], 63..125);
        assert_eq!(bounds[20].end, 1313);
        assert!(bounds.windows(2).all(|w| w[0].end == w[1].start));
        assert!(bounds.iter().all(|r| r.len() == 62 || r.len() == 63));

        // 10.3 s at 125 Hz ends at exactly 10 s
        assert_eq!(epoch_bounds(1288, 62.5).last(), Some(&(1188..1250)));
    }

    #[test]
    fn count_survives_inexact_lengths() {
        // 0.5 s × 1000/3 Hz is not representable exactly
        let len = 0.5 * (1000.0 / 3.0);
        assert_eq!(n_epochs(1000, len), 6);
        assert_eq!(epoch_bounds(1000, len).last().map(|r| r.end), Some(1000));
    }

    #[test]
    fn views_are_chronological() {
        let data = Array2::from_shape_fn((2, 10), |(c, t)| (c * 100 + t) as f64);
        let eps = epoch_views(data.view(), 4.0);
        assert_eq!(eps.len(), 2);
        assert_eq!(eps[1][[1, 0]], 104.0);
    }

    #[test]
    fn concatenate_inverts_epoching() {
        let data = Array2::from_shape_fn((3, 12), |(c, t)| (c * 31 + t * 7) as f64);
        let owned: Vec<Array2<f64>> = epoch_views(data.view(), 4.0).iter().map(|v| v.to_owned()).collect();
        assert_eq!(concatenate(&owned, 3), data);
    }

    #[test]
    fn no_epochs_gives_empty_result() {
        let out = concatenate(&[], 5);
        assert_eq!(out.dim(), (5, 0));
        assert_eq!(n_epochs(100, 0.0), 0);
        assert_eq!(n_epochs(100, 0.5), 0);
    }
}
