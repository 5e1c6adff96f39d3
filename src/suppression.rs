//! Suppression sets and the operator prompt contract.
use std::collections::BTreeSet;

use crate::error::{AjdcError, Result};

/// Source indices zeroed before reconstruction.
///
/// Ordered and duplicate-free; the union of the blink and saccade selections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SuppressionSet(BTreeSet<usize>);

impl SuppressionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blink and saccade selections merged into one set.
    pub fn from_selections(blink: &[usize], saccade: &[usize]) -> Self {
        blink.iter().chain(saccade).copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.0.contains(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    /// Fail with [`AjdcError::Index`] on the first index `>= n_sources`.
    pub fn check_range(&self, n_sources: usize) -> Result<()> {
        match self.0.iter().find(|&&i| i >= n_sources) {
            Some(&index) => Err(AjdcError::Index { index, n_sources }),
            None => Ok(()),
        }
    }
}

impl FromIterator<usize> for SuppressionSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a SuppressionSet {
    type Item = &'a usize;
    type IntoIter = std::collections::btree_set::Iter<'a, usize>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Parse one operator answer: whitespace-separated tokens, keeping only
/// those made entirely of ASCII digits (`"1 x 3 -2 4.5"` → `[1, 3]`).
///
/// Order and duplicates are preserved; they collapse when the lists are
/// merged into a [`SuppressionSet`].
pub fn parse_indices(input: &str) -> Vec<usize> {
    input
        .split_whitespace()
        .filter(|tok| tok.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|tok| tok.parse().ok())
        .collect()
}
