//! Per-parent relative abundance and alpha diversity.
//!
//! Computed from the record counts of numbered sub-units only; the
//! unassigned bucket is not a taxon.

use serde::Serialize;
use std::collections::BTreeMap;

/// Relative abundance and diversity indices for one parent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Abundance {
    /// Records across all numbered sub-units
    pub total: u64,

    /// Fraction of `total` per sub-unit
    pub relative: BTreeMap<u32, f64>,

    /// Sub-units with at least one record
    pub richness: usize,

    /// Shannon entropy H' = -sum(p ln p)
    pub shannon: f64,

    /// Simpson's index of diversity 1 - sum(p^2)
    pub simpson: f64,

    /// exp(H')
    pub effective_shannon: f64,

    /// 1 / sum(p^2)
    pub effective_simpson: f64,
}

impl Abundance {
    /// Compute from per-sub-unit record counts.
    ///
    /// An empty or all-zero input gives all-zero metrics.
    pub fn from_counts(counts: &BTreeMap<u32, u64>) -> Self {
        let total: u64 = counts.values().sum();
        if total == 0 {
            return Self::default();
        }

        let relative: BTreeMap<u32, f64> = counts
            .iter()
            .map(|(id, n)| (*id, *n as f64 / total as f64))
            .collect();

        let shannon = -relative
            .values()
            .filter(|p| **p > 0.0)
            .map(|p| p * p.ln())
            .sum::<f64>();
        let dominance: f64 = relative.values().map(|p| p * p).sum();

        let richness = relative.values().filter(|p| **p > 0.0).count();

        Self {
            total,
            relative,
            richness,
            shannon,
            simpson: 1.0 - dominance,
            effective_shannon: shannon.exp(),
            effective_simpson: if dominance > 0.0 { 1.0 / dominance } else { 0.0 },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(values: &[(u32, u64)]) -> BTreeMap<u32, u64> {
        values.iter().copied().collect()
    }

    #[test]
    fn test_even_community() {
        let a = Abundance::from_counts(&counts(&[(0, 25), (1, 25), (2, 25), (3, 25)]));

        assert_eq!(a.total, 100);
        assert!((a.relative[&2] - 0.25).abs() < 1e-12);
        assert!((a.shannon - 4f64.ln()).abs() < 1e-12);
        assert!((a.simpson - 0.75).abs() < 1e-12);
        assert!((a.effective_shannon - 4.0).abs() < 1e-9);
        assert!((a.effective_simpson - 4.0).abs() < 1e-9);
        assert_eq!(a.richness, 4);
    }

    #[test]
    fn test_single_taxon() {
        let a = Abundance::from_counts(&counts(&[(7, 40)]));

        assert_eq!(a.shannon, 0.0);
        assert_eq!(a.simpson, 0.0);
        assert!((a.effective_shannon - 1.0).abs() < 1e-12);
        assert!((a.effective_simpson - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_uneven_community() {
        let a = Abundance::from_counts(&counts(&[(0, 90), (1, 10)]));

        let expected = -(0.9f64 * 0.9f64.ln() + 0.1 * 0.1f64.ln());
        assert!((a.shannon - expected).abs() < 1e-12);
        assert!((a.simpson - 0.18).abs() < 1e-12);
    }

    #[test]
    fn test_zero_total_is_all_zero() {
        assert_eq!(Abundance::from_counts(&BTreeMap::new()), Abundance::default());
        let a = Abundance::from_counts(&counts(&[(0, 0), (1, 0)]));
        assert_eq!(a.shannon, 0.0);
        assert_eq!(a.effective_simpson, 0.0);
        assert!(a.relative.is_empty());
    }
}
