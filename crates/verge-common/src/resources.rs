use std::fmt;

use serde::{Deserialize, Serialize};

/// Tolerance below which a component is treated as zero.
pub const COMPONENT_EPS: f64 = 1e-9;

/// A fixed-dimension vector of resource quantities.
///
/// Dimension 0 is CPU cores and dimension 1 is memory MB in the default
/// two-dimensional setup, but nothing here depends on what a dimension
/// means. Every vector inside one cluster shares a single dimension; all
/// binary operations panic on a mismatch, which would be a configuration
/// bug rather than a runtime condition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resources(Vec<f64>);

impl Resources {
    pub fn zeros(dim: usize) -> Self {
        Self(vec![0.0; dim])
    }

    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, i: usize) -> f64 {
        self.0[i]
    }

    fn check_dim(&self, other: &Self) {
        assert_eq!(
            self.0.len(),
            other.0.len(),
            "resource vectors must share one dimension"
        );
    }

    pub fn add_assign(&mut self, other: &Self) {
        self.check_dim(other);
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a += b;
        }
    }

    pub fn sub_assign(&mut self, other: &Self) {
        self.check_dim(other);
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a -= b;
        }
    }

    pub fn add(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.add_assign(other);
        out
    }

    pub fn sub(&self, other: &Self) -> Self {
        let mut out = self.clone();
        out.sub_assign(other);
        out
    }

    /// Componentwise `self - other`, with negative components clamped to 0.
    pub fn sub_clamped(&self, other: &Self) -> Self {
        self.check_dim(other);
        Self(
            self.0
                .iter()
                .zip(&other.0)
                .map(|(a, b)| (a - b).max(0.0))
                .collect(),
        )
    }

    /// `self <= other` in every dimension.
    pub fn fits(&self, other: &Self) -> bool {
        self.check_dim(other);
        self.0
            .iter()
            .zip(&other.0)
            .all(|(a, b)| *a <= b + COMPONENT_EPS)
    }

    /// `self > other` in at least one dimension.
    pub fn exceeds_any(&self, other: &Self) -> bool {
        !self.fits(other)
    }

    /// Every component is zero or negative: a deficit vector this describes
    /// has been fully covered.
    pub fn is_consumed(&self) -> bool {
        self.0.iter().all(|a| *a <= COMPONENT_EPS)
    }

    /// Componentwise maximum, in place.
    pub fn max_with(&mut self, other: &Self) {
        self.check_dim(other);
        for (a, b) in self.0.iter_mut().zip(&other.0) {
            *a = a.max(*b);
        }
    }

    /// Defragmentation score against the per-dimension maxima `M`:
    /// `sum_i (v_i / M_i)^2`. Dimensions with a zero maximum contribute
    /// nothing. The score is convex, so a given amount of free capacity
    /// scores higher when concentrated on fewer nodes.
    pub fn defrag(&self, maxima: &Self) -> f64 {
        self.check_dim(maxima);
        self.0
            .iter()
            .zip(&maxima.0)
            .filter(|(_, m)| m.abs() > COMPONENT_EPS)
            .map(|(v, m)| {
                let norm = v / m;
                norm * norm
            })
            .sum()
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sub_round_trip() {
        let a = Resources::new(vec![2.0, 4.0]);
        let b = Resources::new(vec![0.5, 1.0]);
        assert_eq!(a.add(&b).sub(&b), a);
    }

    #[test]
    fn sub_clamped_never_negative() {
        let a = Resources::new(vec![1.0, 3.0]);
        let b = Resources::new(vec![2.0, 1.0]);
        assert_eq!(a.sub_clamped(&b), Resources::new(vec![0.0, 2.0]));
    }

    #[test]
    fn fits_is_componentwise() {
        let small = Resources::new(vec![1.0, 1.0]);
        let big = Resources::new(vec![2.0, 4.0]);
        let skewed = Resources::new(vec![0.5, 8.0]);
        assert!(small.fits(&big));
        assert!(!big.fits(&small));
        assert!(!skewed.fits(&big));
        assert!(skewed.exceeds_any(&big));
    }

    #[test]
    fn consumed_accepts_negatives() {
        assert!(Resources::new(vec![0.0, -1.5]).is_consumed());
        assert!(!Resources::new(vec![0.1, -1.5]).is_consumed());
    }

    #[test]
    fn defrag_rewards_consolidation() {
        let maxima = Resources::new(vec![2.0, 4.0]);
        let whole = Resources::new(vec![2.0, 4.0]);
        let half = Resources::new(vec![1.0, 2.0]);
        // One fully free node beats the same capacity split across two.
        assert!(whole.defrag(&maxima) > 2.0 * half.defrag(&maxima));
    }

    #[test]
    fn defrag_skips_zero_maxima() {
        let maxima = Resources::new(vec![2.0, 0.0]);
        let v = Resources::new(vec![1.0, 3.0]);
        assert!((v.defrag(&maxima) - 0.25).abs() < 1e-12);
    }

    #[test]
    #[should_panic]
    fn mismatched_dims_panic() {
        let a = Resources::new(vec![1.0]);
        let b = Resources::new(vec![1.0, 2.0]);
        let _ = a.add(&b);
    }
}
