use serde::{Deserialize, Serialize};

use crate::error::{IsocoreError, Result};

/// A mass isotopomer distribution for one labeled fragment ion.
///
/// Holds the fractional abundances M0..Mk together with the confidence
/// interval of each fraction, the fragment ion m/z the distribution was
/// derived from and the goodness of fit of the deconvolution.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IsotopomerDistribution {
    pub fractions: Vec<f64>,
    pub confidence: Vec<f64>,
    pub ion: f64,
    pub r2: f64,
}

impl IsotopomerDistribution {
    /// Constructs a new `IsotopomerDistribution`.
    ///
    /// # Arguments
    ///
    /// * `fractions` - fractional abundances M0..Mk.
    /// * `confidence` - confidence interval per fraction, same length as `fractions`.
    /// * `ion` - fragment ion m/z.
    /// * `r2` - goodness of fit of the isotopomer deconvolution.
    ///
    /// Fails when `fractions` is empty or the two vectors differ in length.
    ///
    /// # Examples
    ///
    /// ```
    /// use isocore::data::mid::IsotopomerDistribution;
    ///
    /// let mid = IsotopomerDistribution::new(vec![0.7, 0.2, 0.1], vec![0.01, 0.01, 0.02], 245.0, 0.99).unwrap();
    /// assert_eq!(mid.len(), 3);
    /// ```
    pub fn new(fractions: Vec<f64>, confidence: Vec<f64>, ion: f64, r2: f64) -> Result<Self> {
        if fractions.is_empty() {
            return Err(IsocoreError::EmptyDistribution);
        }
        if fractions.len() != confidence.len() {
            return Err(IsocoreError::LengthMismatch {
                fractions: fractions.len(),
                confidence: confidence.len(),
            });
        }
        Ok(IsotopomerDistribution { fractions, confidence, ion, r2 })
    }

    pub fn len(&self) -> usize {
        self.fractions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fractions.is_empty()
    }

    /// Sum of the absolute fractional abundances.
    pub fn abs_sum(&self) -> f64 {
        self.fractions.iter().map(|f| f.abs()).sum()
    }

    /// Drops the trailing run of fractions with abundance at or below
    /// `threshold`. Interior low-abundance fractions are kept. The
    /// confidence vector is truncated to the same length.
    ///
    /// # Examples
    ///
    /// ```
    /// use isocore::data::mid::IsotopomerDistribution;
    ///
    /// let mid = IsotopomerDistribution::new(vec![0.8, 0.005, 0.19, 0.004, 0.001], vec![0.0; 5], 200.0, 0.99).unwrap();
    /// let trimmed = mid.trim_trailing_abundances(0.01);
    /// assert_eq!(trimmed.fractions, vec![0.8, 0.005, 0.19]);
    /// ```
    pub fn trim_trailing_abundances(&self, threshold: f64) -> IsotopomerDistribution {
        let mut keep = 0;
        for (i, &f) in self.fractions.iter().enumerate() {
            if f > threshold {
                keep = i + 1;
            }
        }
        IsotopomerDistribution {
            fractions: self.fractions[..keep].to_vec(),
            confidence: self.confidence[..keep].to_vec(),
            ion: self.ion,
            r2: self.r2,
        }
    }
}

/// Divides every element by the maximum of the vector. Empty input stays empty.
pub fn base_peak_normalization(v: &[f64]) -> Vec<f64> {
    if v.is_empty() {
        return Vec::new();
    }
    let max = v.iter().cloned().fold(v[0], f64::max);
    v.iter().map(|x| x / max).collect()
}

/// Divides every element by the sum of the vector. Empty input stays empty.
pub fn sum_normalization(v: &[f64]) -> Vec<f64> {
    if v.is_empty() {
        return Vec::new();
    }
    let sum: f64 = v.iter().sum();
    v.iter().map(|x| x / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_distribution() {
        let r = IsotopomerDistribution::new(vec![], vec![], 100.0, 0.99);
        assert_eq!(r.unwrap_err(), IsocoreError::EmptyDistribution);
    }

    #[test]
    fn test_rejects_length_mismatch() {
        let r = IsotopomerDistribution::new(vec![0.5, 0.5], vec![0.01], 100.0, 0.99);
        assert_eq!(
            r.unwrap_err(),
            IsocoreError::LengthMismatch { fractions: 2, confidence: 1 }
        );
    }

    #[test]
    fn test_trim_keeps_interior_low_abundances() {
        let mid = IsotopomerDistribution::new(
            vec![0.9, 0.001, 0.09, 0.002],
            vec![0.0; 4],
            150.0,
            0.98,
        )
        .unwrap();
        let trimmed = mid.trim_trailing_abundances(0.01);
        assert_eq!(trimmed.fractions, vec![0.9, 0.001, 0.09]);
        assert_eq!(trimmed.confidence.len(), 3);
    }

    #[test]
    fn test_trim_all_below_threshold_yields_empty() {
        let mid =
            IsotopomerDistribution::new(vec![0.005, 0.004], vec![0.0; 2], 150.0, 0.98).unwrap();
        assert!(mid.trim_trailing_abundances(0.01).fractions.is_empty());
    }

    #[test]
    fn test_base_peak_normalization() {
        let v = base_peak_normalization(&[0.2, 0.4, 0.1]);
        assert_eq!(v, vec![0.5, 1.0, 0.25]);
    }

    #[test]
    fn test_sum_normalization() {
        let v = sum_normalization(&[0.2, 0.4, 0.2]);
        let sum: f64 = v.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
    }
}
