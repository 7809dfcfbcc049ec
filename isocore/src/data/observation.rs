use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::data::dataset::DatasetSettings;
use crate::data::mid::IsotopomerDistribution;

/// One experiment's detection of a labeled compound: the isotopomer
/// distributions of all labeled fragment ions plus chromatographic metadata.
///
/// The distributions are kept sorted by fragment ion so that the last entry
/// is always the highest-mass labeled ion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompoundObservation {
    pub name: String,
    pub retention_index: f64,
    pub retention_time: f64,
    pub total_signal: f64,
    /// Number of labeled source spectra behind this detection.
    pub labeled_spec_count: usize,
    /// Number of unlabeled source spectra behind this detection.
    pub unlabeled_spec_count: usize,
    mids: Vec<IsotopomerDistribution>,
    pub features: BTreeMap<String, String>,
}

impl CompoundObservation {
    pub fn new(name: &str, retention_index: f64, mids: Vec<IsotopomerDistribution>) -> Self {
        let mut obs = CompoundObservation {
            name: name.to_string(),
            retention_index,
            retention_time: 0.0,
            total_signal: 0.0,
            labeled_spec_count: 1,
            unlabeled_spec_count: 1,
            mids,
            features: BTreeMap::new(),
        };
        obs.sort_mids();
        obs
    }

    fn sort_mids(&mut self) {
        self.mids.sort_by(|a, b| a.ion.partial_cmp(&b.ion).unwrap_or(std::cmp::Ordering::Equal));
    }

    pub fn mids(&self) -> &[IsotopomerDistribution] {
        &self.mids
    }

    /// Replaces the distributions, restoring the by-ion ordering.
    pub fn set_mids(&mut self, mids: Vec<IsotopomerDistribution>) {
        self.mids = mids;
        self.sort_mids();
    }

    /// The labeled fragment ions, in ascending m/z order.
    pub fn labeled_ions(&self) -> Vec<f64> {
        self.mids.iter().map(|m| m.ion).collect()
    }

    pub fn has_labeled_ions(&self) -> bool {
        !self.mids.is_empty()
    }

    /// The distribution detected for the given fragment ion, if any.
    pub fn mid_for_ion(&self, ion: f64) -> Option<&IsotopomerDistribution> {
        self.mids.iter().find(|m| m.ion == ion)
    }

    /// The distribution of the highest-mass labeled ion.
    pub fn largest_ion_mid(&self) -> Option<&IsotopomerDistribution> {
        self.mids.last()
    }

    pub fn add_feature(&mut self, name: &str, value: &str) {
        self.features.insert(name.to_string(), value.to_string());
    }

    pub fn feature(&self, name: &str) -> Option<&str> {
        self.features.get(name).map(|s| s.as_str())
    }

    /// Filters the fragment-ion distributions against the dataset settings.
    ///
    /// Drops ions with a goodness of fit below `min_r2`, ions whose heaviest
    /// isotopomer is incompatible with the fragment mass, ions with more
    /// than `max_mass_isotopomer` heavy positions, ions with an M0 fraction
    /// below `min_m0`, and ions whose absolute fraction sum deviates from 1
    /// by more than `max_fragment_deviation`. Survivors get their trailing
    /// low-abundance fractions trimmed.
    pub fn filter_mids(&mut self, settings: &DatasetSettings) {
        let mut kept: Vec<IsotopomerDistribution> = Vec::new();

        for mid in &self.mids {
            if mid.r2 < settings.min_r2 {
                continue;
            }

            // heaviest isotopomer significant but heavier than the fragment
            let last = mid.fractions[mid.fractions.len() - 1];
            let last_ci = mid.confidence[mid.confidence.len() - 1];
            if last * settings.tracer_atom_mass > mid.ion && last.abs() > last_ci {
                continue;
            }

            if (mid.abs_sum() - 1.0).abs() > settings.max_fragment_deviation {
                continue;
            }

            // mass filter: m/z must accommodate all heavy positions
            if mid.len() <= settings.max_mass_isotopomer + 1
                && mid.fractions[0] >= settings.min_m0
                && mid.len() as f64 * settings.tracer_atom_mass <= mid.ion
            {
                let trimmed = mid.trim_trailing_abundances(settings.trailing_threshold);
                if !trimmed.is_empty() {
                    kept.push(trimmed);
                }
            }
        }

        self.mids = kept;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::mid::IsotopomerDistribution;

    fn mid(ion: f64, fractions: Vec<f64>, r2: f64) -> IsotopomerDistribution {
        let n = fractions.len();
        IsotopomerDistribution::new(fractions, vec![0.0; n], ion, r2).unwrap()
    }

    #[test]
    fn test_mids_sorted_by_ion() {
        let obs = CompoundObservation::new(
            "malate",
            1490.0,
            vec![mid(233.0, vec![0.5, 0.5], 0.99), mid(117.0, vec![0.6, 0.4], 0.99)],
        );
        assert_eq!(obs.labeled_ions(), vec![117.0, 233.0]);
        assert_eq!(obs.largest_ion_mid().unwrap().ion, 233.0);
    }

    #[test]
    fn test_filter_drops_low_r2() {
        let mut obs = CompoundObservation::new(
            "citrate",
            1800.0,
            vec![mid(273.0, vec![0.5, 0.5], 0.80), mid(375.0, vec![0.6, 0.4], 0.99)],
        );
        obs.filter_mids(&DatasetSettings { min_m0: 0.0, ..DatasetSettings::new("glc") });
        assert_eq!(obs.labeled_ions(), vec![375.0]);
    }

    #[test]
    fn test_filter_drops_low_m0() {
        let mut obs = CompoundObservation::new(
            "pyruvate",
            1050.0,
            vec![mid(174.0, vec![0.2, 0.8], 0.99), mid(189.0, vec![0.6, 0.4], 0.99)],
        );
        obs.filter_mids(&DatasetSettings::new("glc"));
        assert_eq!(obs.labeled_ions(), vec![189.0]);
    }

    #[test]
    fn test_filter_drops_deviating_sum() {
        let mut obs = CompoundObservation::new(
            "alanine",
            1100.0,
            vec![mid(116.0, vec![0.8, 0.4], 0.99), mid(190.0, vec![0.6, 0.4], 0.99)],
        );
        obs.filter_mids(&DatasetSettings { min_m0: 0.0, ..DatasetSettings::new("glc") });
        assert_eq!(obs.labeled_ions(), vec![190.0]);
    }
}
