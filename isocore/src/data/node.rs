use std::collections::{BTreeMap, BTreeSet};

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, FisherSnedecor, StudentsT};
use statrs::statistics::Statistics;

use crate::data::mid::IsotopomerDistribution;
use crate::data::observation::CompoundObservation;
use crate::error::{IsocoreError, Result};

/// Feature key carrying the dense node index assigned at re-indexing.
pub const GROUPING_FEATURE: &str = "CMP_ID";

/// Mean goodness-of-fit a common ion needs to be preferred for scoring.
const COMMON_ION_MIN_R2: f64 = 0.95;

/// Which fragment ion of a node is scored per experiment.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum IonSelection {
    /// Each experiment's own highest-mass labeled ion.
    Individual,
    /// The largest ion labeled in every experiment of the node.
    LargestCommon,
}

impl Default for IonSelection {
    fn default() -> Self {
        IonSelection::Individual
    }
}

/// A canonical compound: the same metabolite matched across experiments.
///
/// Holds at most one observation per experiment. Nodes are created by the
/// compound matcher on first sighting and re-indexed densely after the
/// redetection pass; the dense index doubles as the row/column index of the
/// per-experiment distance matrices.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeCompound {
    pub name: String,
    pub features: BTreeMap<String, String>,
    observations: BTreeMap<String, CompoundObservation>,
    ion_selection: IonSelection,
}

impl NodeCompound {
    pub fn new(name: &str) -> Self {
        NodeCompound {
            name: name.to_string(),
            features: BTreeMap::new(),
            observations: BTreeMap::new(),
            ion_selection: IonSelection::Individual,
        }
    }

    /// Attaches an experiment's observation. The observation's features are
    /// merged into the node. Fails when the experiment already contributed.
    pub fn attach_observation(&mut self, experiment: &str, obs: CompoundObservation) -> Result<()> {
        if self.observations.contains_key(experiment) {
            return Err(IsocoreError::DuplicateExperiment {
                node: self.name.clone(),
                experiment: experiment.to_string(),
            });
        }
        for (k, v) in &obs.features {
            self.features.insert(k.clone(), v.clone());
        }
        self.observations.insert(experiment.to_string(), obs);
        Ok(())
    }

    pub fn remove_observation(&mut self, experiment: &str) {
        self.observations.remove(experiment);
    }

    pub fn observation(&self, experiment: &str) -> Option<&CompoundObservation> {
        self.observations.get(experiment)
    }

    pub fn observation_mut(&mut self, experiment: &str) -> Option<&mut CompoundObservation> {
        self.observations.get_mut(experiment)
    }

    pub fn observations(&self) -> impl Iterator<Item = (&String, &CompoundObservation)> {
        self.observations.iter()
    }

    pub fn experiments(&self) -> Vec<&str> {
        self.observations.keys().map(|s| s.as_str()).collect()
    }

    pub fn experiment_count(&self) -> usize {
        self.observations.len()
    }

    pub fn has_experiment(&self, experiment: &str) -> bool {
        self.observations.contains_key(experiment)
    }

    pub fn ion_selection(&self) -> IonSelection {
        self.ion_selection
    }

    pub fn set_ion_selection(&mut self, selection: IonSelection) {
        self.ion_selection = selection;
    }

    pub fn add_feature(&mut self, name: &str, value: &str) {
        self.features.insert(name.to_string(), value.to_string());
    }

    pub fn feature(&self, name: &str) -> Option<&str> {
        self.features.get(name).map(|s| s.as_str())
    }

    /// Every fragment ion labeled in any experiment of this node.
    pub fn all_labeled_ions(&self) -> BTreeSet<OrderedFloat<f64>> {
        let mut ions = BTreeSet::new();
        for obs in self.observations.values() {
            for ion in obs.labeled_ions() {
                ions.insert(OrderedFloat(ion));
            }
        }
        ions
    }

    /// The largest ion labeled in every experiment whose mean goodness of
    /// fit reaches 0.95, falling back to the largest common ion overall.
    /// `None` when the experiments share no labeled ion.
    pub fn largest_common_ion(&self) -> Option<f64> {
        let mut iter = self.observations.values();
        let first = iter.next()?;
        let mut common: BTreeSet<OrderedFloat<f64>> =
            first.labeled_ions().into_iter().map(OrderedFloat).collect();
        for obs in iter {
            let ions: BTreeSet<OrderedFloat<f64>> =
                obs.labeled_ions().into_iter().map(OrderedFloat).collect();
            common = common.intersection(&ions).cloned().collect();
            if common.is_empty() {
                return None;
            }
        }

        let n = self.observations.len() as f64;
        for ion in common.iter().rev() {
            let mean_r2: f64 = self
                .observations
                .values()
                .filter_map(|obs| obs.mid_for_ion(ion.into_inner()))
                .map(|mid| mid.r2)
                .sum::<f64>()
                / n;
            if mean_r2 >= COMMON_ION_MIN_R2 {
                return Some(ion.into_inner());
            }
        }

        common.iter().next_back().map(|ion| ion.into_inner())
    }

    /// The distribution scored for the given experiment, per the node's ion
    /// selection policy. Falls back to the experiment's highest-mass ion
    /// when the common ion is not present in that experiment.
    pub fn selected_mid(&self, experiment: &str) -> Option<&IsotopomerDistribution> {
        let obs = self.observations.get(experiment)?;
        match self.ion_selection {
            IonSelection::Individual => obs.largest_ion_mid(),
            IonSelection::LargestCommon => self
                .largest_common_ion()
                .and_then(|ion| obs.mid_for_ion(ion))
                .or_else(|| obs.largest_ion_mid()),
        }
    }

    /// Union of the fragment-ion windows (start mass, end mass) seen across
    /// all experiments of this node. Windows sharing a start are merged to
    /// the widest end; the result is sorted by start.
    pub fn fragment_windows(&self) -> Vec<(usize, usize)> {
        let mut windows: Vec<(usize, usize)> = Vec::new();
        for obs in self.observations.values() {
            for mid in obs.mids() {
                let start = mid.ion as usize;
                let end = start + mid.len();
                match windows.iter_mut().find(|(s, _)| *s == start) {
                    Some((_, e)) => *e = (*e).max(end),
                    None => windows.push((start, end)),
                }
            }
        }
        windows.sort_by_key(|&(s, _)| s);
        windows
    }

    /// Maximum cross-experiment population standard deviation of any
    /// isotopomer fraction of the selected distributions. Nodes seen in a
    /// single experiment vary by 0 by definition.
    pub fn variation_score(&self) -> f64 {
        if self.observations.len() <= 1 {
            return 0.0;
        }

        let mids: Vec<&IsotopomerDistribution> = self
            .observations
            .keys()
            .filter_map(|t| self.selected_mid(t))
            .collect();
        let max_len = mids.iter().map(|m| m.len()).max().unwrap_or(0);

        let mut max_sd: f64 = 0.0;
        for m in 0..max_len {
            let values: Vec<f64> =
                mids.iter().filter(|mid| mid.len() > m).map(|mid| mid.fractions[m]).collect();
            let sd = values.as_slice().population_variance().sqrt();
            max_sd = max_sd.max(sd);
        }

        max_sd
    }

    /// Mean retention index over all experiments of this node.
    pub fn average_retention_index(&self) -> f64 {
        let n = self.observations.len();
        if n == 0 {
            return 0.0;
        }
        self.observations.values().map(|obs| obs.retention_index).sum::<f64>() / n as f64
    }

    /// Smallest one-way ANOVA p-value over all isotopomer levels, testing
    /// whether any fraction differs between experiments. 1.0 when fewer
    /// than two experiments contribute.
    pub fn min_anova_p_value(&self) -> f64 {
        if self.observations.len() <= 1 {
            return 1.0;
        }

        let max_len = self
            .observations
            .keys()
            .filter_map(|t| self.selected_mid(t))
            .map(|mid| mid.len())
            .max()
            .unwrap_or(0);

        (0..max_len)
            .map(|m| self.anova_p_value_for_isotopomer(m))
            .fold(1.0, f64::min)
    }

    /// One-way ANOVA p-value for isotopomer level `m` across experiments.
    /// Group standard deviations are recovered from the confidence
    /// intervals via the inverse Students-t CDF at 0.9.
    pub fn anova_p_value_for_isotopomer(&self, m: usize) -> f64 {
        let mut means: Vec<f64> = Vec::new();
        let mut sds: Vec<f64> = Vec::new();
        let mut min_num_files = usize::MAX;

        for t in self.observations.keys() {
            let obs = &self.observations[t];
            let mid = match self.selected_mid(t) {
                Some(mid) if mid.len() > m => mid,
                _ => continue,
            };

            let n = obs.labeled_spec_count * obs.unlabeled_spec_count;
            let df = n.saturating_sub(1) * mid.len();
            if df == 0 {
                continue;
            }

            min_num_files =
                min_num_files.min(obs.labeled_spec_count.max(obs.unlabeled_spec_count));

            let t_dist = match StudentsT::new(0.0, 1.0, df as f64) {
                Ok(d) => d,
                Err(_) => continue,
            };
            let t_quantile = t_dist.inverse_cdf(0.9);

            means.push(mid.fractions[m]);
            sds.push(mid.confidence[m] / t_quantile);
        }

        if min_num_files == usize::MAX {
            return 1.0;
        }

        anova_p_value(&means, &sds, min_num_files)
    }
}

/// One-way ANOVA p-value from group means, group standard deviations and a
/// per-group observation count.
pub fn anova_p_value(means: &[f64], sds: &[f64], n: usize) -> f64 {
    let k = means.len();
    if n < 2 || k < 2 || sds.len() != k {
        return 1.0;
    }

    let df1 = n - 1;
    let df2 = n * k - df1 - 1;

    let mean_mean: f64 = means.iter().sum::<f64>() / k as f64;
    let sum_var: f64 = sds.iter().map(|sd| sd * sd).sum();

    let s_x: f64 =
        means.iter().map(|m| (m - mean_mean) * (m - mean_mean)).sum::<f64>() / (k - 1) as f64;

    let f = n as f64 * s_x / (sum_var / k as f64);
    if !f.is_finite() {
        return if f.is_nan() { 1.0 } else { 0.0 };
    }

    match FisherSnedecor::new(df1 as f64, df2 as f64) {
        Ok(dist) => 1.0 - dist.cdf(f),
        Err(_) => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::data::mid::IsotopomerDistribution;

    fn mid(ion: f64, fractions: Vec<f64>, r2: f64) -> IsotopomerDistribution {
        let n = fractions.len();
        IsotopomerDistribution::new(fractions, vec![0.01; n], ion, r2).unwrap()
    }

    fn obs(name: &str, mids: Vec<IsotopomerDistribution>) -> CompoundObservation {
        CompoundObservation::new(name, 1500.0, mids)
    }

    fn node_with(mids_per_exp: Vec<(&str, Vec<IsotopomerDistribution>)>) -> NodeCompound {
        let mut node = NodeCompound::new("succinate");
        for (exp, mids) in mids_per_exp {
            node.attach_observation(exp, obs("succinate", mids)).unwrap();
        }
        node
    }

    #[test]
    fn test_attach_rejects_second_observation_for_experiment() {
        let mut node = NodeCompound::new("fumarate");
        node.attach_observation("glc", obs("fumarate", vec![mid(245.0, vec![0.5, 0.5], 0.99)]))
            .unwrap();
        let err = node
            .attach_observation("glc", obs("fumarate", vec![mid(245.0, vec![0.5, 0.5], 0.99)]))
            .unwrap_err();
        assert!(matches!(err, IsocoreError::DuplicateExperiment { .. }));
    }

    #[test]
    fn test_single_experiment_node_has_zero_variation() {
        let node = node_with(vec![("glc", vec![mid(245.0, vec![0.1, 0.2, 0.7], 0.99)])]);
        assert_eq!(node.variation_score(), 0.0);
    }

    #[test]
    fn test_variation_concrete_case() {
        // M0 fractions 0.5 / 0.6 / 0.55 over three experiments
        let node = node_with(vec![
            ("glc", vec![mid(245.0, vec![0.5], 0.99)]),
            ("gln", vec![mid(245.0, vec![0.6], 0.99)]),
            ("lac", vec![mid(245.0, vec![0.55], 0.99)]),
        ]);
        assert_relative_eq!(node.variation_score(), (0.005f64 / 3.0).sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn test_variation_uses_only_experiments_with_entry() {
        // level 1 exists in two experiments only; SD over exactly those two
        let node = node_with(vec![
            ("glc", vec![mid(245.0, vec![0.5, 0.5], 0.99)]),
            ("gln", vec![mid(245.0, vec![0.5, 0.3], 0.99)]),
            ("lac", vec![mid(245.0, vec![0.5], 0.99)]),
        ]);
        assert_relative_eq!(node.variation_score(), 0.1, epsilon = 1e-9);
    }

    #[test]
    fn test_largest_common_ion_prefers_high_r2() {
        let node = node_with(vec![
            (
                "glc",
                vec![mid(174.0, vec![0.5, 0.5], 0.99), mid(245.0, vec![0.5, 0.5], 0.90)],
            ),
            (
                "gln",
                vec![mid(174.0, vec![0.6, 0.4], 0.99), mid(245.0, vec![0.6, 0.4], 0.91)],
            ),
        ]);
        // 245 is common but its mean fit is below 0.95
        assert_eq!(node.largest_common_ion(), Some(174.0));
    }

    #[test]
    fn test_largest_common_ion_falls_back_to_largest() {
        let node = node_with(vec![
            ("glc", vec![mid(174.0, vec![0.5, 0.5], 0.90), mid(245.0, vec![0.5, 0.5], 0.90)]),
            ("gln", vec![mid(174.0, vec![0.6, 0.4], 0.90), mid(245.0, vec![0.6, 0.4], 0.90)]),
        ]);
        assert_eq!(node.largest_common_ion(), Some(245.0));
    }

    #[test]
    fn test_no_common_ion() {
        let node = node_with(vec![
            ("glc", vec![mid(174.0, vec![0.5, 0.5], 0.99)]),
            ("gln", vec![mid(245.0, vec![0.6, 0.4], 0.99)]),
        ]);
        assert_eq!(node.largest_common_ion(), None);
    }

    #[test]
    fn test_selected_mid_individual_takes_largest_ion() {
        let mut node = node_with(vec![(
            "glc",
            vec![mid(174.0, vec![0.5, 0.5], 0.99), mid(245.0, vec![0.7, 0.3], 0.99)],
        )]);
        node.set_ion_selection(IonSelection::Individual);
        assert_eq!(node.selected_mid("glc").unwrap().ion, 245.0);
    }

    #[test]
    fn test_selected_mid_common_policy() {
        let mut node = node_with(vec![
            ("glc", vec![mid(174.0, vec![0.5, 0.5], 0.99), mid(245.0, vec![0.7, 0.3], 0.99)]),
            ("gln", vec![mid(174.0, vec![0.6, 0.4], 0.99)]),
        ]);
        node.set_ion_selection(IonSelection::LargestCommon);
        assert_eq!(node.selected_mid("glc").unwrap().ion, 174.0);
        assert_eq!(node.selected_mid("gln").unwrap().ion, 174.0);
    }

    #[test]
    fn test_fragment_windows_merge_same_start() {
        let node = node_with(vec![
            ("glc", vec![mid(174.0, vec![0.5, 0.5], 0.99)]),
            ("gln", vec![mid(174.0, vec![0.4, 0.3, 0.3], 0.99), mid(245.0, vec![1.0], 0.99)]),
        ]);
        assert_eq!(node.fragment_windows(), vec![(174, 177), (245, 246)]);
    }

    #[test]
    fn test_anova_identical_groups_is_insignificant() {
        let p = anova_p_value(&[0.5, 0.5, 0.5], &[0.01, 0.01, 0.01], 3);
        assert_relative_eq!(p, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_anova_separated_groups_is_significant() {
        let p = anova_p_value(&[0.1, 0.9], &[0.01, 0.01], 5);
        assert!(p < 0.01);
    }

    #[test]
    fn test_anova_degenerate_inputs() {
        assert_eq!(anova_p_value(&[0.5], &[0.01], 5), 1.0);
        assert_eq!(anova_p_value(&[0.5, 0.6], &[0.01, 0.01], 1), 1.0);
    }
}
