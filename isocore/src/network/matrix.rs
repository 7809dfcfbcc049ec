use itertools::Itertools;
use log::info;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::algorithm::distance::{DistanceConfig, DistanceEngine};
use crate::data::dataset::{Dataset, M0Mode};
use crate::data::mid::{base_peak_normalization, sum_normalization};
use crate::data::node::NodeCompound;

/// One cell of a distance matrix.
///
/// Distances that cannot be computed are stored as explicit kinds instead
/// of sentinel floats: `Missing` when one of the nodes has no observation
/// for the experiment, `Incomparable` when the measure is undefined on the
/// aligned pair (e.g. Canberra where both values are 0). Neither kind can
/// ever satisfy a cutoff.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum DistanceEntry {
    Finite(f64),
    Missing,
    Incomparable,
}

impl DistanceEntry {
    /// Numeric view: `Missing` maps to +inf, `Incomparable` to NaN.
    pub fn value(&self) -> f64 {
        match self {
            DistanceEntry::Finite(d) => *d,
            DistanceEntry::Missing => f64::INFINITY,
            DistanceEntry::Incomparable => f64::NAN,
        }
    }

    pub fn is_finite(&self) -> bool {
        matches!(self, DistanceEntry::Finite(_))
    }

    /// Whether this entry qualifies as an edge under the given cutoff.
    pub fn passes(&self, cutoff: f64) -> bool {
        matches!(self, DistanceEntry::Finite(d) if *d <= cutoff)
    }
}

/// Pairwise distances of one experiment over the canonical node index
/// space.
///
/// Only the upper triangle is computed; access is canonicalized to
/// (min, max) so both `get(i, j)` and `get(j, i)` read the same computed
/// cell. The diagonal holds the constant 1.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DistanceMatrix {
    size: usize,
    entries: Vec<DistanceEntry>,
    range: (f64, f64),
    mean: f64,
}

impl DistanceMatrix {
    /// Number of rows/columns; always equals the canonical node count the
    /// matrix was built for.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Observed (min, max) over the finite upper-triangle distances.
    pub fn range(&self) -> (f64, f64) {
        self.range
    }

    /// Mean of the finite upper-triangle distances.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    fn triangle_index(&self, i: usize, j: usize) -> usize {
        triangle_index(self.size, i, j)
    }

    pub fn get(&self, i: usize, j: usize) -> DistanceEntry {
        self.entries[self.triangle_index(i, j)]
    }

    /// Fully mirrored dense copy for tabular export: `Missing` becomes
    /// +inf, `Incomparable` NaN, the diagonal stays 1.
    pub fn to_dense(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.size, self.size, |i, j| self.get(i, j).value())
    }
}

/// Builds one distance matrix per experiment over the canonical node index
/// space, applying the per-dataset gap penalty and M0 handling.
pub struct DistanceMatrixBuilder {
    config: DistanceConfig,
    use_z_score: bool,
    seed: Option<u64>,
}

impl DistanceMatrixBuilder {
    pub fn new(config: DistanceConfig) -> Self {
        DistanceMatrixBuilder { config, use_z_score: false, seed: None }
    }

    /// Standardize every finite distance against the Monte-Carlo null model
    /// for its length pair.
    pub fn use_z_score(mut self, on: bool) -> Self {
        self.use_z_score = on;
        self
    }

    /// Seed for the Monte-Carlo sampling, for reproducible z-scores.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// One matrix per dataset, in dataset order. Matrix dimensions equal
    /// `nodes.len()`; any change to the node set requires calling this
    /// again for every dataset.
    pub fn build_all(&self, nodes: &[NodeCompound], datasets: &[Dataset]) -> Vec<DistanceMatrix> {
        info!("creating distance matrices for {} nodes", nodes.len());
        datasets.iter().map(|ds| self.build(nodes, ds)).collect()
    }

    /// The distance matrix of a single experiment.
    pub fn build(&self, nodes: &[NodeCompound], dataset: &Dataset) -> DistanceMatrix {
        let experiment = &dataset.settings.experiment;
        let config =
            DistanceConfig { gap_penalty: dataset.settings.gap_penalty, ..self.config };
        let mut engine = match self.seed {
            Some(seed) => DistanceEngine::with_seed(config, seed),
            None => DistanceEngine::new(config),
        };

        // representative MID per node, preprocessed per the M0 mode
        let mids: Vec<Option<Vec<f64>>> = nodes
            .iter()
            .map(|node| {
                node.selected_mid(experiment)
                    .map(|mid| preprocess_mid(&mid.fractions, dataset.settings.m0_mode))
                    .filter(|fractions| !fractions.is_empty())
            })
            .collect();

        let n = nodes.len();
        let mut entries = vec![DistanceEntry::Missing; n * (n + 1) / 2];

        let mut d_min = f64::INFINITY;
        let mut d_max = f64::NEG_INFINITY;
        let mut d_sum = 0.0;
        let mut finite = 0usize;

        for i in 0..n {
            entries[triangle_index(n, i, i)] = DistanceEntry::Finite(1.0);
        }

        for (i, j) in (0..n).tuple_combinations() {
            let entry = match (&mids[i], &mids[j]) {
                (Some(mid1), Some(mid2)) => {
                    match engine.mid_distance(mid1, mid2) {
                        Ok(dist) => {
                            let dist = if self.use_z_score {
                                engine
                                    .monte_carlo_z_score(dist, mid1.len(), mid2.len())
                                    .unwrap_or(f64::NAN)
                            } else {
                                dist
                            };
                            if dist.is_nan() {
                                DistanceEntry::Incomparable
                            } else {
                                d_min = d_min.min(dist);
                                d_max = d_max.max(dist);
                                d_sum += dist;
                                finite += 1;
                                DistanceEntry::Finite(dist)
                            }
                        }
                        Err(_) => DistanceEntry::Missing,
                    }
                }
                _ => DistanceEntry::Missing,
            };
            entries[triangle_index(n, i, j)] = entry;
        }

        let mut matrix = DistanceMatrix { size: n, entries, range: (0.0, 0.0), mean: 0.0 };
        if finite > 0 {
            matrix.range = (d_min, d_max);
            matrix.mean = d_sum / finite as f64;
        }

        info!(
            "{}: {} nodes, distance range {:.4} - {:.4}, mean {:.4}",
            experiment, n, matrix.range.0, matrix.range.1, matrix.mean
        );

        matrix
    }
}

/// Index into the packed upper triangle (diagonal included); (i, j) is
/// canonicalized to (min, max) first.
fn triangle_index(size: usize, i: usize, j: usize) -> usize {
    let (i, j) = (i.min(j), i.max(j));
    i * size - i * (i.saturating_sub(1)) / 2 + (j - i)
}

/// Applies the M0 handling before alignment: drop the M0 fraction and
/// optionally renormalize what remains.
pub fn preprocess_mid(fractions: &[f64], mode: M0Mode) -> Vec<f64> {
    match mode {
        M0Mode::AsIs => fractions.to_vec(),
        M0Mode::DropM0 => fractions[1..].to_vec(),
        M0Mode::BasePeakNormalize => base_peak_normalization(&fractions[1..]),
        M0Mode::SumNormalize => sum_normalization(&fractions[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::data::dataset::DatasetSettings;
    use crate::data::mid::IsotopomerDistribution;
    use crate::data::observation::CompoundObservation;

    fn mid(ion: f64, fractions: Vec<f64>) -> IsotopomerDistribution {
        let n = fractions.len();
        IsotopomerDistribution::new(fractions, vec![0.0; n], ion, 0.99).unwrap()
    }

    fn node(name: &str, per_experiment: Vec<(&str, Vec<f64>)>) -> NodeCompound {
        let mut node = NodeCompound::new(name);
        for (experiment, fractions) in per_experiment {
            let obs = CompoundObservation::new(name, 1500.0, vec![mid(233.0, fractions)]);
            node.attach_observation(experiment, obs).unwrap();
        }
        node
    }

    fn dataset(experiment: &str) -> Dataset {
        Dataset::new(DatasetSettings::new(experiment), Vec::new())
    }

    fn builder() -> DistanceMatrixBuilder {
        DistanceMatrixBuilder::new(DistanceConfig::default())
    }

    #[test]
    fn test_matrix_dimensions_match_node_count() {
        let nodes = vec![
            node("a", vec![("glc", vec![0.5, 0.5])]),
            node("b", vec![("glc", vec![0.6, 0.4])]),
            node("c", vec![("glc", vec![0.7, 0.3])]),
        ];
        let mat = builder().build(&nodes, &dataset("glc"));
        assert_eq!(mat.size(), 3);
    }

    #[test]
    fn test_diagonal_is_one() {
        let nodes = vec![node("a", vec![("glc", vec![0.5, 0.5])])];
        let mat = builder().build(&nodes, &dataset("glc"));
        assert_eq!(mat.get(0, 0), DistanceEntry::Finite(1.0));
    }

    #[test]
    fn test_access_is_canonicalized() {
        let nodes = vec![
            node("a", vec![("glc", vec![0.5, 0.5])]),
            node("b", vec![("glc", vec![0.9, 0.1])]),
        ];
        let mat = builder().build(&nodes, &dataset("glc"));
        assert_eq!(mat.get(0, 1), mat.get(1, 0));
        assert!(mat.get(0, 1).is_finite());
    }

    #[test]
    fn test_missing_observation_yields_missing_entry() {
        let nodes = vec![
            node("x", vec![("glc", vec![0.5, 0.5]), ("gln", vec![0.6, 0.4])]),
            node("y", vec![("glc", vec![0.9, 0.1])]),
        ];
        let mat_gln = builder().build(&nodes, &dataset("gln"));
        assert_eq!(mat_gln.get(0, 1), DistanceEntry::Missing);
        assert_eq!(mat_gln.get(0, 1).value(), f64::INFINITY);
        assert!(!mat_gln.get(0, 1).passes(f64::MAX));
    }

    #[test]
    fn test_identical_mids_have_zero_distance() {
        let nodes = vec![
            node("a", vec![("glc", vec![0.5, 0.3, 0.2])]),
            node("b", vec![("glc", vec![0.5, 0.3, 0.2])]),
        ];
        let mat = builder().build(&nodes, &dataset("glc"));
        assert_eq!(mat.get(0, 1), DistanceEntry::Finite(0.0));
    }

    #[test]
    fn test_drop_m0_mode_ignores_m0_difference() {
        let nodes = vec![
            node("a", vec![("glc", vec![0.5, 0.3, 0.2])]),
            node("b", vec![("glc", vec![0.8, 0.3, 0.2])]),
        ];
        let mut ds = dataset("glc");

        let mat = builder().build(&nodes, &ds);
        assert!(matches!(mat.get(0, 1), DistanceEntry::Finite(d) if d > 0.0));

        ds.settings.m0_mode = M0Mode::DropM0;
        let mat = builder().build(&nodes, &ds);
        assert_eq!(mat.get(0, 1), DistanceEntry::Finite(0.0));
    }

    #[test]
    fn test_sum_normalize_mode() {
        // same shape after dropping M0 and renormalizing
        let nodes = vec![
            node("a", vec![("glc", vec![0.6, 0.3, 0.1])]),
            node("b", vec![("glc", vec![0.2, 0.6, 0.2])]),
        ];
        let mut ds = dataset("glc");
        ds.settings.m0_mode = M0Mode::SumNormalize;
        let mat = builder().build(&nodes, &ds);
        assert_eq!(mat.get(0, 1), DistanceEntry::Finite(0.0));
    }

    #[test]
    fn test_preprocess_empty_after_m0_drop_is_missing() {
        let nodes = vec![
            node("a", vec![("glc", vec![1.0])]),
            node("b", vec![("glc", vec![0.5, 0.5])]),
        ];
        let mut ds = dataset("glc");
        ds.settings.m0_mode = M0Mode::DropM0;
        let mat = builder().build(&nodes, &ds);
        assert_eq!(mat.get(0, 1), DistanceEntry::Missing);
    }

    #[test]
    fn test_range_tracks_finite_distances() {
        let nodes = vec![
            node("a", vec![("glc", vec![0.5, 0.5])]),
            node("b", vec![("glc", vec![0.6, 0.4])]),
            node("c", vec![("glc", vec![0.9, 0.1])]),
        ];
        let mat = builder().build(&nodes, &dataset("glc"));
        let (min, max) = mat.range();
        assert!(min > 0.0);
        assert!(max >= min);
        for (i, j) in [(0usize, 1usize), (0, 2), (1, 2)] {
            if let DistanceEntry::Finite(d) = mat.get(i, j) {
                assert!(d >= min && d <= max);
            }
        }
    }

    #[test]
    fn test_dense_export_mirrors() {
        let nodes = vec![
            node("a", vec![("glc", vec![0.5, 0.5])]),
            node("b", vec![("glc", vec![0.6, 0.4])]),
        ];
        let mat = builder().build(&nodes, &dataset("glc"));
        let dense = mat.to_dense();
        assert_eq!(dense.nrows(), 2);
        assert_relative_eq!(dense[(0, 1)], dense[(1, 0)], epsilon = 1e-15);
        assert_relative_eq!(dense[(0, 0)], 1.0, epsilon = 1e-15);
    }
}
