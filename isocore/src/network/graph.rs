use std::collections::BTreeMap;

use log::info;
use serde::{Deserialize, Serialize};

use crate::algorithm::distance::DistanceConfig;
use crate::algorithm::matching::{
    CompoundMatcher, ExcludeLibrary, FragmentQuantifier, MatcherConfig, SpectralLibrary,
};
use crate::data::dataset::{Dataset, M0Mode};
use crate::data::node::{IonSelection, NodeCompound};
use crate::error::Result;
use crate::network::matrix::{DistanceMatrix, DistanceMatrixBuilder};

/// A qualifying similarity between two nodes in one experiment. Derived on
/// demand, never stored.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Edge {
    pub node1: usize,
    pub node2: usize,
    pub distance: f64,
    pub dataset_index: usize,
}

/// Node-visibility filters, each independently toggleable.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GraphFilters {
    /// Show nodes without any qualifying edge in a visible dataset.
    pub show_unconnected: bool,
    /// Hide nodes whose variation score falls below `variation_cutoff`.
    pub hide_less_varying: bool,
    pub variation_cutoff: f64,
    /// Hide nodes attached to fewer than `min_experiment_count` experiments.
    pub hide_rare_compounds: bool,
    pub min_experiment_count: usize,
}

impl Default for GraphFilters {
    fn default() -> Self {
        GraphFilters {
            show_unconnected: true,
            hide_less_varying: false,
            variation_cutoff: 0.0,
            hide_rare_compounds: false,
            min_experiment_count: 1,
        }
    }
}

/// Holds the datasets of all experiments, the canonical node set matched
/// across them and one distance matrix per experiment, and derives the
/// visible graph from them.
///
/// The node set and the matrices are single-writer state: they change only
/// through the sequential add/remove-dataset, rebuild and setter methods,
/// which take `&mut self`. Every mutation of the node set rebuilds all
/// matrices; there is no incremental update.
pub struct NetworkSet {
    datasets: Vec<Dataset>,
    nodes: Vec<NodeCompound>,
    matrices: Vec<DistanceMatrix>,
    distance_config: DistanceConfig,
    matcher_config: MatcherConfig,
    use_z_score: bool,
    mc_seed: Option<u64>,
}

impl NetworkSet {
    pub fn new(distance_config: DistanceConfig, matcher_config: MatcherConfig) -> Self {
        NetworkSet {
            datasets: Vec::new(),
            nodes: Vec::new(),
            matrices: Vec::new(),
            distance_config,
            matcher_config,
            use_z_score: false,
            mc_seed: None,
        }
    }

    /// Assembles a set from an externally matched node set and rebuilds the
    /// matrices over it.
    pub fn from_parts(
        datasets: Vec<Dataset>,
        nodes: Vec<NodeCompound>,
        distance_config: DistanceConfig,
    ) -> Self {
        let mut set = NetworkSet::new(distance_config, MatcherConfig::default());
        set.datasets = datasets;
        set.nodes = nodes;
        set.rebuild_matrices();
        set
    }

    pub fn datasets(&self) -> &[Dataset] {
        &self.datasets
    }

    pub fn nodes(&self) -> &[NodeCompound] {
        &self.nodes
    }

    pub fn matrices(&self) -> &[DistanceMatrix] {
        &self.matrices
    }

    /// Node names in index order, for the tabular-export consumer.
    pub fn node_names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name.clone()).collect()
    }

    /// Experiment names in dataset order, for the tabular-export consumer.
    pub fn experiment_names(&self) -> Vec<String> {
        self.datasets.iter().map(|ds| ds.settings.experiment.clone()).collect()
    }

    pub fn add_dataset(&mut self, dataset: Dataset) {
        self.datasets.push(dataset);
    }

    /// Removes a dataset and rebuilds the matrices over the current node
    /// set. A subsequent `rebuild` refreshes the node set itself.
    pub fn remove_dataset(&mut self, index: usize) {
        self.datasets.remove(index);
        self.rebuild_matrices();
    }

    pub fn set_visible(&mut self, index: usize, visible: bool) {
        self.datasets[index].settings.visible = visible;
    }

    /// Standardize distances against the Monte-Carlo null model on the next
    /// matrix rebuild.
    pub fn set_use_z_score(&mut self, on: bool) {
        self.use_z_score = on;
    }

    pub fn set_monte_carlo_seed(&mut self, seed: u64) {
        self.mc_seed = Some(seed);
    }

    /// Full rebuild chain: match compounds across all datasets into a fresh
    /// node set, then rebuild every distance matrix over the new index
    /// space.
    pub fn rebuild(
        &mut self,
        library: &mut dyn SpectralLibrary,
        exclude: Option<&dyn ExcludeLibrary>,
        quantifier: &dyn FragmentQuantifier,
    ) -> Result<()> {
        let matcher = CompoundMatcher::new(self.matcher_config);
        self.nodes = matcher.match_compounds(&self.datasets, library, exclude, quantifier)?;
        self.rebuild_matrices();
        Ok(())
    }

    /// Rebuilds every per-experiment matrix over the current node set.
    pub fn rebuild_matrices(&mut self) {
        let mut builder =
            DistanceMatrixBuilder::new(self.distance_config).use_z_score(self.use_z_score);
        if let Some(seed) = self.mc_seed {
            builder = builder.seed(seed);
        }
        self.matrices = builder.build_all(&self.nodes, &self.datasets);
    }

    /// Sets the same absolute edge cutoff on every dataset.
    pub fn set_distance_cutoff(&mut self, cutoff: f64) {
        for ds in self.datasets.iter_mut() {
            ds.settings.distance_cutoff = cutoff;
        }
    }

    /// Sets each dataset's cutoff to `pct` percent of its observed distance
    /// range above the observed minimum.
    pub fn set_relative_distance_cutoff(&mut self, pct: f64) {
        for (ds, matrix) in self.datasets.iter_mut().zip(self.matrices.iter()) {
            let (min, max) = matrix.range();
            let cutoff = min + pct / 100.0 * (max - min);
            info!("set '{}' cutoff to {:.4} ({}% of range)", ds.settings.experiment, cutoff, pct);
            ds.settings.distance_cutoff = cutoff;
        }
    }

    /// Sets the M0 handling on every dataset and rebuilds the matrices.
    pub fn set_m0_mode(&mut self, mode: M0Mode) {
        for ds in self.datasets.iter_mut() {
            ds.settings.m0_mode = mode;
        }
        self.rebuild_matrices();
    }

    /// Switches every node's ion selection policy and rebuilds the
    /// matrices.
    pub fn set_ion_selection(&mut self, selection: IonSelection) {
        for node in self.nodes.iter_mut() {
            node.set_ion_selection(selection);
        }
        self.rebuild_matrices();
    }

    /// Whether node `n` has at least one qualifying edge in some visible
    /// dataset.
    pub fn node_has_edges(&self, n: usize) -> bool {
        for (ds, matrix) in self.datasets.iter().zip(self.matrices.iter()) {
            if !ds.is_visible() {
                continue;
            }
            let cutoff = ds.settings.distance_cutoff;
            for m in 0..matrix.size() {
                if m != n && matrix.get(n, m).passes(cutoff) {
                    return true;
                }
            }
        }
        false
    }

    fn node_passes(&self, n: usize, variations: &[f64], min_count: usize, variation_cutoff: f64) -> bool {
        if min_count > 1 && self.nodes[n].experiment_count() < min_count {
            return false;
        }
        if self.datasets.len() > 1 && variations[n] < variation_cutoff {
            return false;
        }
        true
    }

    /// All qualifying (node1 < node2, dataset) edges.
    ///
    /// An edge requires a visible dataset, both nodes passing the
    /// experiment-count and variation predicates, and a finite distance at
    /// or below the dataset's cutoff. Missing or incomparable distances
    /// never qualify.
    pub fn edges(&self, min_experiment_count: usize, variation_cutoff: f64) -> Vec<Edge> {
        let variations: Vec<f64> = self.nodes.iter().map(|n| n.variation_score()).collect();
        let mut edges = Vec::new();

        for (ds_index, (ds, matrix)) in self.datasets.iter().zip(self.matrices.iter()).enumerate() {
            if !ds.is_visible() {
                continue;
            }
            let cutoff = ds.settings.distance_cutoff;

            for i in 0..matrix.size() {
                if !self.node_passes(i, &variations, min_experiment_count, variation_cutoff) {
                    continue;
                }
                for j in (i + 1)..matrix.size() {
                    if !self.node_passes(j, &variations, min_experiment_count, variation_cutoff) {
                        continue;
                    }
                    let entry = matrix.get(i, j);
                    if entry.passes(cutoff) {
                        edges.push(Edge {
                            node1: i,
                            node2: j,
                            distance: entry.value(),
                            dataset_index: ds_index,
                        });
                    }
                }
            }
        }

        edges
    }

    /// Number of qualifying edges under the given predicates.
    pub fn edge_count(&self, min_experiment_count: usize, variation_cutoff: f64) -> usize {
        self.edges(min_experiment_count, variation_cutoff).len()
    }

    /// The nodes passing the visibility filters, keyed by node index.
    pub fn visible_nodes(&self, filters: &GraphFilters) -> BTreeMap<usize, &NodeCompound> {
        let variations: Vec<f64> = self.nodes.iter().map(|n| n.variation_score()).collect();
        let mut visible = BTreeMap::new();

        for (n, node) in self.nodes.iter().enumerate() {
            if !filters.show_unconnected && !self.node_has_edges(n) {
                continue;
            }
            if self.datasets.len() > 1
                && filters.hide_less_varying
                && variations[n] < filters.variation_cutoff
            {
                continue;
            }
            if self.datasets.len() > 1
                && filters.hide_rare_compounds
                && node.experiment_count() < filters.min_experiment_count
            {
                continue;
            }
            visible.insert(n, node);
        }

        visible
    }

    /// Global (min, max) over the cutoff-filtered distances of all visible
    /// datasets, for edge-width scaling. The experiment-count and variation
    /// node filters are deliberately not applied here.
    pub fn min_max_distances(&self) -> (f64, f64) {
        let mut overall_min = f64::MAX;
        let mut overall_max = 0.0f64;

        for (ds, matrix) in self.datasets.iter().zip(self.matrices.iter()) {
            if !ds.is_visible() {
                continue;
            }
            let cutoff = ds.settings.distance_cutoff;

            for i in 0..matrix.size() {
                for j in (i + 1)..matrix.size() {
                    let entry = matrix.get(i, j);
                    if entry.passes(cutoff) {
                        overall_min = overall_min.min(entry.value());
                        overall_max = overall_max.max(entry.value());
                    }
                }
            }
        }

        (overall_min, overall_max)
    }
}
