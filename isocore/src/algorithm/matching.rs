use std::collections::HashMap;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::data::dataset::{Dataset, DatasetSettings};
use crate::data::mid::IsotopomerDistribution;
use crate::data::node::{IonSelection, NodeCompound, GROUPING_FEATURE};
use crate::data::observation::CompoundObservation;
use crate::error::Result;

/// Best match of an observation against the running spectral library.
#[derive(Clone, Copy, Debug)]
pub struct LibraryHit {
    /// Index of the node whose representative spectrum matched.
    pub node_index: usize,
    pub score: f64,
}

/// Spectral similarity search over the representative spectra of already
/// created nodes. Implementations are external; the matcher only consumes
/// the best hit and registers new representatives.
pub trait SpectralLibrary {
    fn best_hit(&self, observation: &CompoundObservation) -> Option<LibraryHit>;

    fn register(&mut self, observation: &CompoundObservation, node_index: usize, experiment: &str);
}

/// Similarity search against a fixed library of compounds that must never
/// become nodes (e.g. known contaminants).
pub trait ExcludeLibrary {
    /// Score of the best library match, if any.
    fn best_score(&self, observation: &CompoundObservation) -> Option<f64>;
}

/// The empty library: never matches, ignores registrations. Stands in when
/// a library file cannot be loaded; matching then proceeds and simply
/// creates more new nodes than a populated library would.
pub struct NullLibrary;

impl SpectralLibrary for NullLibrary {
    fn best_hit(&self, _observation: &CompoundObservation) -> Option<LibraryHit> {
        None
    }

    fn register(&mut self, _observation: &CompoundObservation, _node_index: usize, _experiment: &str) {}
}

impl ExcludeLibrary for NullLibrary {
    fn best_score(&self, _observation: &CompoundObservation) -> Option<f64> {
        None
    }
}

/// Re-evaluates an observation against a harmonized list of fragment-ion
/// windows (start mass, end mass), returning the distributions detected in
/// those windows. Implementations are external.
pub trait FragmentQuantifier {
    fn requantify(
        &self,
        observation: &CompoundObservation,
        windows: &[(usize, usize)],
    ) -> Vec<IsotopomerDistribution>;
}

/// Configuration for cross-experiment compound matching.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Minimum similarity for attaching an observation to an existing node.
    pub score_cutoff: f64,
    /// Observations matching the exclude library at or above this score are
    /// discarded outright.
    pub exclude_cutoff: f64,
    /// Ion selection policy stamped onto every created node.
    pub ion_selection: IonSelection,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        MatcherConfig {
            score_cutoff: 0.85,
            exclude_cutoff: 0.92,
            ion_selection: IonSelection::Individual,
        }
    }
}

/// Merges per-experiment compound detections into canonical nodes.
///
/// Experiments are processed in their given order. Each surviving
/// observation either joins the node of its best spectral-library hit or
/// founds a new node whose representative spectrum is registered in the
/// running library. Afterwards the fragment-ion windows are harmonized
/// across each node's experiments and every observation is requantified
/// against the union, then the node set is compacted to dense indices that
/// define the distance-matrix index space.
pub struct CompoundMatcher {
    config: MatcherConfig,
}

impl CompoundMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        CompoundMatcher { config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Runs the full matching pass over the datasets.
    ///
    /// A fresh node set is produced on every call; node identity never
    /// survives a rebuild.
    pub fn match_compounds(
        &self,
        datasets: &[Dataset],
        library: &mut dyn SpectralLibrary,
        exclude: Option<&dyn ExcludeLibrary>,
        quantifier: &dyn FragmentQuantifier,
    ) -> Result<Vec<NodeCompound>> {
        let mut nodes: Vec<NodeCompound> = Vec::new();

        for (tracer_id, ds) in datasets.iter().enumerate() {
            let experiment = ds.settings.experiment.clone();

            for raw_obs in &ds.observations {
                let mut obs = raw_obs.clone();
                obs.filter_mids(&ds.settings);

                if !obs.has_labeled_ions() {
                    continue;
                }

                if let Some(exclude) = exclude {
                    if let Some(score) = exclude.best_score(&obs) {
                        if score >= self.config.exclude_cutoff {
                            debug!(
                                "exclude-library match for {} (RI {}), score {:.3}",
                                obs.name, obs.retention_index, score
                            );
                            continue;
                        }
                    }
                }

                let mut attached = false;
                if tracer_id > 0 {
                    if let Some(hit) = library.best_hit(&obs) {
                        if hit.score >= self.config.score_cutoff
                            && hit.node_index < nodes.len()
                            && !nodes[hit.node_index].has_experiment(&experiment)
                        {
                            nodes[hit.node_index].attach_observation(&experiment, obs.clone())?;
                            attached = true;
                        }
                    }
                }

                if !attached {
                    // first tracer or not yet in the library: found a new node
                    let index = nodes.len();
                    obs.add_feature(GROUPING_FEATURE, &index.to_string());
                    library.register(&obs, index, &experiment);

                    let mut node = NodeCompound::new(&obs.name);
                    node.set_ion_selection(self.config.ion_selection);
                    node.add_feature(GROUPING_FEATURE, &index.to_string());
                    node.attach_observation(&experiment, obs)?;
                    nodes.push(node);
                }
            }
        }

        info!("detected {} labeled compounds", nodes.len());

        if datasets.len() >= 2 {
            redetect_all_ions(&mut nodes, datasets, quantifier);
        }
        filter_and_reindex(&mut nodes);

        Ok(nodes)
    }
}

/// Harmonizes which fragment-ion windows are evaluated across all of a
/// node's experiments: every observation is requantified against the union
/// of the windows any experiment detected, refiltered, and dropped when no
/// qualifying labeled ion remains.
pub fn redetect_all_ions(
    nodes: &mut [NodeCompound],
    datasets: &[Dataset],
    quantifier: &dyn FragmentQuantifier,
) {
    let settings: HashMap<&str, &DatasetSettings> =
        datasets.iter().map(|ds| (ds.settings.experiment.as_str(), &ds.settings)).collect();

    for node in nodes.iter_mut() {
        debug!("redetecting labeled fragments: {}", node.name);
        let windows = node.fragment_windows();
        let experiments: Vec<String> =
            node.experiments().into_iter().map(|s| s.to_string()).collect();

        for experiment in experiments {
            let Some(obs) = node.observation_mut(&experiment) else {
                continue;
            };
            let mids = quantifier.requantify(obs, &windows);
            obs.set_mids(mids);
            if let Some(s) = settings.get(experiment.as_str()) {
                obs.filter_mids(s);
            } else {
                warn!("no dataset settings for experiment {experiment}");
            }
            if !obs.has_labeled_ions() {
                node.remove_observation(&experiment);
            }
        }
    }
}

/// Drops nodes left without any observation and assigns dense zero-based
/// indices to the survivors. The index is stamped into the grouping feature
/// of the node and each of its observations; it equals the node's row and
/// column in every distance matrix.
pub fn filter_and_reindex(nodes: &mut Vec<NodeCompound>) {
    let old = std::mem::take(nodes);
    for mut node in old {
        if node.experiment_count() == 0 {
            info!("removing compound without labeled fragments: {}", node.name);
            continue;
        }

        let index = nodes.len().to_string();
        node.add_feature(GROUPING_FEATURE, &index);
        let experiments: Vec<String> =
            node.experiments().into_iter().map(|s| s.to_string()).collect();
        for experiment in experiments {
            if let Some(obs) = node.observation_mut(&experiment) {
                obs.add_feature(GROUPING_FEATURE, &index);
            }
        }
        nodes.push(node);
    }
}
