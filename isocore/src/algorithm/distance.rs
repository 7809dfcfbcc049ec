use std::collections::HashMap;
use std::fmt;
use std::fmt::{Display, Formatter};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::algorithm::alignment::align;
use crate::error::{IsocoreError, Result};

/// Raw dissimilarity measure applied to an aligned pair of distributions.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum DistanceMeasure {
    Euclidean,
    /// Summand is undefined (NaN) where both aligned values are 0.
    Canberra,
    Manhattan,
    /// The plain unnormalized dot product. Kept as the historical scoring
    /// variant; not a cosine similarity.
    DotProduct,
    /// 1 - Pearson correlation of the aligned vectors.
    Custom,
}

impl Default for DistanceMeasure {
    fn default() -> Self {
        DistanceMeasure::Euclidean
    }
}

impl Display for DistanceMeasure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DistanceMeasure::Euclidean => write!(f, "Euclidean"),
            DistanceMeasure::Canberra => write!(f, "Canberra"),
            DistanceMeasure::Manhattan => write!(f, "Manhattan"),
            DistanceMeasure::DotProduct => write!(f, "DotProduct"),
            DistanceMeasure::Custom => write!(f, "Custom"),
        }
    }
}

/// Length-based normalization of the raw measure.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum LengthNormalization {
    None,
    Sum,
    Prod,
    Max,
    Min,
}

impl Default for LengthNormalization {
    fn default() -> Self {
        LengthNormalization::Sum
    }
}

/// Distance calculation parameters, threaded explicitly through every call.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct DistanceConfig {
    pub measure: DistanceMeasure,
    pub normalization: LengthNormalization,
    pub gap_penalty: f64,
}

impl Default for DistanceConfig {
    fn default() -> Self {
        DistanceConfig {
            measure: DistanceMeasure::Euclidean,
            normalization: LengthNormalization::Sum,
            gap_penalty: 0.2,
        }
    }
}

pub fn euclidean_distance(v: &[f64], w: &[f64]) -> f64 {
    debug_assert_eq!(v.len(), w.len());
    v.iter().zip(w.iter()).map(|(a, b)| (a - b) * (a - b)).sum::<f64>().sqrt()
}

pub fn canberra_distance(v: &[f64], w: &[f64]) -> f64 {
    debug_assert_eq!(v.len(), w.len());
    v.iter().zip(w.iter()).map(|(a, b)| (a - b).abs() / (a.abs() + b.abs())).sum()
}

pub fn manhattan_distance(v: &[f64], w: &[f64]) -> f64 {
    debug_assert_eq!(v.len(), w.len());
    v.iter().zip(w.iter()).map(|(a, b)| (a - b).abs()).sum()
}

pub fn dot_product(v: &[f64], w: &[f64]) -> f64 {
    debug_assert_eq!(v.len(), w.len());
    v.iter().zip(w.iter()).map(|(a, b)| a * b).sum()
}

/// 1 - Pearson correlation, with population mean and standard deviation
/// taken over the aligned length.
pub fn pearson_distance(v: &[f64], w: &[f64]) -> f64 {
    debug_assert_eq!(v.len(), w.len());
    let n = v.len() as f64;

    let m_v = v.iter().sum::<f64>() / n;
    let m_w = w.iter().sum::<f64>() / n;

    let sd_v = (v.iter().map(|x| (m_v - x) * (m_v - x)).sum::<f64>() / n).sqrt();
    let sd_w = (w.iter().map(|x| (m_w - x) * (m_w - x)).sum::<f64>() / n).sqrt();

    let corr: f64 =
        v.iter().zip(w.iter()).map(|(a, b)| (a - m_v) / sd_v * (b - m_w) / sd_w).sum::<f64>() / n;

    1.0 - corr
}

/// Scores aligned distribution pairs and maintains the Monte-Carlo null
/// models used for z-score standardization.
///
/// The null-model cache is owned by the engine instance and keyed by the
/// (shorter, longer) length pair. An optional seed makes the sampling
/// reproducible; by default the models are drawn from entropy.
pub struct DistanceEngine {
    config: DistanceConfig,
    sample_count: usize,
    seed: Option<u64>,
    models: HashMap<(usize, usize), (f64, f64)>,
}

impl DistanceEngine {
    /// Number of random distribution pairs behind each null model.
    pub const DEFAULT_SAMPLE_COUNT: usize = 1000;

    pub fn new(config: DistanceConfig) -> Self {
        DistanceEngine {
            config,
            sample_count: Self::DEFAULT_SAMPLE_COUNT,
            seed: None,
            models: HashMap::new(),
        }
    }

    /// Engine with a deterministic Monte-Carlo sampling seed.
    pub fn with_seed(config: DistanceConfig, seed: u64) -> Self {
        DistanceEngine { seed: Some(seed), ..Self::new(config) }
    }

    pub fn config(&self) -> &DistanceConfig {
        &self.config
    }

    pub fn set_sample_count(&mut self, sample_count: usize) {
        self.sample_count = sample_count;
        self.models.clear();
    }

    /// Distance of an aligned pair.
    ///
    /// # Arguments
    ///
    /// * `al_v` - first aligned vector.
    /// * `al_w` - second aligned vector, same length.
    /// * `orig_len1` - pre-alignment length of the first vector; 0 means
    ///   "use the aligned length".
    /// * `orig_len2` - likewise for the second vector.
    ///
    /// The raw measure is divided by the configured length normalization;
    /// the absolute value of the quotient is returned. May be NaN for
    /// measures that are undefined on the input (Canberra at 0/0).
    pub fn aligned_distance(
        &self,
        al_v: &[f64],
        al_w: &[f64],
        orig_len1: usize,
        orig_len2: usize,
    ) -> f64 {
        let dist = match self.config.measure {
            DistanceMeasure::Euclidean => euclidean_distance(al_v, al_w),
            DistanceMeasure::Canberra => canberra_distance(al_v, al_w),
            DistanceMeasure::Manhattan => manhattan_distance(al_v, al_w),
            DistanceMeasure::DotProduct => dot_product(al_v, al_w),
            DistanceMeasure::Custom => pearson_distance(al_v, al_w),
        };

        let len1 = if orig_len1 == 0 { al_v.len() } else { orig_len1 };
        let len2 = if orig_len2 == 0 { al_w.len() } else { orig_len2 };

        let divide_by = match self.config.normalization {
            LengthNormalization::None => 1.0,
            LengthNormalization::Sum => (len1 + len2) as f64,
            LengthNormalization::Prod => (len1 * len2) as f64,
            LengthNormalization::Max => len1.max(len2) as f64,
            LengthNormalization::Min => len1.min(len2) as f64,
        };

        (dist / divide_by).abs()
    }

    /// Aligns two distributions with the configured gap penalty and scores
    /// the pair.
    ///
    /// # Examples
    ///
    /// ```
    /// use isocore::algorithm::distance::{DistanceConfig, DistanceEngine, DistanceMeasure, LengthNormalization};
    ///
    /// let config = DistanceConfig {
    ///     measure: DistanceMeasure::Euclidean,
    ///     normalization: LengthNormalization::None,
    ///     gap_penalty: 0.5,
    /// };
    /// let engine = DistanceEngine::new(config);
    /// let d = engine.mid_distance(&[1.0, 0.0, 0.0], &[1.0, 0.0]).unwrap();
    /// assert_eq!(d, 0.0);
    /// ```
    pub fn mid_distance(&self, v: &[f64], w: &[f64]) -> Result<f64> {
        let (al_v, al_w) = align(v, w, self.config.gap_penalty)?;
        Ok(self.aligned_distance(&al_v, &al_w, v.len(), w.len()))
    }

    /// Standardizes an observed distance against the null model for the
    /// given length pair, building and caching the model on first use.
    pub fn monte_carlo_z_score(&mut self, distance: f64, len1: usize, len2: usize) -> Result<f64> {
        let key = (len1.min(len2), len1.max(len2));
        if key.0 == 0 {
            return Err(IsocoreError::EmptyAlignment);
        }

        if !self.models.contains_key(&key) {
            let model = self.create_monte_carlo_model(key.0, key.1);
            self.models.insert(key, model);
        }

        let (mean, sd) = self.models[&key];
        Ok((distance - mean) / sd)
    }

    /// Samples `sample_count` random distribution pairs of the given
    /// lengths, scores them through the alignment pipeline and returns the
    /// population (mean, standard deviation) of the scores.
    ///
    /// The samples are split into disjoint contiguous slices, one per rayon
    /// worker; each worker writes only its own slice and all workers are
    /// joined before the moments are computed.
    fn create_monte_carlo_model(&self, len1: usize, len2: usize) -> (f64, f64) {
        let size = self.sample_count;
        let workers = rayon::current_num_threads().max(1);
        let chunk_size = size.div_ceil(workers).max(1);

        let gap_penalty = self.config.gap_penalty;
        let seed = self.seed;

        let mut dists = vec![0.0f64; size];
        dists.par_chunks_mut(chunk_size).enumerate().for_each(|(chunk, slice)| {
            let mut rng: StdRng = match seed {
                Some(s) => StdRng::seed_from_u64(s.wrapping_add(chunk as u64)),
                None => StdRng::from_entropy(),
            };
            for d in slice.iter_mut() {
                let v1 = normalized_random_vector(len1, &mut rng);
                let v2 = normalized_random_vector(len2, &mut rng);
                if let Ok((al_v, al_w)) = align(&v1, &v2, gap_penalty) {
                    *d = self.aligned_distance(&al_v, &al_w, v1.len(), v2.len());
                }
            }
        });

        let mean = dists.as_slice().mean();
        let sd = dists.as_slice().population_variance().sqrt();
        (mean, sd)
    }
}

/// Random non-negative vector normalized to sum 1.
fn normalized_random_vector<R: Rng>(len: usize, rng: &mut R) -> Vec<f64> {
    let mut v: Vec<f64> = (0..len).map(|_| rng.gen::<f64>()).collect();
    let sum: f64 = v.iter().sum();
    for x in v.iter_mut() {
        *x /= sum;
    }
    v
}
