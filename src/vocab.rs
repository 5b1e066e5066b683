use log::{debug, info};
use ndarray::{Array2, ArrayView1};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::*;

/// Ceiling on the number of descriptors used to train a vocabulary.
pub const DEFAULT_MAX_SAMPLES: usize = 10_000;

#[derive(Serialize, Deserialize, PartialEq, Clone)]
/// Visual vocabulary built from a collection of local descriptors. Can be:
/// 1. Trained with k-means.
/// 2. Saved to a file & loaded from a file, reproducing identical assignments.
/// 3. Used to map new descriptors to their visual word ids.
pub struct Vocabulary {
    k: usize,
    dimensionality: usize,
    centroids: Array2<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Initial centroid selection for k-means.
pub enum Init {
    /// `k` distinct samples chosen uniformly at random.
    Random,
    /// k-means++ seeding: each new centroid is drawn with probability
    /// proportional to its squared distance from the nearest chosen one.
    PlusPlus,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TrainParams {
    pub seed: u64,
    pub max_samples: usize,
    pub max_iterations: usize,
    pub init: Init,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            seed: 0,
            max_samples: DEFAULT_MAX_SAMPLES,
            max_iterations: 100,
            init: Init::PlusPlus,
        }
    }
}

/// Vocabulary API
impl Vocabulary {
    /// Build a vocabulary of `k` words by clustering a sample of descriptors.
    ///
    /// Samples beyond `params.max_samples` are dropped from the end.
    pub fn train<D: AsRef<[f32]> + Sync>(
        features: &[D],
        k: usize,
        params: &TrainParams,
    ) -> PhowResult<Self> {
        if k == 0 {
            return Err(PhowErr::config("vocabulary size k must be positive"));
        }
        let features = if features.len() > params.max_samples {
            debug!(
                "Truncating vocabulary sample from {} to {} descriptors",
                features.len(),
                params.max_samples
            );
            &features[..params.max_samples]
        } else {
            features
        };
        if features.len() < k {
            return Err(PhowErr::Configuration(format!(
                "need at least {} descriptors to train {} words, got {}",
                k,
                k,
                features.len()
            )));
        }
        let dimensionality = features[0].as_ref().len();
        if dimensionality == 0 {
            return Err(PhowErr::config("descriptors must not be empty"));
        }
        for f in features {
            check_len("training descriptor", dimensionality, f.as_ref().len())?;
        }

        info!(
            "KMeans with {} descriptors of dimension {}, k = {}",
            features.len(),
            dimensionality,
            k
        );

        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut v = Self {
            k,
            dimensionality,
            centroids: Self::initialize_clusters(features, k, params.init, &mut rng),
        };
        let groups = v.cluster(features, params.max_iterations);

        let sizes: Vec<usize> = groups.iter().map(|g| g.len()).collect();
        info!(
            "Vocabulary trained: min cluster {}, max cluster {}, mean cluster {}",
            sizes.iter().min().unwrap_or(&0),
            sizes.iter().max().unwrap_or(&0),
            features.len() / k
        );

        Ok(v)
    }

    /// Index of the nearest visual word, ties going to the lowest index.
    pub fn assign(&self, descriptor: &[f32]) -> PhowResult<usize> {
        check_len("descriptor", self.dimensionality, descriptor.len())?;
        Ok(self.nearest(descriptor))
    }

    /// Assign a batch of descriptors in parallel, preserving order.
    pub fn assign_all<D: AsRef<[f32]> + Sync>(&self, descriptors: &[D]) -> PhowResult<Vec<usize>> {
        descriptors
            .par_iter()
            .map(|d| self.assign(d.as_ref()))
            .collect()
    }

    /// Number of words.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Descriptor dimensionality every assignment must match.
    pub fn dimensionality(&self) -> usize {
        self.dimensionality
    }

    /// Centroid of visual word `id`.
    pub fn word(&self, id: usize) -> ArrayView1<'_, f64> {
        self.centroids.row(id)
    }

    /// Rebuild a vocabulary from an explicit `k × dimensionality` centroid matrix.
    pub fn from_centroids(centroids: Array2<f64>) -> PhowResult<Self> {
        let (k, dimensionality) = centroids.dim();
        let v = Self {
            k,
            dimensionality,
            centroids,
        };
        v.validate()?;
        Ok(v)
    }

    /// Checksum of the serialized vocabulary. Distinct vocabularies give
    /// distinct cache namespaces.
    pub fn fingerprint(&self) -> PhowResult<u32> {
        Ok(crc32fast::hash(&bincode::serialize(self)?))
    }

    /// Load a vocabulary from a file
    pub fn load<P: AsRef<std::path::Path>>(file: P) -> PhowResult<Self> {
        let mut file = std::fs::File::open(file)?;
        let mut buffer: Vec<u8> = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut buffer)?;
        let v: Self = bincode::deserialize(&buffer)?;
        v.validate()?;
        Ok(v)
    }

    /// Save vocabulary to a file
    pub fn save<P: AsRef<std::path::Path>>(&self, file: P) -> PhowResult<()> {
        let serialized = bincode::serialize(&self)?;
        let mut file = std::fs::File::create(file)?;
        std::io::Write::write_all(&mut file, &serialized)?;
        Ok(())
    }
}

/////////////////////                Helpers                 ////////////////////////
/////////////////////////////////////////////////////////////////////////////////////

impl Vocabulary {
    fn validate(&self) -> PhowResult<()> {
        if self.k == 0 || self.dimensionality == 0 {
            return Err(PhowErr::config("vocabulary must have words of nonzero dimension"));
        }
        if self.centroids.dim() != (self.k, self.dimensionality) {
            return Err(PhowErr::Configuration(format!(
                "centroid matrix is {:?}, expected ({}, {})",
                self.centroids.dim(),
                self.k,
                self.dimensionality
            )));
        }
        Ok(())
    }

    /// Lloyd iterations until the assignment stops changing. Returns the final groups.
    fn cluster<D: AsRef<[f32]> + Sync>(
        &mut self,
        features: &[D],
        max_iterations: usize,
    ) -> Vec<Vec<usize>> {
        let mut labels: Vec<usize> = Vec::new();
        for iteration in 0..max_iterations {
            let new_labels: Vec<usize> = features
                .par_iter()
                .map(|f| self.nearest(f.as_ref()))
                .collect();

            if labels == new_labels {
                debug!("KMeans converged after {} iterations", iteration);
                break; // converged
            }

            // update clusters
            let mut sums = Array2::<f64>::zeros((self.k, self.dimensionality));
            let mut counts = vec![0usize; self.k];
            for (f, &label) in features.iter().zip(&new_labels) {
                counts[label] += 1;
                for (s, &x) in sums.row_mut(label).iter_mut().zip(f.as_ref()) {
                    *s += x as f64;
                }
            }
            for (j, &count) in counts.iter().enumerate() {
                // an emptied cluster keeps its previous centroid
                if count > 0 {
                    let inv = 1. / count as f64;
                    for (c, s) in self.centroids.row_mut(j).iter_mut().zip(sums.row(j)) {
                        *c = s * inv;
                    }
                }
            }
            debug!(
                "KMeans step {}: {} reassigned",
                iteration,
                if labels.is_empty() {
                    new_labels.len()
                } else {
                    labels.iter().zip(&new_labels).filter(|(a, b)| a != b).count()
                }
            );
            labels = new_labels;
        }

        let mut groups = vec![Vec::new(); self.k];
        for (i, &l) in labels.iter().enumerate() {
            groups[l].push(i);
        }
        groups
    }

    fn initialize_clusters<D: AsRef<[f32]>>(
        features: &[D],
        k: usize,
        init: Init,
        rng: &mut StdRng,
    ) -> Array2<f64> {
        let dim = features[0].as_ref().len();
        let chosen: Vec<usize> = match init {
            Init::Random => {
                let idx: Vec<usize> = (0..features.len()).collect();
                idx.choose_multiple(rng, k).copied().collect()
            }
            Init::PlusPlus => {
                let mut chosen = vec![rng.gen_range(0..features.len())];
                let mut dist: Vec<f64> = features
                    .iter()
                    .map(|f| Self::sq_dist_f32(f.as_ref(), features[chosen[0]].as_ref()))
                    .collect();
                while chosen.len() < k {
                    let total: f64 = dist.iter().sum();
                    let next = if total > 0. {
                        let mut target = rng.gen::<f64>() * total;
                        let mut pick = dist.len() - 1;
                        for (i, &d) in dist.iter().enumerate() {
                            if d > 0. && target < d {
                                pick = i;
                                break;
                            }
                            target -= d;
                        }
                        pick
                    } else {
                        // every remaining sample coincides with a chosen one
                        (0..features.len())
                            .find(|i| !chosen.contains(i))
                            .unwrap_or(0)
                    };
                    chosen.push(next);
                    for (d, f) in dist.iter_mut().zip(features) {
                        *d = d.min(Self::sq_dist_f32(f.as_ref(), features[next].as_ref()));
                    }
                }
                chosen
            }
        };

        let mut centroids = Array2::<f64>::zeros((k, dim));
        for (mut row, &i) in centroids.outer_iter_mut().zip(&chosen) {
            for (c, &x) in row.iter_mut().zip(features[i].as_ref()) {
                *c = x as f64;
            }
        }
        centroids
    }

    #[inline]
    fn nearest(&self, descriptor: &[f32]) -> usize {
        let mut best: (usize, f64) = (0, f64::INFINITY);
        for (j, c) in self.centroids.outer_iter().enumerate() {
            let d = c
                .iter()
                .zip(descriptor)
                .fold(0., |a, (c, &x)| a + (c - x as f64).powi(2));
            if d < best.1 {
                best = (j, d);
            }
        }
        best.0
    }

    #[inline]
    fn sq_dist_f32(a: &[f32], b: &[f32]) -> f64 {
        a.iter()
            .zip(b)
            .fold(0., |acc, (&x, &y)| acc + (x as f64 - y as f64).powi(2))
    }
}

impl fmt::Debug for Vocabulary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vocabulary")
            .field("Words", &self.k)
            .field("Dimensionality", &self.dimensionality)
            .finish()
    }
}
