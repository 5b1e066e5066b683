use thiserror::Error;

/// Visual vocabulary: k-means training and nearest-word assignment.
pub mod vocab;
pub use vocab::{Init, TrainParams, Vocabulary};

/// Spatial pyramid bag-of-words aggregation.
pub mod bow;
pub use bow::{Bounds, Normalisation, PyramidLevel, SpatialAggregator};

/// Explicit feature maps for additive homogeneous kernels.
pub mod kernel_map;
pub use kernel_map::{HomogeneousKernelMap, KernelType};

/// Persistent get-or-compute store for final feature vectors.
pub mod cache;
pub use cache::{CacheConfig, CacheStats, CorruptionPolicy, FeatureCache};

/// One-vs-rest linear classification.
pub mod classifier;
pub use classifier::{
    Classifier, ClassifierModel, DualCoordinateDescent, LabeledSample, LinearSolver, Loss,
    Prediction,
};

/// Confusion matrices, abstention policies and evaluation reports.
pub mod eval;
pub use eval::{
    AbstentionPolicy, ConfusionMatrix, Evaluator, MarginThreshold, NeverAbstain, Report,
    ScoreThreshold,
};

/// Image decoding and local feature extraction.
pub mod extract;
pub use extract::{ImageCrateDecoder, ImageDecoder, KeypointExtractor, LocalFeature};

/// Dense SIFT-like gradient descriptors.
pub mod dsift;
pub use dsift::{DenseSift, PyramidDenseSift, RawPatches};

/// Class-per-directory image datasets.
pub mod dataset;
pub use dataset::{GroupedDataset, Record};

/// Pipeline configuration.
pub mod config;
pub use config::{
    ClassifierConfig, ExtractorConfig, KernelMapConfig, PipelineConfig, VocabularyConfig,
};

/// The full image → feature → classifier pipeline.
pub mod pipeline;
pub use pipeline::Pipeline;

/// Final feature vector of an image: a normalised pyramid histogram,
/// optionally expanded by a kernel map.
///
/// Index: see [`SpatialAggregator`] for the histogram layout and
/// [`HomogeneousKernelMap`] for the expansion.
pub type FeatureVector = Vec<f64>;

pub type PhowResult<T> = std::result::Result<T, PhowErr>;

#[derive(Error, Debug)]
pub enum PhowErr {
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("Configuration file error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Image decode error: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Corrupt cache entry for {key:?}: {reason}")]
    CacheCorruption { key: String, reason: String },
    #[error("Classifier used before training")]
    UntrainedModel,
    #[error("Training failed: {0}")]
    Training(String),
}

impl PhowErr {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        PhowErr::Configuration(msg.into())
    }
}

/// Fail with a configuration error unless a vector has the expected length.
pub(crate) fn check_len(what: &str, expected: usize, actual: usize) -> PhowResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(PhowErr::Configuration(format!(
            "{} has length {}, expected {}",
            what, actual, expected
        )))
    }
}
