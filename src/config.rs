use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::*;

/// Everything that determines the feature vector of an image and the
/// classifier trained on it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub extractor: ExtractorConfig,
    pub vocabulary: VocabularyConfig,
    pub pyramid: Vec<PyramidLevel>,
    pub normalisation: Normalisation,
    /// `None` feeds the histograms to the classifier unmapped.
    pub kernel_map: Option<KernelMapConfig>,
    pub cache: Option<CacheConfig>,
    pub classifier: ClassifierConfig,
    /// Extraction threads; `None` uses every core.
    pub workers: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            extractor: ExtractorConfig::default(),
            vocabulary: VocabularyConfig::default(),
            pyramid: vec![PyramidLevel::new(2, 2), PyramidLevel::new(4, 4)],
            normalisation: Normalisation::L2,
            kernel_map: Some(KernelMapConfig::default()),
            cache: None,
            classifier: ClassifierConfig::default(),
            workers: None,
        }
    }
}

impl PipelineConfig {
    pub fn load<P: AsRef<Path>>(file: P) -> PhowResult<Self> {
        let bytes = std::fs::read(file)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn save<P: AsRef<Path>>(&self, file: P) -> PhowResult<()> {
        std::fs::write(file, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Check the parts that do not depend on a trained vocabulary.
    pub fn validate(&self) -> PhowResult<()> {
        self.extractor.validate()?;
        self.vocabulary.validate()?;
        if let Some(km) = &self.kernel_map {
            km.validate()?;
        }
        self.classifier.validate()?;
        if self.workers == Some(0) {
            return Err(PhowErr::config("workers must be positive"));
        }
        // the aggregator checks the pyramid
        SpatialAggregator::new(self.pyramid.clone(), self.normalisation).map(|_| ())
    }
}

/// Which local descriptor to extract.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractorConfig {
    DenseSift(DenseSift),
    PyramidDenseSift(PyramidDenseSift),
    RawPatches(RawPatches),
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        ExtractorConfig::PyramidDenseSift(PyramidDenseSift {
            step: 3,
            bin_sizes: vec![4, 6, 8, 10],
            magnification: 6.,
            energy_threshold: 0.015,
        })
    }
}

impl ExtractorConfig {
    pub fn validate(&self) -> PhowResult<()> {
        let ok = match self {
            ExtractorConfig::DenseSift(d) => d.step > 0 && d.bin_size > 0,
            ExtractorConfig::PyramidDenseSift(p) => {
                p.step > 0
                    && !p.bin_sizes.is_empty()
                    && p.bin_sizes.iter().all(|&s| s > 0)
                    && p.magnification > 0.
            }
            ExtractorConfig::RawPatches(r) => r.step > 0 && r.patch_size > 0,
        };
        if ok {
            Ok(())
        } else {
            Err(PhowErr::Configuration(format!(
                "invalid extractor settings {:?}",
                self
            )))
        }
    }

    pub fn build(&self) -> PhowResult<Box<dyn KeypointExtractor>> {
        self.validate()?;
        Ok(match self {
            ExtractorConfig::DenseSift(d) => Box::new(d.clone()),
            ExtractorConfig::PyramidDenseSift(p) => Box::new(p.clone()),
            ExtractorConfig::RawPatches(r) => Box::new(r.clone()),
        })
    }

    /// Same extractor with another energy threshold. Raw patches have none.
    pub fn with_energy_threshold(&self, threshold: f32) -> Self {
        let mut config = self.clone();
        match &mut config {
            ExtractorConfig::DenseSift(d) => d.energy_threshold = threshold,
            ExtractorConfig::PyramidDenseSift(p) => p.energy_threshold = threshold,
            ExtractorConfig::RawPatches(_) => {}
        }
        config
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct VocabularyConfig {
    pub k: usize,
    /// Energy threshold of the extractor while collecting training descriptors.
    pub energy_threshold: f32,
    pub params: TrainParams,
}

impl Default for VocabularyConfig {
    fn default() -> Self {
        Self {
            k: 600,
            energy_threshold: 0.005,
            params: TrainParams::default(),
        }
    }
}

impl VocabularyConfig {
    pub fn validate(&self) -> PhowResult<()> {
        if self.k == 0 || self.params.max_samples < self.k {
            return Err(PhowErr::Configuration(format!(
                "vocabulary needs 0 < k <= max_samples, got k = {}, max_samples = {}",
                self.k, self.params.max_samples
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct KernelMapConfig {
    pub kernel: KernelType,
    pub order: usize,
    pub gamma: f64,
}

impl Default for KernelMapConfig {
    fn default() -> Self {
        Self {
            kernel: KernelType::Chi2,
            order: 1,
            gamma: 1.,
        }
    }
}

impl KernelMapConfig {
    pub fn validate(&self) -> PhowResult<()> {
        if !(self.gamma > 0.) || !self.gamma.is_finite() {
            return Err(PhowErr::Configuration(format!(
                "kernel map homogeneity must be positive, got {}",
                self.gamma
            )));
        }
        Ok(())
    }

    pub fn build(&self) -> HomogeneousKernelMap {
        HomogeneousKernelMap::with_gamma(self.kernel, self.order, self.gamma)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ClassifierConfig {
    pub solver: DualCoordinateDescent,
    /// Constant feature appended to every sample.
    pub bias: Option<f64>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            solver: DualCoordinateDescent::default(),
            bias: Some(1.),
        }
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> PhowResult<()> {
        let s = &self.solver;
        if !(s.c > 0.) || !(s.eps > 0.) || s.max_iterations == 0 {
            return Err(PhowErr::Configuration(format!(
                "invalid solver settings {:?}",
                s
            )));
        }
        Ok(())
    }

    pub fn build(&self) -> Classifier {
        Classifier::new(self.solver.clone()).with_bias(self.bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_reproduce_the_reference_setup() {
        let c = PipelineConfig::default();
        assert_eq!(c.vocabulary.k, 600);
        assert_eq!(c.vocabulary.params.max_samples, 10_000);
        assert_eq!(c.pyramid, [PyramidLevel::new(2, 2), PyramidLevel::new(4, 4)]);
        assert_eq!(c.normalisation, Normalisation::L2);
        assert_eq!(c.kernel_map.as_ref().unwrap().kernel, KernelType::Chi2);
        assert_eq!(c.classifier.solver.c, 1.);
        assert_eq!(c.classifier.solver.eps, 1e-5);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn json_round_trip_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        let mut c = PipelineConfig::default();
        c.extractor = ExtractorConfig::DenseSift(DenseSift {
            step: 4,
            bin_size: 8,
            energy_threshold: 0.01,
        });
        c.workers = Some(2);
        c.save(&path).unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap(), c);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let c: PipelineConfig = serde_json::from_str(
            r#"{ "extractor": { "kind": "raw_patches", "step": 4, "patch_size": 8 },
                 "vocabulary": { "k": 16 },
                 "normalisation": "l1" }"#,
        )
        .unwrap();
        assert_eq!(c.vocabulary.k, 16);
        assert_eq!(c.vocabulary.energy_threshold, 0.005);
        assert_eq!(c.normalisation, Normalisation::L1);
        assert_eq!(c.extractor.build().unwrap().descriptor_len(), 64);
    }

    #[test]
    fn partial_solver_settings_keep_their_defaults() {
        let c: PipelineConfig =
            serde_json::from_str(r#"{ "classifier": { "solver": { "c": 2.0 } } }"#).unwrap();
        let solver = &c.classifier.solver;
        assert_eq!(solver.c, 2.);
        assert_eq!(solver.eps, 1e-5);
        assert_eq!(solver.loss, Loss::SquaredHinge);
        assert_eq!(solver.max_iterations, 10_000);
        assert_eq!(c.classifier.bias, Some(1.));
    }

    #[test]
    fn energy_threshold_override() {
        let c = ExtractorConfig::default().with_energy_threshold(0.005);
        match c {
            ExtractorConfig::PyramidDenseSift(p) => assert_eq!(p.energy_threshold, 0.005),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let mut c = PipelineConfig::default();
        c.pyramid.clear();
        assert!(matches!(c.validate(), Err(PhowErr::Configuration(_))));

        let mut c = PipelineConfig::default();
        c.vocabulary.k = 0;
        assert!(c.validate().is_err());

        let bad = ExtractorConfig::DenseSift(DenseSift {
            step: 0,
            bin_size: 4,
            energy_threshold: 0.,
        });
        assert!(bad.build().is_err());
    }

    #[test]
    fn malformed_json_is_a_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(PipelineConfig::load(&path), Err(PhowErr::Json(_))));
    }
}
