use image::GrayImage;
use log::{debug, info};
use rayon::prelude::*;
use rayon::ThreadPool;
use std::sync::Arc;

use crate::*;

/// Decode → describe → quantise → pool → map, with an optional cache in
/// front, plus classifier training and evaluation over dataset records.
///
/// The vocabulary is shared read-only; everything else is fixed by the
/// [`PipelineConfig`] at construction.
pub struct Pipeline {
    config: PipelineConfig,
    vocabulary: Arc<Vocabulary>,
    decoder: Box<dyn ImageDecoder>,
    extractor: Box<dyn KeypointExtractor>,
    aggregator: SpatialAggregator,
    kernel_map: Option<HomogeneousKernelMap>,
    cache: Option<FeatureCache>,
    feature_len: usize,
    pool: ThreadPool,
}

fn thread_pool(workers: Option<usize>) -> PhowResult<ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers.unwrap_or(0))
        .build()
        .map_err(|e| PhowErr::Configuration(format!("cannot start worker pool: {}", e)))
}

/// Pipeline API
impl Pipeline {
    /// Train a vocabulary on descriptors of `images`, extracted with the
    /// vocabulary's energy threshold.
    ///
    /// When the images hold more than `max_samples` descriptors, every image
    /// contributes an evenly strided share of its own.
    pub fn learn_vocabulary<B: AsRef<[u8]> + Sync>(
        config: &PipelineConfig,
        images: &[B],
    ) -> PhowResult<Vocabulary> {
        Self::learn_vocabulary_with(config, &ImageCrateDecoder, images)
    }

    /// [`learn_vocabulary`](Self::learn_vocabulary) with a custom decoder.
    pub fn learn_vocabulary_with<B: AsRef<[u8]> + Sync>(
        config: &PipelineConfig,
        decoder: &dyn ImageDecoder,
        images: &[B],
    ) -> PhowResult<Vocabulary> {
        config.validate()?;
        let extractor = config
            .extractor
            .with_energy_threshold(config.vocabulary.energy_threshold)
            .build()?;

        let per_image: Vec<Vec<LocalFeature>> = thread_pool(config.workers)?.install(|| {
            images
                .par_iter()
                .map(|bytes| -> PhowResult<Vec<LocalFeature>> {
                    Ok(extractor.detect(&decoder.decode(bytes.as_ref())?))
                })
                .collect::<PhowResult<Vec<_>>>()
        })?;
        let total: usize = per_image.iter().map(Vec::len).sum();
        let features = spread_sample(per_image, config.vocabulary.params.max_samples);
        info!(
            "Sampled {} of {} descriptors from {} images for vocabulary training",
            features.len(),
            total,
            images.len()
        );
        Vocabulary::train(&features, config.vocabulary.k, &config.vocabulary.params)
    }

    /// Assemble the stages of `config` around a trained vocabulary.
    pub fn new(config: PipelineConfig, vocabulary: impl Into<Arc<Vocabulary>>) -> PhowResult<Self> {
        Self::with_decoder(config, vocabulary, Box::new(ImageCrateDecoder))
    }

    /// [`new`](Self::new) with a custom decoder. The decoder's identity is
    /// part of the cache namespace.
    pub fn with_decoder(
        config: PipelineConfig,
        vocabulary: impl Into<Arc<Vocabulary>>,
        decoder: Box<dyn ImageDecoder>,
    ) -> PhowResult<Self> {
        config.validate()?;
        let vocabulary = vocabulary.into();
        let extractor = config.extractor.build()?;
        check_len(
            "vocabulary word",
            extractor.descriptor_len(),
            vocabulary.dimensionality(),
        )?;
        if vocabulary.k() != config.vocabulary.k {
            return Err(PhowErr::Configuration(format!(
                "vocabulary has {} words, configuration expects {}",
                vocabulary.k(),
                config.vocabulary.k
            )));
        }

        let aggregator = SpatialAggregator::new(config.pyramid.clone(), config.normalisation)?;
        let kernel_map = config.kernel_map.as_ref().map(KernelMapConfig::build);
        let histogram_len = aggregator.feature_len(vocabulary.k());
        let feature_len = match &kernel_map {
            Some(km) => km.expanded_len(histogram_len),
            None => histogram_len,
        };

        let cache = match &config.cache {
            Some(cache_config) => {
                let namespaced = CacheConfig {
                    store_location: cache_config.store_location.clone(),
                    namespace_key: Self::namespace(&config, &vocabulary, &*decoder)?,
                };
                debug!("Caching features under {:?}", namespaced);
                Some(FeatureCache::open(&namespaced, feature_len)?)
            }
            None => None,
        };

        Ok(Self {
            pool: thread_pool(config.workers)?,
            config,
            vocabulary,
            decoder,
            extractor,
            aggregator,
            kernel_map,
            cache,
            feature_len,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn vocabulary(&self) -> &Arc<Vocabulary> {
        &self.vocabulary
    }

    pub fn cache(&self) -> Option<&FeatureCache> {
        self.cache.as_ref()
    }

    /// Length of every vector this pipeline produces.
    pub fn feature_len(&self) -> usize {
        self.feature_len
    }

    /// Feature vector of one encoded image, looked up by `key` when caching.
    pub fn extract(&self, key: &str, bytes: &[u8]) -> PhowResult<FeatureVector> {
        self.extract_with(key, || Ok(bytes.to_vec()))
    }

    /// Feature vector of a decoded image; never cached.
    pub fn extract_image(&self, image: &GrayImage) -> PhowResult<FeatureVector> {
        self.features_of(image, true)
    }

    /// Extract `(key, bytes)` pairs on the worker pool, preserving order.
    pub fn extract_batch<K, B>(&self, items: &[(K, B)]) -> PhowResult<Vec<FeatureVector>>
    where
        K: AsRef<str> + Sync,
        B: AsRef<[u8]> + Sync,
    {
        self.pool.install(|| {
            items
                .par_iter()
                .map(|(key, bytes)| self.extract(key.as_ref(), bytes.as_ref()))
                .collect()
        })
    }

    /// Labelled feature vectors of dataset records. Files are only read on
    /// a cache miss.
    pub fn extract_records(&self, records: &[Record]) -> PhowResult<Vec<LabeledSample>> {
        self.pool.install(|| {
            records
                .par_iter()
                .map(|r| -> PhowResult<LabeledSample> {
                    let features = self.extract_with(&r.key, || r.read())?;
                    Ok(LabeledSample::new(features, r.class.clone()))
                })
                .collect()
        })
    }

    /// Fit a classifier, configured by [`ClassifierConfig`], on `records`.
    pub fn train_classifier(&self, records: &[Record]) -> PhowResult<Classifier> {
        let samples = self.extract_records(records)?;
        let mut classifier = self.config.classifier.build();
        classifier.train(&samples)?;
        Ok(classifier)
    }

    /// Score `classifier` on held-out `records`.
    pub fn evaluate<P: AbstentionPolicy>(
        &self,
        classifier: &Classifier,
        records: &[Record],
        policy: P,
    ) -> PhowResult<Report> {
        let model = classifier.model()?;
        let samples = self.extract_records(records)?;
        let matrix = Evaluator::new(policy).evaluate(model, &samples)?;
        Ok(matrix.report())
    }

    //// Helpers ////

    fn extract_with<F>(&self, key: &str, load: F) -> PhowResult<FeatureVector>
    where
        F: FnOnce() -> PhowResult<Vec<u8>>,
    {
        match &self.cache {
            // the key lock is held while computing, so stay off the pool
            Some(cache) => cache.get_or_compute(key, || {
                self.features_of(&self.decoder.decode(&load()?)?, false)
            }),
            None => self.features_of(&self.decoder.decode(&load()?)?, true),
        }
    }

    fn features_of(&self, image: &GrayImage, parallel: bool) -> PhowResult<FeatureVector> {
        let features = self.extractor.detect(image);
        let bounds = Bounds::of_image(image.width(), image.height());
        let histogram = if parallel {
            self.aggregator.aggregate(&self.vocabulary, &features, bounds)?
        } else {
            self.aggregator
                .aggregate_serial(&self.vocabulary, &features, bounds)?
        };
        let vector = match &self.kernel_map {
            Some(km) => km.expand(&histogram),
            None => histogram,
        };
        check_len("feature vector", self.feature_len, vector.len())?;
        Ok(vector)
    }

    /// `namespace_key` followed by a checksum of every setting that shapes
    /// the feature vector, the decoder and the vocabulary itself.
    fn namespace(
        config: &PipelineConfig,
        vocabulary: &Vocabulary,
        decoder: &dyn ImageDecoder,
    ) -> PhowResult<String> {
        let base = config
            .cache
            .as_ref()
            .map(|c| c.namespace_key.as_str())
            .unwrap_or_default();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&serde_json::to_vec(&(
            &config.extractor,
            &config.pyramid,
            config.normalisation,
            &config.kernel_map,
        ))?);
        hasher.update(decoder.identity().as_bytes());
        hasher.update(&vocabulary.fingerprint()?.to_le_bytes());
        Ok(format!("{}-{:08x}", base, hasher.finalize()))
    }
}

/// At most `cap` descriptors, drawn from every image. Quotas are filled
/// smallest image first so short images pass their unused share on; within an
/// image the picks are evenly strided.
fn spread_sample(per_image: Vec<Vec<LocalFeature>>, cap: usize) -> Vec<LocalFeature> {
    let total: usize = per_image.iter().map(Vec::len).sum();
    if total <= cap {
        return per_image.into_iter().flatten().collect();
    }

    let mut by_size: Vec<usize> = (0..per_image.len()).collect();
    by_size.sort_by_key(|&i| per_image[i].len());
    let mut quotas = vec![0; per_image.len()];
    let mut remaining = cap;
    for (n, &i) in by_size.iter().enumerate() {
        let images_left = per_image.len() - n;
        quotas[i] = per_image[i].len().min(remaining / images_left);
        remaining -= quotas[i];
    }

    per_image
        .into_iter()
        .zip(quotas)
        .flat_map(|(features, quota)| {
            let len = features.len();
            let mut features: Vec<Option<LocalFeature>> = features.into_iter().map(Some).collect();
            (0..quota)
                .filter_map(|j| features[j * len / quota].take())
                .collect::<Vec<_>>()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Luma};
    use ndarray::Array2;
    use std::io::Cursor;

    fn config(k: usize) -> PipelineConfig {
        PipelineConfig {
            extractor: ExtractorConfig::RawPatches(RawPatches {
                step: 4,
                patch_size: 2,
            }),
            vocabulary: VocabularyConfig {
                k,
                ..Default::default()
            },
            pyramid: vec![PyramidLevel::new(1, 1), PyramidLevel::new(2, 2)],
            workers: Some(2),
            ..Default::default()
        }
    }

    fn vocabulary(k: usize) -> Vocabulary {
        Vocabulary::from_centroids(Array2::from_shape_fn((k, 4), |(i, j)| (i * 4 + j) as f64 / 10.))
            .unwrap()
    }

    fn png(seed: u32) -> Vec<u8> {
        let img = GrayImage::from_fn(16, 16, |x, y| Luma([((x * seed + y * 31) % 256) as u8]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn feature_length_accounts_for_pyramid_and_kernel_map() {
        let p = Pipeline::new(config(3), vocabulary(3)).unwrap();
        assert_eq!(p.feature_len(), 3 * (1 + 4) * 3);
        let v = p.extract("a", &png(7)).unwrap();
        assert_eq!(v.len(), p.feature_len());

        let mut plain = config(3);
        plain.kernel_map = None;
        let p = Pipeline::new(plain, vocabulary(3)).unwrap();
        assert_eq!(p.feature_len(), 15);
    }

    #[test]
    fn vocabulary_must_match_the_extractor() {
        let mut c = config(3);
        c.extractor = ExtractorConfig::RawPatches(RawPatches {
            step: 4,
            patch_size: 3,
        });
        assert!(matches!(
            Pipeline::new(c, vocabulary(3)),
            Err(PhowErr::Configuration(_))
        ));
        assert!(Pipeline::new(config(5), vocabulary(3)).is_err());
    }

    #[test]
    fn batch_matches_single_extraction() {
        let p = Pipeline::new(config(3), vocabulary(3)).unwrap();
        let items: Vec<(String, Vec<u8>)> = (1..6).map(|i| (format!("img{}", i), png(i))).collect();
        let batch = p.extract_batch(&items).unwrap();
        for ((key, bytes), v) in items.iter().zip(&batch) {
            assert_eq!(&p.extract(key, bytes).unwrap(), v);
        }
    }

    #[test]
    fn namespace_follows_configuration_and_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = config(3);
        c.cache = Some(CacheConfig {
            store_location: dir.path().to_path_buf(),
            namespace_key: "test".to_string(),
        });
        let a = Pipeline::new(c.clone(), vocabulary(3)).unwrap();
        let same = Pipeline::new(c.clone(), vocabulary(3)).unwrap();
        assert_eq!(a.cache().unwrap().dir(), same.cache().unwrap().dir());

        let mut other = c.clone();
        other.normalisation = Normalisation::L1;
        let b = Pipeline::new(other, vocabulary(3)).unwrap();
        assert_ne!(a.cache().unwrap().dir(), b.cache().unwrap().dir());

        let shifted = Vocabulary::from_centroids(Array2::from_elem((3, 4), 0.5)).unwrap();
        let d = Pipeline::new(c, shifted).unwrap();
        assert_ne!(a.cache().unwrap().dir(), d.cache().unwrap().dir());
        assert!(a
            .cache()
            .unwrap()
            .dir()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("test-"));
    }

    #[test]
    fn cached_extraction_skips_decoding() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = config(3);
        c.cache = Some(CacheConfig {
            store_location: dir.path().to_path_buf(),
            namespace_key: "test".to_string(),
        });
        let p = Pipeline::new(c, vocabulary(3)).unwrap();
        let v = p.extract("img", &png(3)).unwrap();
        // a hit never looks at the bytes
        assert_eq!(p.extract("img", b"garbage").unwrap(), v);
        assert_eq!(p.cache().unwrap().stats().hits, 1);
        assert!(matches!(p.extract("other", b"garbage"), Err(PhowErr::Decode(_))));
    }

    #[test]
    fn learns_a_vocabulary_from_images() {
        let images: Vec<Vec<u8>> = (1..4).map(png).collect();
        let v = Pipeline::learn_vocabulary(&config(3), &images).unwrap();
        assert_eq!(v.k(), 3);
        assert_eq!(v.dimensionality(), 4);
        assert!(Pipeline::new(config(3), v).is_ok());
    }

    fn tagged(image: usize, n: usize) -> Vec<LocalFeature> {
        (0..n)
            .map(|i| LocalFeature {
                x: image as f32,
                y: i as f32,
                scale: 1.,
                descriptor: vec![0.; 4],
            })
            .collect()
    }

    #[test]
    fn capped_sample_draws_from_every_image() {
        let sample = spread_sample(vec![tagged(0, 100), tagged(1, 5), tagged(2, 50)], 30);
        assert_eq!(sample.len(), 30);
        let from = |image: f32| sample.iter().filter(|f| f.x == image).count();
        assert_eq!((from(0.), from(1.), from(2.)), (13, 5, 12));
        // strided, not the leading descriptors
        assert!(sample.iter().any(|f| f.x == 0. && f.y > 50.));

        let small = spread_sample(vec![tagged(0, 3), tagged(1, 4)], 30);
        assert_eq!(small.len(), 7);
    }

    #[test]
    fn later_images_shape_the_vocabulary() {
        let mut c = config(3);
        c.extractor = ExtractorConfig::RawPatches(RawPatches {
            step: 1,
            patch_size: 2,
        });
        // one 16x16 image alone holds 225 descriptors
        c.vocabulary.params.max_samples = 100;
        let first = Pipeline::learn_vocabulary(&c, &[png(1)]).unwrap();
        let more = Pipeline::learn_vocabulary(&c, &[png(1), png(9), png(40)]).unwrap();
        assert_ne!(first, more);
    }

    /// Ignores its input and returns a fixed gradient.
    struct FixedDecoder;

    impl ImageDecoder for FixedDecoder {
        fn decode(&self, _bytes: &[u8]) -> PhowResult<GrayImage> {
            Ok(GrayImage::from_fn(16, 16, |x, y| Luma([(x * 5 + y * 11) as u8])))
        }
    }

    #[test]
    fn custom_decoder_gets_its_own_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = config(3);
        c.cache = Some(CacheConfig {
            store_location: dir.path().to_path_buf(),
            namespace_key: "test".to_string(),
        });
        let default = Pipeline::new(c.clone(), vocabulary(3)).unwrap();
        let fixed = Pipeline::with_decoder(c, vocabulary(3), Box::new(FixedDecoder)).unwrap();
        assert_ne!(default.cache().unwrap().dir(), fixed.cache().unwrap().dir());

        let v = fixed.extract("img", b"not an image").unwrap();
        assert_eq!(v.len(), fixed.feature_len());
        assert!(matches!(default.extract("img", b"not an image"), Err(PhowErr::Decode(_))));

        let garbage = vec![b"a".to_vec(), b"b".to_vec()];
        let voc = Pipeline::learn_vocabulary_with(&config(3), &FixedDecoder, &garbage).unwrap();
        assert_eq!(voc.k(), 3);
    }

    #[test]
    fn repeated_keys_in_a_cached_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = config(3);
        c.workers = Some(4);
        c.cache = Some(CacheConfig {
            store_location: dir.path().to_path_buf(),
            namespace_key: "test".to_string(),
        });
        let p = Pipeline::new(c, vocabulary(3)).unwrap();
        let items: Vec<(String, Vec<u8>)> = (0..64)
            .map(|i| (format!("img{}", i % 4), png(i % 4 + 1)))
            .collect();
        let batch = p.extract_batch(&items).unwrap();
        for (i, v) in batch.iter().enumerate() {
            assert_eq!(v, &batch[i % 4]);
        }
        let stats = p.cache().unwrap().stats();
        assert_eq!(stats.misses, 4);
        assert_eq!(stats.hits, 60);
    }
}
