use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::*;

/// Descriptors are counted in parallel in chunks of this many.
const CHUNK: usize = 1024;

/// One level of a spatial pyramid: the image is cut into `rows × cols`
/// equal-area cells.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PyramidLevel {
    pub rows: usize,
    pub cols: usize,
}

impl PyramidLevel {
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    pub fn cells(&self) -> usize {
        self.rows * self.cols
    }
}

/// Normalisation applied to the concatenated pyramid histogram.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Normalisation {
    /// Raw counts.
    None,
    /// Divide by the sum of all bins.
    L1,
    /// Divide by the euclidean length.
    L2,
}

/// Axis-aligned region the feature locations live in, usually the whole image.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Bounds {
    pub fn of_image(width: u32, height: u32) -> Self {
        Self {
            x: 0.,
            y: 0.,
            width: width as f32,
            height: height as f32,
        }
    }

    /// Cell of a `rows × cols` grid containing `(x, y)`. Points on or past
    /// the far edges fall into the border cells.
    fn cell(&self, level: PyramidLevel, x: f32, y: f32) -> usize {
        let col = Self::bin((x - self.x) / self.width, level.cols);
        let row = Self::bin((y - self.y) / self.height, level.rows);
        row * level.cols + col
    }

    #[inline]
    fn bin(t: f32, n: usize) -> usize {
        if t.is_nan() || t <= 0. {
            0
        } else {
            ((t * n as f32) as usize).min(n - 1)
        }
    }
}

/// Pools visual word occurrences over a spatial pyramid.
///
/// Histogram layout: levels in configuration order; within a level, cells in
/// row-major order; within a cell, one bin per visual word. The bin of word `w`
/// in cell `(r, c)` of a level is at `level_offset + (r * cols + c) * k + w`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialAggregator {
    levels: Vec<PyramidLevel>,
    normalisation: Normalisation,
}

impl SpatialAggregator {
    pub fn new(levels: Vec<PyramidLevel>, normalisation: Normalisation) -> PhowResult<Self> {
        if levels.is_empty() {
            return Err(PhowErr::config("spatial pyramid needs at least one level"));
        }
        if let Some(l) = levels.iter().find(|l| l.rows == 0 || l.cols == 0) {
            return Err(PhowErr::Configuration(format!(
                "pyramid level {}x{} has no cells",
                l.rows, l.cols
            )));
        }
        Ok(Self {
            levels,
            normalisation,
        })
    }

    pub fn levels(&self) -> &[PyramidLevel] {
        &self.levels
    }

    pub fn normalisation(&self) -> Normalisation {
        self.normalisation
    }

    /// Total number of cells over all levels.
    pub fn cells(&self) -> usize {
        self.levels.iter().map(|l| l.cells()).sum()
    }

    /// Histogram length for a vocabulary of `k` words.
    pub fn feature_len(&self, k: usize) -> usize {
        k * self.cells()
    }

    /// Build the pyramid histogram of a set of local features.
    ///
    /// An image without features yields the zero vector.
    pub fn aggregate(
        &self,
        vocabulary: &Vocabulary,
        features: &[LocalFeature],
        bounds: Bounds,
    ) -> PhowResult<FeatureVector> {
        self.check_bounds(&bounds)?;
        let len = self.feature_len(vocabulary.k());
        let counts = features
            .par_chunks(CHUNK)
            .map(|chunk| self.count(vocabulary, chunk, &bounds))
            .try_reduce(
                || vec![0u32; len],
                |mut a, b| {
                    a.iter_mut().zip(&b).for_each(|(x, y)| *x += y);
                    Ok(a)
                },
            )?;
        Ok(self.finish(counts))
    }

    /// [`aggregate`](Self::aggregate) on the calling thread only. Use it
    /// where a lock is held, so the thread never steals pool work.
    pub fn aggregate_serial(
        &self,
        vocabulary: &Vocabulary,
        features: &[LocalFeature],
        bounds: Bounds,
    ) -> PhowResult<FeatureVector> {
        self.check_bounds(&bounds)?;
        let counts = self.count(vocabulary, features, &bounds)?;
        Ok(self.finish(counts))
    }

    fn check_bounds(&self, bounds: &Bounds) -> PhowResult<()> {
        if !(bounds.width > 0. && bounds.height > 0.) {
            return Err(PhowErr::Configuration(format!(
                "image bounds {}x{} are empty",
                bounds.width, bounds.height
            )));
        }
        Ok(())
    }

    fn count(
        &self,
        vocabulary: &Vocabulary,
        features: &[LocalFeature],
        bounds: &Bounds,
    ) -> PhowResult<Vec<u32>> {
        let mut counts = vec![0u32; self.feature_len(vocabulary.k())];
        for f in features {
            for bin in self.bins(vocabulary, f, bounds)? {
                counts[bin] += 1;
            }
        }
        Ok(counts)
    }

    fn finish(&self, counts: Vec<u32>) -> FeatureVector {
        let mut histogram: FeatureVector = counts.into_iter().map(f64::from).collect();
        normalise(&mut histogram, self.normalisation);
        histogram
    }

    /// Histogram bins one feature contributes to, one per level.
    fn bins(
        &self,
        vocabulary: &Vocabulary,
        feature: &LocalFeature,
        bounds: &Bounds,
    ) -> PhowResult<SmallVec<[usize; 4]>> {
        let k = vocabulary.k();
        let word = vocabulary.assign(&feature.descriptor)?;
        let mut offset = 0;
        let mut bins = SmallVec::new();
        for &level in &self.levels {
            let cell = bounds.cell(level, feature.x, feature.y);
            bins.push(offset + cell * k + word);
            offset += level.cells() * k;
        }
        Ok(bins)
    }
}

/// Scale a vector in place to unit l1 or l2 norm. The zero vector is left alone.
pub fn normalise(v: &mut [f64], mode: Normalisation) {
    let norm = match mode {
        Normalisation::None => return,
        Normalisation::L1 => v.iter().map(|x| x.abs()).sum::<f64>(),
        Normalisation::L2 => v.iter().map(|x| x * x).sum::<f64>().sqrt(),
    };
    if norm > 0. {
        let inv = 1. / norm;
        for x in v.iter_mut() {
            *x *= inv;
        }
    }
}
