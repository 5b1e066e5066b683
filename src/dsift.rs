//! Dense descriptors computed on a regular grid, without keypoint detection.
//!
//! [`DenseSift`] follows the SIFT descriptor layout (4×4 spatial bins of 8
//! gradient orientations, normalised, clamped at 0.2 and renormalised) but
//! skips orientation assignment, which is what dense bag-of-words pipelines
//! use. Bin sums come from per-orientation integral images, so a descriptor
//! costs the same regardless of bin size.

use image::GrayImage;
use imageproc::filter::gaussian_blur_f32;
use ndarray::{s, Array2, Array3};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

use crate::*;

/// Spatial bins along each side of a descriptor.
pub const SPATIAL_BINS: usize = 4;
/// Orientation bins of each spatial bin.
pub const ORIENTATION_BINS: usize = 8;
pub const DESCRIPTOR_SIZE: usize = SPATIAL_BINS * SPATIAL_BINS * ORIENTATION_BINS;

/// Components of the normalised descriptor are capped to this before renormalising.
const DESCRIPTOR_MAGNITUDE_CAP: f32 = 0.2;

/// Single-scale dense SIFT.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DenseSift {
    /// Grid spacing in pixels.
    pub step: u32,
    /// Side of one spatial bin in pixels; a descriptor covers `4 × bin_size`.
    pub bin_size: u32,
    /// Descriptors whose mean gradient magnitude (pixels scaled to `[0, 1]`)
    /// is below this are dropped.
    pub energy_threshold: f32,
}

impl KeypointExtractor for DenseSift {
    fn detect(&self, image: &GrayImage) -> Vec<LocalFeature> {
        if self.step == 0 || self.bin_size == 0 {
            return Vec::new();
        }
        let integrals = OrientationIntegrals::new(image);
        self.describe(&integrals)
    }

    fn descriptor_len(&self) -> usize {
        DESCRIPTOR_SIZE
    }
}

impl DenseSift {
    fn describe(&self, integrals: &OrientationIntegrals) -> Vec<LocalFeature> {
        let bin = self.bin_size as usize;
        let patch = bin * SPATIAL_BINS;
        let (width, height) = (integrals.width, integrals.height);
        if width < patch || height < patch {
            return Vec::new();
        }

        let mut features = Vec::new();
        for y0 in (0..=height - patch).step_by(self.step as usize) {
            for x0 in (0..=width - patch).step_by(self.step as usize) {
                let mut hist = vec![0f32; DESCRIPTOR_SIZE];
                let mut energy = 0.;
                for by in 0..SPATIAL_BINS {
                    for bx in 0..SPATIAL_BINS {
                        let (cx, cy) = (x0 + bx * bin, y0 + by * bin);
                        for o in 0..ORIENTATION_BINS {
                            let v = integrals.sum(o, cx, cy, cx + bin, cy + bin);
                            energy += v;
                            hist[(by * SPATIAL_BINS + bx) * ORIENTATION_BINS + o] = v as f32;
                        }
                    }
                }
                if ((energy / (patch * patch) as f64) as f32) < self.energy_threshold {
                    continue;
                }
                normalise_descriptor(&mut hist);
                features.push(LocalFeature {
                    x: (x0 + patch / 2) as f32,
                    y: (y0 + patch / 2) as f32,
                    scale: self.bin_size as f32,
                    descriptor: hist,
                });
            }
        }
        features
    }
}

/// Dense SIFT at several bin sizes, each computed on the image smoothed in
/// proportion to the bin size.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PyramidDenseSift {
    pub step: u32,
    pub bin_sizes: Vec<u32>,
    /// Smoothing is `σ = bin_size / magnification`.
    pub magnification: f32,
    pub energy_threshold: f32,
}

impl KeypointExtractor for PyramidDenseSift {
    fn detect(&self, image: &GrayImage) -> Vec<LocalFeature> {
        let mut features = Vec::new();
        for &bin_size in &self.bin_sizes {
            let sift = DenseSift {
                step: self.step,
                bin_size,
                energy_threshold: self.energy_threshold,
            };
            let sigma = bin_size as f32 / self.magnification;
            if sigma > 0. && sigma.is_finite() {
                features.extend(sift.detect(&gaussian_blur_f32(image, sigma)));
            } else {
                features.extend(sift.detect(image));
            }
        }
        features
    }

    fn descriptor_len(&self) -> usize {
        DESCRIPTOR_SIZE
    }
}

/// Zero-mean, unit-norm raw intensity patches on a grid.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RawPatches {
    pub step: u32,
    pub patch_size: u32,
}

impl KeypointExtractor for RawPatches {
    fn detect(&self, image: &GrayImage) -> Vec<LocalFeature> {
        let (step, patch) = (self.step as usize, self.patch_size as usize);
        let (width, height) = (image.width() as usize, image.height() as usize);
        if step == 0 || patch == 0 || width < patch || height < patch {
            return Vec::new();
        }
        let mut features = Vec::new();
        for y0 in (0..=height - patch).step_by(step) {
            for x0 in (0..=width - patch).step_by(step) {
                let mut d: Vec<f32> = Vec::with_capacity(patch * patch);
                for y in y0..y0 + patch {
                    for x in x0..x0 + patch {
                        d.push(image.get_pixel(x as u32, y as u32)[0] as f32 / 255.);
                    }
                }
                let mean = d.iter().sum::<f32>() / d.len() as f32;
                d.iter_mut().for_each(|v| *v -= mean);
                let norm = d.iter().map(|v| v * v).sum::<f32>().sqrt();
                if norm > 0. {
                    d.iter_mut().for_each(|v| *v /= norm);
                }
                features.push(LocalFeature {
                    x: (x0 + patch / 2) as f32,
                    y: (y0 + patch / 2) as f32,
                    scale: self.patch_size as f32,
                    descriptor: d,
                });
            }
        }
        features
    }

    fn descriptor_len(&self) -> usize {
        (self.patch_size * self.patch_size) as usize
    }
}

/// L2 normalise, cap every component at 0.2, renormalise. Zero stays zero.
fn normalise_descriptor(hist: &mut [f32]) {
    let l2 = |h: &[f32]| h.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm = l2(hist);
    if norm <= f32::EPSILON {
        hist.iter_mut().for_each(|x| *x = 0.);
        return;
    }
    hist.iter_mut()
        .for_each(|x| *x = (*x / norm).min(DESCRIPTOR_MAGNITUDE_CAP));
    let capped = l2(hist).max(f32::EPSILON);
    hist.iter_mut().for_each(|x| *x /= capped);
}

/// Integral images of gradient magnitude, one per orientation bin. Each pixel's
/// magnitude is split linearly between the two nearest orientation bins.
struct OrientationIntegrals {
    width: usize,
    height: usize,
    /// `(orientation, height + 1, width + 1)`
    planes: Array3<f64>,
}

impl OrientationIntegrals {
    fn new(image: &GrayImage) -> Self {
        let (width, height) = (image.width() as usize, image.height() as usize);
        let mut pixels = Array2::<f32>::zeros((height, width));
        for (x, y, p) in image.enumerate_pixels() {
            pixels[[y as usize, x as usize]] = p[0] as f32 / 255.;
        }

        let mut planes = Array3::<f64>::zeros((ORIENTATION_BINS, height + 1, width + 1));
        for y in 0..height {
            for x in 0..width {
                let (gx, gy) = gradient(&pixels, x, y);
                let magnitude = (gx * gx + gy * gy).sqrt();
                if magnitude == 0. {
                    continue;
                }
                let mut angle = gy.atan2(gx);
                if angle < 0. {
                    angle += 2. * PI;
                }
                let o = angle / (2. * PI) * ORIENTATION_BINS as f32;
                let o0 = o.floor();
                let frac = o - o0;
                let o0 = o0 as usize % ORIENTATION_BINS;
                let o1 = (o0 + 1) % ORIENTATION_BINS;
                planes[[o0, y + 1, x + 1]] += (magnitude * (1. - frac)) as f64;
                planes[[o1, y + 1, x + 1]] += (magnitude * frac) as f64;
            }
        }

        for o in 0..ORIENTATION_BINS {
            let mut plane = planes.slice_mut(s![o, .., ..]);
            for y in 1..=height {
                for x in 1..=width {
                    let above = plane[[y - 1, x]] + plane[[y, x - 1]] - plane[[y - 1, x - 1]];
                    plane[[y, x]] += above;
                }
            }
        }

        Self {
            width,
            height,
            planes,
        }
    }

    /// Sum of orientation `o` over pixels `x0..x1 × y0..y1`.
    #[inline]
    fn sum(&self, o: usize, x0: usize, y0: usize, x1: usize, y1: usize) -> f64 {
        let p = &self.planes;
        (p[[o, y1, x1]] - p[[o, y0, x1]] - p[[o, y1, x0]] + p[[o, y0, x0]]).max(0.)
    }
}

/// Central differences, one-sided at the borders.
#[inline]
fn gradient(pixels: &Array2<f32>, x: usize, y: usize) -> (f32, f32) {
    let (height, width) = pixels.dim();
    let diff = |a: f32, b: f32, span: usize| if span == 0 { 0. } else { (a - b) / span as f32 };
    let (xl, xr) = (x.saturating_sub(1), (x + 1).min(width - 1));
    let (yu, yd) = (y.saturating_sub(1), (y + 1).min(height - 1));
    (
        diff(pixels[[y, xr]], pixels[[y, xl]], xr - xl),
        diff(pixels[[yd, x]], pixels[[yu, x]], yd - yu),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn horizontal_ramp(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, _| Luma([(x * 4).min(255) as u8]))
    }

    fn checker(width: u32, height: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            Luma([if (x / 4 + y / 4) % 2 == 0 { 30 } else { 220 }])
        })
    }

    #[test]
    fn grid_positions_and_lengths() {
        let sift = DenseSift {
            step: 4,
            bin_size: 2,
            energy_threshold: 0.,
        };
        let features = sift.detect(&checker(24, 16));
        // patch 8: x0 in 0..=16 step 4 (5), y0 in 0..=8 step 4 (3)
        assert_eq!(features.len(), 15);
        assert_eq!((features[0].x, features[0].y), (4., 4.));
        assert_eq!((features[14].x, features[14].y), (20., 12.));
        assert!(features.iter().all(|f| f.descriptor.len() == DESCRIPTOR_SIZE));
    }

    #[test]
    fn descriptors_are_unit_length_and_capped() {
        let sift = DenseSift {
            step: 8,
            bin_size: 4,
            energy_threshold: 0.,
        };
        for f in sift.detect(&checker(32, 32)) {
            let norm: f32 = f.descriptor.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.).abs() < 1e-4);
            assert!(f.descriptor.iter().all(|&x| x >= 0.));
        }
    }

    #[test]
    fn ramp_gradients_point_along_x() {
        let sift = DenseSift {
            step: 16,
            bin_size: 4,
            energy_threshold: 0.,
        };
        let features = sift.detect(&horizontal_ramp(32, 32));
        assert!(!features.is_empty());
        for f in features {
            // every spatial bin is dominated by orientation 0 (pointing right)
            for cell in f.descriptor.chunks(ORIENTATION_BINS) {
                let best = (0..ORIENTATION_BINS)
                    .max_by(|&a, &b| cell[a].total_cmp(&cell[b]))
                    .unwrap();
                assert_eq!(best, 0);
            }
        }
    }

    #[test]
    fn flat_regions_fall_below_the_energy_threshold() {
        let flat = GrayImage::from_pixel(32, 32, Luma([128]));
        let sift = DenseSift {
            step: 4,
            bin_size: 4,
            energy_threshold: 0.005,
        };
        assert!(sift.detect(&flat).is_empty());
        assert!(!sift.detect(&checker(32, 32)).is_empty());
    }

    #[test]
    fn small_images_yield_no_features() {
        let sift = DenseSift {
            step: 3,
            bin_size: 8,
            energy_threshold: 0.,
        };
        assert!(sift.detect(&checker(20, 40)).is_empty());
        let degenerate = DenseSift {
            step: 0,
            bin_size: 8,
            energy_threshold: 0.,
        };
        assert!(degenerate.detect(&checker(64, 64)).is_empty());
    }

    #[test]
    fn pyramid_concatenates_scales() {
        let pyramid = PyramidDenseSift {
            step: 8,
            bin_sizes: vec![2, 4],
            magnification: 6.,
            energy_threshold: 0.,
        };
        let features = pyramid.detect(&checker(32, 32));
        // patch 8: 4×4 positions, patch 16: 3×3 positions
        assert_eq!(features.len(), 16 + 9);
        assert_eq!(features[0].scale, 2.);
        assert_eq!(features[16].scale, 4.);
    }

    #[test]
    fn raw_patches_are_normalised() {
        let raw = RawPatches {
            step: 8,
            patch_size: 8,
        };
        let features = raw.detect(&checker(16, 16));
        assert_eq!(features.len(), 4);
        assert_eq!(raw.descriptor_len(), 64);
        for f in features {
            let mean: f32 = f.descriptor.iter().sum::<f32>() / 64.;
            let norm: f32 = f.descriptor.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!(mean.abs() < 1e-5);
            assert!((norm - 1.).abs() < 1e-4);
        }
    }

    #[test]
    fn integral_sums_match_direct_sums() {
        let img = checker(12, 10);
        let integrals = OrientationIntegrals::new(&img);
        let total: f64 = (0..ORIENTATION_BINS)
            .map(|o| integrals.sum(o, 2, 3, 9, 8))
            .sum();

        let mut pixels = Array2::<f32>::zeros((10, 12));
        for (x, y, p) in img.enumerate_pixels() {
            pixels[[y as usize, x as usize]] = p[0] as f32 / 255.;
        }
        let mut direct = 0f64;
        for y in 3..8 {
            for x in 2..9 {
                let (gx, gy) = gradient(&pixels, x, y);
                direct += ((gx * gx + gy * gy).sqrt()) as f64;
            }
        }
        assert!((total - direct).abs() < 1e-4);
    }
}
