//! Explicit feature maps for additive homogeneous kernels, after
//! [Vedaldi & Zisserman 2012](https://www.robots.ox.ac.uk/~vgg/publications/2011/Vedaldi11/vedaldi11.pdf).
//!
//! A homogeneous kernel `k(x, y) = sqrt(xy) κ(ln y - ln x)` is approximated by
//! sampling the spectrum `κ` at `2n + 1` frequencies, so that
//! `ψ(x) · ψ(y) ≈ k(x, y)` for every input dimension. A linear classifier
//! over `ψ` then behaves like a kernel machine over the original histogram.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Kernels with a closed-form spectrum.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KernelType {
    /// `2xy / (x + y)`
    Chi2,
    /// `min(x, y)`
    Intersection,
    /// `x/2 log2((x + y)/x) + y/2 log2((x + y)/y)`
    JensenShannon,
}

impl KernelType {
    /// Spectrum `κ(λ)`.
    fn spectrum(self, lambda: f64) -> f64 {
        match self {
            KernelType::Chi2 => 1. / (PI * lambda).cosh(),
            KernelType::Intersection => 2. / PI / (1. + 4. * lambda * lambda),
            KernelType::JensenShannon => {
                2. / (4f64.ln() * (1. + 4. * lambda * lambda)) / (PI * lambda).cosh()
            }
        }
    }

    /// Default log-period for an approximation of the given order.
    fn default_period(self, order: usize) -> f64 {
        let n = order as f64;
        match self {
            KernelType::Chi2 | KernelType::JensenShannon => 5.86 * n.sqrt() + 3.65,
            KernelType::Intersection => 2.38 * (n + 0.8).ln() + 5.6,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HomogeneousKernelMap {
    kernel: KernelType,
    order: usize,
    gamma: f64,
    /// Sampling step `L` of the spectrum.
    step: f64,
    /// `sqrt(L κ(0))`, then `sqrt(2 L κ(jL))` for `j = 1..=order`.
    coefficients: Vec<f64>,
}

impl HomogeneousKernelMap {
    /// Map of order `order` with homogeneity 1 and the default period.
    pub fn new(kernel: KernelType, order: usize) -> Self {
        Self::with_params(kernel, order, 1., kernel.default_period(order))
    }

    /// Map with homogeneity `gamma` and the default period.
    pub fn with_gamma(kernel: KernelType, order: usize, gamma: f64) -> Self {
        Self::with_params(kernel, order, gamma, kernel.default_period(order))
    }

    /// Map with explicit homogeneity `gamma` and spectrum period.
    pub fn with_params(kernel: KernelType, order: usize, gamma: f64, period: f64) -> Self {
        let step = 2. * PI / period;
        let coefficients = (0..=order)
            .map(|j| {
                let weight = if j == 0 { 1. } else { 2. };
                (weight * step * kernel.spectrum(j as f64 * step)).sqrt()
            })
            .collect();
        Self {
            kernel,
            order,
            gamma,
            step,
            coefficients,
        }
    }

    pub fn kernel(&self) -> KernelType {
        self.kernel
    }

    pub fn order(&self) -> usize {
        self.order
    }

    /// Output dimensions produced per input dimension.
    pub fn expansion_factor(&self) -> usize {
        2 * self.order + 1
    }

    /// Length of the expansion of an `n`-dimensional vector.
    pub fn expanded_len(&self, n: usize) -> usize {
        n * self.expansion_factor()
    }

    /// Expand every dimension of `v` into `2n + 1` consecutive components.
    pub fn expand(&self, v: &[f64]) -> Vec<f64> {
        let mut out = vec![0.; self.expanded_len(v.len())];
        for (x, chunk) in v.iter().zip(out.chunks_exact_mut(self.expansion_factor())) {
            self.map_value(*x, chunk);
        }
        out
    }

    fn map_value(&self, x: f64, out: &mut [f64]) {
        // zero (and NaN) map to the zero vector
        if !(x.abs() > 0.) {
            return;
        }
        let sign = x.signum();
        let x = x.abs();
        let magnitude = sign * x.powf(self.gamma / 2.);
        let log_x = x.ln();

        out[0] = magnitude * self.coefficients[0];
        for j in 1..=self.order {
            let (sin, cos) = (j as f64 * self.step * log_x).sin_cos();
            out[2 * j - 1] = magnitude * self.coefficients[j] * cos;
            out[2 * j] = magnitude * self.coefficients[j] * sin;
        }
    }
}
