use log::{debug, info};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::*;

/// A feature vector with its class.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LabeledSample {
    pub features: FeatureVector,
    pub label: String,
}

impl LabeledSample {
    pub fn new(features: FeatureVector, label: impl Into<String>) -> Self {
        Self {
            features,
            label: label.into(),
        }
    }
}

/// Loss of the binary linear problems.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Loss {
    /// `max(0, 1 - y w·x)`
    Hinge,
    /// `max(0, 1 - y w·x)²`
    SquaredHinge,
}

/// Solves one binary problem: rows of `design` are samples, `labels` are ±1.
/// Returns a weight per column.
pub trait LinearSolver: Sync {
    fn solve(&self, design: ArrayView2<f64>, labels: &[f64]) -> PhowResult<Array1<f64>>;
}

/// Dual coordinate descent for L2-regularised linear SVMs
/// (Hsieh et al., "A Dual Coordinate Descent Method for Large-scale Linear SVM", 2008).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DualCoordinateDescent {
    pub loss: Loss,
    /// Penalty of the loss term.
    pub c: f64,
    /// Stopping tolerance on the spread of the projected gradient.
    pub eps: f64,
    pub max_iterations: usize,
    /// Seed of the per-pass coordinate shuffle.
    pub seed: u64,
}

impl Default for DualCoordinateDescent {
    fn default() -> Self {
        Self {
            loss: Loss::SquaredHinge,
            c: 1.0,
            eps: 1e-5,
            max_iterations: 10_000,
            seed: 1,
        }
    }
}

impl LinearSolver for DualCoordinateDescent {
    fn solve(&self, design: ArrayView2<f64>, labels: &[f64]) -> PhowResult<Array1<f64>> {
        if !(self.c > 0.) || !(self.eps > 0.) {
            return Err(PhowErr::Configuration(format!(
                "solver needs positive c and eps, got c = {}, eps = {}",
                self.c, self.eps
            )));
        }
        let (n, dim) = design.dim();
        check_len("label vector", n, labels.len())?;

        let (diag, upper) = match self.loss {
            Loss::Hinge => (0., self.c),
            Loss::SquaredHinge => (0.5 / self.c, f64::INFINITY),
        };
        let qd: Vec<f64> = design
            .outer_iter()
            .map(|x| diag + x.dot(&x))
            .collect();

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut alpha = vec![0.; n];
        let mut w = Array1::<f64>::zeros(dim);
        let mut order: Vec<usize> = (0..n).collect();

        for iteration in 0..self.max_iterations {
            order.shuffle(&mut rng);
            let mut pg_max = f64::NEG_INFINITY;
            let mut pg_min = f64::INFINITY;

            for &i in &order {
                if qd[i] <= 0. {
                    continue;
                }
                let x = design.row(i);
                let y = labels[i];
                let g = y * w.dot(&x) - 1. + alpha[i] * diag;

                let pg = if alpha[i] == 0. {
                    g.min(0.)
                } else if alpha[i] == upper {
                    g.max(0.)
                } else {
                    g
                };
                pg_max = pg_max.max(pg);
                pg_min = pg_min.min(pg);

                if pg.abs() > 1e-12 {
                    let old = alpha[i];
                    alpha[i] = (old - g / qd[i]).max(0.).min(upper);
                    w.scaled_add((alpha[i] - old) * y, &x);
                }
            }

            if !(pg_max - pg_min).is_finite() {
                return Err(PhowErr::Training(format!(
                    "solver diverged at iteration {}",
                    iteration
                )));
            }
            if pg_max - pg_min <= self.eps {
                debug!(
                    "Dual coordinate descent converged after {} iterations",
                    iteration + 1
                );
                return Ok(w);
            }
        }

        Err(PhowErr::Training(format!(
            "no convergence within {} iterations (eps = {})",
            self.max_iterations, self.eps
        )))
    }
}

/// Trained one-vs-rest model: row `c` of `weights` scores class `classes[c]`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClassifierModel {
    classes: Vec<String>,
    dimensionality: usize,
    bias: Option<f64>,
    weights: Array2<f64>,
}

/// Scores of one vector against every class.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Index of the best class in [`ClassifierModel::classes`].
    pub index: usize,
    pub class: String,
    /// One score per class, in class order.
    pub scores: Vec<f64>,
}

impl Prediction {
    /// Lead of the best score over the runner-up; infinite with one class.
    pub fn margin(&self) -> f64 {
        let runner_up = self
            .scores
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != self.index)
            .map(|(_, &s)| s)
            .fold(f64::NEG_INFINITY, f64::max);
        self.scores[self.index] - runner_up
    }

    pub fn top_score(&self) -> f64 {
        self.scores[self.index]
    }

    pub fn scores_by_class<'a>(&'a self, model: &'a ClassifierModel) -> impl Iterator<Item = (&'a str, f64)> {
        model.classes.iter().map(String::as_str).zip(self.scores.iter().copied())
    }
}

impl ClassifierModel {
    /// Class names, sorted.
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn dimensionality(&self) -> usize {
        self.dimensionality
    }

    pub fn class_index(&self, label: &str) -> Option<usize> {
        self.classes.binary_search_by(|c| c.as_str().cmp(label)).ok()
    }

    /// Score `features` against every class; the argmax wins, ties going to
    /// the lower class index.
    pub fn predict(&self, features: &[f64]) -> PhowResult<Prediction> {
        check_len("feature vector", self.dimensionality, features.len())?;
        let x = ArrayView1::from(features);
        let scores: Vec<f64> = self
            .weights
            .outer_iter()
            .map(|w| {
                let s = w.slice(ndarray::s![..self.dimensionality]).dot(&x);
                match self.bias {
                    Some(b) => s + w[self.dimensionality] * b,
                    None => s,
                }
            })
            .collect();
        let mut index = 0;
        for (i, &s) in scores.iter().enumerate() {
            if s > scores[index] {
                index = i;
            }
        }
        Ok(Prediction {
            index,
            class: self.classes[index].clone(),
            scores,
        })
    }

    pub fn load<P: AsRef<std::path::Path>>(file: P) -> PhowResult<Self> {
        let bytes = std::fs::read(file)?;
        let model: Self = bincode::deserialize(&bytes)?;
        let cols = model.dimensionality + model.bias.is_some() as usize;
        if model.weights.dim() != (model.classes.len(), cols) {
            return Err(PhowErr::Configuration(format!(
                "weight matrix is {:?}, expected ({}, {})",
                model.weights.dim(),
                model.classes.len(),
                cols
            )));
        }
        Ok(model)
    }

    pub fn save<P: AsRef<std::path::Path>>(&self, file: P) -> PhowResult<()> {
        std::fs::write(file, bincode::serialize(self)?)?;
        Ok(())
    }
}

/// One-vs-rest linear classifier.
pub struct Classifier<S = DualCoordinateDescent> {
    solver: S,
    bias: Option<f64>,
    model: Option<ClassifierModel>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(DualCoordinateDescent::default())
    }
}

impl<S: LinearSolver> Classifier<S> {
    /// Untrained classifier with a bias feature of 1.
    pub fn new(solver: S) -> Self {
        Self {
            solver,
            bias: Some(1.),
            model: None,
        }
    }

    /// Value of the constant feature appended to every sample; `None` fits
    /// hyperplanes through the origin.
    pub fn with_bias(mut self, bias: Option<f64>) -> Self {
        self.bias = bias;
        self
    }

    pub fn from_model(solver: S, model: ClassifierModel) -> Self {
        Self {
            solver,
            bias: model.bias,
            model: Some(model),
        }
    }

    /// Fit one discriminant per class, replacing any previous model.
    pub fn train(&mut self, samples: &[LabeledSample]) -> PhowResult<&ClassifierModel> {
        // a failed run must not leave the old model looking current
        self.model = None;

        let first = samples
            .first()
            .ok_or_else(|| PhowErr::config("no training samples"))?;
        let dimensionality = first.features.len();
        for s in samples {
            check_len("training feature vector", dimensionality, s.features.len())?;
            if s.features.iter().any(|x| !x.is_finite()) {
                return Err(PhowErr::Training(format!(
                    "sample of class {:?} has non-finite features",
                    s.label
                )));
            }
        }
        let classes: Vec<String> = samples
            .iter()
            .map(|s| s.label.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if classes.len() < 2 {
            return Err(PhowErr::Training(format!(
                "need at least two classes, got {:?}",
                classes
            )));
        }

        let cols = dimensionality + self.bias.is_some() as usize;
        let mut design = Array2::<f64>::zeros((samples.len(), cols));
        for (mut row, s) in design.outer_iter_mut().zip(samples) {
            row.slice_mut(ndarray::s![..dimensionality])
                .assign(&ArrayView1::from(&s.features[..]));
            if let Some(b) = self.bias {
                row[dimensionality] = b;
            }
        }

        info!(
            "Training {} one-vs-rest classifiers on {} samples of dimension {}",
            classes.len(),
            samples.len(),
            dimensionality
        );
        let solver = &self.solver;
        let rows: Vec<Array1<f64>> = classes
            .par_iter()
            .map(|class| {
                let labels: Vec<f64> = samples
                    .iter()
                    .map(|s| if &s.label == class { 1. } else { -1. })
                    .collect();
                solver.solve(design.view(), &labels)
            })
            .collect::<PhowResult<_>>()?;

        let mut weights = Array2::<f64>::zeros((classes.len(), cols));
        for (mut row, w) in weights.outer_iter_mut().zip(&rows) {
            check_len("solver weight vector", cols, w.len())?;
            row.assign(w);
        }

        Ok(self.model.insert(ClassifierModel {
            classes,
            dimensionality,
            bias: self.bias,
            weights,
        }))
    }

    pub fn model(&self) -> PhowResult<&ClassifierModel> {
        self.model.as_ref().ok_or(PhowErr::UntrainedModel)
    }

    pub fn predict(&self, features: &[f64]) -> PhowResult<Prediction> {
        self.model()?.predict(features)
    }
}
