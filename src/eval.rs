use rayon::prelude::*;
use std::fmt;

use crate::*;

/// Decides whether a prediction is too uncertain to commit to.
pub trait AbstentionPolicy: Sync {
    fn abstain(&self, prediction: &Prediction) -> bool;
}

/// Always commit to the best class.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverAbstain;

impl AbstentionPolicy for NeverAbstain {
    fn abstain(&self, _prediction: &Prediction) -> bool {
        false
    }
}

/// Abstain when the best score leads the runner-up by less than `margin`.
#[derive(Debug, Clone, Copy)]
pub struct MarginThreshold {
    pub margin: f64,
}

impl AbstentionPolicy for MarginThreshold {
    fn abstain(&self, prediction: &Prediction) -> bool {
        prediction.margin() < self.margin
    }
}

/// Abstain when the best score is below `threshold`.
#[derive(Debug, Clone, Copy)]
pub struct ScoreThreshold {
    pub threshold: f64,
}

impl AbstentionPolicy for ScoreThreshold {
    fn abstain(&self, prediction: &Prediction) -> bool {
        prediction.top_score() < self.threshold
    }
}

/// Counts of (true class, predicted class), plus a column of abstentions.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfusionMatrix {
    classes: Vec<String>,
    /// `counts[t][p]`; the last column `p == classes.len()` is "unknown".
    counts: Vec<Vec<u64>>,
}

impl ConfusionMatrix {
    pub fn new(classes: Vec<String>) -> Self {
        let n = classes.len();
        Self {
            classes,
            counts: vec![vec![0; n + 1]; n],
        }
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// Record one sample; `predicted == None` files it as unknown.
    pub fn record(&mut self, actual: usize, predicted: Option<usize>) {
        let unknown = self.classes.len();
        self.counts[actual][predicted.unwrap_or(unknown)] += 1;
    }

    /// Samples of class `actual` predicted as `predicted`.
    pub fn count(&self, actual: usize, predicted: usize) -> u64 {
        self.counts[actual][predicted]
    }

    /// Samples of class `actual` that were abstained on.
    pub fn unknown(&self, actual: usize) -> u64 {
        self.counts[actual][self.classes.len()]
    }

    /// Merge counts of another matrix over the same classes.
    pub fn combine(mut self, other: &Self) -> Self {
        for (row, other_row) in self.counts.iter_mut().zip(&other.counts) {
            for (c, o) in row.iter_mut().zip(other_row) {
                *c += o;
            }
        }
        self
    }

    pub fn report(&self) -> Report {
        let n = self.classes.len();
        let correct: u64 = (0..n).map(|i| self.counts[i][i]).sum();
        let decided: u64 = self.counts.iter().map(|r| r[..n].iter().sum::<u64>()).sum();
        let abstained: u64 = (0..n).map(|i| self.unknown(i)).sum();

        let per_class: Vec<ClassStats> = (0..n)
            .map(|c| {
                let tp = self.counts[c][c];
                let predicted: u64 = (0..n).map(|t| self.counts[t][c]).sum();
                let actual: u64 = self.counts[c][..n].iter().sum();
                let precision = ratio(tp, predicted);
                let recall = ratio(tp, actual);
                let f1 = if precision + recall > 0. {
                    2. * precision * recall / (precision + recall)
                } else {
                    0.
                };
                ClassStats {
                    class: self.classes[c].clone(),
                    precision,
                    recall,
                    f1,
                    support: actual + self.unknown(c),
                }
            })
            .collect();

        let mean = |f: fn(&ClassStats) -> f64| {
            if n == 0 {
                0.
            } else {
                per_class.iter().map(f).sum::<f64>() / n as f64
            }
        };
        let accuracy = ratio(correct, decided);
        Report {
            accuracy,
            error_rate: if decided > 0 { 1. - accuracy } else { 0. },
            correct,
            incorrect: decided - correct,
            abstained,
            macro_precision: mean(|s| s.precision),
            macro_recall: mean(|s| s.recall),
            macro_f1: mean(|s| s.f1),
            per_class,
            confusion: self.clone(),
        }
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.
    } else {
        num as f64 / den as f64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassStats {
    pub class: String,
    pub precision: f64,
    /// Over the class's non-abstained samples.
    pub recall: f64,
    pub f1: f64,
    /// All test samples of the class, abstained ones included.
    pub support: u64,
}

/// Summary of an evaluation. Abstentions count towards neither correct nor
/// incorrect predictions.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub accuracy: f64,
    pub error_rate: f64,
    pub correct: u64,
    pub incorrect: u64,
    pub abstained: u64,
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,
    pub per_class: Vec<ClassStats>,
    pub confusion: ConfusionMatrix,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Accuracy:   {:.3}", self.accuracy)?;
        writeln!(f, "Error rate: {:.3}", self.error_rate)?;
        writeln!(
            f,
            "Correct: {}  Incorrect: {}  Unknown: {}",
            self.correct, self.incorrect, self.abstained
        )?;
        writeln!(f, "{:<24} {:>9} {:>9} {:>9} {:>8}", "class", "precision", "recall", "f1", "support")?;
        for s in &self.per_class {
            writeln!(
                f,
                "{:<24} {:>9.3} {:>9.3} {:>9.3} {:>8}",
                s.class, s.precision, s.recall, s.f1, s.support
            )?;
        }
        write!(
            f,
            "{:<24} {:>9.3} {:>9.3} {:>9.3}",
            "macro average", self.macro_precision, self.macro_recall, self.macro_f1
        )
    }
}

/// Runs a trained model over held-out samples.
pub struct Evaluator<P = NeverAbstain> {
    policy: P,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(NeverAbstain)
    }
}

impl<P: AbstentionPolicy> Evaluator<P> {
    pub fn new(policy: P) -> Self {
        Self { policy }
    }

    /// Predict every sample and tally the outcomes.
    pub fn evaluate(
        &self,
        model: &ClassifierModel,
        test_samples: &[LabeledSample],
    ) -> PhowResult<ConfusionMatrix> {
        let empty = || ConfusionMatrix::new(model.classes().to_vec());
        test_samples
            .par_iter()
            .try_fold(empty, |mut matrix, s| -> PhowResult<ConfusionMatrix> {
                let actual = model.class_index(&s.label).ok_or_else(|| {
                    PhowErr::Configuration(format!("test label {:?} was never trained", s.label))
                })?;
                let prediction = model.predict(&s.features)?;
                let predicted = if self.policy.abstain(&prediction) {
                    None
                } else {
                    Some(prediction.index)
                };
                matrix.record(actual, predicted);
                Ok(matrix)
            })
            .try_reduce(empty, |a, b| Ok(a.combine(&b)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classes() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    #[test]
    fn abstentions_are_excluded_from_accuracy() {
        let mut m = ConfusionMatrix::new(classes());
        for _ in 0..4 {
            m.record(0, Some(0));
        }
        for _ in 0..2 {
            m.record(1, Some(1));
        }
        m.record(0, Some(1));
        m.record(1, Some(0));
        m.record(0, None);
        m.record(1, None);

        let r = m.report();
        assert_eq!(r.correct, 6);
        assert_eq!(r.incorrect, 2);
        assert_eq!(r.abstained, 2);
        assert_eq!(r.accuracy, 0.75);
        assert_eq!(r.error_rate, 0.25);
        assert_eq!(r.confusion.count(0, 1), 1);
        assert_eq!(r.confusion.unknown(1), 1);
    }

    #[test]
    fn per_class_statistics() {
        let mut m = ConfusionMatrix::new(classes());
        // a: 3 right, 1 called b; b: 1 right, 1 unknown
        for _ in 0..3 {
            m.record(0, Some(0));
        }
        m.record(0, Some(1));
        m.record(1, Some(1));
        m.record(1, None);

        let r = m.report();
        let a = &r.per_class[0];
        assert_eq!(a.precision, 1.0);
        assert_eq!(a.recall, 0.75);
        assert!((a.f1 - 6. / 7.).abs() < 1e-12);
        assert_eq!(a.support, 4);
        let b = &r.per_class[1];
        assert_eq!(b.precision, 0.5);
        assert_eq!(b.recall, 1.0);
        assert_eq!(b.support, 2);
        assert!((r.macro_precision - 0.75).abs() < 1e-12);
        assert!(r.to_string().contains("Accuracy:   0.800"));
    }

    #[test]
    fn empty_matrix_reports_zeros() {
        let r = ConfusionMatrix::new(classes()).report();
        assert_eq!(r.accuracy, 0.);
        assert_eq!(r.per_class[0].f1, 0.);
    }

    #[test]
    fn combine_adds_counts() {
        let mut a = ConfusionMatrix::new(classes());
        a.record(0, Some(0));
        let mut b = ConfusionMatrix::new(classes());
        b.record(0, Some(0));
        b.record(1, None);
        let c = a.combine(&b);
        assert_eq!(c.count(0, 0), 2);
        assert_eq!(c.unknown(1), 1);
    }

    fn trained() -> Classifier {
        let mut samples = Vec::new();
        for i in 0..5 {
            let t = i as f64 * 0.1;
            samples.push(LabeledSample::new(vec![1. + t, 0.], "a"));
            samples.push(LabeledSample::new(vec![0., 1. + t], "b"));
        }
        let mut clf = Classifier::default();
        clf.train(&samples).unwrap();
        clf
    }

    #[test]
    fn margin_policy_files_ambiguous_samples_as_unknown() {
        let clf = trained();
        let model = clf.model().unwrap();
        let test = vec![
            LabeledSample::new(vec![1.2, 0.], "a"),
            LabeledSample::new(vec![0., 1.2], "b"),
            // equidistant from both classes
            LabeledSample::new(vec![0.6, 0.6], "a"),
        ];

        let strict = Evaluator::new(MarginThreshold { margin: 0.5 })
            .evaluate(model, &test)
            .unwrap();
        let r = strict.report();
        assert_eq!(r.abstained, 1);
        assert_eq!(strict.unknown(0), 1);
        assert_eq!(r.accuracy, 1.0);

        let lenient = Evaluator::default().evaluate(model, &test).unwrap();
        assert_eq!(lenient.report().abstained, 0);
    }

    #[test]
    fn partial_matrices_merge_to_the_full_tally() {
        let clf = trained();
        let model = clf.model().unwrap();
        let test: Vec<LabeledSample> = (0..2000)
            .map(|i| {
                let t = (i % 7) as f64 * 0.1;
                if i % 3 == 0 {
                    LabeledSample::new(vec![0., 1. + t], "b")
                } else {
                    LabeledSample::new(vec![1. + t, 0.], "a")
                }
            })
            .collect();

        let mut expected = ConfusionMatrix::new(model.classes().to_vec());
        for s in &test {
            let actual = model.class_index(&s.label).unwrap();
            expected.record(actual, Some(model.predict(&s.features).unwrap().index));
        }
        let m = Evaluator::default().evaluate(model, &test).unwrap();
        assert_eq!(m, expected);
        assert_eq!(m.count(0, 0) + m.count(0, 1), 1333);
    }

    #[test]
    fn score_threshold_policy() {
        let clf = trained();
        let test = vec![LabeledSample::new(vec![0., 0.], "a")];
        let m = Evaluator::new(ScoreThreshold { threshold: 10. })
            .evaluate(clf.model().unwrap(), &test)
            .unwrap();
        assert_eq!(m.unknown(0), 1);
    }

    #[test]
    fn unknown_test_label_is_rejected() {
        let clf = trained();
        let test = vec![LabeledSample::new(vec![1., 0.], "zebra")];
        assert!(matches!(
            Evaluator::default().evaluate(clf.model().unwrap(), &test),
            Err(PhowErr::Configuration(_))
        ));
    }
}
