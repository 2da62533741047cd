use ndarray::{ArrayView1, ArrayView2, Axis};
use thiserror::Error;
use tracing::info;

use crate::{
    digits::Dataset,
    network::{Network, NetworkError},
};

#[derive(Debug, Error)]
pub enum EvaluationError {
    // An accuracy over zero samples would be made up, so an empty test set is refused outright.
    #[error("the evaluation set is empty, accuracy is undefined")]
    EmptyEvaluationSet,
    #[error(transparent)]
    Network(#[from] NetworkError),
}

// Index of the largest output. Ties go to the lowest index and NaN never wins; `None` only when
// there is nothing to choose from.
pub fn predict_class(outputs: ArrayView1<f64>) -> Option<usize> {
    outputs
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (index, &value)| match best {
            _ if value.is_nan() => best,
            Some((_, largest)) if value <= largest => best,
            _ => Some((index, value)),
        })
        .map(|(index, _)| index)
}

/// Least-squares line through (target, output) pairs of one output node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegressionLine {
    pub slope: f64,
    pub intercept: f64,
    /// Pearson correlation between targets and outputs.
    pub r: f64,
}

impl RegressionLine {
    // `None` when the targets never vary, since no line is determined then.
    pub fn fit(targets: ArrayView1<f64>, outputs: ArrayView1<f64>) -> Option<RegressionLine> {
        let count = targets.len() as f64;
        let target_mean = targets.mean()?;
        let output_mean = outputs.mean()?;

        let (mut covariance, mut target_variance, mut output_variance) = (0.0, 0.0, 0.0);
        for (&target, &output) in targets.iter().zip(outputs) {
            let (dx, dy) = (target - target_mean, output - output_mean);
            covariance += dx * dy / count;
            target_variance += dx * dx / count;
            output_variance += dy * dy / count;
        }
        if target_variance == 0.0 {
            return None;
        }

        let slope = covariance / target_variance;
        let r = if output_variance == 0.0 {
            0.0
        } else {
            covariance / (target_variance * output_variance).sqrt()
        };
        Some(RegressionLine {
            slope,
            intercept: output_mean - slope * target_mean,
            r,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub correct: usize,
    pub incorrect: usize,
    pub predictions: Vec<Option<usize>>,
    pub regressions: Vec<Option<RegressionLine>>,
}

impl Evaluation {
    // Score already computed outputs against the true labels.
    pub fn score(
        outputs: ArrayView2<f64>,
        labels: &[u8],
        targets: ArrayView2<f64>,
    ) -> Result<Evaluation, EvaluationError> {
        assert_eq!(outputs.nrows(), labels.len());
        if labels.is_empty() {
            return Err(EvaluationError::EmptyEvaluationSet);
        }

        let predictions = outputs.outer_iter().map(predict_class).collect::<Vec<_>>();
        let correct = predictions
            .iter()
            .zip(labels)
            .filter(|&(prediction, &label)| *prediction == Some(label as usize))
            .count();
        let regressions = targets
            .axis_iter(Axis(1))
            .zip(outputs.axis_iter(Axis(1)))
            .map(|(targets, outputs)| RegressionLine::fit(targets, outputs))
            .collect();

        Ok(Evaluation {
            correct,
            incorrect: labels.len() - correct,
            predictions,
            regressions,
        })
    }

    pub fn total(&self) -> usize {
        self.correct + self.incorrect
    }

    /// Percentage of samples whose arg-max output matched the label.
    pub fn accuracy(&self) -> f64 {
        100.0 * self.correct as f64 / self.total() as f64
    }
}

#[tracing::instrument(skip_all, fields(samples = dataset.len()))]
pub fn evaluate(network: &Network, dataset: &Dataset) -> Result<Evaluation, EvaluationError> {
    if dataset.is_empty() {
        return Err(EvaluationError::EmptyEvaluationSet);
    }

    let outputs = network.outputs(dataset.features.view())?;
    let evaluation = Evaluation::score(outputs.view(), &dataset.labels, dataset.targets().view())?;

    for (digit, line) in evaluation.regressions.iter().enumerate() {
        match line {
            Some(line) => info!(
                digit,
                slope = line.slope,
                intercept = line.intercept,
                r = line.r,
                "output regression"
            ),
            None => info!(digit, "output regression undefined, target never varies"),
        }
    }

    Ok(evaluation)
}
