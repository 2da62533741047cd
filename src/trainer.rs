use ndarray::{Array1, ArrayView1, ArrayViewMut1, Zip};
use std::{
    fmt,
    time::{Duration, Instant},
};
use tracing::{debug, info};

use crate::{
    digits::Dataset,
    network::{Network, NetworkError, TrainingSet},
};

/// Something a [`Minimizer`] can drive: a scalar function of a parameter vector together with its
/// gradient.
pub trait Objective {
    fn dimension(&self) -> usize;

    /// Returns the value at `point` and writes the gradient there into `gradient`.
    fn evaluate(&self, point: ArrayView1<f64>, gradient: ArrayViewMut1<f64>) -> f64;
}

pub trait Minimizer {
    fn minimize(&self, objective: &dyn Objective, start: Array1<f64>) -> Minimum;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The projected gradient fell below the tolerance.
    Converged,
    /// Every allowed objective evaluation has been spent.
    BudgetExhausted,
    /// The line search could not find a lower value along the search direction.
    LineSearchStalled,
    /// There were no samples to fit, so the optimizer never ran.
    NothingToFit,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopReason::Converged => "converged",
            StopReason::BudgetExhausted => "evaluation budget exhausted",
            StopReason::LineSearchStalled => "line search stalled",
            StopReason::NothingToFit => "nothing to fit",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Minimum {
    pub point: Array1<f64>,
    /// Objective at `point`. NaN when the budget did not allow a single evaluation.
    pub value: f64,
    pub initial_value: f64,
    pub evaluations: usize,
    pub iterations: usize,
    pub reason: StopReason,
}

// Hands out objective evaluations until the budget is spent.
struct Budget<'a> {
    objective: &'a dyn Objective,
    limit: usize,
    used: usize,
}

impl Budget<'_> {
    fn evaluate(&mut self, point: ArrayView1<f64>, gradient: ArrayViewMut1<f64>) -> Option<f64> {
        if self.exhausted() {
            return None;
        }
        self.used += 1;
        Some(self.objective.evaluate(point, gradient))
    }

    fn remaining(&self) -> usize {
        self.limit - self.used
    }

    fn exhausted(&self) -> bool {
        self.used >= self.limit
    }
}

enum LineSearch {
    Accepted,
    OutOfBudget,
    Stalled,
}

// Projected truncated Newton. Each outer iteration approximately solves the Newton system on the
// variables that are free to move with a few conjugate-gradient steps, using finite differences of
// the gradient for the Hessian-vector products, then backtracks along that direction while keeping
// every parameter inside [-bound, bound]. Every gradient evaluation, Hessian probes included,
// counts toward `max_evaluations`.
#[derive(Debug, Clone)]
pub struct TruncatedNewton {
    pub max_evaluations: usize,
    pub bound: f64,
    pub gradient_tolerance: f64,
    pub max_inner_iterations: usize,
    pub max_step: f64,
}

const ARMIJO: f64 = 1e-4;

impl TruncatedNewton {
    pub fn new(max_evaluations: usize, bound: f64) -> TruncatedNewton {
        TruncatedNewton {
            max_evaluations,
            bound,
            gradient_tolerance: 1e-8,
            max_inner_iterations: 50,
            max_step: 10.0,
        }
    }

    fn clamp(&self, point: &mut Array1<f64>) {
        let bound = self.bound;
        point.mapv_inplace(|value| value.clamp(-bound, bound));
    }

    // 1.0 for variables that may move, 0.0 for those pinned at a bound by a gradient pushing them
    // further out.
    fn free_mask(&self, point: &Array1<f64>, gradient: &Array1<f64>) -> Array1<f64> {
        Zip::from(point).and(gradient).map_collect(|&value, &slope| {
            let pinned =
                (value <= -self.bound && slope > 0.0) || (value >= self.bound && slope < 0.0);
            if pinned { 0.0 } else { 1.0 }
        })
    }

    fn newton_direction(
        &self,
        budget: &mut Budget,
        point: &Array1<f64>,
        gradient: &Array1<f64>,
        free: &Array1<f64>,
    ) -> Array1<f64> {
        let projected = gradient * free;
        let steepest = projected.mapv(|slope| -slope);
        let gradient_norm = projected.dot(&projected).sqrt();
        let forcing = 0.5f64.min(gradient_norm.sqrt());
        let point_norm = point.dot(point).sqrt();

        let mut direction = Array1::zeros(point.len());
        let mut residual = steepest.clone();
        let mut conjugate = steepest.clone();
        let mut residual_squared = residual.dot(&residual);
        let mut probe_gradient = Array1::zeros(point.len());

        for inner in 0..self.max_inner_iterations {
            // Keep one evaluation back for the line search.
            if budget.remaining() <= 1 {
                break;
            }
            let conjugate_norm = conjugate.dot(&conjugate).sqrt();
            if conjugate_norm == 0.0 {
                break;
            }

            let step = f64::EPSILON.sqrt() * (1.0 + point_norm) / conjugate_norm;
            let probe = point + &(&conjugate * step);
            if budget.evaluate(probe.view(), probe_gradient.view_mut()).is_none() {
                break;
            }
            let product = (&probe_gradient - gradient) / step * free;

            let curvature = conjugate.dot(&product);
            if curvature <= f64::EPSILON * conjugate_norm * conjugate_norm {
                if inner == 0 {
                    direction.assign(&conjugate);
                }
                break;
            }

            let alpha = residual_squared / curvature;
            direction.scaled_add(alpha, &conjugate);
            residual.scaled_add(-alpha, &product);

            let next_squared = residual.dot(&residual);
            if next_squared.sqrt() <= forcing * gradient_norm {
                break;
            }
            conjugate = &residual + &(conjugate * (next_squared / residual_squared));
            residual_squared = next_squared;
        }

        if direction.dot(&projected) >= 0.0 {
            steepest
        } else {
            direction
        }
    }

    fn line_search(
        &self,
        budget: &mut Budget,
        point: &mut Array1<f64>,
        value: &mut f64,
        gradient: &mut Array1<f64>,
        direction: &Array1<f64>,
    ) -> LineSearch {
        let direction_norm = direction.dot(direction).sqrt();
        let mut step = (self.max_step / direction_norm).min(1.0);
        let mut candidate_gradient = Array1::zeros(point.len());

        loop {
            let mut candidate = &*point + &(direction * step);
            self.clamp(&mut candidate);

            let moved = (&candidate - &*point).dot(&*gradient);
            if moved >= 0.0 {
                return LineSearch::Stalled;
            }
            let Some(candidate_value) =
                budget.evaluate(candidate.view(), candidate_gradient.view_mut())
            else {
                return LineSearch::OutOfBudget;
            };

            if candidate_value.is_finite() && candidate_value <= *value + ARMIJO * moved {
                *point = candidate;
                *value = candidate_value;
                std::mem::swap(gradient, &mut candidate_gradient);
                return LineSearch::Accepted;
            }

            step *= 0.5;
            if step * direction_norm < f64::EPSILON {
                return LineSearch::Stalled;
            }
        }
    }
}

impl Minimizer for TruncatedNewton {
    fn minimize(&self, objective: &dyn Objective, start: Array1<f64>) -> Minimum {
        assert_eq!(start.len(), objective.dimension());
        let mut budget = Budget {
            objective,
            limit: self.max_evaluations,
            used: 0,
        };

        let mut point = start;
        self.clamp(&mut point);
        let mut gradient = Array1::zeros(point.len());
        let Some(mut value) = budget.evaluate(point.view(), gradient.view_mut()) else {
            return Minimum {
                point,
                value: f64::NAN,
                initial_value: f64::NAN,
                evaluations: 0,
                iterations: 0,
                reason: StopReason::BudgetExhausted,
            };
        };
        let initial_value = value;
        let mut iterations = 0;

        let reason = loop {
            let free = self.free_mask(&point, &gradient);
            let largest = Zip::from(&gradient)
                .and(&free)
                .fold(0.0f64, |largest, &slope, &free| largest.max((slope * free).abs()));
            if largest <= self.gradient_tolerance {
                break StopReason::Converged;
            }
            if budget.exhausted() {
                break StopReason::BudgetExhausted;
            }

            let direction = self.newton_direction(&mut budget, &point, &gradient, &free);
            match self.line_search(&mut budget, &mut point, &mut value, &mut gradient, &direction) {
                LineSearch::Accepted => iterations += 1,
                LineSearch::OutOfBudget => break StopReason::BudgetExhausted,
                LineSearch::Stalled => break StopReason::LineSearchStalled,
            }
            debug!(
                iteration = iterations,
                evaluations = budget.used,
                value,
                "truncated Newton step"
            );
        };

        Minimum {
            point,
            value,
            initial_value,
            evaluations: budget.used,
            iterations,
            reason,
        }
    }
}

// Half the summed squared error of a network over a training set, as a function of its parameters.
pub struct SquaredError<'a> {
    network: &'a Network,
    set: &'a TrainingSet,
}

impl<'a> SquaredError<'a> {
    pub fn new(network: &'a Network, set: &'a TrainingSet) -> SquaredError<'a> {
        SquaredError { network, set }
    }
}

impl Objective for SquaredError<'_> {
    fn dimension(&self) -> usize {
        self.network.parameter_count()
    }

    fn evaluate(&self, point: ArrayView1<f64>, gradient: ArrayViewMut1<f64>) -> f64 {
        self.network.error_and_gradient(point, self.set, gradient)
    }
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub samples: usize,
    pub initial_error: f64,
    pub final_error: f64,
    pub evaluations: usize,
    pub iterations: usize,
    pub reason: StopReason,
    pub elapsed: Duration,
}

// Fits a network to the first `train_limit` samples of a dataset. Only a prefix is used so the
// run time stays bounded however large the training file is.
pub struct Trainer<M> {
    minimizer: M,
    train_limit: usize,
}

impl<M: Minimizer> Trainer<M> {
    pub fn new(minimizer: M, train_limit: usize) -> Trainer<M> {
        Trainer {
            minimizer,
            train_limit,
        }
    }

    #[tracing::instrument(skip_all, fields(limit = self.train_limit))]
    pub fn train(
        &self,
        network: &mut Network,
        dataset: &Dataset,
    ) -> Result<TrainingReport, NetworkError> {
        let subset = dataset.prefix(self.train_limit);
        if subset.is_empty() {
            info!("no training samples, keeping the initial weights");
            return Ok(TrainingReport {
                samples: 0,
                initial_error: 0.0,
                final_error: 0.0,
                evaluations: 0,
                iterations: 0,
                reason: StopReason::NothingToFit,
                elapsed: Duration::ZERO,
            });
        }

        let set = network.training_set(subset.features.view(), subset.targets().view())?;
        let start = Instant::now();
        let minimum = {
            let objective = SquaredError::new(network, &set);
            self.minimizer
                .minimize(&objective, network.parameters().to_owned())
        };
        let elapsed = start.elapsed();

        info!(
            samples = subset.len(),
            evaluations = minimum.evaluations,
            iterations = minimum.iterations,
            initial_error = minimum.initial_value,
            final_error = minimum.value,
            reason = %minimum.reason,
            "training finished in {:.2}s",
            elapsed.as_secs_f32()
        );

        network.set_parameters(minimum.point);
        Ok(TrainingReport {
            samples: subset.len(),
            initial_error: minimum.initial_value,
            final_error: minimum.value,
            evaluations: minimum.evaluations,
            iterations: minimum.iterations,
            reason: minimum.reason,
            elapsed,
        })
    }
}
