use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, Axis, Zip};
use ndarray_rand::{RandomExt, rand::Rng, rand_distr::Uniform};
use std::borrow::Cow;
use thiserror::Error;

use crate::topology::{ConnectionGraph, NodeId};

// Every input feature is squeezed into this range before it reaches the network, and every output
// node's sigmoid activation is read back out of it. Keeping clear of 0 and 1 leaves the sigmoid
// enough slope to learn.
pub const NORMALIZED_RANGE: (f64, f64) = (0.15, 0.85);

// Range of the bipolar target vectors the outputs are reported in.
pub const TARGET_RANGE: (f64, f64) = (-1.0, 1.0);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("expected {expected} input values, got {actual}")]
    InputWidth { expected: usize, actual: usize },
    #[error("expected {expected} target values, got {actual}")]
    TargetWidth { expected: usize, actual: usize },
    #[error("{inputs} input rows but {targets} target rows")]
    SampleCount { inputs: usize, targets: usize },
}

// Coefficients of the linear map taking [a, b] onto [c, d]. A degenerate source range maps
// everything to the middle of the target range.
fn linear(a: f64, b: f64, c: f64, d: f64) -> (f64, f64) {
    if a == b {
        (0.0, (c + d) / 2.0)
    } else {
        let scale = (d - c) / (b - a);
        (scale, c - a * scale)
    }
}

// A per-column affine map, value * scale + offset.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearMap {
    scale: Array1<f64>,
    offset: Array1<f64>,
}

impl LinearMap {
    // Map each column of `data` from its observed [min, max] onto `to`.
    pub fn fit(data: ArrayView2<f64>, to: (f64, f64)) -> LinearMap {
        let columns = data.ncols();
        let mut scale = Array1::zeros(columns);
        let mut offset = Array1::zeros(columns);
        for (column, values) in data.axis_iter(Axis(1)).enumerate() {
            let (low, high) = if values.is_empty() {
                (0.0, 0.0)
            } else {
                values
                    .iter()
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(low, high), &v| {
                        (low.min(v), high.max(v))
                    })
            };
            (scale[column], offset[column]) = linear(low, high, to.0, to.1);
        }
        LinearMap { scale, offset }
    }

    pub fn uniform(columns: usize, from: (f64, f64), to: (f64, f64)) -> LinearMap {
        let (scale, offset) = linear(from.0, from.1, to.0, to.1);
        LinearMap {
            scale: Array1::from_elem(columns, scale),
            offset: Array1::from_elem(columns, offset),
        }
    }

    pub fn apply(&self, values: ArrayView1<f64>) -> Array1<f64> {
        Zip::from(&values)
            .and(&self.scale)
            .and(&self.offset)
            .map_collect(|&value, &scale, &offset| value * scale + offset)
    }

    pub fn apply_rows(&self, rows: ArrayView2<f64>) -> Array2<f64> {
        &rows * &self.scale + &self.offset
    }
}

// Inputs and targets already mapped into the network's internal range, ready to be fitted.
#[derive(Debug, Clone)]
pub struct TrainingSet {
    inputs: Array2<f64>,
    targets: Array2<f64>,
}

#[derive(Debug, Clone)]
pub struct Network {
    graph: ConnectionGraph,
    // One weight per edge, in edge order, followed by one bias per non-input node.
    parameters: Array1<f64>,
    input_map: LinearMap,
    output_map: LinearMap,
    target_map: LinearMap,
}

impl Network {
    // Build a network over `graph`, fitting the input normalisation to `training_inputs`. Every
    // parameter starts uniformly random in +-1/sqrt(fan_in + 1) of the node it belongs to.
    pub fn new<R: Rng + ?Sized>(
        graph: ConnectionGraph,
        training_inputs: ArrayView2<f64>,
        rng: &mut R,
    ) -> Result<Network, NetworkError> {
        let layout = graph.layout();
        if training_inputs.ncols() != layout.inputs {
            return Err(NetworkError::InputWidth {
                expected: layout.inputs,
                actual: training_inputs.ncols(),
            });
        }

        let input_map = LinearMap::fit(training_inputs, NORMALIZED_RANGE);
        let output_map = LinearMap::uniform(layout.outputs, NORMALIZED_RANGE, TARGET_RANGE);
        let target_map = LinearMap::uniform(layout.outputs, TARGET_RANGE, NORMALIZED_RANGE);

        let edge_count = graph.edges().len();
        let mut parameters =
            Array1::random_using(edge_count + graph.non_input_count(), Uniform::new(-1.0, 1.0), rng);
        for (index, edge) in graph.edges().iter().enumerate() {
            parameters[index] /= ((graph.fan_in(edge.target) + 1) as f64).sqrt();
        }
        for &node in graph.order() {
            parameters[edge_count + node - layout.inputs] /= ((graph.fan_in(node) + 1) as f64).sqrt();
        }

        Ok(Network {
            graph,
            parameters,
            input_map,
            output_map,
            target_map,
        })
    }

    pub fn parameters(&self) -> ArrayView1<'_, f64> {
        self.parameters.view()
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    pub fn set_parameters(&mut self, parameters: Array1<f64>) {
        assert_eq!(parameters.len(), self.parameters.len());
        self.parameters = parameters;
    }

    fn bias_index(&self, node: NodeId) -> usize {
        self.graph.edges().len() + node - self.graph.layout().inputs
    }

    // Calculates the activations of the output nodes for one raw (unnormalised) input vector, in
    // the units of the target vectors.
    pub fn output(&self, input: ArrayView1<f64>) -> Result<Array1<f64>, NetworkError> {
        self.check_input_width(input.len())?;
        let parameters = contiguous(self.parameters.view());
        let mut activations = vec![0.0; self.graph.node_count()];

        self.feedforward(&parameters, self.input_map.apply(input).view(), &mut activations);
        Ok(self.read_outputs(&activations))
    }

    // Runs every row of `inputs` through the network, one output row per input row.
    pub fn outputs(&self, inputs: ArrayView2<f64>) -> Result<Array2<f64>, NetworkError> {
        self.check_input_width(inputs.ncols())?;
        let parameters = contiguous(self.parameters.view());
        let normalized = self.input_map.apply_rows(inputs);
        let mut activations = vec![0.0; self.graph.node_count()];
        let mut outputs = Array2::zeros((inputs.nrows(), self.graph.layout().outputs));

        for (input, mut output) in normalized.outer_iter().zip(outputs.outer_iter_mut()) {
            self.feedforward(&parameters, input, &mut activations);
            output.assign(&self.read_outputs(&activations));
        }
        Ok(outputs)
    }

    pub fn training_set(
        &self,
        inputs: ArrayView2<f64>,
        targets: ArrayView2<f64>,
    ) -> Result<TrainingSet, NetworkError> {
        self.check_input_width(inputs.ncols())?;
        let outputs = self.graph.layout().outputs;
        if targets.ncols() != outputs {
            return Err(NetworkError::TargetWidth {
                expected: outputs,
                actual: targets.ncols(),
            });
        }
        if inputs.nrows() != targets.nrows() {
            return Err(NetworkError::SampleCount {
                inputs: inputs.nrows(),
                targets: targets.nrows(),
            });
        }

        Ok(TrainingSet {
            inputs: self.input_map.apply_rows(inputs),
            targets: self.target_map.apply_rows(targets),
        })
    }

    // Half the summed squared error of the network with `parameters` over the whole training set,
    // measured in the normalised output range. The exact gradient with respect to every parameter
    // is written into `gradient`.
    pub fn error_and_gradient(
        &self,
        parameters: ArrayView1<f64>,
        set: &TrainingSet,
        mut gradient: ArrayViewMut1<f64>,
    ) -> f64 {
        assert_eq!(parameters.len(), self.parameters.len());
        assert_eq!(gradient.len(), self.parameters.len());

        let parameters = contiguous(parameters);
        let mut activations = vec![0.0; self.graph.node_count()];
        let mut deltas = vec![0.0; self.graph.node_count()];
        let mut sums = vec![0.0; parameters.len()];
        let mut error = 0.0;

        for (input, target) in set.inputs.outer_iter().zip(set.targets.outer_iter()) {
            self.feedforward(&parameters, input, &mut activations);
            error += self.backpropagate(&parameters, &activations, target, &mut deltas, &mut sums);
        }

        gradient.assign(&ArrayView1::from(&sums));
        error
    }

    // Propagate one normalised input through the graph. Nodes are visited in evaluation order, so
    // every source activation is final by the time a node reads it.
    fn feedforward(&self, parameters: &[f64], input: ArrayView1<f64>, activations: &mut [f64]) {
        let edges = self.graph.edges();
        for (activation, &value) in activations.iter_mut().zip(input.iter()) {
            *activation = value;
        }

        for &node in self.graph.order() {
            let z = self
                .graph
                .incoming(node)
                .fold(parameters[self.bias_index(node)], |z, index| {
                    z + parameters[index] * activations[edges[index].source]
                });
            activations[node] = sigmoid(z);
        }
    }

    // Accumulate the gradient of one sample's error into `gradient` and return that error. Walking
    // the evaluation order backwards means a node's delta is complete before it is pushed further
    // down to its sources.
    fn backpropagate(
        &self,
        parameters: &[f64],
        activations: &[f64],
        target: ArrayView1<f64>,
        deltas: &mut [f64],
        gradient: &mut [f64],
    ) -> f64 {
        let edges = self.graph.edges();
        deltas.fill(0.0);

        let mut error = 0.0;
        for (node, &expected) in self.graph.layout().outputs().zip(target.iter()) {
            let difference = activations[node] - expected;
            error += 0.5 * difference * difference;
            deltas[node] = difference;
        }

        for &node in self.graph.order().iter().rev() {
            let delta = deltas[node] * sigmoid_slope(activations[node]);
            gradient[self.bias_index(node)] += delta;
            for index in self.graph.incoming(node) {
                let source = edges[index].source;
                gradient[index] += delta * activations[source];
                deltas[source] += delta * parameters[index];
            }
        }

        error
    }

    fn read_outputs(&self, activations: &[f64]) -> Array1<f64> {
        let outputs = ArrayView1::from(&activations[self.graph.layout().outputs()]);
        self.output_map.apply(outputs)
    }

    fn check_input_width(&self, actual: usize) -> Result<(), NetworkError> {
        let expected = self.graph.layout().inputs;
        if actual == expected {
            Ok(())
        } else {
            Err(NetworkError::InputWidth { expected, actual })
        }
    }
}

fn contiguous(values: ArrayView1<'_, f64>) -> Cow<'_, [f64]> {
    match values.to_slice() {
        Some(slice) => Cow::Borrowed(slice),
        None => Cow::Owned(values.to_vec()),
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + f64::exp(-z))
}

// Derivative of the sigmoid expressed through its own output.
fn sigmoid_slope(activation: f64) -> f64 {
    activation * (1.0 - activation)
}
