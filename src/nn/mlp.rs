//! Multi-layer perceptron with a linear output layer.

use nalgebra::DVector;
use rand::Rng;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::{Linear, Parameters};

/// Hidden-layer nonlinearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Activation {
    Tanh,
    Relu,
}

impl Activation {
    pub fn apply(&self, x: f64) -> f64 {
        match self {
            Activation::Tanh => x.tanh(),
            Activation::Relu => x.max(0.0),
        }
    }

    /// Derivative expressed in terms of the activation's output `y`.
    pub fn derivative_from_output(&self, y: f64) -> f64 {
        match self {
            Activation::Tanh => 1.0 - y * y,
            Activation::Relu => {
                if y > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// Stack of [`Linear`] layers with `activation` between them.
///
/// Architecture: `sizes[0] → sizes[1] → … → sizes[n]`, no activation on the
/// output layer.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Mlp {
    layers: Vec<Linear>,
    activation: Activation,
}

/// Intermediate values recorded by [`Mlp::forward_traced`] for backprop.
#[derive(Debug, Clone)]
pub struct MlpTrace {
    /// `inputs[i]` is the input to layer `i` (post-activation for `i > 0`).
    inputs: Vec<DVector<f64>>,
}

impl Mlp {
    /// Creates an MLP with the given layer sizes (at least input and output).
    pub fn new<R: Rng + ?Sized>(sizes: &[usize], activation: Activation, rng: &mut R) -> Self {
        let layers = sizes
            .windows(2)
            .map(|w| Linear::new(w[0], w[1], rng))
            .collect();
        Self { layers, activation }
    }

    /// Zero-valued MLP of identical shape, used as a gradient accumulator.
    pub fn zeros_like(&self) -> Self {
        Self {
            layers: self.layers.iter().map(Linear::zeros_like).collect(),
            activation: self.activation,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.layers.first().map(Linear::input_dim).unwrap_or(0)
    }

    pub fn output_dim(&self) -> usize {
        self.layers.last().map(Linear::output_dim).unwrap_or(0)
    }

    /// Scales the output layer, typically to start policies near uniform.
    pub fn scale_output_layer(&mut self, factor: f64) {
        if let Some(last) = self.layers.last_mut() {
            last.scale(factor);
        }
    }

    /// Mutable access to the output layer.
    pub fn output_layer_mut(&mut self) -> Option<&mut Linear> {
        self.layers.last_mut()
    }

    pub fn forward(&self, x: &DVector<f64>) -> DVector<f64> {
        let n = self.layers.len();
        let mut h = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h);
            if i + 1 < n {
                h.apply(|v| *v = self.activation.apply(*v));
            }
        }
        h
    }

    /// Forward pass that keeps what [`Mlp::backward`] needs.
    pub fn forward_traced(&self, x: &DVector<f64>) -> (DVector<f64>, MlpTrace) {
        let n = self.layers.len();
        let mut inputs = Vec::with_capacity(n);
        let mut h = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            let out = layer.forward(&h);
            inputs.push(h);
            h = out;
            if i + 1 < n {
                h.apply(|v| *v = self.activation.apply(*v));
            }
        }
        (h, MlpTrace { inputs })
    }

    /// Accumulates parameter gradients into `grads` for the output gradient
    /// `grad_out` and returns the gradient with respect to the network input.
    pub fn backward(&self, trace: &MlpTrace, grad_out: &DVector<f64>, grads: &mut Mlp) -> DVector<f64> {
        let mut g = grad_out.clone();
        for i in (0..self.layers.len()).rev() {
            let input = &trace.inputs[i];
            let g_in = self.layers[i].backward(input, &g, &mut grads.layers[i]);
            g = if i > 0 {
                g_in.zip_map(input, |gi, y| gi * self.activation.derivative_from_output(y))
            } else {
                g_in
            };
        }
        g
    }
}

impl Parameters for Mlp {
    fn num_parameters(&self) -> usize {
        self.layers.iter().map(Parameters::num_parameters).sum()
    }

    fn write_flat(&self, out: &mut Vec<f64>) {
        for layer in &self.layers {
            layer.write_flat(out);
        }
    }

    fn read_flat(&mut self, src: &[f64]) -> usize {
        let mut offset = 0;
        for layer in &mut self.layers {
            offset += layer.read_flat(&src[offset..]);
        }
        offset
    }
}
