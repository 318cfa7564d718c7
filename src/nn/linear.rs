//! Fully connected layer `y = W x + b`.

use nalgebra::{DMatrix, DVector};
use rand::Rng;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::Parameters;

/// Dense affine layer.
///
/// The same type doubles as its own gradient accumulator: [`Linear::zeros_like`]
/// returns a layer of matching shape that [`Linear::backward`] adds into.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Linear {
    pub weight: DMatrix<f64>,
    pub bias: DVector<f64>,
}

impl Linear {
    /// Creates a layer with Xavier-uniform weights and zero bias.
    pub fn new<R: Rng + ?Sized>(input_dim: usize, output_dim: usize, rng: &mut R) -> Self {
        let bound = (6.0 / (input_dim + output_dim).max(1) as f64).sqrt();
        let weight = DMatrix::from_fn(output_dim, input_dim, |_, _| rng.gen_range(-bound..bound));
        Self {
            weight,
            bias: DVector::zeros(output_dim),
        }
    }

    /// Creates a layer with all parameters set to zero.
    pub fn zeros(input_dim: usize, output_dim: usize) -> Self {
        Self {
            weight: DMatrix::zeros(output_dim, input_dim),
            bias: DVector::zeros(output_dim),
        }
    }

    /// Zero layer with the same shape as `self`.
    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.input_dim(), self.output_dim())
    }

    pub fn input_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn output_dim(&self) -> usize {
        self.weight.nrows()
    }

    pub fn forward(&self, x: &DVector<f64>) -> DVector<f64> {
        &self.weight * x + &self.bias
    }

    /// Accumulates parameter gradients into `grads` and returns the gradient
    /// with respect to the input `x`.
    pub fn backward(
        &self,
        x: &DVector<f64>,
        grad_out: &DVector<f64>,
        grads: &mut Linear,
    ) -> DVector<f64> {
        grads.weight += grad_out * x.transpose();
        grads.bias += grad_out;
        self.weight.transpose() * grad_out
    }

    /// Multiplies every parameter by `factor`.
    pub fn scale(&mut self, factor: f64) {
        self.weight *= factor;
        self.bias *= factor;
    }
}

impl Parameters for Linear {
    fn num_parameters(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    fn write_flat(&self, out: &mut Vec<f64>) {
        out.extend_from_slice(self.weight.as_slice());
        out.extend_from_slice(self.bias.as_slice());
    }

    fn read_flat(&mut self, src: &[f64]) -> usize {
        let nw = self.weight.len();
        let nb = self.bias.len();
        self.weight.as_mut_slice().copy_from_slice(&src[..nw]);
        self.bias.as_mut_slice().copy_from_slice(&src[nw..nw + nb]);
        nw + nb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn forward_shape() {
        let mut rng = StdRng::seed_from_u64(0);
        let layer = Linear::new(4, 3, &mut rng);
        let y = layer.forward(&DVector::from_element(4, 1.0));
        assert_eq!(y.len(), 3);
    }

    #[test]
    fn backward_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(1);
        let layer = Linear::new(3, 2, &mut rng);
        let x = DVector::from_vec(vec![0.5, -1.0, 2.0]);
        // loss = sum(y)
        let mut grads = layer.zeros_like();
        let gx = layer.backward(&x, &DVector::from_element(2, 1.0), &mut grads);

        let eps = 1e-6;
        for i in 0..3 {
            let mut xp = x.clone();
            xp[i] += eps;
            let fd = (layer.forward(&xp).sum() - layer.forward(&x).sum()) / eps;
            assert!((fd - gx[i]).abs() < 1e-5);
        }
        assert!((grads.weight[(1, 2)] - 2.0).abs() < 1e-12);
        assert!((grads.bias[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn flat_round_trip() {
        let mut rng = StdRng::seed_from_u64(2);
        let layer = Linear::new(3, 2, &mut rng);
        let flat = layer.flat();
        assert_eq!(flat.len(), layer.num_parameters());
        let mut other = layer.zeros_like();
        other.load_flat(&flat);
        assert_eq!(other, layer);
    }
}
