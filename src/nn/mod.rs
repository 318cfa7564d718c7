//! Small dense function approximators with hand-derived gradients.
//!
//! Every learned module in the crate is built from [`Linear`] layers and
//! [`Mlp`] stacks over `nalgebra` vectors. Gradients are accumulated into a
//! zero-initialised copy of the module (same shape as the parameters), then
//! flattened through [`Parameters`] and handed to [`Adam`], which returns a
//! complete new parameter vector. Callers commit that vector only after it
//! passes the finiteness check, so a failed update never leaves a module
//! half-written.

pub mod adam;
pub mod linear;
pub mod mlp;
pub mod si;

use nalgebra::DVector;

use crate::error::{Module, PolarisError, Result};
use crate::types::AgentId;

pub use adam::{Adam, AdamStep};
pub use linear::Linear;
pub use mlp::{Activation, Mlp, MlpTrace};
pub use si::SynapticIntelligence;

/// Flat view over a module's trainable parameters.
///
/// `write_flat` and `read_flat` must visit parameters in the same order.
pub trait Parameters {
    /// Total number of scalar parameters.
    fn num_parameters(&self) -> usize;

    /// Appends all parameters to `out`.
    fn write_flat(&self, out: &mut Vec<f64>);

    /// Overwrites parameters from the front of `src`, returning how many
    /// values were consumed.
    fn read_flat(&mut self, src: &[f64]) -> usize;

    /// Returns all parameters as one vector.
    fn flat(&self) -> DVector<f64> {
        let mut out = Vec::with_capacity(self.num_parameters());
        self.write_flat(&mut out);
        DVector::from_vec(out)
    }

    /// Overwrites all parameters from a vector produced by [`Parameters::flat`].
    fn load_flat(&mut self, flat: &DVector<f64>) {
        self.read_flat(flat.as_slice());
    }
}

impl<P: Parameters> Parameters for Vec<P> {
    fn num_parameters(&self) -> usize {
        self.iter().map(Parameters::num_parameters).sum()
    }

    fn write_flat(&self, out: &mut Vec<f64>) {
        for p in self {
            p.write_flat(out);
        }
    }

    fn read_flat(&mut self, src: &[f64]) -> usize {
        let mut offset = 0;
        for p in self.iter_mut() {
            offset += p.read_flat(&src[offset..]);
        }
        offset
    }
}

/// Moves `target` toward `source` by Polyak averaging with rate `tau`.
pub fn soft_update<P: Parameters>(target: &mut P, source: &P, tau: f64) {
    let blended = target.flat() * (1.0 - tau) + source.flat() * tau;
    target.load_flat(&blended);
}

/// Numerically stable softmax.
pub fn softmax(logits: &DVector<f64>) -> DVector<f64> {
    let max = logits.max();
    let exp = logits.map(|x| (x - max).exp());
    let sum = exp.sum();
    exp / sum
}

/// Numerically stable log-softmax.
pub fn log_softmax(logits: &DVector<f64>) -> DVector<f64> {
    let max = logits.max();
    let log_sum = logits.iter().map(|x| (x - max).exp()).sum::<f64>().ln() + max;
    logits.map(|x| x - log_sum)
}

/// Shannon entropy (nats) of a probability vector.
pub fn entropy(probs: &DVector<f64>) -> f64 {
    -probs
        .iter()
        .filter(|p| **p > 0.0)
        .map(|p| p * p.ln())
        .sum::<f64>()
}

/// One-hot vector of length `n` with a 1 at `index`.
pub fn one_hot(index: usize, n: usize) -> DVector<f64> {
    let mut v = DVector::zeros(n);
    if index < n {
        v[index] = 1.0;
    }
    v
}

/// Concatenates vectors into one.
pub fn concat(parts: &[&DVector<f64>]) -> DVector<f64> {
    let len = parts.iter().map(|p| p.len()).sum();
    let mut out = Vec::with_capacity(len);
    for part in parts {
        out.extend_from_slice(part.as_slice());
    }
    DVector::from_vec(out)
}

/// Returns a [`PolarisError::NumericInstability`] if `value` is not finite.
pub fn check_finite_scalar(value: f64, agent: AgentId, module: Module, what: &str) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(PolarisError::NumericInstability {
            agent,
            module,
            detail: format!("{} is {}", what, value),
        })
    }
}

/// Returns a [`PolarisError::NumericInstability`] if any entry is not finite.
pub fn check_finite(values: &DVector<f64>, agent: AgentId, module: Module, what: &str) -> Result<()> {
    match values.iter().position(|v| !v.is_finite()) {
        None => Ok(()),
        Some(i) => Err(PolarisError::NumericInstability {
            agent,
            module,
            detail: format!("{}[{}] is {}", what, i, values[i]),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_sums_to_one() {
        let p = softmax(&DVector::from_vec(vec![1000.0, 999.0, -5.0]));
        assert!((p.sum() - 1.0).abs() < 1e-12);
        assert!(p[0] > p[1] && p[1] > p[2]);
    }

    #[test]
    fn log_softmax_matches_softmax() {
        let logits = DVector::from_vec(vec![0.3, -1.2, 2.0]);
        let p = softmax(&logits);
        let lp = log_softmax(&logits);
        for i in 0..3 {
            assert!((p[i].ln() - lp[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn entropy_of_uniform() {
        let p = DVector::from_element(4, 0.25);
        assert!((entropy(&p) - 4.0_f64.ln()).abs() < 1e-12);
        assert_eq!(entropy(&one_hot(1, 4)), 0.0);
    }

    #[test]
    fn check_finite_reports_position() {
        let v = DVector::from_vec(vec![1.0, f64::NAN]);
        let err = check_finite(&v, 2, Module::Actor, "grad").unwrap_err();
        assert!(err.to_string().contains("grad[1] is NaN"));
        assert!(check_finite_scalar(1.0, 0, Module::Actor, "loss").is_ok());
    }
}
