//! Opponent policy inference.
//!
//! Each agent models the policies of the neighbors it observes as latent
//! states `m_j` with a diagonal Gaussian posterior, inferred from a short
//! window of their observed actions:
//!
//! ```text
//! e_j = [action histogram (C), last action (C), degree / (N-1), id one-hot (N)]
//! h_j = tanh(A e_j + a)
//! c_j = mean_{k≠j} h_k                        relational context
//! μ_j = W_μ [h_j; c_j] + b_μ,  log σ²_j = clamp(W_σ [h_j; c_j] + b_σ)
//! p(a_j' | m_j) = softmax(D m_j + d)
//! ```
//!
//! Training maximizes the ELBO of the neighbors' next actions with a
//! standard normal prior, using the reparameterization `m = μ + σ ε`.
//! Without neighbors the module returns the prior-only estimate: the decoder
//! evaluated at the prior mean, with unit spread.

use nalgebra::DVector;
use rand::Rng;
use rand_distr::StandardNormal;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{Module, Result};
use crate::nn::{
    check_finite, check_finite_scalar, concat, log_softmax, one_hot, softmax, Adam, Linear,
    Parameters,
};
use crate::types::AgentId;

const LOGVAR_MIN: f64 = -6.0;
const LOGVAR_MAX: f64 = 2.0;

/// Recent actions of one neighbor, as seen by the observing agent.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NeighborRecord {
    pub agent: AgentId,
    /// Out-degree of the neighbor in the observation network.
    pub degree: usize,
    /// Action classes, oldest first, at most the inference window.
    pub actions: Vec<usize>,
}

/// Read-only snapshot of an agent's neighborhood.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NeighborhoodView {
    pub neighbors: Vec<NeighborRecord>,
}

impl NeighborhoodView {
    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }
}

/// Posterior over one neighbor's latent policy state.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborPosterior {
    pub agent: AgentId,
    pub mean: DVector<f64>,
    pub std: DVector<f64>,
    /// Predicted distribution of the neighbor's next action class.
    pub predicted: DVector<f64>,
}

/// Distributional estimate of the neighborhood's policies.
#[derive(Debug, Clone, PartialEq)]
pub struct OpponentEstimate {
    pub neighbors: Vec<NeighborPosterior>,
    /// `[mean predicted action distribution (C), mean posterior std]`,
    /// the part consumed by the policy.
    pub summary: DVector<f64>,
}

/// One training sample: the neighborhood at time `t` and the action classes
/// neighbors took at `t + 1`.
#[derive(Debug, Clone, Copy)]
pub struct InferenceSample<'a> {
    pub view: &'a NeighborhoodView,
    pub next_actions: &'a [(AgentId, usize)],
}

/// Loss breakdown of one inference update.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InferenceLosses {
    /// Negative ELBO per predicted action.
    pub elbo: f64,
    pub reconstruction: f64,
    pub kl: f64,
}

/// Trainable parts, flattened in field order.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
struct InferenceNet {
    encoder: Linear,
    mean_head: Linear,
    logvar_head: Linear,
    decoder: Linear,
}

impl InferenceNet {
    fn zeros_like(&self) -> Self {
        Self {
            encoder: self.encoder.zeros_like(),
            mean_head: self.mean_head.zeros_like(),
            logvar_head: self.logvar_head.zeros_like(),
            decoder: self.decoder.zeros_like(),
        }
    }
}

impl Parameters for InferenceNet {
    fn num_parameters(&self) -> usize {
        self.encoder.num_parameters()
            + self.mean_head.num_parameters()
            + self.logvar_head.num_parameters()
            + self.decoder.num_parameters()
    }

    fn write_flat(&self, out: &mut Vec<f64>) {
        self.encoder.write_flat(out);
        self.mean_head.write_flat(out);
        self.logvar_head.write_flat(out);
        self.decoder.write_flat(out);
    }

    fn read_flat(&mut self, src: &[f64]) -> usize {
        let mut offset = self.encoder.read_flat(src);
        offset += self.mean_head.read_flat(&src[offset..]);
        offset += self.logvar_head.read_flat(&src[offset..]);
        offset += self.decoder.read_flat(&src[offset..]);
        offset
    }
}

/// Forward quantities for one neighbor.
struct NeighborPass {
    u: DVector<f64>,
    mean: DVector<f64>,
    logvar: DVector<f64>,
    clamped: Vec<bool>,
}

/// Per-agent variational opponent model.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct InferenceModule {
    num_agents: usize,
    num_classes: usize,
    window: usize,
    kl_weight: f64,
    net: InferenceNet,
    optimizer: Adam,
}

impl InferenceModule {
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: Rng + ?Sized>(
        num_agents: usize,
        num_classes: usize,
        window: usize,
        hidden_dim: usize,
        latent_dim: usize,
        kl_weight: f64,
        lr: f64,
        max_grad_norm: f64,
        rng: &mut R,
    ) -> Self {
        let input_dim = 2 * num_classes + 1 + num_agents;
        let mut logvar_head = Linear::new(2 * hidden_dim, latent_dim, rng);
        logvar_head.scale(0.1);
        let net = InferenceNet {
            encoder: Linear::new(input_dim, hidden_dim, rng),
            mean_head: Linear::new(2 * hidden_dim, latent_dim, rng),
            logvar_head,
            decoder: Linear::new(latent_dim, num_classes, rng),
        };
        let optimizer = Adam::new(net.num_parameters(), lr).with_max_grad_norm(max_grad_norm);
        Self {
            num_agents,
            num_classes,
            window,
            kl_weight,
            net,
            optimizer,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Number of recent actions per neighbor the module conditions on.
    pub fn window(&self) -> usize {
        self.window
    }

    pub fn latent_dim(&self) -> usize {
        self.net.decoder.input_dim()
    }

    /// Length of [`OpponentEstimate::summary`].
    pub fn summary_dim(&self) -> usize {
        self.num_classes + 1
    }

    /// Summary used when nothing is observed: decoder at the prior mean,
    /// unit spread.
    pub fn prior_estimate(&self) -> DVector<f64> {
        let predicted = softmax(&self.net.decoder.bias);
        let mut summary = DVector::zeros(self.summary_dim());
        summary.rows_mut(0, self.num_classes).copy_from(&predicted);
        summary[self.num_classes] = 1.0;
        summary
    }

    fn neighbor_input(&self, record: &NeighborRecord) -> DVector<f64> {
        let c = self.num_classes;
        let recent = &record.actions[record.actions.len().saturating_sub(self.window)..];
        let mut histogram = DVector::zeros(c);
        for &a in recent {
            histogram[a.min(c - 1)] += 1.0 / recent.len() as f64;
        }
        let last = match recent.last() {
            Some(&a) => one_hot(a.min(c - 1), c),
            None => DVector::zeros(c),
        };
        let degree = DVector::from_element(
            1,
            record.degree as f64 / self.num_agents.saturating_sub(1).max(1) as f64,
        );
        let id = one_hot(record.agent, self.num_agents);
        concat(&[&histogram, &last, &degree, &id])
    }

    /// Encodes every neighbor; returns inputs and hidden codes.
    fn encode(&self, view: &NeighborhoodView) -> (Vec<DVector<f64>>, Vec<DVector<f64>>) {
        let inputs: Vec<_> = view
            .neighbors
            .iter()
            .map(|r| self.neighbor_input(r))
            .collect();
        let hidden = inputs
            .iter()
            .map(|e| self.net.encoder.forward(e).map(f64::tanh))
            .collect();
        (inputs, hidden)
    }

    fn posterior(&self, hidden: &[DVector<f64>], j: usize) -> NeighborPass {
        let h_dim = self.net.encoder.output_dim();
        let mut context = DVector::zeros(h_dim);
        if hidden.len() > 1 {
            for (k, h) in hidden.iter().enumerate() {
                if k != j {
                    context += h;
                }
            }
            context /= (hidden.len() - 1) as f64;
        }
        let u = concat(&[&hidden[j], &context]);
        let mean = self.net.mean_head.forward(&u);
        let raw = self.net.logvar_head.forward(&u);
        let clamped = raw
            .iter()
            .map(|v| *v < LOGVAR_MIN || *v > LOGVAR_MAX)
            .collect();
        let logvar = raw.map(|v| v.clamp(LOGVAR_MIN, LOGVAR_MAX));
        NeighborPass {
            u,
            mean,
            logvar,
            clamped,
        }
    }

    /// Posterior estimate of the neighborhood, using posterior means.
    pub fn estimate(&self, view: &NeighborhoodView) -> OpponentEstimate {
        if view.is_empty() {
            return OpponentEstimate {
                neighbors: Vec::new(),
                summary: self.prior_estimate(),
            };
        }
        let (_, hidden) = self.encode(view);
        let mut neighbors = Vec::with_capacity(hidden.len());
        let mut mean_pred = DVector::zeros(self.num_classes);
        let mut mean_std = 0.0;
        for (j, record) in view.neighbors.iter().enumerate() {
            let pass = self.posterior(&hidden, j);
            let std = pass.logvar.map(|v| (0.5 * v).exp());
            let predicted = softmax(&self.net.decoder.forward(&pass.mean));
            mean_pred += &predicted;
            mean_std += std.mean();
            neighbors.push(NeighborPosterior {
                agent: record.agent,
                mean: pass.mean,
                std,
                predicted,
            });
        }
        let n = neighbors.len() as f64;
        let mut summary = DVector::zeros(self.summary_dim());
        summary
            .rows_mut(0, self.num_classes)
            .copy_from(&(mean_pred / n));
        summary[self.num_classes] = mean_std / n;
        OpponentEstimate { neighbors, summary }
    }

    /// Negative ELBO of `batch` with fixed noise draws and its gradient.
    ///
    /// `noise` yields one standard normal vector per predicted action, in
    /// batch order.
    fn loss_and_grad(
        &self,
        batch: &[InferenceSample<'_>],
        noise: &mut dyn FnMut(usize) -> DVector<f64>,
    ) -> (InferenceLosses, InferenceNet) {
        let mut grads = self.net.zeros_like();
        let mut losses = InferenceLosses::default();
        let targets: usize = batch
            .iter()
            .map(|s| {
                s.next_actions
                    .iter()
                    .filter(|(a, _)| s.view.neighbors.iter().any(|r| r.agent == *a))
                    .count()
            })
            .sum();
        if targets == 0 {
            return (losses, grads);
        }
        let scale = 1.0 / targets as f64;
        let latent = self.latent_dim();
        let h_dim = self.net.encoder.output_dim();

        for sample in batch {
            let (inputs, hidden) = self.encode(sample.view);
            let mut grad_hidden = vec![DVector::zeros(h_dim); hidden.len()];
            for &(agent, class) in sample.next_actions {
                let j = match sample.view.neighbors.iter().position(|r| r.agent == agent) {
                    Some(j) => j,
                    None => continue,
                };
                let pass = self.posterior(&hidden, j);
                let std = pass.logvar.map(|v| (0.5 * v).exp());
                let eps = noise(latent);
                let m = &pass.mean + std.component_mul(&eps);
                let logits = self.net.decoder.forward(&m);
                let log_probs = log_softmax(&logits);
                let target = class.min(self.num_classes - 1);
                let reconstruction = -log_probs[target];
                let kl = 0.5
                    * pass
                        .mean
                        .iter()
                        .zip(pass.logvar.iter())
                        .map(|(mu, lv)| mu * mu + lv.exp() - 1.0 - lv)
                        .sum::<f64>();
                losses.reconstruction += reconstruction * scale;
                losses.kl += kl * scale;
                losses.elbo += (reconstruction + self.kl_weight * kl) * scale;

                let grad_logits = (log_probs.map(f64::exp) - one_hot(target, self.num_classes)) * scale;
                let grad_m = self
                    .net
                    .decoder
                    .backward(&m, &grad_logits, &mut grads.decoder);
                let grad_mean = &grad_m + &pass.mean * (self.kl_weight * scale);
                let mut grad_logvar = DVector::zeros(latent);
                for i in 0..latent {
                    if pass.clamped[i] {
                        continue;
                    }
                    let var = pass.logvar[i].exp();
                    grad_logvar[i] = grad_m[i] * eps[i] * 0.5 * std[i]
                        + self.kl_weight * scale * 0.5 * (var - 1.0);
                }
                let grad_u = self
                    .net
                    .mean_head
                    .backward(&pass.u, &grad_mean, &mut grads.mean_head)
                    + self
                        .net
                        .logvar_head
                        .backward(&pass.u, &grad_logvar, &mut grads.logvar_head);

                grad_hidden[j] += grad_u.rows(0, h_dim);
                if hidden.len() > 1 {
                    let share = grad_u.rows(h_dim, h_dim) / (hidden.len() - 1) as f64;
                    for (k, g) in grad_hidden.iter_mut().enumerate() {
                        if k != j {
                            *g += &share;
                        }
                    }
                }
            }
            for ((e, h), g) in inputs.iter().zip(&hidden).zip(&grad_hidden) {
                let grad_pre = g.zip_map(h, |gi, hi| gi * (1.0 - hi * hi));
                self.net.encoder.backward(e, &grad_pre, &mut grads.encoder);
            }
        }
        (losses, grads)
    }

    /// One variational update. Parameters change only if the loss, gradient
    /// and new parameters are all finite.
    pub fn update<R: Rng + ?Sized>(
        &mut self,
        batch: &[InferenceSample<'_>],
        rng: &mut R,
        agent: AgentId,
    ) -> Result<InferenceLosses> {
        let (losses, grads) = self.loss_and_grad(batch, &mut |n| {
            DVector::from_fn(n, |_, _| rng.sample(StandardNormal))
        });
        check_finite_scalar(losses.elbo, agent, Module::Inference, "negative ELBO")?;
        let grad = grads.flat();
        check_finite(&grad, agent, Module::Inference, "gradient")?;
        let params = self.net.flat();
        let step = self.optimizer.step(&params, &grad);
        check_finite(&step.params, agent, Module::Inference, "parameters")?;
        let next = self.optimizer.commit(step);
        self.net.load_flat(&next);
        Ok(losses)
    }
}
