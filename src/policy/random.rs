//! Random policy for testing and baselines.

use nalgebra::DVector;
use rand::{Rng, RngCore};

use super::trait_::Policy;
use super::{ActionMode, Decision};
use crate::types::{Action, ActionSpace};

/// Uniformly random action selection.
///
/// Discrete spaces draw an index from `[0, n)`; allocation spaces draw a
/// share uniformly from `[0, 1]`. Ignores its input and the action mode.
/// Used for sanity checks and as a lower-bound baseline.
#[derive(Debug, Clone, Copy)]
pub struct RandomPolicy {
    space: ActionSpace,
}

impl RandomPolicy {
    pub fn new(space: ActionSpace) -> Self {
        Self { space }
    }
}

impl Policy for RandomPolicy {
    fn decide(&self, _input: &DVector<f64>, _mode: ActionMode, rng: &mut dyn RngCore) -> Decision {
        match self.space {
            ActionSpace::Discrete { n } => {
                let probs = DVector::from_element(n, 1.0 / n.max(1) as f64);
                Decision {
                    action: Action::Discrete(rng.gen_range(0..n.max(1))),
                    allocation: (n == 2).then_some(0.5),
                    probs: Some(probs),
                }
            }
            ActionSpace::Allocation { .. } => {
                let share = rng.gen_range(0.0..=1.0);
                Decision {
                    action: Action::Allocation(share),
                    probs: None,
                    allocation: Some(share),
                }
            }
        }
    }

    fn action_space(&self) -> ActionSpace {
        self.space
    }

    fn name(&self) -> &str {
        "random"
    }
}
