//! Policy trait shared by learned and baseline policies.

use nalgebra::DVector;
use rand::RngCore;

use super::{ActionMode, Decision};
use crate::types::ActionSpace;

/// A policy that maps one agent's policy input to an action.
pub trait Policy: Send + Sync {
    /// Chooses an action for the given policy input.
    ///
    /// # Arguments
    ///
    /// * `input` - Belief probabilities, optionally followed by the opponent summary
    /// * `mode` - Sample ([`ActionMode::Explore`]) or take the mode ([`ActionMode::Exploit`])
    /// * `rng` - Randomness for sampled actions
    fn decide(&self, input: &DVector<f64>, mode: ActionMode, rng: &mut dyn RngCore) -> Decision;

    /// The action space this policy acts in.
    fn action_space(&self) -> ActionSpace;

    /// Returns a human-readable name for this policy.
    fn name(&self) -> &str;
}
