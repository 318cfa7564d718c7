//! Core types shared by environments, agents and the trainer.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Agent identifier: the agent's index in the environment and network.
pub type AgentId = usize;

/// An action taken by a single agent.
///
/// Discrete actions index a finite action set (a guess of the state in the
/// social-learning game, or safe/risky in the experimentation game).
/// Allocations are the share of a unit resource placed on the risky option.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Action {
    Discrete(usize),
    Allocation(f64),
}

impl Action {
    /// Returns the discrete index, if this is a discrete action.
    pub fn as_discrete(&self) -> Option<usize> {
        match self {
            Action::Discrete(a) => Some(*a),
            Action::Allocation(_) => None,
        }
    }

    /// Returns the allocation, if this is a continuous action.
    pub fn as_allocation(&self) -> Option<f64> {
        match self {
            Action::Allocation(a) => Some(*a),
            Action::Discrete(_) => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Discrete(a) => write!(f, "discrete({})", a),
            Action::Allocation(a) => write!(f, "allocation({:.3})", a),
        }
    }
}

/// Shape of the action set an environment accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ActionSpace {
    /// `n` mutually exclusive actions.
    Discrete { n: usize },
    /// A single allocation in `[0, 1]`.
    ///
    /// `bins` is the number of classes allocations are bucketed into when
    /// neighbours' allocations are modelled categorically.
    Allocation { bins: usize },
}

impl ActionSpace {
    /// Returns true for allocation (continuous) spaces.
    pub fn is_continuous(&self) -> bool {
        matches!(self, ActionSpace::Allocation { .. })
    }

    /// Number of categorical classes an action maps to.
    pub fn num_classes(&self) -> usize {
        match self {
            ActionSpace::Discrete { n } => *n,
            ActionSpace::Allocation { bins } => *bins,
        }
    }

    /// Maps an action to its categorical class.
    ///
    /// Allocations are bucketed into `bins` equal-width classes over `[0, 1]`.
    /// Discrete indices are clamped to the valid range; environments reject
    /// out-of-range actions before they ever reach an observation.
    pub fn class_of(&self, action: &Action) -> usize {
        let n = self.num_classes().max(1);
        match action {
            Action::Discrete(a) => (*a).min(n - 1),
            Action::Allocation(x) => {
                let x = if x.is_finite() { x.clamp(0.0, 1.0) } else { 0.0 };
                ((x * n as f64) as usize).min(n - 1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_classes_cover_unit_interval() {
        let space = ActionSpace::Allocation { bins: 5 };
        assert_eq!(space.class_of(&Action::Allocation(0.0)), 0);
        assert_eq!(space.class_of(&Action::Allocation(0.21)), 1);
        assert_eq!(space.class_of(&Action::Allocation(1.0)), 4);
    }

    #[test]
    fn discrete_class_is_index() {
        let space = ActionSpace::Discrete { n: 3 };
        assert_eq!(space.class_of(&Action::Discrete(2)), 2);
        assert_eq!(space.num_classes(), 3);
        assert!(!space.is_continuous());
    }

    #[test]
    fn action_accessors() {
        assert_eq!(Action::Discrete(1).as_discrete(), Some(1));
        assert_eq!(Action::Discrete(1).as_allocation(), None);
        assert_eq!(Action::Allocation(0.5).as_allocation(), Some(0.5));
    }
}
