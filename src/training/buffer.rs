//! Bounded replay buffer for per-agent experience.

use std::collections::VecDeque;

use nalgebra::DVector;
use rand::seq::index;
use rand::Rng;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::belief::BeliefState;
use crate::inference::NeighborhoodView;
use crate::types::{Action, AgentId};

/// A single transition stored by one agent.
///
/// Beliefs are stored as recurrence traces and neighborhoods as raw action
/// windows, so each update re-derives belief probabilities and opponent
/// summaries with the freshest parameters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Experience {
    /// Belief trace when the action was chosen.
    pub belief: BeliefState,
    /// Neighborhood when the action was chosen.
    pub view: NeighborhoodView,
    pub action: Action,
    pub reward: f64,
    /// Belief trace after absorbing the next observation.
    pub next_belief: BeliefState,
    pub next_view: NeighborhoodView,
    /// Per-state likelihood of the next private observation.
    pub next_likelihood: DVector<f64>,
    /// Action classes neighbors took at this step.
    pub next_actions: Vec<(AgentId, usize)>,
    /// Whether this was the last step of the episode.
    pub done: bool,
}

/// FIFO buffer with a fixed capacity.
///
/// Pushing into a full buffer evicts the oldest record first; a full buffer
/// is normal operation, not an error.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ReplayBuffer<T = Experience> {
    capacity: usize,
    records: VecDeque<T>,
    pushed: u64,
}

impl<T> ReplayBuffer<T> {
    /// Creates a new empty buffer holding at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: VecDeque::with_capacity(capacity.max(1)),
            pushed: 0,
        }
    }

    /// Appends a record and returns the one evicted to make room, if any.
    pub fn push(&mut self, record: T) -> Option<T> {
        let evicted = if self.records.len() == self.capacity {
            self.records.pop_front()
        } else {
            None
        };
        self.records.push_back(record);
        self.pushed += 1;
        evicted
    }

    /// Returns the number of stored records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records pushed over the buffer's lifetime, evicted ones included.
    pub fn total_pushed(&self) -> u64 {
        self.pushed
    }

    /// Iterates oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.records.iter()
    }

    /// Draws up to `n` distinct records uniformly at random.
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<&T> {
        let n = n.min(self.records.len());
        index::sample(rng, self.records.len(), n)
            .into_iter()
            .filter_map(|i| self.records.get(i))
            .collect()
    }

    /// Clears all stored records.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn buffer_add_and_clear() {
        let mut buf = ReplayBuffer::new(4);
        assert!(buf.is_empty());
        buf.push(1);
        assert_eq!(buf.len(), 1);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.total_pushed(), 1);
    }

    #[test]
    fn never_exceeds_capacity_and_evicts_oldest() {
        let mut buf = ReplayBuffer::new(3);
        let mut evicted = Vec::new();
        for i in 0..10 {
            if let Some(old) = buf.push(i) {
                evicted.push(old);
            }
            assert!(buf.len() <= 3);
        }
        assert_eq!(evicted, (0..7).collect::<Vec<_>>());
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![7, 8, 9]);
    }

    #[test]
    fn sample_is_distinct_and_bounded() {
        let mut buf = ReplayBuffer::new(10);
        for i in 0..10 {
            buf.push(i);
        }
        let mut rng = StdRng::seed_from_u64(0);
        let mut drawn: Vec<i32> = buf.sample(6, &mut rng).into_iter().copied().collect();
        drawn.sort_unstable();
        drawn.dedup();
        assert_eq!(drawn.len(), 6);
        assert_eq!(buf.sample(50, &mut rng).len(), 10);
    }
}
