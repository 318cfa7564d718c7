//! Per-step rewards for the two games.

use super::Outcome;

/// Computes rewards from realized outcomes.
pub struct RewardComputer;

impl RewardComputer {
    /// Reward for guessing state `action` when the step's realized signal is
    /// `signal`.
    ///
    /// ```text
    /// r = (1[signal = action] - p_off) / (q - p_off),   p_off = (1 - q) / (S - 1)
    /// ```
    ///
    /// Its expectation is exactly `1[action = θ]`, so the reward carries no
    /// more information about `θ` than one extra private signal.
    pub fn signal_reward(action: usize, signal: usize, num_states: usize, accuracy: f64) -> f64 {
        let off = (1.0 - accuracy) / (num_states.max(2) - 1) as f64;
        let hit = if action == signal { 1.0 } else { 0.0 };
        (hit - off) / (accuracy - off)
    }

    /// Flow reward of an allocation: safe share times the safe payoff plus
    /// the realized risky increment (Brownian part plus jumps).
    pub fn allocation_reward(outcome: &Outcome, jump_size: f64, safe_payoff: f64, dt: f64) -> f64 {
        (1.0 - outcome.allocation) * safe_payoff * dt
            + outcome.diffusion
            + outcome.jumps as f64 * jump_size
    }

    /// `1 - |allocation - optimum|`.
    pub fn allocation_accuracy(allocation: f64, optimum: f64) -> f64 {
        1.0 - (allocation - optimum).abs()
    }
}
