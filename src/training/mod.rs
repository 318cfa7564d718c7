//! Training infrastructure: replay storage, the collect/update loop,
//! metrics and checkpoints.

pub mod buffer;
pub mod cancel;
#[cfg(feature = "serde")]
pub mod checkpoint;
pub mod metrics;
pub mod trainer;

#[cfg(test)]
mod tests;

pub use buffer::{Experience, ReplayBuffer};
pub use cancel::CancellationToken;
#[cfg(feature = "serde")]
pub use checkpoint::Checkpoint;
pub use metrics::{AgentSummary, EvaluationSummary, LearningBounds, StepMetrics};
#[cfg(feature = "serde")]
pub use metrics::{LogHeader, MetricsLog, MetricsReplay};
pub use trainer::{Phase, QuickEvaluation, Rollout, RunMode, Trainer, TrainingReport};
