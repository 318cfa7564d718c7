//! End-to-end scenarios for the training loop.

use nalgebra::DVector;

use super::*;
use crate::config::{EnvironmentConfig, PolarisConfig};
use crate::environment::{
    Environment, ExperimentationConfig, SocialEnvironment, SocialLearningConfig,
};
use crate::error::PolarisError;
use crate::types::Action;

fn social_learning(num_agents: usize, num_states: usize, accuracy: f64, horizon: u32) -> PolarisConfig {
    let mut config = PolarisConfig {
        num_agents,
        environment: EnvironmentConfig::SocialLearning(SocialLearningConfig {
            num_states,
            signal_accuracy: accuracy,
            ..SocialLearningConfig::default()
        }),
        seed: 7,
        ..PolarisConfig::default()
    };
    config.training.horizon = horizon;
    config.training.num_episodes = 1;
    config.training.workers = 2;
    config.training.log_interval = 1000;
    config.agent.hidden_dim = 16;
    config
}

#[test]
fn two_agents_learn_the_state() {
    let config = social_learning(2, 3, 0.8, 500);
    let mut trainer = Trainer::new(config).unwrap();
    let metrics = trainer
        .rollout(RunMode::Train, 1)
        .collect::<crate::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(metrics.len(), 500);
    let late: Vec<&StepMetrics> = metrics.iter().filter(|m| m.step > 400).collect();
    for agent in 0..2 {
        let accuracy =
            late.iter().map(|m| m.belief_accuracy[agent]).sum::<f64>() / late.len() as f64;
        assert!(accuracy > 0.6, "agent {} belief accuracy {}", agent, accuracy);
    }
    assert_eq!(trainer.phase(), Phase::Terminated);
    assert_eq!(trainer.episode(), 1);
}

#[test]
fn malformed_joint_actions_are_rejected() {
    let config = social_learning(2, 3, 0.8, 10);
    let mut env = SocialEnvironment::from_config(&config).unwrap();
    env.reset();
    let err = env.step(&[Action::Discrete(0)]).unwrap_err();
    assert!(matches!(err, PolarisError::Environment { agent: None, .. }));
    let err = env
        .step(&[Action::Discrete(0), Action::Allocation(0.5)])
        .unwrap_err();
    assert!(matches!(err, PolarisError::Environment { agent: Some(1), .. }));
    let err = env
        .step(&[Action::Discrete(3), Action::Discrete(0)])
        .unwrap_err();
    assert!(matches!(err, PolarisError::Environment { agent: Some(0), .. }));
}

#[test]
fn updates_follow_the_schedule() {
    let mut config = social_learning(2, 2, 0.75, 50);
    config.training.batch_size = 32;
    config.training.update_interval = 10;
    let mut trainer = Trainer::new(config).unwrap();
    let report = trainer.train().unwrap();
    // buffers exceed a batch from step 40 on: updates at steps 40 and 50
    assert_eq!(report.updates, 2);
    assert_eq!(report.steps, 50);
    assert_eq!(report.episodes, 1);
    assert!(!report.cancelled);
    for agent in trainer.agents() {
        assert_eq!(agent.buffer().len(), 50);
    }
}

#[test]
fn same_seed_same_run() {
    let mut config = social_learning(3, 3, 0.7, 30);
    config.training.batch_size = 8;
    config.training.update_interval = 5;
    let run = |config: PolarisConfig| {
        let mut trainer = Trainer::new(config).unwrap();
        trainer
            .rollout(RunMode::Train, 1)
            .collect::<crate::Result<Vec<_>>>()
            .unwrap()
    };
    assert_eq!(run(config.clone()), run(config));
}

#[test]
fn evaluation_leaves_agents_untouched() {
    let mut config = social_learning(2, 2, 0.75, 40);
    config.training.batch_size = 8;
    config.training.update_interval = 5;
    let mut trainer = Trainer::new(config).unwrap();
    trainer.train().unwrap();
    let before: Vec<_> = trainer.agents().iter().map(|a| a.parameters()).collect();
    let buffered: Vec<_> = trainer.agents().iter().map(|a| a.buffer().len()).collect();
    let updates = trainer.updates();

    let summary = trainer.evaluate(2).unwrap();
    assert_eq!(summary.episodes, 2);
    assert_eq!(summary.steps, 80);
    let after: Vec<_> = trainer.agents().iter().map(|a| a.parameters()).collect();
    assert_eq!(before, after);
    let buffered_after: Vec<_> = trainer.agents().iter().map(|a| a.buffer().len()).collect();
    assert_eq!(buffered, buffered_after);
    assert_eq!(trainer.updates(), updates);
    assert_eq!(trainer.phase(), Phase::Terminated);

    let quick = trainer.quick_evaluate(10).unwrap();
    assert_eq!(quick.steps, 10);
    assert_eq!(quick.action_accuracy.len(), 2);
    assert!(quick.average_reward.is_finite());
    assert_eq!(trainer.phase(), Phase::Terminated);
    assert_eq!(trainer.updates(), updates);
}

#[test]
fn cancelled_run_stops_at_episode_boundary() {
    let mut config = social_learning(2, 2, 0.75, 20);
    config.training.num_episodes = 5;
    let mut trainer = Trainer::new(config).unwrap();
    trainer.cancellation_token().cancel();
    let report = trainer.train().unwrap();
    assert!(report.cancelled);
    assert_eq!(report.episodes, 0);
    assert_eq!(report.steps, 0);
    assert_eq!(trainer.phase(), Phase::Terminated);
}

#[test]
fn cancellation_stops_at_next_update_boundary() {
    let mut config = social_learning(2, 2, 0.75, 40);
    config.training.num_episodes = 3;
    config.training.batch_size = 8;
    config.training.update_interval = 5;
    let mut trainer = Trainer::new(config).unwrap();
    let token = trainer.cancellation_token();
    let mut seen = Vec::new();
    let report = trainer
        .train_with(|m| {
            if m.step == 12 {
                token.cancel();
            }
            seen.push(m.step);
            Ok(())
        })
        .unwrap();
    // step 15 is collected, then the update due there is not run
    assert_eq!(seen, (1..=15).collect::<Vec<_>>());
    assert!(report.cancelled);
    assert_eq!(report.episodes, 0);
    assert_eq!(report.steps, 15);
    assert_eq!(report.updates, 1);
    assert_eq!(trainer.updates(), 1);
    assert_eq!(trainer.episode(), 0);
    assert_eq!(trainer.phase(), Phase::Terminated);
    for agent in trainer.agents() {
        assert_eq!(agent.buffer().len(), 15);
    }
}

#[test]
fn evaluation_between_episodes_does_not_shift_training() {
    let mut config = social_learning(2, 3, 0.8, 25);
    config.training.batch_size = 8;
    config.training.update_interval = 5;
    let collect = |trainer: &mut Trainer| {
        trainer
            .rollout(RunMode::Train, 1)
            .collect::<crate::Result<Vec<_>>>()
            .unwrap()
    };

    let mut interleaved = Trainer::new(config.clone()).unwrap();
    collect(&mut interleaved);
    interleaved.evaluate(2).unwrap();
    interleaved.quick_evaluate(7).unwrap();
    let after_eval = collect(&mut interleaved);

    let mut plain = Trainer::new(config).unwrap();
    collect(&mut plain);
    let straight = collect(&mut plain);

    assert_eq!(after_eval.len(), straight.len());
    for (a, b) in after_eval.iter().zip(&straight) {
        assert_eq!(a, b, "records diverge at step {}", a.step);
    }
    for (a, b) in interleaved.agents().iter().zip(plain.agents()) {
        assert_eq!(a.parameters(), b.parameters());
    }
}

#[test]
fn continuous_experimentation_runs() {
    let mut config = PolarisConfig {
        num_agents: 3,
        environment: EnvironmentConfig::StrategicExperimentation(ExperimentationConfig::default()),
        continuous_actions: true,
        ..PolarisConfig::default()
    };
    config.training.horizon = 40;
    config.training.batch_size = 8;
    config.training.update_interval = 4;
    config.training.workers = 2;
    config.agent.hidden_dim = 8;
    let mut trainer = Trainer::new(config).unwrap();
    let metrics = trainer
        .rollout(RunMode::Train, 1)
        .collect::<crate::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(metrics.len(), 40);
    for m in &metrics {
        assert!(m.rewards.iter().all(|r| r.is_finite()));
        for allocation in &m.allocations {
            let a = allocation.unwrap();
            assert!((0.0..=1.0).contains(&a));
        }
        assert!(m.action_accuracy.iter().all(|a| (0.0..=1.0).contains(a)));
    }
    assert!(trainer.updates() > 0);
    let skipped: u64 = trainer.agents().iter().map(|a| a.skipped_updates()).sum();
    assert_eq!(skipped, 0);
}

#[test]
fn synaptic_intelligence_runs_across_episodes() {
    let mut config = social_learning(2, 3, 0.8, 20);
    config.training.num_episodes = 4;
    config.training.batch_size = 8;
    config.training.update_interval = 5;
    config.agent.use_si = true;
    let mut trainer = Trainer::new(config).unwrap();
    let report = trainer.train().unwrap();
    assert_eq!(report.episodes, 4);
    assert_eq!(report.summary.episodes, 4);
    assert_eq!(report.skipped_updates, 0);
}

#[cfg(feature = "serde")]
#[test]
fn checkpoint_round_trip_preserves_policies() {
    let mut config = social_learning(2, 3, 0.8, 60);
    config.training.batch_size = 16;
    config.training.update_interval = 5;
    let mut trainer = Trainer::new(config).unwrap();
    trainer.train().unwrap();

    let path = std::env::temp_dir().join(format!("polaris-checkpoint-{}.json", crate::generate_run_id()));
    trainer.checkpoint().save(&path).unwrap();
    let mut restored = Trainer::from_checkpoint(Checkpoint::load(&path).unwrap()).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(restored.run_id(), trainer.run_id());
    assert_eq!(restored.episode(), 1);
    for (a, b) in trainer.agents().iter().zip(restored.agents()) {
        assert_eq!(a.parameters(), b.parameters());
        let x = a.policy_input();
        let shifted = x.map(|v| 0.5 * v + 0.1);
        let uniform = DVector::from_element(x.len(), 1.0 / x.len() as f64);
        for x in [&x, &shifted, &uniform] {
            let diff = a.policy().distribution(x).max_abs_diff(&b.policy().distribution(x));
            assert!(diff < 1e-12, "distribution drift {}", diff);
        }
    }
    assert_eq!(trainer.evaluate(1).unwrap(), restored.evaluate(1).unwrap());
}

#[cfg(feature = "serde")]
#[test]
fn resumed_run_matches_uninterrupted_run() {
    let mut config = social_learning(2, 3, 0.8, 20);
    config.training.batch_size = 8;
    config.training.update_interval = 5;
    config.agent.use_si = true;

    let mut full_config = config.clone();
    full_config.training.num_episodes = 3;
    let mut full = Trainer::new(full_config).unwrap();
    let mut uninterrupted = Vec::new();
    full.train_with(|m| {
        uninterrupted.push(m.clone());
        Ok(())
    })
    .unwrap();

    let mut first = Trainer::new(config).unwrap();
    first.train().unwrap();
    let path = std::env::temp_dir().join(format!("polaris-resume-{}.json", crate::generate_run_id()));
    first.checkpoint().save(&path).unwrap();
    let checkpoint = Checkpoint::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(checkpoint.updates, first.updates());
    assert_eq!(checkpoint.buffers[0].len(), 20);

    let mut resumed = Trainer::from_checkpoint(checkpoint).unwrap();
    assert_eq!(resumed.updates(), first.updates());
    let mut continued = Vec::new();
    for _ in 0..2 {
        resumed
            .train_with(|m| {
                continued.push(m.clone());
                Ok(())
            })
            .unwrap();
    }

    assert_eq!(continued.len(), 40);
    assert_eq!(&uninterrupted[20..], &continued[..]);
    assert_eq!(resumed.episode(), full.episode());
    assert_eq!(resumed.total_steps(), full.total_steps());
    assert_eq!(resumed.updates(), full.updates());
    for (a, b) in resumed.agents().iter().zip(full.agents()) {
        assert_eq!(a.parameters(), b.parameters());
        assert_eq!(a.buffer(), b.buffer());
    }
}

#[cfg(feature = "serde")]
#[test]
fn metrics_log_reproduces_training_summary() {
    let config = social_learning(2, 2, 0.75, 30);
    let mut trainer = Trainer::new(config).unwrap();
    let path = std::env::temp_dir().join(format!("polaris-run-{}.jsonl", crate::generate_run_id()));
    let mut log = MetricsLog::create(&path, &trainer.log_header()).unwrap();
    let report = trainer.train_with(|m| log.append(m)).unwrap();
    log.flush().unwrap();

    let (read_header, replay) = MetricsLog::open(&path).unwrap();
    let replayed: Vec<StepMetrics> = replay.collect::<crate::Result<_>>().unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(read_header.run_id, report.run_id);
    assert_eq!(replayed.len(), 30);
    assert!(read_header.bounds.is_some());
    assert_eq!(read_header.bounds, trainer.learning_bounds());
    assert_eq!(
        EvaluationSummary::from_metrics(&replayed).with_bounds(read_header.bounds),
        report.summary
    );
}
