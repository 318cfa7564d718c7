// Demonstration: train agents on a social-learning game and compare the
// evaluated policies with a uniformly random baseline.
//
// Build/run from this repo root:
//   cargo run --example social_learning_demo -- --game learning --agents 4 --episodes 2
//   cargo run --example social_learning_demo -- --game experimentation --continuous --log run.jsonl

use std::env;
use std::process;

use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::SeedableRng;

use polaris::config::EnvironmentConfig;
use polaris::environment::{Environment, SocialEnvironment, SocialLearningConfig};
use polaris::network::Topology;
use polaris::policy::{ActionMode, Policy, RandomPolicy};
use polaris::training::MetricsLog;
use polaris::{PolarisConfig, Trainer};

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}

fn run() -> polaris::Result<()> {
    let args: Vec<String> = env::args().collect();
    let mut config = match arg_value(&args, "--config") {
        Some(path) => PolarisConfig::from_json_file(path)?,
        None => PolarisConfig::default(),
    };
    if let Some(n) = arg_value(&args, "--agents").and_then(|s| s.parse().ok()) {
        config.num_agents = n;
    }
    if let Some(n) = arg_value(&args, "--episodes").and_then(|s| s.parse().ok()) {
        config.training.num_episodes = n;
    }
    if let Some(seed) = arg_value(&args, "--seed").and_then(|s| s.parse().ok()) {
        config.seed = seed;
    }
    match arg_value(&args, "--game") {
        None => {}
        Some("learning") => {
            config.environment = EnvironmentConfig::SocialLearning(SocialLearningConfig {
                num_states: 3,
                signal_accuracy: 0.75,
                ..SocialLearningConfig::default()
            })
        }
        Some("experimentation") => {
            config.environment = EnvironmentConfig::StrategicExperimentation(Default::default());
            config.continuous_actions = args.iter().any(|a| a == "--continuous");
        }
        Some(other) => {
            eprintln!(
                "Unknown --game '{}'; expected 'learning' or 'experimentation'.",
                other
            );
            process::exit(2);
        }
    }
    if args.iter().any(|a| a == "--ring") {
        config.network.topology = Topology::Ring;
    }
    config.validate()?;

    let baseline = random_baseline(&config)?;
    let mut trainer = Trainer::new(config.clone())?;
    println!("Run {} with {} agents", trainer.run_id(), config.num_agents);

    let report = match arg_value(&args, "--log") {
        Some(path) => {
            let mut log = MetricsLog::create(path, &trainer.log_header())?;
            let report = trainer.train_with(|m| log.append(m))?;
            log.flush()?;
            println!("Wrote {} records to {}", log.written(), path);
            report
        }
        None => trainer.train()?,
    };
    println!(
        "Trained {} episodes ({} steps, {} update cycles, {} skipped module steps)",
        report.episodes, report.steps, report.updates, report.skipped_updates
    );
    println!("{}", report.summary);

    let eval_episodes = arg_value(&args, "--eval-episodes")
        .and_then(|s| s.parse().ok())
        .unwrap_or(2);
    let summary = trainer.evaluate(eval_episodes)?;
    println!("Policy: {}", trainer.agents()[0].policy().name());
    println!("{}", summary);
    println!("Random baseline: mean reward per step {:.3}", baseline);
    Ok(())
}

/// Mean per-agent reward of uniformly random actions over one episode.
fn random_baseline(config: &PolarisConfig) -> polaris::Result<f64> {
    let mut env = SocialEnvironment::from_config(config)?;
    env.reseed(config.seed);
    env.reset();
    let policy = RandomPolicy::new(env.action_space());
    let mut rng = StdRng::seed_from_u64(config.seed);
    let input = DVector::zeros(0);
    let (mut total, mut steps) = (0.0, 0u32);
    loop {
        let actions: Vec<_> = (0..env.num_agents())
            .map(|_| policy.decide(&input, ActionMode::Explore, &mut rng).action)
            .collect();
        let result = env.step(&actions)?;
        total += result.rewards.iter().sum::<f64>() / env.num_agents() as f64;
        steps += 1;
        if result.done {
            break;
        }
    }
    Ok(total / f64::from(steps))
}

fn arg_value<'a>(args: &'a [String], key: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == key)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}
