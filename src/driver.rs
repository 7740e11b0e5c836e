use std::time::Instant;

use rand::Rng;
use tracing::info;

use crate::algorithm::AlgorithmProvider;
use crate::controller::EnvController;
use crate::env::{EnvProvider, Environment};
use crate::error::Result;
use crate::utils::format_time_from_seconds;

/// Alternates `train` and `run` for `rounds` rounds, then releases the
/// environment. The first failure ends the experiment.
pub fn run_experiment<P: EnvProvider, A: AlgorithmProvider>(
    controller: &mut EnvController<P, A>,
    rounds: u64,
) -> Result<()> {
    let started = Instant::now();
    for _ in 0..rounds {
        let stats = controller.train()?;
        info!(
            round = controller.round(),
            timesteps = controller.total_timesteps(),
            episodes = stats.episodes,
            mean_reward = ?stats.mean_episode_reward,
            elapsed = %format_time_from_seconds(started.elapsed().as_secs_f64()),
            "training phase finished"
        );
        if let Some(report) = controller.run()? {
            info!(
                round = controller.round(),
                steps = report.steps,
                reward = format_args!("{:.2}", report.reward),
                "visualisation finished"
            );
        }
    }
    info!(
        rounds,
        elapsed = %format_time_from_seconds(started.elapsed().as_secs_f64()),
        "experiment finished"
    );
    controller.close()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RandomPlayStats {
    pub steps: u64,
    pub episodes: u64,
}

/// Presses uniformly random buttons, resetting after every terminated
/// episode. Play stops at `max_steps` or on the first truncation (the NES
/// window was closed).
pub fn play_random<R: Rng + ?Sized>(
    env: &mut dyn Environment,
    max_steps: Option<u64>,
    rng: &mut R,
) -> Result<RandomPlayStats> {
    let space = env.action_space();
    let mut stats = RandomPlayStats::default();
    env.reset()?;
    while max_steps.is_none_or(|max| stats.steps < max) {
        let step = env.step(space.sample(rng))?;
        env.render()?;
        stats.steps += 1;
        if step.truncated {
            break;
        }
        if step.terminated {
            stats.episodes += 1;
            info!(episode = stats.episodes, steps = stats.steps, "episode finished");
            env.reset()?;
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExperimentConfig;
    use crate::env::RenderMode;
    use crate::testing::{FakeAlgorithmProvider, FakeEnv, FakeProvider, Script, ledger};
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    #[test]
    fn test_rounds_alternate_train_and_run() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger();
        let config = ExperimentConfig {
            total_steps: 400,
            check_count: 4,
            check_freq: 1000,
            checkpoint_path: dir.path().join("train"),
            log_path: dir.path().join("logs"),
            record_path: dir.path().join("recordings"),
            ..ExperimentConfig::default()
        };
        let rounds = config.check_count;
        let mut controller = EnvController::new(
            config,
            FakeProvider::new(ledger.clone()),
            FakeAlgorithmProvider::new(ledger.clone()),
        )
        .unwrap();
        run_experiment(&mut controller, rounds).unwrap();

        assert_eq!(controller.round(), 4);
        let l = ledger.borrow();
        let phases: Vec<&str> = l
            .events
            .iter()
            .filter_map(|e| match e.as_str() {
                "learn" => Some("train"),
                "make:human" => Some("run"),
                _ => None,
            })
            .collect();
        assert_eq!(phases, ["train", "run"].repeat(4));
        assert_eq!(l.live, 0);
        assert_eq!(l.made.last().map(|s| s.render_mode), Some(RenderMode::Headless));
    }

    #[test]
    fn test_visualisation_gated_by_round() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger();
        let config = ExperimentConfig {
            total_steps: 400,
            check_count: 4,
            check_freq: 1000,
            visualisation_freq: 2,
            checkpoint_path: dir.path().join("train"),
            log_path: dir.path().join("logs"),
            record_path: dir.path().join("recordings"),
            ..ExperimentConfig::default()
        };
        let mut controller = EnvController::new(
            config,
            FakeProvider::new(ledger.clone()),
            FakeAlgorithmProvider::new(ledger.clone()),
        )
        .unwrap();
        run_experiment(&mut controller, 4).unwrap();

        let l = ledger.borrow();
        let human = l
            .made
            .iter()
            .filter(|s| s.render_mode == RenderMode::Human)
            .count();
        // Rounds 2 and 4.
        assert_eq!(human, 2);
    }

    #[test]
    fn test_random_play_resets_after_termination() {
        let mut env = FakeEnv::new(Script {
            episode_len: Some(3),
            ..Script::default()
        });
        let mut rng = SmallRng::seed_from_u64(11);
        let stats = play_random(&mut env, Some(10), &mut rng).unwrap();
        assert_eq!(
            stats,
            RandomPlayStats {
                steps: 10,
                episodes: 3
            }
        );
        assert_eq!(env.actions().len(), 10);
    }
}
