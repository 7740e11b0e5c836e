use tracing::info;

use crate::env::{Action, ActionSpace, Environment, Observation, ObservationSpace, Step};
use crate::error::{Error, Result};

// =============================================================================
// Frame Skip
// =============================================================================

/// Repeats each action `skip` times and sums the rewards.
///
/// The underlying environment sees `skip` steps per call. Repetition stops
/// early when a sub-step terminates or truncates, so a finished episode is
/// never stepped again.
pub struct FrameSkip<E> {
    env: E,
    skip: u32,
}

impl<E: Environment> FrameSkip<E> {
    pub fn new(env: E, skip: u32) -> Result<Self> {
        if skip < 1 {
            return Err(Error::invalid_config(format!(
                "frame skip must be >= 1, got {skip}"
            )));
        }
        Ok(Self { env, skip })
    }

    pub fn inner(&self) -> &E {
        &self.env
    }
}

impl<E: Environment> Environment for FrameSkip<E> {
    fn observation_space(&self) -> ObservationSpace {
        self.env.observation_space()
    }

    fn action_space(&self) -> ActionSpace {
        self.env.action_space()
    }

    fn reset(&mut self) -> Result<Observation> {
        self.env.reset()
    }

    fn step(&mut self, action: Action) -> Result<Step> {
        let mut total_reward = 0.0f32;
        let mut last = self.env.step(action)?;
        total_reward += last.reward;
        for _ in 1..self.skip {
            if last.done() {
                break;
            }
            last = self.env.step(action)?;
            total_reward += last.reward;
        }
        last.reward = total_reward;
        Ok(last)
    }

    fn render(&mut self) -> Result<()> {
        self.env.render()
    }

    fn close(&mut self) -> Result<()> {
        self.env.close()
    }
}

// =============================================================================
// Reward Printer
// =============================================================================

/// Logs reward and episode flags of every step without altering it.
pub struct RewardPrinter<E> {
    env: E,
}

impl<E: Environment> RewardPrinter<E> {
    pub fn new(env: E) -> Self {
        Self { env }
    }
}

impl<E: Environment> Environment for RewardPrinter<E> {
    fn observation_space(&self) -> ObservationSpace {
        self.env.observation_space()
    }

    fn action_space(&self) -> ActionSpace {
        self.env.action_space()
    }

    fn reset(&mut self) -> Result<Observation> {
        self.env.reset()
    }

    fn step(&mut self, action: Action) -> Result<Step> {
        let step = self.env.step(action)?;
        info!(
            reward = format_args!("{:.2}", step.reward),
            terminated = step.terminated,
            truncated = step.truncated,
            "step"
        );
        Ok(step)
    }

    fn render(&mut self) -> Result<()> {
        self.env.render()
    }

    fn close(&mut self) -> Result<()> {
        self.env.close()
    }
}

// =============================================================================
// Grayscale
// =============================================================================

/// Converts RGB observations to single-channel luminance, keeping the
/// channel axis.
pub struct Grayscale<E> {
    env: E,
}

impl<E: Environment> Grayscale<E> {
    pub fn new(env: E) -> Result<Self> {
        let space = env.observation_space();
        if space.channels != 3 {
            return Err(Error::invalid_config(format!(
                "grayscale needs RGB observations, got {space}"
            )));
        }
        Ok(Self { env })
    }
}

fn to_gray(obs: Observation) -> Observation {
    let data = obs
        .data
        .chunks_exact(3)
        .map(|px| {
            let y = 299 * px[0] as u32 + 587 * px[1] as u32 + 114 * px[2] as u32;
            ((y + 500) / 1000) as u8
        })
        .collect();
    Observation {
        height: obs.height,
        width: obs.width,
        channels: 1,
        data,
    }
}

impl<E: Environment> Environment for Grayscale<E> {
    fn observation_space(&self) -> ObservationSpace {
        ObservationSpace {
            channels: 1,
            ..self.env.observation_space()
        }
    }

    fn action_space(&self) -> ActionSpace {
        self.env.action_space()
    }

    fn reset(&mut self) -> Result<Observation> {
        self.env.reset().map(to_gray)
    }

    fn step(&mut self, action: Action) -> Result<Step> {
        let Step {
            observation,
            reward,
            terminated,
            truncated,
            info,
        } = self.env.step(action)?;
        Ok(Step {
            observation: to_gray(observation),
            reward,
            terminated,
            truncated,
            info,
        })
    }

    fn render(&mut self) -> Result<()> {
        self.env.render()
    }

    fn close(&mut self) -> Result<()> {
        self.env.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEnv, Script};

    #[test]
    fn test_frame_skip_repeats_action_and_sums_rewards() {
        let env = FakeEnv::new(Script {
            rewards: vec![1.0, 2.0, 3.0, 4.0, 5.0],
            ..Script::default()
        });
        let mut env = FrameSkip::new(env, 4).unwrap();
        env.reset().unwrap();
        let action = Action::from_bits(0b1000_0001);
        let step = env.step(action).unwrap();

        assert_eq!(step.reward, 10.0);
        assert_eq!(env.inner().actions(), vec![action; 4]);
        // Last sub-step's observation and info.
        assert_eq!(step.info["step"], 4);
        assert_eq!(step.observation.data[0], 4);
        assert!(!step.terminated && !step.truncated);
    }

    #[test]
    fn test_frame_skip_zero_is_invalid() {
        let err = FrameSkip::new(FakeEnv::new(Script::default()), 0)
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn test_frame_skip_stops_at_termination() {
        let env = FakeEnv::new(Script {
            rewards: vec![1.0; 8],
            episode_len: Some(2),
            ..Script::default()
        });
        let mut env = FrameSkip::new(env, 4).unwrap();
        env.reset().unwrap();
        let step = env.step(Action::NOOP).unwrap();
        assert!(step.terminated);
        assert_eq!(step.reward, 2.0);
        assert_eq!(env.inner().actions().len(), 2);
    }

    #[test]
    fn test_reward_printer_passes_step_through() {
        let mut plain = FakeEnv::new(Script {
            rewards: vec![0.5, -1.0],
            ..Script::default()
        });
        let mut printed = RewardPrinter::new(FakeEnv::new(Script {
            rewards: vec![0.5, -1.0],
            ..Script::default()
        }));
        plain.reset().unwrap();
        printed.reset().unwrap();
        for _ in 0..2 {
            let a = plain.step(Action::NOOP).unwrap();
            let b = printed.step(Action::NOOP).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_grayscale_luminance() {
        let obs = Observation {
            height: 1,
            width: 3,
            channels: 3,
            data: vec![255, 255, 255, 255, 0, 0, 0, 0, 0],
        };
        let gray = to_gray(obs);
        assert_eq!(gray.channels, 1);
        assert_eq!(gray.data, vec![255, 76, 0]);
    }

    #[test]
    fn test_grayscale_rejects_non_rgb() {
        let env = Grayscale::new(FakeEnv::new(Script::default())).unwrap();
        assert_eq!(env.observation_space().channels, 1);
        let err = Grayscale::new(env).err().unwrap();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }
}
