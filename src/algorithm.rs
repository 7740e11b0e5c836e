use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::env::{Action, Observation};
use crate::error::Result;
use crate::vec_env::VecEnv;

/// Something that can write its trainable parameters to disk.
pub trait Persist {
    fn save(&self, path: &Path) -> Result<()>;
}

/// Hook invoked by [`Algorithm::learn`] after every batched environment step.
pub trait TrainingCallback {
    /// `steps` is the number of environment transitions since the previous
    /// call. An error aborts the learning call.
    fn on_step(&mut self, model: &dyn Persist, steps: u64) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LearnStats {
    pub timesteps: u64,
    pub episodes: u64,
    /// Mean reward of the episodes that finished during the call.
    pub mean_episode_reward: Option<f64>,
}

pub trait Algorithm: Persist {
    /// Trains for `total_timesteps` environment transitions against `env`.
    fn learn(
        &mut self,
        env: &mut dyn VecEnv,
        total_timesteps: u64,
        callback: &mut dyn TrainingCallback,
    ) -> Result<LearnStats>;

    /// One action per observation.
    fn predict(&mut self, observations: &[Observation], deterministic: bool)
    -> Result<Vec<Action>>;
}

/// Creates models bound to an environment's observation and action spaces.
pub trait AlgorithmProvider {
    type Model: Algorithm;

    fn create(&self, env: &dyn VecEnv) -> Result<Self::Model>;

    /// Loads a checkpoint written by [`Persist::save`]. Fails when the file is
    /// missing or does not fit `env`.
    fn load(&self, path: &Path, env: &dyn VecEnv) -> Result<Self::Model>;
}
