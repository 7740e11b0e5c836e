pub mod algorithm;
pub mod callback;
pub mod config;
pub mod controller;
pub mod driver;
pub mod env;
pub mod error;
pub mod movie;
pub mod nes;
pub mod policy_gradient;
pub mod scenario;
pub mod utils;
pub mod vec_env;
pub mod wrappers;

#[cfg(test)]
mod testing;

pub use algorithm::{Algorithm, AlgorithmProvider, LearnStats, Persist, TrainingCallback};
pub use callback::{CheckpointCallback, checkpoint_file};
pub use config::ExperimentConfig;
pub use controller::{EnvController, EvalReport, ProgressRecord, StopReason, TrainMeta};
pub use driver::{RandomPlayStats, play_random, run_experiment};
pub use env::{
    Action, ActionSpace, Button, EnvProvider, EnvSpec, Environment, Info, Observation,
    ObservationSpace, RenderMode, Step,
};
pub use error::{Error, Result};
pub use movie::{Movie, MovieRecorder};
pub use nes::{NesEnv, NesProvider};
pub use policy_gradient::{PolicyConfig, PolicyGradient, PolicyGradientProvider};
pub use scenario::Scenario;
pub use utils::format_time_from_seconds;
pub use vec_env::{DummyVecEnv, VecEnv, VecFrameStack, VecStep};
pub use wrappers::{FrameSkip, Grayscale, RewardPrinter};
