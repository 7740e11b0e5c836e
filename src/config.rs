use std::fs::File;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::env::{EnvSpec, RenderMode};
use crate::error::{Error, Result};
use crate::policy_gradient::PolicyConfig;

// =============================================================================
// Experiment Constants
// =============================================================================

/// Everything one experiment run needs. `Default` holds the values the runner
/// uses when started without a config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// ROM image of the game.
    pub game: PathBuf,
    /// Scenario descriptor (variables, reward, done conditions).
    pub scenario: PathBuf,
    /// Optional save-state every episode starts from.
    pub state: Option<PathBuf>,

    /// Training budget across all rounds.
    pub total_steps: u64,
    /// Number of train/run rounds; each trains `total_steps / check_count`.
    pub check_count: u64,
    /// Interval, in environment steps, of the in-training checkpoints.
    pub check_freq: u64,
    pub checkpoint_path: PathBuf,
    /// Fixed checkpoint name overwritten after every round.
    pub checkpoint_name: String,
    pub log_path: PathBuf,
    pub record_path: PathBuf,
    /// Evaluate with display and recording when `round % visualisation_freq == 0`.
    pub visualisation_freq: u64,
    /// Keep a round-stamped snapshot when `round % saving_frequency == 0`.
    pub saving_frequency: u64,
    /// Evaluation stops once the game clock is at or below this value.
    pub stop_clock_threshold: i64,
    /// Info key holding the game clock.
    pub stop_clock_variable: String,

    pub frame_skip: u32,
    pub frame_stack: usize,
    pub print_rewards: bool,
    pub deterministic_eval: bool,

    pub policy: PolicyConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            game: PathBuf::from("roms/SuperMarioBros.nes"),
            scenario: PathBuf::from("scenarios/super_mario_bros.json"),
            state: None,
            total_steps: 1_000_000,
            check_count: 10,
            check_freq: 10_000,
            checkpoint_path: PathBuf::from("train"),
            checkpoint_name: "mario_pg".to_string(),
            log_path: PathBuf::from("logs"),
            record_path: PathBuf::from("recordings"),
            visualisation_freq: 1,
            saving_frequency: 5,
            stop_clock_threshold: 250,
            stop_clock_variable: "time".to_string(),
            frame_skip: 4,
            frame_stack: 4,
            print_rewards: false,
            deterministic_eval: false,
            policy: PolicyConfig::default(),
        }
    }
}

impl ExperimentConfig {
    /// Reads a JSON config; missing fields keep their defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            Error::invalid_config(format!("cannot read {}: {e}", path.display()))
        })?;
        let reader = std::io::BufReader::new(file);
        let config: ExperimentConfig = serde_json::from_reader(reader).map_err(|e| {
            Error::invalid_config(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("check_count", self.check_count),
            ("check_freq", self.check_freq),
            ("visualisation_freq", self.visualisation_freq),
            ("saving_frequency", self.saving_frequency),
            ("frame_skip", self.frame_skip as u64),
            ("frame_stack", self.frame_stack as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::invalid_config(format!("{name} must be >= 1")));
            }
        }
        if self.total_steps < self.check_count {
            return Err(Error::invalid_config(format!(
                "total_steps ({}) must be >= check_count ({})",
                self.total_steps, self.check_count
            )));
        }
        if self.checkpoint_name.is_empty() {
            return Err(Error::invalid_config("checkpoint_name must not be empty"));
        }
        self.policy.validate()
    }

    /// Timesteps trained per round.
    pub fn steps_per_round(&self) -> u64 {
        self.total_steps / self.check_count
    }

    pub fn env_spec(&self, render_mode: RenderMode, recording: bool) -> EnvSpec {
        EnvSpec {
            game: self.game.clone(),
            scenario: self.scenario.clone(),
            state: self.state.clone(),
            render_mode,
            record_dir: recording.then(|| self.record_path.clone()),
        }
    }
}
