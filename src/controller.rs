use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::algorithm::{Algorithm, AlgorithmProvider, LearnStats, Persist};
use crate::callback::{CheckpointCallback, checkpoint_file};
use crate::config::ExperimentConfig;
use crate::env::{EnvProvider, Environment, RenderMode};
use crate::error::{Error, Result};
use crate::vec_env::{DummyVecEnv, VecEnv, VecFrameStack};
use crate::wrappers::{FrameSkip, Grayscale, RewardPrinter};

pub const PROGRESS_FILE: &str = "progress.jsonl";

/// Written next to the fixed-name checkpoint so a restarted run resumes its
/// round counter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainMeta {
    pub round: u64,
    pub total_timesteps: u64,
}

/// One line of `progress.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub round: u64,
    pub timesteps: u64,
    pub episodes: u64,
    pub mean_episode_reward: Option<f64>,
    pub elapsed_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EpisodeEnd,
    ClockExpired,
}

/// Outcome of one visualised evaluation episode.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalReport {
    pub steps: u64,
    pub reward: f64,
    pub stop: StopReason,
}

/// Owns the single environment handle and the model bound to it.
///
/// The handle cannot change render mode or recording target once built, so
/// every change goes through [`EnvController::configure`], which releases the
/// old handle before building the new one. The model is dropped together with
/// its handle and rebound on the next [`train`](Self::train) or
/// [`run`](Self::run).
pub struct EnvController<P: EnvProvider, A: AlgorithmProvider> {
    config: ExperimentConfig,
    environments: P,
    algorithms: A,
    env: Option<Box<dyn VecEnv>>,
    model: Option<A::Model>,
    render_mode: RenderMode,
    recording: bool,
    round: u64,
    total_timesteps: u64,
}

impl<P: EnvProvider, A: AlgorithmProvider> EnvController<P, A> {
    /// Validates `config`, resumes the round counter from a previous run and
    /// builds the initial headless handle.
    pub fn new(config: ExperimentConfig, environments: P, algorithms: A) -> Result<Self> {
        config.validate()?;
        let mut controller = Self {
            config,
            environments,
            algorithms,
            env: None,
            model: None,
            render_mode: RenderMode::Headless,
            recording: false,
            round: 0,
            total_timesteps: 0,
        };
        if let Some(meta) = controller.read_meta()? {
            info!(
                round = meta.round,
                total_timesteps = meta.total_timesteps,
                "resuming experiment"
            );
            controller.round = meta.round;
            controller.total_timesteps = meta.total_timesteps;
        }
        controller.configure(RenderMode::Headless, false)?;
        Ok(controller)
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn total_timesteps(&self) -> u64 {
        self.total_timesteps
    }

    pub fn render_mode(&self) -> RenderMode {
        self.render_mode
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn is_configured(&self) -> bool {
        self.env.is_some()
    }

    /// Fixed-name checkpoint, overwritten after every training phase.
    pub fn checkpoint(&self) -> PathBuf {
        checkpoint_file(&self.config.checkpoint_path, &self.config.checkpoint_name)
    }

    fn meta_path(&self) -> PathBuf {
        self.config
            .checkpoint_path
            .join(format!("{}.json", self.config.checkpoint_name))
    }

    /// Tears down the current handle and builds a new one. The old handle is
    /// released first even when building the new one fails.
    pub fn configure(&mut self, render_mode: RenderMode, recording: bool) -> Result<()> {
        self.release()?;
        let spec = self.config.env_spec(render_mode, recording);
        let env = self.environments.make(&spec)?;
        // A failing wrapper drops `env`, which closes it.
        let venv = self.preprocess(env)?;
        self.env = Some(venv);
        self.render_mode = render_mode;
        self.recording = recording;
        debug!(%render_mode, recording, "environment configured");
        Ok(())
    }

    /// Grayscale, frame skip, batch, frame stack; in that order.
    fn preprocess(&self, env: Box<dyn Environment>) -> Result<Box<dyn VecEnv>> {
        let env: Box<dyn Environment> = if self.config.print_rewards {
            Box::new(RewardPrinter::new(env))
        } else {
            env
        };
        let env = Grayscale::new(env)?;
        let env: Box<dyn Environment> = Box::new(FrameSkip::new(env, self.config.frame_skip)?);
        let venv = DummyVecEnv::new(vec![env])?;
        let venv = VecFrameStack::new(venv, self.config.frame_stack)?;
        Ok(Box::new(venv))
    }

    /// Closes the live handle, if any, and unbinds the model.
    pub fn release(&mut self) -> Result<()> {
        self.model = None;
        match self.env.take() {
            Some(mut env) => env.close(),
            None => Ok(()),
        }
    }

    /// Loads the fixed-name checkpoint when present, otherwise creates a
    /// fresh model, bound to the live handle.
    fn bind_model(&mut self) -> Result<()> {
        let checkpoint = self.checkpoint();
        let env = self
            .env
            .as_deref()
            .ok_or_else(|| Error::invalid_config("no environment configured"))?;
        let model = if checkpoint.exists() {
            debug!(path = %checkpoint.display(), "loading checkpoint");
            self.algorithms.load(&checkpoint, env)?
        } else {
            self.algorithms.create(env)?
        };
        self.model = Some(model);
        Ok(())
    }

    /// One training phase of `total_steps / check_count` timesteps.
    pub fn train(&mut self) -> Result<LearnStats> {
        let started = Instant::now();
        self.bind_model()?;

        let steps = self.config.steps_per_round();
        let mut callback = CheckpointCallback::resume(
            self.config.check_freq,
            &self.config.checkpoint_path,
            self.total_timesteps,
        )?;
        let (Some(env), Some(model)) = (self.env.as_mut(), self.model.as_mut()) else {
            return Err(Error::invalid_config("no environment configured"));
        };
        let stats = model.learn(&mut **env, steps, &mut callback)?;

        let round = self.round + 1;
        std::fs::create_dir_all(&self.config.checkpoint_path)
            .map_err(|e| Error::persistence(&self.config.checkpoint_path, e))?;
        if round % self.config.saving_frequency == 0 {
            let snapshot = checkpoint_file(
                &self.config.checkpoint_path,
                &format!("{}_{round}", self.config.checkpoint_name),
            );
            model.save(&snapshot)?;
            info!(path = %snapshot.display(), round, "snapshot saved");
        }
        // The fixed-name checkpoint and the resume file move together.
        let checkpoint = checkpoint_file(&self.config.checkpoint_path, &self.config.checkpoint_name);
        model.save(&checkpoint)?;
        self.round = round;
        self.total_timesteps += stats.timesteps;
        self.write_meta()?;

        self.append_progress(&ProgressRecord {
            round,
            timesteps: stats.timesteps,
            episodes: stats.episodes,
            mean_episode_reward: stats.mean_episode_reward,
            elapsed_secs: started.elapsed().as_secs_f64(),
        })?;
        Ok(stats)
    }

    /// Evaluation phase. Visualises and records one episode when the round
    /// counter is a multiple of `visualisation_freq`, then always returns to
    /// headless, non-recording mode.
    pub fn run(&mut self) -> Result<Option<EvalReport>> {
        self.release()?;
        let report = if self.round % self.config.visualisation_freq == 0 {
            self.configure(RenderMode::Human, true)
                .and_then(|()| self.evaluate())
                .map(Some)
        } else {
            Ok(None)
        };
        let restored = self.configure(RenderMode::Headless, false);
        if let (Err(e), Err(_)) = (&report, &restored) {
            warn!(error = %e, "evaluation failed before headless mode could be restored");
        }
        let report = report?;
        restored?;
        Ok(report)
    }

    fn evaluate(&mut self) -> Result<EvalReport> {
        self.bind_model()?;
        let (Some(env), Some(model)) = (self.env.as_mut(), self.model.as_mut()) else {
            return Err(Error::invalid_config("no environment configured"));
        };
        let clock_var = &self.config.stop_clock_variable;
        let threshold = self.config.stop_clock_threshold;

        let mut observations = env.reset()?;
        let mut steps = 0u64;
        let mut reward = 0.0f64;
        let stop = loop {
            let actions = model.predict(&observations, self.config.deterministic_eval)?;
            let step = env.step(&actions)?;
            env.render()?;
            steps += 1;
            reward += step.rewards[0] as f64;
            if step.done(0) {
                break StopReason::EpisodeEnd;
            }
            if step.infos[0].get(clock_var).is_some_and(|&clock| clock <= threshold) {
                break StopReason::ClockExpired;
            }
            observations = step.observations;
        };

        let report = EvalReport {
            steps,
            reward,
            stop,
        };
        info!(
            round = self.round,
            steps,
            reward = format_args!("{reward:.2}"),
            stop = ?report.stop,
            "evaluation finished"
        );
        Ok(report)
    }

    /// Releases the handle without building a new one.
    pub fn close(&mut self) -> Result<()> {
        self.release()
    }

    fn read_meta(&self) -> Result<Option<TrainMeta>> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(&path).map_err(|e| Error::persistence(&path, e))?;
        let meta = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::persistence(&path, e))?;
        Ok(Some(meta))
    }

    fn write_meta(&self) -> Result<()> {
        let path = self.meta_path();
        let meta = TrainMeta {
            round: self.round,
            total_timesteps: self.total_timesteps,
        };
        let file = File::create(&path).map_err(|e| Error::persistence(&path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &meta).map_err(|e| Error::persistence(&path, e))?;
        writer.flush().map_err(|e| Error::persistence(&path, e))
    }

    fn append_progress(&self, record: &ProgressRecord) -> Result<()> {
        let dir = &self.config.log_path;
        std::fs::create_dir_all(dir).map_err(|e| Error::persistence(dir, e))?;
        let path = dir.join(PROGRESS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::persistence(&path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, record).map_err(|e| Error::persistence(&path, e))?;
        writeln!(writer).map_err(|e| Error::persistence(&path, e))?;
        writer.flush().map_err(|e| Error::persistence(&path, e))
    }
}
