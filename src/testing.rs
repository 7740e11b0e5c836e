//! Scripted fakes for unit tests. Every handle and model reports to a shared
//! [`Ledger`] so tests can count live handles and observe call order.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use crate::algorithm::{Algorithm, AlgorithmProvider, LearnStats, Persist, TrainingCallback};
use crate::env::{
    Action, ActionSpace, EnvProvider, EnvSpec, Environment, Info, Observation, ObservationSpace,
    RenderMode, Step,
};
use crate::error::{Error, Result};
use crate::vec_env::VecEnv;

#[derive(Debug, Default)]
pub struct Ledger {
    pub live: usize,
    pub max_live: usize,
    pub closed: usize,
    pub made: Vec<EnvSpec>,
    pub events: Vec<String>,
}

pub type SharedLedger = Rc<RefCell<Ledger>>;

pub fn ledger() -> SharedLedger {
    Rc::new(RefCell::new(Ledger::default()))
}

/// Behaviour of a [`FakeEnv`].
#[derive(Debug, Clone)]
pub struct Script {
    /// Reward of the n-th step of an episode, cycled. Empty means zero.
    pub rewards: Vec<f32>,
    /// Terminate after this many steps.
    pub episode_len: Option<u64>,
    /// `time` info value at reset, decreasing by `clock_per_step` each step.
    pub clock_start: i64,
    pub clock_per_step: i64,
    pub space: ObservationSpace,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            rewards: Vec::new(),
            episode_len: None,
            clock_start: 400,
            clock_per_step: 1,
            space: ObservationSpace {
                height: 8,
                width: 8,
                channels: 3,
            },
        }
    }
}

/// Every observation is filled with the current episode step count.
pub struct FakeEnv {
    script: Script,
    ledger: Option<SharedLedger>,
    step: u64,
    actions: Vec<Action>,
    open: bool,
}

impl FakeEnv {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            ledger: None,
            step: 0,
            actions: Vec::new(),
            open: true,
        }
    }

    pub fn with_ledger(script: Script, ledger: SharedLedger) -> Self {
        {
            let mut l = ledger.borrow_mut();
            l.live += 1;
            l.max_live = l.max_live.max(l.live);
        }
        let mut env = Self::new(script);
        env.ledger = Some(ledger);
        env
    }

    /// Every action received so far, across episodes.
    pub fn actions(&self) -> Vec<Action> {
        self.actions.clone()
    }

    fn observation(&self) -> Observation {
        let mut obs = Observation::zeros(self.script.space);
        obs.data.fill(self.step as u8);
        obs
    }

    fn info(&self) -> Info {
        let clock = self.script.clock_start - self.script.clock_per_step * self.step as i64;
        Info::from([("step".to_string(), self.step as i64), ("time".to_string(), clock)])
    }
}

impl Environment for FakeEnv {
    fn observation_space(&self) -> ObservationSpace {
        self.script.space
    }

    fn action_space(&self) -> ActionSpace {
        ActionSpace::nes()
    }

    fn reset(&mut self) -> Result<Observation> {
        self.step = 0;
        Ok(self.observation())
    }

    fn step(&mut self, action: Action) -> Result<Step> {
        if !self.open {
            return Err(Error::environment("step on a closed handle"));
        }
        self.actions.push(action);
        self.step += 1;
        let rewards = &self.script.rewards;
        let reward = if rewards.is_empty() {
            0.0
        } else {
            rewards[(self.step as usize - 1) % rewards.len()]
        };
        Ok(Step {
            observation: self.observation(),
            reward,
            terminated: self.script.episode_len.is_some_and(|n| self.step >= n),
            truncated: false,
            info: self.info(),
        })
    }

    fn render(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.open, false) {
            if let Some(ledger) = &self.ledger {
                let mut l = ledger.borrow_mut();
                l.live -= 1;
                l.closed += 1;
            }
        }
        Ok(())
    }
}

impl Drop for FakeEnv {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

pub struct FakeProvider {
    pub script: Script,
    pub ledger: SharedLedger,
    /// Construction fails for handles in this render mode.
    pub fail_on: Option<RenderMode>,
    /// Handles in this render mode produce single-channel observations.
    pub single_channel_on: Option<RenderMode>,
}

impl FakeProvider {
    pub fn new(ledger: SharedLedger) -> Self {
        Self {
            script: Script::default(),
            ledger,
            fail_on: None,
            single_channel_on: None,
        }
    }
}

impl EnvProvider for FakeProvider {
    fn make(&self, spec: &EnvSpec) -> Result<Box<dyn Environment>> {
        if self.fail_on == Some(spec.render_mode) {
            return Err(Error::EnvironmentConstruction {
                game: spec.game.clone(),
                source: "no such ROM".into(),
            });
        }
        {
            let mut l = self.ledger.borrow_mut();
            l.made.push(spec.clone());
            l.events.push(format!("make:{}", spec.render_mode));
        }
        let mut script = self.script.clone();
        if self.single_channel_on == Some(spec.render_mode) {
            script.space.channels = 1;
        }
        Ok(Box::new(FakeEnv::with_ledger(script, self.ledger.clone())))
    }
}

/// Steps with NOOP actions and persists a marker file.
pub struct FakeModel {
    ledger: SharedLedger,
    fail_learn: bool,
    fail_predict: bool,
}

impl Persist for FakeModel {
    fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, b"fake").map_err(|e| Error::persistence(path, e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.ledger.borrow_mut().events.push(format!("save:{name}"));
        Ok(())
    }
}

impl Algorithm for FakeModel {
    fn learn(
        &mut self,
        env: &mut dyn VecEnv,
        total_timesteps: u64,
        callback: &mut dyn TrainingCallback,
    ) -> Result<LearnStats> {
        self.ledger.borrow_mut().events.push("learn".to_string());
        if self.fail_learn {
            return Err(Error::learning("loss diverged"));
        }
        let n = env.num_envs();
        env.reset()?;
        let mut stats = LearnStats::default();
        while stats.timesteps < total_timesteps {
            let step = env.step(&vec![Action::NOOP; n])?;
            stats.episodes += (0..n).filter(|&i| step.done(i)).count() as u64;
            stats.timesteps += n as u64;
            callback.on_step(&*self, n as u64)?;
        }
        Ok(stats)
    }

    fn predict(&mut self, observations: &[Observation], _deterministic: bool) -> Result<Vec<Action>> {
        if self.fail_predict {
            return Err(Error::learning("policy produced NaN"));
        }
        Ok(vec![Action::NOOP; observations.len()])
    }
}

pub struct FakeAlgorithmProvider {
    pub ledger: SharedLedger,
    pub fail_learn: bool,
    pub fail_predict: bool,
}

impl FakeAlgorithmProvider {
    pub fn new(ledger: SharedLedger) -> Self {
        Self {
            ledger,
            fail_learn: false,
            fail_predict: false,
        }
    }

    fn model(&self) -> FakeModel {
        FakeModel {
            ledger: self.ledger.clone(),
            fail_learn: self.fail_learn,
            fail_predict: self.fail_predict,
        }
    }
}

impl AlgorithmProvider for FakeAlgorithmProvider {
    type Model = FakeModel;

    fn create(&self, _env: &dyn VecEnv) -> Result<FakeModel> {
        self.ledger.borrow_mut().events.push("create".to_string());
        Ok(self.model())
    }

    fn load(&self, path: &Path, _env: &dyn VecEnv) -> Result<FakeModel> {
        if !path.exists() {
            return Err(Error::persistence(path, "checkpoint not found"));
        }
        self.ledger.borrow_mut().events.push("load".to_string());
        Ok(self.model())
    }
}
