use std::collections::VecDeque;

use crate::env::{Action, ActionSpace, Environment, Info, Observation, ObservationSpace};
use crate::error::{Error, Result};

/// Result of stepping every sub-environment once.
#[derive(Debug, Clone, PartialEq)]
pub struct VecStep {
    pub observations: Vec<Observation>,
    pub rewards: Vec<f32>,
    pub terminated: Vec<bool>,
    pub truncated: Vec<bool>,
    pub infos: Vec<Info>,
}

impl VecStep {
    pub fn done(&self, i: usize) -> bool {
        self.terminated[i] || self.truncated[i]
    }

    pub fn any_done(&self) -> bool {
        (0..self.rewards.len()).any(|i| self.done(i))
    }
}

/// Batched environment interface. Sub-environments that finish an episode
/// are reset automatically; the observation returned for them is the first
/// one of the next episode.
pub trait VecEnv {
    fn num_envs(&self) -> usize;
    fn observation_space(&self) -> ObservationSpace;
    fn action_space(&self) -> ActionSpace;
    fn reset(&mut self) -> Result<Vec<Observation>>;
    fn step(&mut self, actions: &[Action]) -> Result<VecStep>;
    fn render(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

impl<V: VecEnv + ?Sized> VecEnv for Box<V> {
    fn num_envs(&self) -> usize {
        (**self).num_envs()
    }

    fn observation_space(&self) -> ObservationSpace {
        (**self).observation_space()
    }

    fn action_space(&self) -> ActionSpace {
        (**self).action_space()
    }

    fn reset(&mut self) -> Result<Vec<Observation>> {
        (**self).reset()
    }

    fn step(&mut self, actions: &[Action]) -> Result<VecStep> {
        (**self).step(actions)
    }

    fn render(&mut self) -> Result<()> {
        (**self).render()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

// =============================================================================
// Sequential batch
// =============================================================================

/// Steps its environments one after another on the calling thread.
pub struct DummyVecEnv {
    envs: Vec<Box<dyn Environment>>,
}

impl DummyVecEnv {
    pub fn new(envs: Vec<Box<dyn Environment>>) -> Result<Self> {
        let Some(first) = envs.first() else {
            return Err(Error::invalid_config("batch needs at least one environment"));
        };
        let space = first.observation_space();
        let actions = first.action_space();
        if envs
            .iter()
            .any(|e| e.observation_space() != space || e.action_space() != actions)
        {
            return Err(Error::invalid_config(
                "all batched environments must share observation and action spaces",
            ));
        }
        Ok(Self { envs })
    }
}

impl VecEnv for DummyVecEnv {
    fn num_envs(&self) -> usize {
        self.envs.len()
    }

    fn observation_space(&self) -> ObservationSpace {
        self.envs[0].observation_space()
    }

    fn action_space(&self) -> ActionSpace {
        self.envs[0].action_space()
    }

    fn reset(&mut self) -> Result<Vec<Observation>> {
        self.envs.iter_mut().map(|e| e.reset()).collect()
    }

    fn step(&mut self, actions: &[Action]) -> Result<VecStep> {
        if actions.len() != self.envs.len() {
            return Err(Error::environment(format!(
                "expected {} actions, got {}",
                self.envs.len(),
                actions.len()
            )));
        }
        let n = self.envs.len();
        let mut out = VecStep {
            observations: Vec::with_capacity(n),
            rewards: Vec::with_capacity(n),
            terminated: Vec::with_capacity(n),
            truncated: Vec::with_capacity(n),
            infos: Vec::with_capacity(n),
        };
        for (env, &action) in self.envs.iter_mut().zip(actions) {
            let step = env.step(action)?;
            let observation = if step.done() {
                env.reset()?
            } else {
                step.observation
            };
            out.observations.push(observation);
            out.rewards.push(step.reward);
            out.terminated.push(step.terminated);
            out.truncated.push(step.truncated);
            out.infos.push(step.info);
        }
        Ok(out)
    }

    fn render(&mut self) -> Result<()> {
        for env in &mut self.envs {
            env.render()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut first_err = None;
        for env in &mut self.envs {
            if let Err(e) = env.close() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

// =============================================================================
// Frame stacking
// =============================================================================

/// Concatenates the last `n_stack` observations of each sub-environment along
/// the channel axis, oldest first. The stack of an environment is zeroed when
/// its episode ends.
pub struct VecFrameStack<V> {
    venv: V,
    n_stack: usize,
    stacks: Vec<VecDeque<Observation>>,
}

impl<V: VecEnv> VecFrameStack<V> {
    pub fn new(venv: V, n_stack: usize) -> Result<Self> {
        if n_stack < 1 {
            return Err(Error::invalid_config(format!(
                "frame stack must be >= 1, got {n_stack}"
            )));
        }
        let stacks = (0..venv.num_envs()).map(|_| VecDeque::new()).collect();
        Ok(Self {
            venv,
            n_stack,
            stacks,
        })
    }

    fn restart(&mut self, i: usize, first: Observation) {
        let blank = Observation::zeros(self.venv.observation_space());
        let stack = &mut self.stacks[i];
        stack.clear();
        stack.extend(std::iter::repeat_n(blank, self.n_stack - 1));
        stack.push_back(first);
    }

    fn push(&mut self, i: usize, obs: Observation) {
        let stack = &mut self.stacks[i];
        stack.pop_front();
        stack.push_back(obs);
    }

    fn stacked(&self, i: usize) -> Observation {
        let space = self.venv.observation_space();
        let c = space.channels;
        let mut data = Vec::with_capacity(space.len() * self.n_stack);
        for px in 0..space.height * space.width {
            for frame in &self.stacks[i] {
                data.extend_from_slice(&frame.data[px * c..(px + 1) * c]);
            }
        }
        Observation {
            height: space.height,
            width: space.width,
            channels: c * self.n_stack,
            data,
        }
    }
}

impl<V: VecEnv> VecEnv for VecFrameStack<V> {
    fn num_envs(&self) -> usize {
        self.venv.num_envs()
    }

    fn observation_space(&self) -> ObservationSpace {
        let space = self.venv.observation_space();
        ObservationSpace {
            channels: space.channels * self.n_stack,
            ..space
        }
    }

    fn action_space(&self) -> ActionSpace {
        self.venv.action_space()
    }

    fn reset(&mut self) -> Result<Vec<Observation>> {
        let observations = self.venv.reset()?;
        for (i, obs) in observations.into_iter().enumerate() {
            self.restart(i, obs);
        }
        Ok((0..self.num_envs()).map(|i| self.stacked(i)).collect())
    }

    fn step(&mut self, actions: &[Action]) -> Result<VecStep> {
        let mut step = self.venv.step(actions)?;
        let observations = std::mem::take(&mut step.observations);
        for (i, obs) in observations.into_iter().enumerate() {
            if step.done(i) {
                self.restart(i, obs);
            } else {
                self.push(i, obs);
            }
        }
        step.observations = (0..self.num_envs()).map(|i| self.stacked(i)).collect();
        Ok(step)
    }

    fn render(&mut self) -> Result<()> {
        self.venv.render()
    }

    fn close(&mut self) -> Result<()> {
        self.venv.close()
    }
}
