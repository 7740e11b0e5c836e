use std::path::Path;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{
    AdamW, Conv2d, Conv2dConfig, Linear, Module, Optimizer, ParamsAdamW, VarBuilder, VarMap,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::algorithm::{Algorithm, AlgorithmProvider, LearnStats, Persist, TrainingCallback};
use crate::env::{Action, ActionSpace, Observation, ObservationSpace};
use crate::error::{Error, Result};
use crate::vec_env::VecEnv;

// =============================================================================
// Hyperparameters
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Environment steps per sub-environment collected before each update.
    pub n_steps: usize,
    pub gamma: f64,
    pub ent_coef: f64,
    pub max_grad_norm: f64,
    pub hidden_size: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-5,
            weight_decay: 1e-5,
            n_steps: 128,
            gamma: 0.99,
            ent_coef: 0.01,
            max_grad_norm: 0.5,
            hidden_size: 256,
        }
    }
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0.0) {
            return Err(Error::invalid_config("learning_rate must be > 0"));
        }
        if self.n_steps == 0 || self.hidden_size == 0 {
            return Err(Error::invalid_config(
                "n_steps and hidden_size must be >= 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.gamma) {
            return Err(Error::invalid_config("gamma must be within [0, 1]"));
        }
        Ok(())
    }
}

// =============================================================================
// Policy Network (candle)
// =============================================================================

fn conv_out(size: usize, kernel: usize, stride: usize) -> Option<usize> {
    size.checked_sub(kernel).map(|s| s / stride + 1)
}

/// Convolutional torso over stacked frames with one Bernoulli logit per
/// action slot.
/// Input: (N, C, H, W) in [0, 1] → (N, slots) logits.
pub struct PolicyNet {
    conv1: Conv2d,
    conv2: Conv2d,
    fc: Linear,
    head: Linear,
}

impl PolicyNet {
    pub fn new(
        vs: VarBuilder,
        space: ObservationSpace,
        slots: usize,
        hidden: usize,
    ) -> Result<Self> {
        let spatial = |size: usize| conv_out(size, 8, 4).and_then(|s| conv_out(s, 4, 2));
        let (Some(h), Some(w)) = (spatial(space.height), spatial(space.width)) else {
            return Err(Error::invalid_config(format!(
                "observation {space} is too small for the policy network"
            )));
        };
        let build = || -> candle_core::Result<Self> {
            let conv1 = candle_nn::conv2d(
                space.channels,
                16,
                8,
                Conv2dConfig {
                    stride: 4,
                    ..Default::default()
                },
                vs.pp("conv1"),
            )?;
            let conv2 = candle_nn::conv2d(
                16,
                32,
                4,
                Conv2dConfig {
                    stride: 2,
                    ..Default::default()
                },
                vs.pp("conv2"),
            )?;
            let fc = candle_nn::linear(32 * h * w, hidden, vs.pp("fc"))?;
            let head = candle_nn::linear(hidden, slots, vs.pp("head"))?;
            Ok(Self {
                conv1,
                conv2,
                fc,
                head,
            })
        };
        build().map_err(Error::learning)
    }

    pub fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.conv1.forward(x)?.relu()?;
        let h = self.conv2.forward(&h)?.relu()?;
        let h = h.flatten_from(1)?;
        let h = self.fc.forward(&h)?.relu()?;
        self.head.forward(&h)
    }
}

/// log(1 + e^x), stable for large |x|.
fn softplus(x: &Tensor) -> candle_core::Result<Tensor> {
    x.relu()?.add(&x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?)
}

fn clip_gradients(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> candle_core::Result<()> {
    if max_norm <= 0.0 {
        return Ok(());
    }
    let mut total_norm_sq = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total_norm_sq += g.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let total_norm = total_norm_sq.sqrt();
    if total_norm > max_norm {
        let clip_coef = max_norm / (total_norm + 1e-6);
        for var in vars {
            if let Some(g) = grads.get(var.as_tensor()) {
                let clipped = (g * clip_coef)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
    }
    Ok(())
}

// =============================================================================
// Returns
// =============================================================================

/// Discounted returns of a time-major rollout (`index = t * n_envs + env`).
/// The return restarts after every step flagged done.
pub fn discounted_returns(rewards: &[f32], dones: &[bool], n_envs: usize, gamma: f64) -> Vec<f32> {
    let mut out = vec![0.0f32; rewards.len()];
    let mut running = vec![0.0f64; n_envs];
    for idx in (0..rewards.len()).rev() {
        let env = idx % n_envs;
        if dones[idx] {
            running[env] = 0.0;
        }
        running[env] = rewards[idx] as f64 + gamma * running[env];
        out[idx] = running[env] as f32;
    }
    out
}

/// Zero mean, unit variance. Degenerate inputs are only centred.
pub fn normalize(values: &[f32]) -> Vec<f32> {
    if values.is_empty() {
        return Vec::new();
    }
    let n = values.len() as f64;
    let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = values
        .iter()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    let std = var.sqrt();
    let scale = if std > 1e-8 { std } else { 1.0 };
    values
        .iter()
        .map(|&v| ((v as f64 - mean) / scale) as f32)
        .collect()
}

struct Rollout {
    observations: Vec<Observation>,
    actions: Vec<f32>,
    rewards: Vec<f32>,
    dones: Vec<bool>,
}

// =============================================================================
// Policy Gradient Agent
// =============================================================================

pub struct PolicyGradient {
    varmap: VarMap,
    net: PolicyNet,
    optimizer: AdamW,
    device: Device,
    config: PolicyConfig,
    obs_space: ObservationSpace,
    slots: usize,
    updates: u64,
    rng: SmallRng,
}

impl PolicyGradient {
    pub fn new(
        device: &Device,
        config: PolicyConfig,
        obs_space: ObservationSpace,
        action_space: ActionSpace,
        rng: SmallRng,
    ) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let net = PolicyNet::new(vb, obs_space, action_space.slots, config.hidden_size)?;

        let opt_params = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let optimizer = AdamW::new(varmap.all_vars(), opt_params).map_err(Error::learning)?;

        Ok(Self {
            varmap,
            net,
            optimizer,
            device: device.clone(),
            config,
            obs_space,
            slots: action_space.slots,
            updates: 0,
            rng,
        })
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    pub fn load_weights(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(Error::persistence(path, "checkpoint not found"));
        }
        self.varmap
            .load(path)
            .map_err(|e| Error::persistence(path, e))
    }

    fn check_observations(&self, observations: &[&Observation]) -> Result<()> {
        match observations.iter().find(|o| o.space() != self.obs_space) {
            Some(o) => Err(Error::invalid_config(format!(
                "observation {} does not match policy input {}",
                o.space(),
                self.obs_space
            ))),
            None => Ok(()),
        }
    }

    fn batch_tensor(&self, observations: &[&Observation]) -> candle_core::Result<Tensor> {
        let s = self.obs_space;
        let mut data = Vec::with_capacity(observations.len() * s.len());
        for obs in observations {
            data.extend(obs.data.iter().map(|&b| b as f32 / 255.0));
        }
        Tensor::from_vec(
            data,
            (observations.len(), s.height, s.width, s.channels),
            &self.device,
        )?
        .permute((0, 3, 1, 2))?
        .contiguous()
    }

    fn probabilities(&self, observations: &[&Observation]) -> candle_core::Result<Vec<Vec<f32>>> {
        let x = self.batch_tensor(observations)?;
        let logits = self.net.forward(&x)?;
        candle_nn::ops::sigmoid(&logits)?.to_vec2::<f32>()
    }

    /// Actions plus the flat 0/1 slot matrix they were built from.
    fn sample(
        &mut self,
        observations: &[&Observation],
        deterministic: bool,
    ) -> Result<(Vec<Action>, Vec<f32>)> {
        self.check_observations(observations)?;
        let probs = self.probabilities(observations).map_err(Error::learning)?;
        let mut actions = Vec::with_capacity(probs.len());
        let mut flat = Vec::with_capacity(probs.len() * self.slots);
        for row in probs {
            let pressed: Vec<bool> = row
                .iter()
                .map(|&p| {
                    if deterministic {
                        p > 0.5
                    } else {
                        self.rng.random::<f32>() < p
                    }
                })
                .collect();
            flat.extend(pressed.iter().map(|&on| if on { 1.0f32 } else { 0.0 }));
            actions.push(Action::from_pressed(&pressed));
        }
        Ok((actions, flat))
    }

    fn policy_loss(
        &self,
        observations: &[&Observation],
        actions: &[f32],
        advantages: &[f32],
    ) -> candle_core::Result<Tensor> {
        let n = observations.len();
        let x = self.batch_tensor(observations)?;
        let logits = self.net.forward(&x)?;
        let taken = Tensor::from_slice(actions, (n, self.slots), &self.device)?;
        let adv = Tensor::from_slice(advantages, n, &self.device)?;

        // Bernoulli log-likelihood per slot: a*x - softplus(x)
        let sp = softplus(&logits)?;
        let log_prob = taken.mul(&logits)?.sub(&sp)?.sum(1)?;
        // Entropy per slot: softplus(x) - x*sigmoid(x)
        let p = candle_nn::ops::sigmoid(&logits)?;
        let entropy = sp.sub(&p.mul(&logits)?)?.sum(1)?.mean_all()?;

        let pg_loss = log_prob.mul(&adv)?.mean_all()?.neg()?;
        pg_loss.sub(&entropy.affine(self.config.ent_coef, 0.0)?)
    }

    fn update(&mut self, rollout: &Rollout, n_envs: usize) -> Result<f32> {
        let returns = discounted_returns(&rollout.rewards, &rollout.dones, n_envs, self.config.gamma);
        let advantages = normalize(&returns);
        let refs: Vec<&Observation> = rollout.observations.iter().collect();

        let loss = self
            .policy_loss(&refs, &rollout.actions, &advantages)
            .map_err(Error::learning)?;
        let value = loss.to_scalar::<f32>().map_err(Error::learning)?;
        if !value.is_finite() {
            return Err(Error::learning(format!("non-finite policy loss {value}")));
        }

        let mut grads = loss.backward().map_err(Error::learning)?;
        let vars = self.varmap.all_vars();
        clip_gradients(&mut grads, &vars, self.config.max_grad_norm).map_err(Error::learning)?;
        self.optimizer.step(&grads).map_err(Error::learning)?;
        self.updates += 1;
        Ok(value)
    }
}

impl Persist for PolicyGradient {
    fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::persistence(path, e))?;
        }
        self.varmap
            .save(path)
            .map_err(|e| Error::persistence(path, e))
    }
}

impl Algorithm for PolicyGradient {
    fn learn(
        &mut self,
        env: &mut dyn VecEnv,
        total_timesteps: u64,
        callback: &mut dyn TrainingCallback,
    ) -> Result<LearnStats> {
        if env.observation_space() != self.obs_space || env.action_space().slots != self.slots {
            return Err(Error::invalid_config(format!(
                "environment {} does not match policy input {}",
                env.observation_space(),
                self.obs_space
            )));
        }
        let n_envs = env.num_envs();
        let mut obs = env.reset()?;
        let mut stats = LearnStats::default();
        let mut running = vec![0.0f64; n_envs];
        let mut finished_reward = 0.0f64;

        while stats.timesteps < total_timesteps {
            let remaining = total_timesteps - stats.timesteps;
            let horizon = remaining
                .div_ceil(n_envs as u64)
                .min(self.config.n_steps as u64) as usize;
            let mut rollout = Rollout {
                observations: Vec::with_capacity(horizon * n_envs),
                actions: Vec::with_capacity(horizon * n_envs * self.slots),
                rewards: Vec::with_capacity(horizon * n_envs),
                dones: Vec::with_capacity(horizon * n_envs),
            };

            for _ in 0..horizon {
                let refs: Vec<&Observation> = obs.iter().collect();
                let (actions, pressed) = self.sample(&refs, false)?;
                let step = env.step(&actions)?;

                for i in 0..n_envs {
                    let done = step.done(i);
                    running[i] += step.rewards[i] as f64;
                    if done {
                        stats.episodes += 1;
                        finished_reward += running[i];
                        running[i] = 0.0;
                    }
                    rollout.dones.push(done);
                }
                rollout.rewards.extend_from_slice(&step.rewards);
                rollout.actions.extend(pressed);
                rollout.observations.append(&mut obs);
                obs = step.observations;

                stats.timesteps += n_envs as u64;
                callback.on_step(&*self, n_envs as u64)?;
            }

            let loss = self.update(&rollout, n_envs)?;
            debug!(
                update = self.updates,
                timesteps = stats.timesteps,
                loss,
                "policy update"
            );
        }

        stats.mean_episode_reward =
            (stats.episodes > 0).then(|| finished_reward / stats.episodes as f64);
        Ok(stats)
    }

    fn predict(
        &mut self,
        observations: &[Observation],
        deterministic: bool,
    ) -> Result<Vec<Action>> {
        let refs: Vec<&Observation> = observations.iter().collect();
        self.sample(&refs, deterministic).map(|(actions, _)| actions)
    }
}

// =============================================================================
// Provider
// =============================================================================

pub struct PolicyGradientProvider {
    config: PolicyConfig,
    device: Device,
    seed: Option<u64>,
}

impl PolicyGradientProvider {
    pub fn new(config: PolicyConfig, device: Device) -> Self {
        Self {
            config,
            device,
            seed: None,
        }
    }

    /// Fixes the action-sampling seed of every model this provider builds.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn rng(&self) -> SmallRng {
        match self.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        }
    }
}

impl AlgorithmProvider for PolicyGradientProvider {
    type Model = PolicyGradient;

    fn create(&self, env: &dyn VecEnv) -> Result<PolicyGradient> {
        PolicyGradient::new(
            &self.device,
            self.config.clone(),
            env.observation_space(),
            env.action_space(),
            self.rng(),
        )
    }

    fn load(&self, path: &Path, env: &dyn VecEnv) -> Result<PolicyGradient> {
        let mut model = self.create(env)?;
        model.load_weights(path)?;
        debug!(path = %path.display(), "policy loaded");
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::CheckpointCallback;
    use crate::env::Environment;
    use crate::testing::{FakeEnv, Script};
    use crate::vec_env::DummyVecEnv;

    fn venv(size: usize) -> DummyVecEnv {
        let script = Script {
            space: ObservationSpace {
                height: size,
                width: size,
                channels: 3,
            },
            episode_len: Some(5),
            rewards: vec![1.0, 0.0, -1.0],
            ..Script::default()
        };
        let env: Box<dyn Environment> = Box::new(FakeEnv::new(script));
        DummyVecEnv::new(vec![env]).unwrap()
    }

    fn provider() -> PolicyGradientProvider {
        PolicyGradientProvider::new(
            PolicyConfig {
                n_steps: 4,
                hidden_size: 8,
                learning_rate: 1e-3,
                ..PolicyConfig::default()
            },
            Device::Cpu,
        )
        .with_seed(3)
    }

    #[test]
    fn test_discounted_returns_restart_at_done() {
        let rewards = [1.0, 1.0, 1.0, 1.0];
        let dones = [false, true, false, false];
        let returns = discounted_returns(&rewards, &dones, 1, 0.5);
        assert_eq!(returns, vec![1.5, 1.0, 1.5, 1.0]);
    }

    #[test]
    fn test_discounted_returns_interleaved_envs() {
        // t0: e0, e1; t1: e0, e1
        let rewards = [1.0, 10.0, 2.0, 20.0];
        let dones = [false, false, false, true];
        let returns = discounted_returns(&rewards, &dones, 2, 1.0);
        assert_eq!(returns, vec![3.0, 30.0, 2.0, 20.0]);
    }

    #[test]
    fn test_normalize() {
        let out = normalize(&[1.0, 3.0]);
        assert_eq!(out, vec![-1.0, 1.0]);
        assert_eq!(normalize(&[2.0, 2.0]), vec![0.0, 0.0]);
        assert!(normalize(&[]).is_empty());
    }

    #[test]
    fn test_small_observation_rejected() {
        let err = provider().create(&venv(12)).err().unwrap();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn test_predict_one_action_per_observation() {
        let mut env = venv(24);
        let mut model = provider().create(&env).unwrap();
        let obs = env.reset().unwrap();
        let a = model.predict(&obs, true).unwrap();
        let b = model.predict(&obs, true).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a, b);
        assert!(a[0].bits() < 1 << 9);
    }

    #[test]
    fn test_learn_counts_steps_and_calls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = venv(24);
        let mut model = provider().create(&env).unwrap();
        let mut cb = CheckpointCallback::new(5, dir.path()).unwrap();
        let stats = model.learn(&mut env, 10, &mut cb).unwrap();

        assert_eq!(stats.timesteps, 10);
        assert_eq!(stats.episodes, 2);
        assert_eq!(cb.num_timesteps(), 10);
        assert_eq!(cb.saves(), 2);
        // Horizons of 4, 4 and 2 steps.
        assert_eq!(model.updates(), 3);
        assert!(dir.path().join("model_5.safetensors").exists());
        assert!(dir.path().join("model_10.safetensors").exists());
    }

    #[test]
    fn test_save_then_load_reproduces_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("policy.safetensors");
        let mut env = venv(24);
        let provider = provider();
        let mut model = provider.create(&env).unwrap();
        model.save(&path).unwrap();

        let mut loaded = provider.load(&path, &env).unwrap();
        let obs = env.reset().unwrap();
        assert_eq!(
            model.predict(&obs, true).unwrap(),
            loaded.predict(&obs, true).unwrap()
        );
    }

    #[test]
    fn test_load_rejects_mismatched_environment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.safetensors");
        let provider = provider();
        provider.create(&venv(24)).unwrap().save(&path).unwrap();
        let err = provider.load(&path, &venv(32)).err().unwrap();
        assert!(matches!(err, Error::Persistence { .. }));
    }

    #[test]
    fn test_load_missing_checkpoint() {
        let err = provider()
            .load(Path::new("nowhere/policy.safetensors"), &venv(24))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Persistence { .. }));
    }
}
