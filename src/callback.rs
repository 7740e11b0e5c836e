use std::path::{Path, PathBuf};

use tracing::info;

use crate::algorithm::{Persist, TrainingCallback};
use crate::error::{Error, Result};

pub const CHECKPOINT_EXTENSION: &str = "safetensors";

/// Path of the checkpoint named `stem` inside `dir`.
pub fn checkpoint_file(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{stem}.{CHECKPOINT_EXTENSION}"))
}

/// Saves the model to `save_path/model_<timesteps>` every `check_freq`
/// environment steps.
pub struct CheckpointCallback {
    check_freq: u64,
    save_path: PathBuf,
    since_save: u64,
    num_timesteps: u64,
    saves: u64,
}

impl CheckpointCallback {
    pub fn new(check_freq: u64, save_path: impl Into<PathBuf>) -> Result<Self> {
        Self::resume(check_freq, save_path, 0)
    }

    /// Continues counting from `num_timesteps` already trained, so checkpoint
    /// names stay unique across training calls.
    pub fn resume(
        check_freq: u64,
        save_path: impl Into<PathBuf>,
        num_timesteps: u64,
    ) -> Result<Self> {
        if check_freq == 0 {
            return Err(Error::invalid_config("check_freq must be >= 1"));
        }
        Ok(Self {
            check_freq,
            save_path: save_path.into(),
            since_save: num_timesteps % check_freq,
            num_timesteps,
            saves: 0,
        })
    }

    pub fn saves(&self) -> u64 {
        self.saves
    }

    pub fn num_timesteps(&self) -> u64 {
        self.num_timesteps
    }
}

impl TrainingCallback for CheckpointCallback {
    fn on_step(&mut self, model: &dyn Persist, steps: u64) -> Result<()> {
        self.num_timesteps += steps;
        self.since_save += steps;
        // A single large delivery may cross several intervals; each crossing
        // is saved under the step count at which it happened.
        while self.since_save >= self.check_freq {
            self.since_save -= self.check_freq;
            let at = self.num_timesteps - self.since_save;
            std::fs::create_dir_all(&self.save_path)
                .map_err(|e| Error::persistence(&self.save_path, e))?;
            let path = checkpoint_file(&self.save_path, &format!("model_{at}"));
            model.save(&path)?;
            self.saves += 1;
            info!(path = %path.display(), timesteps = at, "checkpoint saved");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder {
        saved: RefCell<Vec<PathBuf>>,
        fail: bool,
    }

    impl Persist for Recorder {
        fn save(&self, path: &Path) -> Result<()> {
            if self.fail {
                return Err(Error::persistence(path, "disk full"));
            }
            self.saved.borrow_mut().push(path.to_path_buf());
            Ok(())
        }
    }

    #[test]
    fn test_saves_every_check_freq_steps() {
        let dir = tempfile::tempdir().unwrap();
        let model = Recorder::default();
        let mut cb = CheckpointCallback::new(100, dir.path()).unwrap();
        for _ in 0..250 {
            cb.on_step(&model, 1).unwrap();
        }
        assert_eq!(cb.saves(), 2);
        assert_eq!(
            *model.saved.borrow(),
            vec![
                dir.path().join("model_100.safetensors"),
                dir.path().join("model_200.safetensors"),
            ]
        );
    }

    #[test]
    fn test_count_independent_of_delivery_size() {
        let dir = tempfile::tempdir().unwrap();
        for chunks in [vec![250], vec![99, 1, 150], vec![30; 8], vec![7, 243]] {
            let model = Recorder::default();
            let mut cb = CheckpointCallback::new(100, dir.path()).unwrap();
            let mut delivered = 0;
            for steps in chunks {
                cb.on_step(&model, steps).unwrap();
                delivered += steps;
            }
            let expected = delivered / 100;
            assert_eq!(cb.saves(), expected);
            assert_eq!(cb.num_timesteps(), delivered);
        }
    }

    #[test]
    fn test_resume_names_checkpoints_by_cumulative_steps() {
        let dir = tempfile::tempdir().unwrap();
        let model = Recorder::default();
        let mut cb = CheckpointCallback::resume(100, dir.path(), 130).unwrap();
        cb.on_step(&model, 75).unwrap();
        cb.on_step(&model, 100).unwrap();
        assert_eq!(cb.num_timesteps(), 305);
        assert_eq!(
            *model.saved.borrow(),
            vec![
                dir.path().join("model_200.safetensors"),
                dir.path().join("model_300.safetensors"),
            ]
        );
    }

    #[test]
    fn test_persistence_failure_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        let model = Recorder {
            fail: true,
            ..Recorder::default()
        };
        let mut cb = CheckpointCallback::new(1, dir.path()).unwrap();
        let err = cb.on_step(&model, 1).unwrap_err();
        assert!(matches!(err, Error::Persistence { .. }));
        assert_eq!(cb.saves(), 0);
    }

    #[test]
    fn test_zero_frequency_is_invalid() {
        assert!(matches!(
            CheckpointCallback::new(0, "checkpoints"),
            Err(Error::InvalidConfiguration(_))
        ));
    }
}
