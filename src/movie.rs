use std::fs::File;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::env::Action;
use crate::error::{Error, Result};

/// Inputs of one recorded episode, one button mask per emulated frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movie {
    pub game: String,
    pub state: Option<String>,
    pub actions: Vec<Action>,
}

impl Movie {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(Error::environment)?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader).map_err(Error::environment)
    }
}

/// Writes one movie file per episode into a directory.
pub struct MovieRecorder {
    dir: PathBuf,
    prefix: String,
    game: String,
    state: Option<String>,
    next_index: u64,
    current: Option<Movie>,
}

impl MovieRecorder {
    pub fn new(dir: &Path, game: &Path, state: Option<&Path>) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| Error::persistence(dir, e))?;
        let stem = |p: &Path| {
            p.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "game".to_string())
        };
        let prefix = format!(
            "{}-{}",
            stem(game),
            state.map(stem).unwrap_or_else(|| "boot".to_string())
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            prefix,
            game: game.display().to_string(),
            state: state.map(|p| p.display().to_string()),
            next_index: 0,
            current: None,
        })
    }

    /// Finishes the running episode, if any, and starts a new one.
    pub fn start_episode(&mut self) -> Result<()> {
        self.finish()?;
        self.current = Some(Movie {
            game: self.game.clone(),
            state: self.state.clone(),
            actions: Vec::new(),
        });
        Ok(())
    }

    pub fn record(&mut self, action: Action) {
        if let Some(movie) = self.current.as_mut() {
            movie.actions.push(action);
        }
    }

    pub fn is_recording(&self) -> bool {
        self.current.is_some()
    }

    /// Writes the running episode to the first unused file name.
    pub fn finish(&mut self) -> Result<Option<PathBuf>> {
        let Some(movie) = self.current.take() else {
            return Ok(None);
        };
        let path = loop {
            let candidate = self
                .dir
                .join(format!("{}-{:06}.json", self.prefix, self.next_index));
            self.next_index += 1;
            if !candidate.exists() {
                break candidate;
            }
        };
        let file = File::create(&path).map_err(|e| Error::persistence(&path, e))?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer(writer, &movie).map_err(|e| Error::persistence(&path, e))?;
        debug!(path = %path.display(), frames = movie.actions.len(), "movie written");
        Ok(Some(path))
    }
}
