use std::path::PathBuf;

/// Boxed foreign error (emulator, tensor backend, I/O, JSON).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the experiment runner.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("failed to construct environment for {game}: {source}")]
    EnvironmentConstruction {
        game: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("environment failure: {0}")]
    Environment(#[source] BoxError),

    #[error("failed to persist {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("learning step failed: {0}")]
    LearningStep(#[source] BoxError),

    #[error("invalid scenario: {0}")]
    Scenario(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Error::InvalidConfiguration(msg.into())
    }

    pub fn environment(source: impl Into<BoxError>) -> Self {
        Error::Environment(source.into())
    }

    pub fn persistence(path: impl Into<PathBuf>, source: impl Into<BoxError>) -> Self {
        Error::Persistence {
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn learning(source: impl Into<BoxError>) -> Self {
        Error::LearningStep(source.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_configuration_display() {
        let err = Error::invalid_config("frame skip must be >= 1, got 0");
        assert_eq!(
            err.to_string(),
            "invalid configuration: frame skip must be >= 1, got 0"
        );
    }

    #[test]
    fn test_persistence_display_names_path() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let err = Error::persistence("checkpoints/model_100.safetensors", io);
        assert_eq!(
            err.to_string(),
            "failed to persist checkpoints/model_100.safetensors: read-only"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_learning_error_from_anyhow() {
        let err = Error::learning(anyhow::anyhow!("loss is NaN"));
        assert_eq!(err.to_string(), "learning step failed: loss is NaN");
    }
}
