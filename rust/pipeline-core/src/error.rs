// rust/pipeline-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Dataset '{name}' error: {message}")]
    Dataset {
        name: String,
        message: String,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Shuffle error: {message}")]
    Shuffle {
        message: String,
    },

    #[error("Worker pool '{pool}' error: {message}")]
    Worker {
        pool: String,
        message: String,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

// Convenience constructors
impl PipelineError {

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn dataset(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dataset {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn unsupported(name: impl Into<String>, operation: &str) -> Self {
        Self::Dataset {
            name: name.into(),
            message: format!("operation '{operation}' is not supported by this dataset"),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn shuffle(message: impl Into<String>) -> Self {
        Self::Shuffle {
            message: message.into(),
        }
    }

    pub fn worker(pool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Worker {
            pool: pool.into(),
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = PipelineError::dataset("multi_slot", "channel_num must not exceed thread_num");
        assert_eq!(
            err.to_string(),
            "Dataset 'multi_slot' error: channel_num must not exceed thread_num"
        );

        let err = PipelineError::worker("load", "task panicked");
        assert_eq!(err.to_string(), "Worker pool 'load' error: task panicked");
    }

    #[test]
    fn test_unsupported_names_operation() {
        let err = PipelineError::unsupported("slot", "dynamic_adjust_channel_num");
        assert!(err.to_string().contains("dynamic_adjust_channel_num"));
    }

    #[test]
    fn test_storage_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = PipelineError::storage_with_source("/tmp/x", "failed to open", io);
        assert!(std::error::Error::source(&err).is_some());
    }
}
