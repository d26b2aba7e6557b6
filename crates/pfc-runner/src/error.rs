use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PfcError {
    #[error("missing config key: {key}")]
    MissingKey { key: String },

    #[error("invalid config value for {key}: {message}")]
    InvalidConfig { key: String, message: String },

    #[error("{} is already occupied by another process", dir.display())]
    AlreadyRunning { dir: PathBuf },

    #[error("data exists: {0}")]
    DataExists(String),

    #[error("field liquefied in all {attempts} attempts of search step {step}")]
    PersistentLiquefaction { step: usize, attempts: usize },

    #[error("invalid data root: {} is not under {}", root.display(), data_dir.display())]
    InvalidRoot { root: PathBuf, data_dir: PathBuf },

    #[error("corrupt checkpoint sequence in {}: {message}", dir.display())]
    CorruptCheckpoints { dir: PathBuf, message: String },

    #[error("engine operation {op} failed: {message}")]
    Engine { op: String, message: String },
}

impl PfcError {
    pub fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        PfcError::InvalidConfig {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn engine(op: impl Into<String>, message: impl Into<String>) -> Self {
        PfcError::Engine {
            op: op.into(),
            message: message.into(),
        }
    }
}

pub fn is_already_running(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<PfcError>(),
        Some(PfcError::AlreadyRunning { .. })
    )
}
