use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("maximum concurrent sessions ({limit}) reached")]
    Capacity { limit: usize },

    #[error("session {0} is already processing a request")]
    Conflict(String),

    #[error("failed to start {binary}: {reason}")]
    Startup { binary: String, reason: String },

    #[error("output of process {0} was already taken")]
    OutputTaken(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
