use std::path::PathBuf;

use thiserror::Error;

/// The crate's sole error type. Every fallible public entry point returns
/// `Result<T, ModError>`.
#[derive(Error, Debug)]
pub enum ModError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid module: {0}")]
    InvalidModule(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("playback cancelled")]
    Cancelled,

    #[error("audio device error: {0}")]
    Audio(String),
}

impl ModError {
    pub fn invalid_module<S: Into<String>>(msg: S) -> Self {
        Self::InvalidModule(msg.into())
    }

    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

/// Removes a partially written render target, swallowing the removal error
/// (the original failure is what gets reported to the caller).
pub fn cleanup_render_target(path: &PathBuf) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            log::warn!("failed to remove partial render target {path:?}: {e}");
        }
    }
}
