use std::path::PathBuf;

use thiserror::Error;

use crate::shared::config::ConfigError;

#[derive(Error, Debug)]
pub enum AnalyserError {
    #[error("failed to decode {path}: {message}")]
    Decode { path: PathBuf, message: String },
    #[error("face detection failed on frame {frame}: {message}")]
    DetectionFailed { frame: usize, message: String },
    #[error("failed to start analysis worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
