use thiserror::Error;

use crate::discovery::DiscoveryError;
use crate::engine::EngineError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Proxy discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("No validated proxy -- run `tunsnare discover <uri>` or pass --uri")]
    NoProxy,
}

pub type Result<T> = std::result::Result<T, AppError>;
