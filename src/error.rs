use crate::chat::model::ModelError;
use crate::proxy::types::ProxyError;
use std::fmt::Display;
use thiserror::Error;

/// Failures while assembling or serving the gateway
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: &'static str, reason: String },

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Model client error: {0}")]
    Model(#[from] ModelError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid_setting(key: &'static str, reason: impl Display) -> Self {
        Self::InvalidSetting {
            key,
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
