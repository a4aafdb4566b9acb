use miette::Diagnostic;
use thiserror::Error;

use crate::authz::errors::LoadError;

#[derive(Debug, Error, Diagnostic)]
pub enum CanopyError {
    #[error("I/O error: {0}")]
    #[diagnostic(code(canopy::io))]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    #[diagnostic(code(canopy::config))]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    #[diagnostic(code(canopy::serde))]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Load(#[from] LoadError),

    #[error("Bad request: {0}")]
    #[diagnostic(code(canopy::bad_request))]
    BadRequest(String),
}
