use thiserror::Error;

/// Top-level error type for Skua applications embedding the client core.
#[derive(Error, Debug)]
pub enum SkuaError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Logging error: {0}")]
    Logging(#[from] crate::logging::LoggingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized Result type for Skua operations.
pub type Result<T> = std::result::Result<T, SkuaError>;
