use thiserror::Error;
use trawler_scanner::ScanError;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Worker process error: {0}")]
    ProcessError(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
