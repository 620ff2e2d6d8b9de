use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Invalid crawl policy: {0}")]
    InvalidPolicy(String),

    #[error("No valid URLs to crawl")]
    NoValidSeeds,

    #[error("Crawler is already running")]
    AlreadyRunning,

    #[error("Render failed: {0}")]
    RenderError(String),

    #[error("Page load timed out after {0} ms")]
    RenderTimeout(u64),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ScanError>;
