use std::time::Duration;

use digestor_adapters::PosterError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("run cancelled")]
    Cancelled,
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error(transparent)]
    Repository(#[from] anyhow::Error),
    #[error("poster: {0}")]
    Poster(#[from] PosterError),
    #[error("cluster summarizer: {0:#}")]
    Summarizer(anyhow::Error),
    #[error("invalid settings: {0}")]
    Settings(String),
}

impl ComposeError {
    /// Errors that end the current run rather than a single window.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ComposeError::Cancelled)
    }
}

pub type ComposeResult<T> = Result<T, ComposeError>;
