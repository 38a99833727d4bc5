use thiserror::Error;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    #[error("Log delivery failed: {0}")]
    LogDeliveryFailed(String),

    #[error("Launch failed: {0}")]
    LaunchFailed(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GateError {
    /// Transient errors are retried on the next poll cycle; everything else
    /// either ends the cycle (`LaunchFailed`) or the process (`Config`).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GateError::FetchFailed(_) | GateError::LogDeliveryFailed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GateError>;
