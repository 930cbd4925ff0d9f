use thiserror::Error;

use crate::recorder::RecorderError;

pub type AutomationResult<T> = Result<T, AutomationError>;

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("browser session lost: {0}")]
    SessionLost(String),
    #[error("page script failed: {0}")]
    Script(String),
    #[error("progress store error: {0}")]
    Store(String),
    #[error("no further video: {0}")]
    AdvanceExhausted(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AutomationError {
    /// True when the browser session itself is gone, not just the page.
    /// The driver never retries past one of these.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            AutomationError::SessionLost(_) => true,
            AutomationError::Cdp(err) => {
                let text = err.to_string().to_lowercase();
                text.contains("closed")
                    || text.contains("disconnect")
                    || text.contains("channel")
                    || text.contains("websocket")
            }
            _ => false,
        }
    }
}

impl From<RecorderError> for AutomationError {
    fn from(err: RecorderError) -> Self {
        AutomationError::Store(err.to_string())
    }
}

impl From<tokio::task::JoinError> for AutomationError {
    fn from(err: tokio::task::JoinError) -> Self {
        AutomationError::Unexpected(err.to_string())
    }
}
