use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClipperError {
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("failed to start {target}: {reason}")]
    SpawnFailure { target: String, reason: String },
    #[error("session `{0}` already exists; sweep it before creating a new one")]
    SessionExists(String),
    #[error("illegal pipeline transition: {0}")]
    InvalidTransition(String),
    #[error("run interrupted")]
    Interrupted,
    #[error("download error: {0}")]
    Download(String),
}

impl ClipperError {
    pub fn spawn(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SpawnFailure {
            target: target.into(),
            reason: reason.into(),
        }
    }
}
