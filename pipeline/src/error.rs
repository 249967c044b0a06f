use derive_more::derive::Display;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Worker-terminating errors. Analyzer failures never surface here; they
/// become failure records and the item moves to the next phase's stream.
#[derive(Debug, Display)]
pub enum PipelineError {
    #[display("configuration error: {_0}")]
    Config(String),
    #[display("filesystem error: {_0}")]
    Io(std::io::Error),
    #[display("http error: {_0}")]
    Http(reqwest::Error),
    #[display("aborted: {_0}")]
    Aborted(String),
    Internal(anyhow::Error),
}

impl std::error::Error for PipelineError {}

impl From<std::io::Error> for PipelineError {
    fn from(error: std::io::Error) -> Self {
        PipelineError::Io(error)
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(error: reqwest::Error) -> Self {
        PipelineError::Http(error)
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(error: anyhow::Error) -> Self {
        PipelineError::Internal(error)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(error: serde_json::Error) -> Self {
        PipelineError::Internal(error.into())
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(error: config::ConfigError) -> Self {
        PipelineError::Config(error.to_string())
    }
}

impl PipelineError {
    /// Process exit code per the CLI contract.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Config(_) => 1,
            PipelineError::Aborted(_) => 3,
            _ => 2,
        }
    }
}
