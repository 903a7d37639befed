use thiserror::Error;

/// Failure taxonomy for one analysis.
///
/// `Validation` is the caller's fault; every other variant is an internal
/// failure carrying the collaborator's error chain.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("{0}")]
    Validation(String),

    #[error("storage failed: {0}")]
    Storage(String),

    #[error("detection failed: {0}")]
    Detection(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("all {attempted} batch items failed; first error: {first_error}")]
    BatchFailed {
        attempted: usize,
        first_error: String,
    },
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;

impl AnalysisError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn detection(msg: impl Into<String>) -> Self {
        Self::Detection(msg.into())
    }

    pub fn generation(msg: impl Into<String>) -> Self {
        Self::Generation(msg.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Short step name used in logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Storage(_) => "storage",
            Self::Detection(_) => "detection",
            Self::Generation(_) => "generation",
            Self::BatchFailed { .. } => "batch",
        }
    }
}
