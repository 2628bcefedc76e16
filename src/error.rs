use thiserror::Error;

/// Fatal pipeline errors. Per-record and per-detector problems never surface
/// here; they are counted in the ingestion summary or recorded as
/// [`NotApplicable`] markers.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("cancellation requested during {stage}")]
    CancellationRequested { stage: &'static str },
    #[error("failed to read input: {0}")]
    Io(#[from] std::io::Error),
    #[error("input is not a valid report document at byte {offset}: {reason}")]
    Json { offset: u64, reason: String },
}

/// Why a single raw report was rejected by the record stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecord {
    #[error("report has no identifier")]
    MissingIdentifier,
    #[error("report does not match the expected shape: {0}")]
    Shape(String),
}

/// A detector that could not score a series.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotApplicable {
    #[error("insufficient data: need {required} periods, have {actual}")]
    InsufficientData { required: usize, actual: usize },
    #[error("degenerate variance in {component}")]
    DegenerateVariance { component: &'static str },
}

pub type Result<T> = std::result::Result<T, PipelineError>;
