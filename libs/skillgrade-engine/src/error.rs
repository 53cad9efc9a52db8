use skillgrade_common::store::StoreError;
use thiserror::Error;

/// A test case could not be launched. Counted as a failed test case by the coding evaluator.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("{what} exceeds maximum size of {limit} bytes")]
    InputTooLarge { what: &'static str, limit: usize },
    #[error("expected output could not be rendered: {0}")]
    Expectation(String),
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
}

/// Failure scoring one answer. Contained by the aggregator: the answer scores 0.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("no test case could be attempted ({attempted} launch failures): {last}")]
    NoTestCaseAttempted {
        attempted: usize,
        #[source]
        last: SandboxError,
    },
}

/// Systemic failure. Propagated to the caller; no score is fabricated.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("question store unavailable: {0}")]
    QuestionStore(#[source] StoreError),
    #[error("failed to persist result: {0}")]
    ResultSink(#[source] StoreError),
    #[error("cohort store unavailable: {0}")]
    CohortStore(#[source] StoreError),
}
