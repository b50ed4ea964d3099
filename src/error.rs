use thiserror::Error;

/// Failure taxonomy for the analysis/generation pipeline.
///
/// `Parse` is always recovered locally by callers (empty result map) and
/// should never reach the HTTP layer. Knowledge-base query failures are
/// swallowed per-query inside the retrieval builder and never become a
/// `PipelineError` at all.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("LLM request timed out after {0}s; check that the model is loaded or raise OLLAMA_TIMEOUT_SECS")]
    UpstreamTimeout(u64),

    #[error("upstream call failed: {0}")]
    Upstream(String),

    #[error("failed to extract JSON from model output: {0}")]
    Parse(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("document export failed: {0}")]
    Export(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
