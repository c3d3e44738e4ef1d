use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error(
        "pg_stat_statements exposes neither total_exec_time/mean_exec_time nor total_time/mean_time (found: {})",
        found.join(", ")
    )]
    MissingTimingColumns { found: Vec<String> },
    #[error("statistics record #{index} is invalid: {reason}")]
    InvalidRecord { index: usize, reason: String },
    #[error("not an EXPLAIN plan: {0}")]
    Plan(String),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, AdvisorError>;
