use axum::http::StatusCode;
use thiserror::Error;

/// Terminal failures of a dataset acquisition. A "not yet published" archive
/// answer is never one of these; the engine absorbs it and steps to the next key.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("Invalid dataset key: {0}")]
    InvalidKey(String),

    #[error("Invalid variable: {0}")]
    InvalidVariable(String),

    #[error("{what} not found after {attempts} attempts")]
    RetryBudgetExhausted { what: &'static str, attempts: u32 },

    #[error("Error while sending archive request. {}", describe_upstream(.status, .reason))]
    UpstreamHardFailure { status: Option<u16>, reason: String },

    #[error("Error while converting the data file to JSON: {0}")]
    ConversionFailed(String),

    #[error("Error while calculating air density from temperature data: {0}")]
    DerivationFailed(String),

    #[error("Error while accessing the weather cache: {0}")]
    LocalIoFailure(String),
}

impl AcquireError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidKey(_) | Self::InvalidVariable(_) => StatusCode::BAD_REQUEST,
            Self::RetryBudgetExhausted { .. } => StatusCode::NOT_FOUND,
            Self::UpstreamHardFailure { .. }
            | Self::ConversionFailed(_)
            | Self::DerivationFailed(_)
            | Self::LocalIoFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn io(context: impl std::fmt::Display, error: std::io::Error) -> Self {
        Self::LocalIoFailure(format!("{context}: {error}"))
    }
}

fn describe_upstream(status: &Option<u16>, reason: &str) -> String {
    match status {
        Some(code) => format!("Archive responded with code: {code}"),
        None => format!("Archive request failed: {reason}"),
    }
}
