use thiserror::Error;

use agentdock_core::StoreError;

/// Why a submission was turned away before any background work started.
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("{0}")]
    Validation(String),
    #[error("File not found or expired: {0}")]
    UnknownFile(String),
    #[error("{0}")]
    UnknownProvider(String),
    #[error("Failed to start {provider} agent: {message}")]
    Session { provider: String, message: String },
    #[error("Failed to start {provider} agent: {source}")]
    Store {
        provider: String,
        #[source]
        source: StoreError,
    },
}

impl AdmissionError {
    /// HTTP status class for the request layer.
    pub fn status_code(&self) -> u16 {
        match self {
            AdmissionError::Validation(_)
            | AdmissionError::UnknownFile(_)
            | AdmissionError::UnknownProvider(_) => 400,
            AdmissionError::Session { .. } | AdmissionError::Store { .. } => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AdmissionError::Validation(_) => "INSTRUCTION_INVALID",
            AdmissionError::UnknownFile(_) => "FILE_NOT_FOUND",
            AdmissionError::UnknownProvider(_) => "PROVIDER_NOT_CONFIGURED",
            AdmissionError::Session { .. } => "PROVIDER_SESSION_FAILED",
            AdmissionError::Store { .. } => "STORE_CREATE_FAILED",
        }
    }
}
