//! Error taxonomy for provisioning operations.

use thiserror::Error;

use crate::{backend::BackendError, policy::ValidationError};

/// Errors surfaced by the provisioning core.
///
/// Configuration and validation errors are detected locally before any backend
/// call. Backend rejections carry the backend's error code and message verbatim.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Conflicting or missing options.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A role archetype is missing a parameter it requires.
    #[error("Invalid role archetype parameters: {0}")]
    InvalidArchetypeParameters(String),

    /// A policy or trust document failed local validation.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The backend refused the request.
    #[error("Backend rejected request: {code}: {message}")]
    BackendRejection { code: String, message: String },

    /// The backend could not be reached.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Another writer pushed the user to the access key ceiling between our count and create.
    #[error(
        "User '{user}' reached the access key limit while a key was being issued; \
         another provisioning run is likely rotating keys for the same user"
    )]
    KeyLimitRaceCondition { user: String },

    #[error("No IAM Identity Center instance found")]
    NoSsoInstance,

    #[error("Permission set '{0}' not found")]
    PermissionSetNotFound(String),

    #[error("Permission set name '{name}' matches more than one permission set: {}", matches.join(", "))]
    AmbiguousPermissionSet { name: String, matches: Vec<String> },

    /// The local credential cache could not be read or written.
    #[error("Credential cache {path}: {message}")]
    CredentialCache { path: String, message: String },
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

impl ProvisionError {
    /// Whether the error was detected before any backend round-trip.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ProvisionError::Configuration(_)
                | ProvisionError::InvalidArchetypeParameters(_)
                | ProvisionError::Validation(_)
        )
    }

    /// Whether re-running the pipeline may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProvisionError::BackendUnavailable(_))
    }
}

impl From<BackendError> for ProvisionError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound(message) => ProvisionError::BackendRejection {
                code: "NoSuchEntity".to_string(),
                message,
            },
            BackendError::AlreadyExists(message) => ProvisionError::BackendRejection {
                code: "EntityAlreadyExists".to_string(),
                message,
            },
            BackendError::LimitExceeded(message) => ProvisionError::BackendRejection {
                code: "LimitExceeded".to_string(),
                message,
            },
            BackendError::Rejected { code, message } => {
                ProvisionError::BackendRejection { code, message }
            }
            BackendError::Unavailable(message) => ProvisionError::BackendUnavailable(message),
        }
    }
}
