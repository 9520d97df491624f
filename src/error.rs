use crate::lcp::{ErrorKind, LcpError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// Resource not found error.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input error.
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Missing or invalid credentials.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not allowed.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// No transaction binds the user to the publication.
    #[error("No license acquired for publication {0}")]
    NotEntitled(String),

    /// License Server or status document failure.
    #[error("License Server error: {0}")]
    License(#[from] LcpError),

    /// A license could not be acquired for a publication.
    #[error("License acquisition failed for publication {publication_id}: {source}")]
    Acquisition {
        /// Publication the license was requested for.
        publication_id: String,
        /// Underlying License Server failure.
        source: LcpError,
    },

    /// The caller went away before the operation completed.
    #[error("Request cancelled")]
    Cancelled,

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Tag a License Server failure with the publication being acquired.
    pub fn for_publication(self, publication_id: &str) -> Self {
        match self {
            AppError::License(source) => AppError::Acquisition {
                publication_id: publication_id.to_string(),
                source,
            },
            other => other,
        }
    }

    /// The License Server failure behind this error, if any.
    pub fn license_error(&self) -> Option<&LcpError> {
        match self {
            AppError::License(e) | AppError::Acquisition { source: e, .. } => Some(e),
            _ => None,
        }
    }

    /// HTTP status matching this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidFormat(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) | AppError::NotEntitled(_) => StatusCode::FORBIDDEN,
            AppError::License(e) | AppError::Acquisition { source: e, .. } => match e.kind() {
                ErrorKind::RemoteClient => StatusCode::UNPROCESSABLE_ENTITY,
                ErrorKind::RemoteServer | ErrorKind::Parse => StatusCode::BAD_GATEWAY,
                ErrorKind::Transport => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::Build => StatusCode::INTERNAL_SERVER_ERROR,
            },
            // nginx's "client closed request"
            AppError::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = %self, "Request error");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }

        (status, self.to_string()).into_response()
    }
}

/// Result type alias for the application.
pub type Result<T> = std::result::Result<T, AppError>;
