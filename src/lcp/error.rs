use thiserror::Error;

/// Broad failure classes, used to pick the user-facing outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request could not be built.
    Build,
    /// The remote server could not be reached, timed out, or answered oddly.
    Transport,
    /// The remote server rejected the request (4xx).
    RemoteClient,
    /// The remote server failed (500).
    RemoteServer,
    /// The remote answer was not a usable document.
    Parse,
}

/// Errors raised while talking to the License Server or the LSD server.
#[derive(Error, Debug)]
pub enum LcpError {
    /// Request could not be built or serialized.
    #[error("Invalid license request: {0}")]
    Build(String),

    /// Network level failure (DNS, refused connection, timeout).
    #[error("Failed to reach {endpoint}: {source}")]
    Transport {
        /// Endpoint being called.
        endpoint: String,
        /// Underlying HTTP client error.
        source: reqwest::Error,
    },

    /// Status code that is neither the expected success, a 4xx nor a 500.
    #[error("Unexpected status code {status} from {endpoint}")]
    UnexpectedStatus {
        /// Endpoint being called.
        endpoint: String,
        /// HTTP status received.
        status: u16,
    },

    /// The remote server refused the request.
    #[error("The License Server rejected the request ({status}): {detail}")]
    Client {
        /// HTTP status received.
        status: u16,
        /// Detail reported by the server.
        detail: String,
    },

    /// The remote server failed while handling the request.
    #[error("The License Server failed ({status}), try again later")]
    Server {
        /// HTTP status received.
        status: u16,
    },

    /// Body was not valid JSON for the expected document.
    #[error("Malformed {document} document ({body_len} bytes): {source}")]
    Parse {
        /// Kind of document being parsed.
        document: &'static str,
        /// Size of the offending body.
        body_len: usize,
        /// JSON error.
        source: serde_json::Error,
    },

    /// License parsed but carries no identifier.
    #[error("License document has no id")]
    MissingId,
}

impl LcpError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LcpError::Build(_) => ErrorKind::Build,
            LcpError::Transport { .. } | LcpError::UnexpectedStatus { .. } => ErrorKind::Transport,
            LcpError::Client { .. } => ErrorKind::RemoteClient,
            LcpError::Server { .. } => ErrorKind::RemoteServer,
            LcpError::Parse { .. } | LcpError::MissingId => ErrorKind::Parse,
        }
    }
}
