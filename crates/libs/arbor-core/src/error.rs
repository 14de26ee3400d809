use arbor_transport::TransportError;
use arbor_wire::codes;

/// Domain error carrying its wire response code.
///
/// The dispatcher serializes these verbatim: the variant decides the response
/// code, the display string becomes the response payload. Anything that is
/// not a `CoreError` by the time it reaches the dispatcher is an internal
/// error (500) by definition.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Address does not resolve (404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Verb not valid for the node kind, or malformed request shape (400).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Payload present but fails validation (422).
    #[error("data invalid: {0}")]
    DataInvalid(String),

    /// Access denied (401).
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// A lock could not be acquired within its timeout (423).
    #[error("locked: {0}")]
    Locked(String),

    /// Element, link or mirror already exists (901).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The node's own contract logic failed (550).
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// Operation recognized but not implemented (501).
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Target temporarily not available (503).
    #[error("not available: {0}")]
    NotAvailable(String),

    /// Execution exceeded its timeout (504).
    #[error("execution timeout: {0}")]
    ExecutionTimeout(String),

    /// A proxied call's remote peer answered with an error code; carried
    /// locally with the remote's code and message unchanged.
    #[error("remote error {code}: {message}")]
    Remote { code: u16, message: String },

    /// Unanticipated failure (500).
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// The wire response code for this error.
    pub fn code(&self) -> u16 {
        match self {
            Self::NotFound(_) => codes::NOT_FOUND,
            Self::InvalidRequest(_) => codes::BAD_REQUEST,
            Self::DataInvalid(_) => codes::DATA_INVALID,
            Self::AccessDenied(_) => codes::ACCESS_DENIED,
            Self::Locked(_) => codes::LOCKED,
            Self::AlreadyExists(_) => codes::ALREADY_EXISTS,
            Self::ExecutionFailed(_) => codes::EXECUTION_FAILED,
            Self::NotImplemented(_) => codes::NOT_IMPLEMENTED,
            Self::NotAvailable(_) => codes::NOT_AVAILABLE,
            Self::ExecutionTimeout(_) => codes::EXECUTION_TIMEOUT,
            Self::Remote { code, .. } => *code,
            Self::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Reconstructs the error a remote peer serialized into a response.
    pub fn from_response(code: u16, message: String) -> Self {
        Self::Remote { code, message }
    }
}

impl From<TransportError> for CoreError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout { uri } => {
                Self::ExecutionTimeout(format!("request to '{uri}' timed out"))
            }
            other => Self::Internal(other.to_string()),
        }
    }
}
