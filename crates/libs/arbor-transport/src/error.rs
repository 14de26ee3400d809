/// Errors surfaced by client transports and the registry.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("no client factory registered for scheme '{0}'")]
    UnknownScheme(String),

    #[error("invalid uri '{0}'")]
    InvalidUri(String),

    #[error("peer unreachable at '{uri}': {reason}")]
    Unreachable { uri: String, reason: String },

    #[error("request to '{uri}' timed out")]
    Timeout { uri: String },

    #[error("send failed: {0}")]
    Send(String),
}
