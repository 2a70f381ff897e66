//! Common error types for chasm.

use std::fmt;

use thiserror::Error;

/// Remote primitive that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOp {
    Put,
    Delete,
    List,
    Download,
    AccountInfo,
}

impl fmt::Display for RemoteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemoteOp::Put => "put",
            RemoteOp::Delete => "delete",
            RemoteOp::List => "list",
            RemoteOp::Download => "download",
            RemoteOp::AccountInfo => "account info",
        };
        f.write_str(name)
    }
}

/// Top-level error type for store operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The operator could not supply an authorization code.
    #[error("Authorization handshake failed: {0}")]
    AuthHandshake(String),

    /// The authorization code could not be exchanged for an access token.
    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    /// The authenticated account's identity could not be fetched.
    #[error("Unable to get account information: {0}")]
    AccountLookup(String),

    /// The account is already registered.
    #[error("Account for {display_name} already exists")]
    DuplicateAccount { display_name: String },

    /// A remote primitive was rejected by the backend.
    #[error("Remote {op} failed: {message}")]
    Remote { op: RemoteOp, message: String },

    /// Transport-level failure talking to a backend.
    #[error("Network error: {0}")]
    Network(String),

    /// A remote call did not complete within its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The local restore staging area could not be prepared.
    #[error("Staging error: {0}")]
    Staging(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The store has no access token yet.
    #[error("Store is not set up: {0}")]
    NotBound(String),
}

impl Error {
    /// Shorthand for a [`Error::Remote`] failure.
    pub fn remote(op: RemoteOp, message: impl Into<String>) -> Self {
        Error::Remote {
            op,
            message: message.into(),
        }
    }

    /// Whether the failure is transient and worth another attempt.
    ///
    /// Only transport failures and elapsed deadlines qualify. Local I/O
    /// errors, operator-driven failures and backend rejections are
    /// reported once.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(Error::Network("reset".to_string()).is_retryable());
        assert!(Error::Timeout("put".to_string()).is_retryable());
        assert!(!Error::AuthHandshake("eof".to_string()).is_retryable());
        assert!(!Error::DuplicateAccount {
            display_name: "Ada".to_string()
        }
        .is_retryable());
        assert!(!Error::remote(RemoteOp::Put, "quota").is_retryable());
        assert!(!Error::Io(std::io::Error::new(
            std::io::ErrorKind::StorageFull,
            "no space left on device"
        ))
        .is_retryable());
    }

    #[test]
    fn test_duplicate_message_names_account() {
        let err = Error::DuplicateAccount {
            display_name: "Ada Lovelace".to_string(),
        };
        assert_eq!(err.to_string(), "Account for Ada Lovelace already exists");
    }

    #[test]
    fn test_remote_message_names_operation() {
        let err = Error::remote(RemoteOp::Download, "path/not_found");
        assert_eq!(err.to_string(), "Remote download failed: path/not_found");
    }
}
