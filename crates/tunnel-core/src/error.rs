use thiserror::Error;
use tunnel_types::ConfigError;

use crate::forwarding::ForwarderId;

/// Errors produced while establishing or running a tunnel.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Malformed configuration, detected before any network activity.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Credentials or host identity were rejected.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Transport establishment or channel open failed.
    #[error("failed to dial {address}: {reason}")]
    Dial { address: String, reason: String },

    /// Local listener could not be bound.
    #[error("failed to listen on {address}: {source}")]
    Listen {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Byte copying failed for one forwarded connection.
    #[error("forwarder {id} failed: {source}")]
    Forward {
        id: ForwarderId,
        #[source]
        source: std::io::Error,
    },

    /// `open()` was called on a session that already left `Created`.
    #[error("session has already been opened")]
    AlreadyOpened,

    /// The session was closed before establishment finished.
    #[error("session was closed before it became ready")]
    Cancelled,
}

/// Result type alias for tunnel operations
pub type TunnelResult<T> = Result<T, TunnelError>;

impl TunnelError {
    /// Create a dial error for `address`
    pub fn dial(address: impl ToString, reason: impl ToString) -> Self {
        Self::Dial {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create an authentication error
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Authentication(message.into())
    }

    /// True for the kinds that abort session establishment. A `Dial` raised
    /// while opening a per-connection channel is only logged.
    pub fn is_establishment_error(&self) -> bool {
        matches!(
            self,
            TunnelError::Config(_) | TunnelError::Authentication(_) | TunnelError::Dial { .. } | TunnelError::Listen { .. }
        )
    }
}
