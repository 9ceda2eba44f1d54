use thiserror::Error;
use tunnel_core::TunnelError;
use tunnel_types::Endpoint;

/// Errors that can occur while talking SSH
#[derive(Error, Debug)]
pub enum SshError {
    /// SSH protocol error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server's host key was not trusted
    #[error("host key verification failed: {0}")]
    HostKey(String),

    /// Every configured method was rejected
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// A private key could not be loaded
    #[error("unusable private key: {0}")]
    Key(String),
}

/// Result type alias for SSH transport operations
pub type SshResult<T> = Result<T, SshError>;

impl SshError {
    /// True when the server or its credentials were refused, as opposed to the
    /// connection itself failing.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            SshError::HostKey(_) | SshError::AuthFailed(_) | SshError::Key(_) | SshError::Ssh(russh::Error::UnknownKey)
        )
    }

    /// Map onto the tunnel error taxonomy for a connection to `address`.
    pub fn into_tunnel_error(self, address: &Endpoint) -> TunnelError {
        if self.is_auth_failure() {
            TunnelError::auth(self.to_string())
        } else {
            TunnelError::dial(address, self)
        }
    }
}
