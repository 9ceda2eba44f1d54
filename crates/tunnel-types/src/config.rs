//! Tunnel configuration passed explicitly to each session.
use std::{error::Error, fmt, path::PathBuf, time::Duration};

use secrecy::SecretString;

use crate::net::{Endpoint, EndpointParseError};

/// Default bound on establishing the secure transport.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Immutable description of one tunnel.
///
/// Addresses are kept as the caller supplied them and validated when the
/// session opens, so malformed input is reported through the readiness signal.
#[derive(Clone, Debug)]
pub struct TunnelConfig {
    /// SSH server, `host:port`.
    pub ssh_address: String,
    /// Address reached from the SSH server, `host:port`.
    pub remote_address: String,
    /// Local listener, `host:port` (port `0` picks an ephemeral port).
    pub local_address: String,
    /// Credentials handed to the transport connector untouched.
    pub auth: AuthParams,
    /// Upper bound on transport establishment.
    pub connect_timeout: Duration,
}

impl TunnelConfig {
    pub fn new(
        ssh_address: impl Into<String>,
        remote_address: impl Into<String>,
        local_address: impl Into<String>,
        auth: AuthParams,
    ) -> Self {
        Self {
            ssh_address: ssh_address.into(),
            remote_address: remote_address.into(),
            local_address: local_address.into(),
            auth,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Parse every address, naming the first field that is malformed.
    pub fn validate(&self) -> Result<ValidatedTargets, ConfigError> {
        let ssh = Endpoint::parse(&self.ssh_address).map_err(|source| ConfigError::new("ssh address", source))?;
        let remote =
            Endpoint::parse(&self.remote_address).map_err(|source| ConfigError::new("remote address", source))?;
        let local = Endpoint::parse(&self.local_address).map_err(|source| ConfigError::new("local address", source))?;
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "connect timeout",
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(ValidatedTargets { ssh, remote, local })
    }
}

/// Parsed addresses of a validated [`TunnelConfig`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedTargets {
    pub ssh: Endpoint,
    pub remote: Endpoint,
    pub local: Endpoint,
}

/// Credentials and server-identity policy for the SSH transport.
#[derive(Clone, Debug)]
pub struct AuthParams {
    pub username: String,
    pub password: Option<SecretString>,
    /// Private key files tried in order.
    pub identities: Vec<PathBuf>,
    /// SSH agent socket, usually taken from `SSH_AUTH_SOCK`.
    pub agent_socket: Option<PathBuf>,
    pub host_key: HostKeyPolicy,
}

impl AuthParams {
    pub fn new(username: impl Into<String>, host_key: HostKeyPolicy) -> Self {
        Self {
            username: username.into(),
            password: None,
            identities: Vec::new(),
            agent_socket: None,
            host_key,
        }
    }

    pub fn with_password(mut self, password: SecretString) -> Self {
        self.password = Some(password);
        self
    }

    pub fn with_identity(mut self, path: impl Into<PathBuf>) -> Self {
        self.identities.push(path.into());
        self
    }

    pub fn with_agent(mut self, socket: impl Into<PathBuf>) -> Self {
        self.agent_socket = Some(socket.into());
        self
    }

    /// Returns true when at least one authentication method is configured.
    pub fn has_methods(&self) -> bool {
        self.password.is_some() || !self.identities.is_empty() || self.agent_socket.is_some()
    }
}

/// How the SSH server's host key is verified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept any key. Only for tests and throwaway hosts.
    AcceptAny,
    /// Accept only the key with this `SHA256:` fingerprint.
    Fingerprint(String),
    /// Look the key up in an OpenSSH `known_hosts` file.
    KnownHosts(PathBuf),
}

/// A configuration value failed validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// An address field did not parse.
    Address {
        field: &'static str,
        source: EndpointParseError,
    },
    /// A non-address field holds an unusable value.
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    fn new(field: &'static str, source: EndpointParseError) -> Self {
        Self::Address { field, source }
    }

    pub fn field(&self) -> &'static str {
        match self {
            ConfigError::Address { field, .. } | ConfigError::Invalid { field, .. } => field,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Address { field, source } => write!(f, "invalid {field}: {source}"),
            ConfigError::Invalid { field, message } => write!(f, "invalid {field}: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConfigError::Address { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
