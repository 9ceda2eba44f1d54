//! Network/endpoint parsing helpers shared across sshtunnel crates.

use std::{error::Error, fmt, str::FromStr};

/// Default SSH port used when a target omits one.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// A `host:port` pair. The host is stored without IPv6 brackets.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port number.
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Parse a strict `host:port` string. IPv6 literals must be bracketed.
    pub fn parse(input: &str) -> Result<Self, EndpointParseError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(EndpointParseError::Empty);
        }
        let (host, port) = if input.starts_with('[') {
            let (host, port) = input.rsplit_once("]:").ok_or(EndpointParseError::MissingPort)?;
            (host.trim_start_matches('['), port)
        } else {
            let (host, port) = input.rsplit_once(':').ok_or(EndpointParseError::MissingPort)?;
            if host.contains(':') {
                return Err(EndpointParseError::UnbracketedIpv6(input.to_string()));
            }
            (host, port)
        };
        if host.is_empty() {
            return Err(EndpointParseError::EmptyHost);
        }
        let port = parse_port(port)?;
        Ok(Self::new(host, port))
    }

    /// Host formatted for use in an address string (IPv6 literals bracketed).
    pub fn host_for_display(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_for_display(), self.port)
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

/// Errors that can occur while parsing an endpoint string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndpointParseError {
    /// The input was empty or only whitespace.
    Empty,
    /// Host portion was empty after parsing.
    EmptyHost,
    /// No `:port` suffix was present.
    MissingPort,
    /// An IPv6 literal was given without brackets.
    UnbracketedIpv6(String),
    /// Port failed to parse into a valid `u16`.
    InvalidPort(String),
}

impl fmt::Display for EndpointParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointParseError::Empty => write!(f, "address must not be empty"),
            EndpointParseError::EmptyHost => write!(f, "address host is missing"),
            EndpointParseError::MissingPort => write!(f, "address must be in host:port form"),
            EndpointParseError::UnbracketedIpv6(value) => write!(f, "IPv6 address must be bracketed: {value}"),
            EndpointParseError::InvalidPort(p) => write!(f, "invalid port: {p}"),
        }
    }
}

impl Error for EndpointParseError {}

/// Parsed SSH destination derived from a `[user@]host[:port]` string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshTarget {
    pub endpoint: Endpoint,
    /// Username inferred from a `user@host` prefix when present.
    pub inferred_username: Option<String>,
}

/// Parse a user-supplied SSH target of the form `[user@]host[:port]`.
///
/// * IPv6 literals must be wrapped in brackets, e.g. `user@[fe80::1]:2222`.
/// * When no port is supplied, the default of 22 is used.
pub fn parse_ssh_target(input: &str) -> Result<SshTarget, EndpointParseError> {
    if input.trim().is_empty() {
        return Err(EndpointParseError::Empty);
    }

    let (username_part, host_part) = match input.trim().rsplit_once('@') {
        Some((user, host)) if !user.is_empty() => (Some(user.to_string()), host),
        Some((_, host)) => (None, host),
        None => (None, input.trim()),
    };

    let endpoint = if host_part.starts_with('[') {
        if host_part.contains("]:") {
            Endpoint::parse(host_part)?
        } else {
            let host = host_part.trim_start_matches('[').trim_end_matches(']');
            Endpoint::new(host, DEFAULT_SSH_PORT)
        }
    } else if let Some((host, port)) = host_part.rsplit_once(':') {
        if host.contains(':') {
            return Err(EndpointParseError::UnbracketedIpv6(input.trim().to_string()));
        }
        Endpoint::new(host, parse_port(port)?)
    } else {
        Endpoint::new(host_part, DEFAULT_SSH_PORT)
    };

    if endpoint.host.is_empty() {
        return Err(EndpointParseError::EmptyHost);
    }

    Ok(SshTarget {
        endpoint,
        inferred_username: username_part,
    })
}

pub(crate) fn parse_port(value: &str) -> Result<u16, EndpointParseError> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|_| EndpointParseError::InvalidPort(value.to_string()))
}

#[cfg(test)]
#[path = "net_tests.rs"]
mod tests;
