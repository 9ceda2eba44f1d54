use std::fmt;

use crate::net::{Endpoint, EndpointParseError, parse_port};

/// Default local bind host when a forward spec omits one.
pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";

/// Local TCP forward specification: listen on `bind`, reach `target` through the tunnel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalForward {
    pub bind: Endpoint,
    pub target: Endpoint,
}

impl fmt::Display for LocalForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local {} -> {}", self.bind, self.target)
    }
}

/// Parse an OpenSSH style local forward.
///
/// Format: `[bind_address:]port:host:hostport`
pub fn parse_local_forward(spec: &str) -> Result<LocalForward, EndpointParseError> {
    let fields = split_colon_parts(spec);
    let (bind_host, bind_port, target_host, target_port) = match fields.as_slice() {
        [bind, port, host, hostport] => (normalize_host(bind), port, host, hostport),
        [port, host, hostport] => (None, port, host, hostport),
        _ => return Err(EndpointParseError::MissingPort),
    };
    let target_host = normalize_host(target_host).ok_or(EndpointParseError::EmptyHost)?;
    Ok(LocalForward {
        bind: Endpoint::new(
            bind_host.unwrap_or_else(|| DEFAULT_BIND_HOST.to_string()),
            parse_port(bind_port)?,
        ),
        target: Endpoint::new(target_host, parse_port(target_port)?),
    })
}

fn normalize_host(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    let no_brackets = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .map(|inner| inner.to_string());
    no_brackets.or_else(|| Some(trimmed.to_string()))
}

fn split_colon_parts(input: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut bracket_depth = 0;
    for ch in input.chars() {
        match ch {
            ':' if bracket_depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            '[' => {
                bracket_depth += 1;
                current.push(ch);
            }
            ']' => {
                if bracket_depth > 0 {
                    bracket_depth -= 1;
                }
                current.push(ch);
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        parts.push(current.trim().to_string());
    }
    parts.into_iter().filter(|p| !p.is_empty()).collect()
}
