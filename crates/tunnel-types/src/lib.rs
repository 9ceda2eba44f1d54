//! Shared type definitions for sshtunnel.
//!
//! These types stay dependency-light so the CLI, the tunnel runtime, and the
//! SSH adapter can share them without pulling in protocol implementations.

pub mod config;
pub mod forward;
pub mod net;

pub use config::{AuthParams, ConfigError, HostKeyPolicy, TunnelConfig, ValidatedTargets};
pub use forward::{LocalForward, parse_local_forward};
pub use net::{Endpoint, EndpointParseError, SshTarget, parse_ssh_target};
