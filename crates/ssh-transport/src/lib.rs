//! SSH implementation of the tunnel transport.
//!
//! [`SshConnector`] dials and authenticates a server with `russh`; the
//! resulting [`SshTransport`] opens one `direct-tcpip` channel per forwarded
//! connection over the shared session.

mod auth;
mod connector;
pub mod crypto;
pub mod error;
mod hostkeys;

pub use connector::{SshConnector, SshOptions, SshTransport};
pub use error::{SshError, SshResult};
