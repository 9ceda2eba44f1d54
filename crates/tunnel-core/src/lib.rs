//! Local TCP forwarding over an authenticated, multiplexed transport.
//!
//! [`TunnelSession`] owns the lifecycle: it dials the transport through a
//! [`TransportConnector`], binds the local listener, and forwards each
//! accepted connection over its own channel until the session is closed.

pub mod error;
pub mod events;
pub mod forwarding;
pub mod session;
pub mod transport;

pub use error::{TunnelError, TunnelResult};
pub use events::TunnelEvent;
pub use session::{Readiness, SessionState, TunnelSession};
pub use transport::{ChannelStream, ChannelStreamIo, SecureTransport, TransportConnector};
