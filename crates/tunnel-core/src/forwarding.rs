//! Per-connection forwarding.
//!
//! A [`ConnectionForwarder`] pairs one accepted local connection with one
//! channel opened over the transport and copies bytes both ways. The
//! [`ForwarderRegistry`] tracks which forwarders are alive so the session can
//! report on them and wait for them during shutdown.

mod forwarder;
mod registry;

pub use forwarder::{ConnectionForwarder, ForwardOutcome};
pub use registry::{ForwarderId, ForwarderInfo, ForwarderRegistry, Registration};
