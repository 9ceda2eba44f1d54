use std::{net::SocketAddr, sync::Arc};

use tokio::sync::broadcast;

use crate::{TunnelError, forwarding::ForwarderId};

const EVENT_CAPACITY: usize = 256;

/// Observable things that happen inside a running session.
///
/// Per-connection failures are reported here instead of being escalated;
/// subscribers may log, count, or ignore them.
#[derive(Clone, Debug)]
pub enum TunnelEvent {
    /// Transport and listener are up.
    Ready { local: SocketAddr },
    /// A local connection was accepted and registered.
    ConnectionAccepted { id: ForwarderId, peer: SocketAddr },
    /// The channel for an accepted connection could not be opened; the local
    /// connection was closed.
    ChannelOpenFailed {
        id: ForwarderId,
        peer: SocketAddr,
        error: Arc<TunnelError>,
    },
    /// One direction reached end-of-stream and both endpoints were closed.
    ForwarderFinished {
        id: ForwarderId,
        peer: SocketAddr,
        bytes_up: u64,
        bytes_down: u64,
    },
    /// The forwarder stopped because the session is shutting down.
    ForwarderCancelled { id: ForwarderId, peer: SocketAddr },
    /// Copying failed for one forwarder.
    ForwarderFailed {
        id: ForwarderId,
        peer: SocketAddr,
        error: Arc<TunnelError>,
    },
    /// The listener failed outside of shutdown; the session is closing.
    AcceptFailed { error: Arc<std::io::Error> },
    /// Listener and transport are closed.
    Closed,
}

/// Fan-out of [`TunnelEvent`]s. Publishing never blocks and never fails when
/// nobody listens.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: broadcast::Sender<TunnelEvent>,
}

impl EventSink {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub(crate) fn publish(&self, event: TunnelEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.tx.subscribe()
    }
}
