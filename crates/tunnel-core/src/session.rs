//! Tunnel session lifecycle.
//!
//! `Created → Establishing → Ready → ShuttingDown → Closed`, with `Failed`
//! reachable only from `Establishing`. One driver task establishes the
//! transport and listener, reports readiness, then runs the accept loop.
//! Every accepted connection gets its own forwarder task; all of them share a
//! single [`CancellationToken`] so shutdown reaches every one.

use std::{
    fmt, net::SocketAddr, sync::{Arc, Mutex, PoisonError}
};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, watch},
    time,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error, info, info_span, warn};
use tunnel_types::{Endpoint, TunnelConfig, ValidatedTargets};

use crate::{
    TunnelError, TunnelResult,
    events::{EventSink, TunnelEvent},
    forwarding::{ConnectionForwarder, ForwardOutcome, ForwarderInfo, ForwarderRegistry, Registration},
    transport::{SecureTransport, TransportConnector},
};

mod readiness;

pub use readiness::Readiness;
use readiness::ReadinessSender;

/// Lifecycle state of a [`TunnelSession`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Establishing,
    Ready,
    ShuttingDown,
    Closed,
    Failed,
}

impl SessionState {
    /// `Closed` and `Failed` are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Created => "created",
            SessionState::Establishing => "establishing",
            SessionState::Ready => "ready",
            SessionState::ShuttingDown => "shutting-down",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// A local listener forwarding every accepted connection through a secure
/// transport to one remote address.
///
/// Cloning is cheap and every clone controls the same session, so `close()`
/// may be called from any task.
pub struct TunnelSession<C: TransportConnector> {
    inner: Arc<SessionInner<C>>,
}

impl<C: TransportConnector> Clone for TunnelSession<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct SessionInner<C: TransportConnector> {
    config: TunnelConfig,
    connector: C,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    registry: ForwarderRegistry,
    events: EventSink,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<C: TransportConnector> TunnelSession<C> {
    pub fn new(config: TunnelConfig, connector: C) -> Self {
        let (state, _) = watch::channel(SessionState::Created);
        Self {
            inner: Arc::new(SessionInner {
                config,
                connector,
                state,
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                registry: ForwarderRegistry::new(),
                events: EventSink::new(),
                local_addr: Mutex::new(None),
            }),
        }
    }

    /// Start establishing the tunnel in the background.
    ///
    /// Must be called from within a Tokio runtime. Only the first call has an
    /// effect; later calls resolve to [`TunnelError::AlreadyOpened`].
    pub fn open(&self) -> Readiness {
        let started = self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Created {
                *state = SessionState::Establishing;
                true
            } else {
                false
            }
        });
        if !started {
            return Readiness::resolved(Err(TunnelError::AlreadyOpened));
        }

        let (ready, readiness) = Readiness::channel();
        let inner = Arc::clone(&self.inner);
        let span = info_span!("tunnel", ssh = %self.inner.config.ssh_address, remote = %self.inner.config.remote_address);
        self.inner.tracker.spawn(inner.drive(ready).instrument(span));
        readiness
    }

    /// Shut the session down and wait until the listener and transport are
    /// closed and every forwarder has stopped.
    ///
    /// Safe to call repeatedly and from several tasks at once. A no-op on a
    /// session that was never opened.
    pub async fn close(&self) {
        let initiated = self.inner.state.send_if_modified(|state| match state {
            SessionState::Establishing | SessionState::Ready => {
                *state = SessionState::ShuttingDown;
                true
            }
            _ => false,
        });
        if initiated {
            info!(active = self.inner.registry.len(), "closing tunnel");
            self.inner.cancel.cancel();
        } else if self.state() == SessionState::Created {
            return;
        }
        // the session may have shut itself down with forwarders still draining
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the session reaches `Closed` or `Failed`.
    ///
    /// Never resolves for a session that is never opened.
    pub async fn terminated(&self) -> SessionState {
        let mut rx = self.inner.state.subscribe();
        match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    /// Subscribe to runtime events. Events published before subscribing are
    /// not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.events.subscribe()
    }

    /// Bound listener address while the session is ready.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forwarders that are currently running.
    pub fn active_forwarders(&self) -> Vec<ForwarderInfo> {
        self.inner.registry.snapshot()
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.inner.config
    }
}

impl<C: TransportConnector> SessionInner<C> {
    async fn drive(self: Arc<Self>, ready: ReadinessSender) {
        let (transport, listener, targets) = match self.establish().await {
            Ok(parts) => parts,
            Err(err) => {
                self.finish_establishment_failure();
                warn!(error = %err, "tunnel establishment failed");
                ready.send(Err(err));
                return;
            }
        };

        let local = match listener.local_addr() {
            Ok(local) => local,
            Err(source) => {
                close_transport(&transport).await;
                self.finish_establishment_failure();
                ready.send(Err(TunnelError::Listen {
                    address: targets.local.to_string(),
                    source,
                }));
                return;
            }
        };

        self.set_local_addr(Some(local));
        let became_ready = self.state.send_if_modified(|state| {
            if *state == SessionState::Establishing {
                *state = SessionState::Ready;
                true
            } else {
                false
            }
        });
        if !became_ready {
            // close() landed between binding and going live
            drop(listener);
            close_transport(&transport).await;
            self.set_local_addr(None);
            self.state.send_replace(SessionState::Closed);
            self.events.publish(TunnelEvent::Closed);
            ready.send(Err(TunnelError::Cancelled));
            return;
        }

        info!(%local, target = %targets.remote, "tunnel ready");
        self.events.publish(TunnelEvent::Ready { local });
        ready.send(Ok(local));

        let transport = Arc::new(transport);
        self.accept_loop(listener, &transport, &targets.remote).await;

        // the loop may also end on a listener failure; shut down the same way
        self.state.send_if_modified(|state| {
            if *state == SessionState::Ready {
                *state = SessionState::ShuttingDown;
                true
            } else {
                false
            }
        });
        self.cancel.cancel();
        close_transport(transport.as_ref()).await;
        self.set_local_addr(None);
        self.state.send_replace(SessionState::Closed);
        self.events.publish(TunnelEvent::Closed);
        info!("tunnel closed");
    }

    async fn establish(&self) -> TunnelResult<(C::Transport, TcpListener, ValidatedTargets)> {
        let targets = self.config.validate()?;
        let timeout = self.config.connect_timeout;

        debug!(ssh = %targets.ssh, "dialing transport");
        let connect = time::timeout(timeout, self.connector.connect(&targets.ssh, &self.config.auth));
        let transport = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TunnelError::Cancelled),
            connected = connect => match connected {
                Ok(result) => result?,
                Err(_) => return Err(TunnelError::dial(&targets.ssh, format!("timed out after {timeout:?}"))),
            },
        };

        let bind = TcpListener::bind((targets.local.host.as_str(), targets.local.port));
        let bound = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            bound = bind => Some(bound),
        };
        match bound {
            Some(Ok(listener)) => Ok((transport, listener, targets)),
            Some(Err(source)) => {
                close_transport(&transport).await;
                Err(TunnelError::Listen {
                    address: targets.local.to_string(),
                    source,
                })
            }
            None => {
                close_transport(&transport).await;
                Err(TunnelError::Cancelled)
            }
        }
    }

    async fn accept_loop(&self, listener: TcpListener, transport: &Arc<C::Transport>, target: &Endpoint) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => self.spawn_forwarder(stream, peer, Arc::clone(transport), target.clone()),
                Err(err) => {
                    error!(error = %err, "local listener failed; shutting tunnel down");
                    self.events.publish(TunnelEvent::AcceptFailed { error: Arc::new(err) });
                    break;
                }
            }
        }
    }

    fn spawn_forwarder(&self, stream: TcpStream, peer: SocketAddr, transport: Arc<C::Transport>, target: Endpoint) {
        let registration = self.registry.register(peer, target.clone());
        let id = registration.id();
        debug!(%id, %peer, "accepted local connection");
        self.events.publish(TunnelEvent::ConnectionAccepted { id, peer });

        let task = forward_connection(
            registration,
            stream,
            peer,
            transport,
            target,
            self.cancel.clone(),
            self.events.clone(),
        );
        self.tracker.spawn(task.instrument(info_span!("forward", %id, %peer)));
    }

    /// `Failed` while still establishing; `Closed` once `close()` has begun.
    fn finish_establishment_failure(&self) {
        self.state.send_modify(|state| {
            *state = if *state == SessionState::Establishing {
                SessionState::Failed
            } else {
                SessionState::Closed
            };
        });
    }

    fn set_local_addr(&self, addr: Option<SocketAddr>) {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = addr;
    }
}

async fn forward_connection<T: SecureTransport>(
    registration: Registration,
    stream: TcpStream,
    peer: SocketAddr,
    transport: Arc<T>,
    target: Endpoint,
    cancel: CancellationToken,
    events: EventSink,
) {
    let id = registration.id();
    stream.set_nodelay(true).ok();

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        opened = transport.open_channel(&target, peer) => Some(opened),
    };
    let channel = match opened {
        Some(Ok(channel)) => channel,
        Some(Err(err)) => {
            warn!(error = %err, "channel open failed; dropping local connection");
            drop(stream);
            drop(registration);
            events.publish(TunnelEvent::ChannelOpenFailed {
                id,
                peer,
                error: Arc::new(err),
            });
            return;
        }
        None => {
            drop(registration);
            events.publish(TunnelEvent::ForwarderCancelled { id, peer });
            return;
        }
    };

    let result = ConnectionForwarder::new(id, peer, stream, channel).run(&cancel).await;
    drop(registration);
    let event = match result {
        Ok(ForwardOutcome::Completed { bytes_up, bytes_down }) => {
            debug!(bytes_up, bytes_down, "forwarded connection finished");
            TunnelEvent::ForwarderFinished {
                id,
                peer,
                bytes_up,
                bytes_down,
            }
        }
        Ok(ForwardOutcome::Cancelled) => {
            debug!("forwarded connection cancelled");
            TunnelEvent::ForwarderCancelled { id, peer }
        }
        Err(err) => {
            warn!(error = %err, "forwarded connection failed");
            TunnelEvent::ForwarderFailed {
                id,
                peer,
                error: Arc::new(err),
            }
        }
    };
    events.publish(event);
}

async fn close_transport<T: SecureTransport>(transport: &T) {
    if let Err(err) = transport.close().await {
        warn!(error = %err, "transport did not close cleanly");
    }
}

#[cfg(test)]
#[path = "session/session_tests.rs"]
mod tests;
