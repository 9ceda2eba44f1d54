use std::{
    future::Future, net::SocketAddr, pin::Pin, task::{Context, Poll}
};

use tokio::sync::oneshot;

use crate::{TunnelError, TunnelResult};

/// One-shot outcome of [`TunnelSession::open`](super::TunnelSession::open).
///
/// Resolves to the bound local address once the transport and listener are
/// up, or to the establishment error. Not resolved yet means still
/// establishing.
#[must_use = "the readiness signal reports whether the tunnel came up"]
pub struct Readiness {
    rx: oneshot::Receiver<TunnelResult<SocketAddr>>,
}

impl Readiness {
    pub(crate) fn channel() -> (ReadinessSender, Self) {
        let (tx, rx) = oneshot::channel();
        (ReadinessSender { tx }, Self { rx })
    }

    pub(crate) fn resolved(result: TunnelResult<SocketAddr>) -> Self {
        let (tx, readiness) = Self::channel();
        tx.send(result);
        readiness
    }
}

impl Future for Readiness {
    type Output = TunnelResult<SocketAddr>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // a dropped sender means the driver task went away without reporting
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TunnelError::Cancelled)))
    }
}

/// Sending half; consumed on use so the signal is delivered at most once.
pub(crate) struct ReadinessSender {
    tx: oneshot::Sender<TunnelResult<SocketAddr>>,
}

impl ReadinessSender {
    pub(crate) fn send(self, result: TunnelResult<SocketAddr>) {
        let _ = self.tx.send(result);
    }
}
