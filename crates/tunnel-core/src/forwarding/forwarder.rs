use std::net::SocketAddr;

use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::ForwarderId;
use crate::{TunnelError, TunnelResult, transport::ChannelStreamIo};

const COPY_BUF_SIZE: usize = 16 * 1024;

/// How a forwarder stopped when it did not fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// One direction reached end-of-stream and both endpoints were closed.
    Completed { bytes_up: u64, bytes_down: u64 },
    /// The session cancelled the forwarder; pending bytes were dropped.
    Cancelled,
}

/// Duplex byte pump between a local connection and a transport channel.
///
/// Ownership of both endpoints moves into [`run`](Self::run), so each is
/// closed exactly once when it returns.
pub struct ConnectionForwarder<L, R> {
    id: ForwarderId,
    peer: SocketAddr,
    local: L,
    remote: R,
}

impl<L, R> ConnectionForwarder<L, R>
where
    L: ChannelStreamIo,
    R: ChannelStreamIo,
{
    pub fn new(id: ForwarderId, peer: SocketAddr, local: L, remote: R) -> Self {
        Self { id, peer, local, remote }
    }

    pub fn id(&self) -> ForwarderId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Copy until one direction finishes, one fails, or `cancel` fires.
    ///
    /// End-of-stream on either side shuts down the opposite writer and then
    /// closes both endpoints; the other direction is not drained. An I/O
    /// error in either direction stops both.
    pub async fn run(self, cancel: &CancellationToken) -> TunnelResult<ForwardOutcome> {
        let Self { id, local, remote, .. } = self;
        let (mut local_rd, mut local_wr) = io::split(local);
        let (mut remote_rd, mut remote_wr) = io::split(remote);
        let mut bytes_up = 0u64;
        let mut bytes_down = 0u64;

        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = pump(&mut local_rd, &mut remote_wr, &mut bytes_up) => Some(result.map(|()| "local")),
            result = pump(&mut remote_rd, &mut local_wr, &mut bytes_down) => Some(result.map(|()| "remote")),
        };
        // endpoints drop here, closing whichever side is still open

        match finished {
            None => {
                trace!(%id, bytes_up, bytes_down, "forwarder cancelled");
                Ok(ForwardOutcome::Cancelled)
            }
            Some(Ok(side)) => {
                trace!(%id, closed_by = side, "end of stream; closing both endpoints");
                Ok(ForwardOutcome::Completed { bytes_up, bytes_down })
            }
            Some(Err(source)) => Err(TunnelError::Forward { id, source }),
        }
    }
}

/// Copy `reader` into `writer` until end-of-stream, counting bytes as they
/// are written so a partial direction still reports its total.
async fn pump<Rd, Wr>(reader: &mut Rd, writer: &mut Wr, copied: &mut u64) -> io::Result<()>
where
    Rd: AsyncRead + Unpin,
    Wr: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        *copied += n as u64;
    }
    // peer may already be gone; what was written is what counts
    let _ = writer.shutdown().await;
    Ok(())
}

#[cfg(test)]
#[path = "forwarder_tests.rs"]
mod tests;
