use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tunnel_types::{AuthParams, Endpoint};

use crate::TunnelResult;

/// Trait for streams that can carry forwarded bytes.
pub trait ChannelStreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> ChannelStreamIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Type alias for boxed channel streams.
pub type ChannelStream = Box<dyn ChannelStreamIo>;

/// An established, authenticated, multiplexed transport.
///
/// Implementations must allow `open_channel` to be called concurrently from
/// many forwarders through a shared reference.
#[async_trait]
pub trait SecureTransport: Send + Sync + 'static {
    /// Open a logical byte stream to `target`. `origin` is the local peer the
    /// channel is opened on behalf of.
    async fn open_channel(&self, target: &Endpoint, origin: SocketAddr) -> TunnelResult<ChannelStream>;

    /// Close the transport, invalidating every channel derived from it.
    /// Closing twice must not fail.
    async fn close(&self) -> TunnelResult<()>;
}

/// Establishes a [`SecureTransport`] from an address and opaque credentials.
#[async_trait]
pub trait TransportConnector: Send + Sync + 'static {
    type Transport: SecureTransport;

    /// Dial and authenticate. Failures are reported as
    /// [`TunnelError::Dial`](crate::TunnelError::Dial) or
    /// [`TunnelError::Authentication`](crate::TunnelError::Authentication).
    async fn connect(&self, address: &Endpoint, auth: &AuthParams) -> TunnelResult<Self::Transport>;
}
