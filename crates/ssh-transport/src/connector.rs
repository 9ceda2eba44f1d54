use std::{
    net::SocketAddr, sync::{
        Arc, atomic::{AtomicBool, Ordering}
    }, time::Duration
};

use async_trait::async_trait;
use russh::{
    Disconnect,
    client::{self, Handle},
};
use tracing::{debug, info, warn};
use tunnel_core::{ChannelStream, SecureTransport, TransportConnector, TunnelError, TunnelResult};
use tunnel_types::{AuthParams, Endpoint};

use crate::{
    SshError, SshResult,
    auth::authenticate,
    crypto::preferred_algorithms,
    hostkeys::{ClientHandler, HostKeyVerifier},
};

/// Connection tuning for the SSH client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshOptions {
    pub keepalive_interval: Option<Duration>,
    /// Unanswered keepalives tolerated before the connection is dropped.
    pub keepalive_max: usize,
    pub inactivity_timeout: Option<Duration>,
    /// Allow SHA-1 key exchange and CBC ciphers for old servers.
    pub legacy_crypto: bool,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            inactivity_timeout: None,
            legacy_crypto: false,
        }
    }
}

impl SshOptions {
    fn client_config(&self) -> client::Config {
        if self.legacy_crypto {
            warn!("legacy crypto enabled: SHA-1 key exchange and CBC ciphers are allowed");
        }
        client::Config {
            preferred: preferred_algorithms(self.legacy_crypto),
            nodelay: true,
            inactivity_timeout: self.inactivity_timeout,
            keepalive_interval: self.keepalive_interval,
            keepalive_max: self.keepalive_max,
            ..Default::default()
        }
    }
}

/// Dials SSH servers and authenticates with [`AuthParams`].
pub struct SshConnector {
    config: Arc<client::Config>,
}

impl SshConnector {
    pub fn new(options: SshOptions) -> Self {
        Self {
            config: Arc::new(options.client_config()),
        }
    }

    async fn establish(&self, address: &Endpoint, auth: &AuthParams) -> SshResult<SshTransport> {
        if !auth.has_methods() {
            return Err(SshError::AuthFailed(
                "no authentication methods configured; supply an identity, an agent socket, or a password".to_string(),
            ));
        }

        let handler = ClientHandler::new(HostKeyVerifier::new(address.clone(), auth.host_key.clone()));
        info!(server = %address, user = %auth.username, "connecting");
        let mut handle = client::connect(Arc::clone(&self.config), (address.host.as_str(), address.port), handler).await?;

        if let Err(err) = authenticate(&mut handle, auth).await {
            let _ = handle.disconnect(Disconnect::ByApplication, "", "").await;
            return Err(err);
        }

        Ok(SshTransport {
            server: address.clone(),
            handle: Arc::new(handle),
            closed: AtomicBool::new(false),
        })
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new(SshOptions::default())
    }
}

#[async_trait]
impl TransportConnector for SshConnector {
    type Transport = SshTransport;

    async fn connect(&self, address: &Endpoint, auth: &AuthParams) -> TunnelResult<SshTransport> {
        self.establish(address, auth)
            .await
            .map_err(|err| err.into_tunnel_error(address))
    }
}

/// An authenticated SSH session shared by every forwarder of a tunnel.
pub struct SshTransport {
    server: Endpoint,
    handle: Arc<Handle<ClientHandler>>,
    closed: AtomicBool,
}

impl SshTransport {
    pub fn server(&self) -> &Endpoint {
        &self.server
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.handle.is_closed()
    }
}

#[async_trait]
impl SecureTransport for SshTransport {
    async fn open_channel(&self, target: &Endpoint, origin: SocketAddr) -> TunnelResult<ChannelStream> {
        debug!(%target, %origin, "opening direct-tcpip channel");
        let channel = self
            .handle
            .channel_open_direct_tcpip(target.host.clone(), target.port.into(), origin.ip().to_string(), origin.port().into())
            .await
            .map_err(|err| TunnelError::dial(target, SshError::from(err)))?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) -> TunnelResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(server = %self.server, "disconnecting");
        match self.handle.disconnect(Disconnect::ByApplication, "", "").await {
            Ok(()) => Ok(()),
            // the session task already ended; nothing left to close
            Err(_) if self.handle.is_closed() => Ok(()),
            Err(err) => Err(TunnelError::dial(&self.server, SshError::from(err))),
        }
    }
}
