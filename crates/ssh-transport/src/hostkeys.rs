use std::sync::Arc;

use russh::keys::{self, HashAlg, PublicKey};
use tracing::{debug, info, warn};
use tunnel_types::{Endpoint, HostKeyPolicy};

use crate::{SshError, SshResult};

/// Decides whether the key a server presents is trusted.
pub struct HostKeyVerifier {
    server: Endpoint,
    policy: HostKeyPolicy,
}

impl HostKeyVerifier {
    pub fn new(server: Endpoint, policy: HostKeyPolicy) -> Self {
        Self { server, policy }
    }

    pub fn check(&self, server_key: &PublicKey) -> SshResult<bool> {
        let fingerprint = server_key.fingerprint(HashAlg::Sha256).to_string();
        match &self.policy {
            HostKeyPolicy::AcceptAny => {
                warn!(server = %self.server, %fingerprint, "accepting host key without verification");
                Ok(true)
            }
            HostKeyPolicy::Fingerprint(pinned) => {
                if fingerprint_matches(pinned, &fingerprint) {
                    debug!(server = %self.server, %fingerprint, "host key matches pinned fingerprint");
                    Ok(true)
                } else {
                    Err(SshError::HostKey(format!(
                        "{} presented {fingerprint}, expected {pinned}",
                        self.server
                    )))
                }
            }
            HostKeyPolicy::KnownHosts(path) => {
                match keys::check_known_hosts_path(&self.server.host, self.server.port, server_key, path) {
                    Ok(true) => {
                        info!(server = %self.server, "host key verified against {}", path.display());
                        Ok(true)
                    }
                    Ok(false) => Err(SshError::HostKey(format!(
                        "no entry for {} in {} (presented {fingerprint})",
                        self.server,
                        path.display()
                    ))),
                    Err(keys::Error::KeyChanged { line }) => Err(SshError::HostKey(format!(
                        "host key for {} changed; {} line {line} holds a different key (presented {fingerprint})",
                        self.server,
                        path.display()
                    ))),
                    Err(err) => Err(SshError::HostKey(format!("unable to read {}: {err}", path.display()))),
                }
            }
        }
    }
}

/// Accepts pinned values with or without the `SHA256:` prefix.
fn fingerprint_matches(pinned: &str, presented: &str) -> bool {
    let pinned = pinned.trim();
    let bare = |value: &str| value.strip_prefix("SHA256:").unwrap_or(value).to_string();
    !pinned.is_empty() && bare(pinned) == bare(presented)
}

#[derive(Clone)]
pub struct ClientHandler {
    verifier: Arc<HostKeyVerifier>,
}

impl ClientHandler {
    pub fn new(verifier: HostKeyVerifier) -> Self {
        Self {
            verifier: Arc::new(verifier),
        }
    }
}

impl russh::client::Handler for ClientHandler {
    type Error = SshError;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl std::future::Future<Output = std::result::Result<bool, Self::Error>> + Send {
        let verdict = self.verifier.check(server_public_key);
        async move { verdict }
    }
}

#[cfg(test)]
#[path = "hostkeys_tests.rs"]
mod tests;
