use std::{path::Path, sync::Arc};

use russh::{
    MethodSet,
    client::{AuthResult, Handle},
    keys::{self, HashAlg, PrivateKeyWithHashAlg},
};
use secrecy::{ExposeSecret, SecretString};
use tokio::fs;
use tracing::{debug, info, warn};
use tunnel_types::AuthParams;

use crate::{SshError, SshResult, hostkeys::ClientHandler};

/// Try every configured method in order: identity files, agent, password.
pub async fn authenticate(session: &mut Handle<ClientHandler>, auth: &AuthParams) -> SshResult<()> {
    let methods = auth_methods(auth).await?;
    if methods.is_empty() {
        return Err(SshError::AuthFailed(
            "no authentication methods configured; supply an identity, an agent socket, or a password".to_string(),
        ));
    }

    let rsa_hash_hint = session.best_supported_rsa_hash().await.unwrap_or(None).flatten();

    for method in methods {
        let label = method.label();
        match method.authenticate(session, &auth.username, rsa_hash_hint).await {
            Ok(result) if result.success() => {
                info!(method = label, user = %auth.username, "authentication succeeded");
                return Ok(());
            }
            Ok(_) => warn!(method = label, "authentication rejected by server"),
            Err(err) => warn!(method = label, error = %err, "authentication attempt failed"),
        }
    }

    Err(SshError::AuthFailed(format!(
        "server rejected every method for user {}",
        auth.username
    )))
}

async fn auth_methods(auth: &AuthParams) -> SshResult<Vec<AuthMethod>> {
    let mut methods = Vec::new();
    if !auth.identities.is_empty() {
        let mut keys = Vec::with_capacity(auth.identities.len());
        for path in &auth.identities {
            keys.push(Arc::new(load_private_key(path).await?));
        }
        methods.push(AuthMethod::PublicKeys(keys));
    }
    if let Some(socket) = &auth.agent_socket {
        methods.push(AuthMethod::Agent {
            socket: socket.clone(),
        });
    }
    if let Some(password) = &auth.password {
        methods.push(AuthMethod::Password(password.clone()));
    }
    Ok(methods)
}

enum AuthMethod {
    PublicKeys(Vec<Arc<keys::PrivateKey>>),
    Agent { socket: std::path::PathBuf },
    Password(SecretString),
}

impl AuthMethod {
    fn label(&self) -> &'static str {
        match self {
            AuthMethod::PublicKeys(_) => "publickey",
            AuthMethod::Agent { .. } => "agent",
            AuthMethod::Password(_) => "password",
        }
    }

    async fn authenticate(
        &self,
        session: &mut Handle<ClientHandler>,
        username: &str,
        rsa_hint: Option<HashAlg>,
    ) -> SshResult<AuthResult> {
        match self {
            AuthMethod::PublicKeys(keys) => authenticate_public_keys(session, username, keys, rsa_hint).await,
            AuthMethod::Agent { socket } => authenticate_via_agent(session, username, socket, rsa_hint).await,
            AuthMethod::Password(password) => session
                .authenticate_password(username.to_string(), password.expose_secret().to_string())
                .await
                .map_err(Into::into),
        }
    }
}

/// Load an unencrypted OpenSSH or PEM private key.
async fn load_private_key(path: &Path) -> SshResult<keys::PrivateKey> {
    let data = fs::read_to_string(path)
        .await
        .map_err(|err| SshError::Key(format!("unable to read {}: {err}", path.display())))?;
    if let Ok(key) = keys::PrivateKey::from_openssh(&data) {
        if key.is_encrypted() {
            return Err(passphrase_required(path));
        }
        return Ok(key);
    }
    match keys::decode_secret_key(&data, None) {
        Ok(key) => Ok(key),
        Err(keys::Error::KeyIsEncrypted) => Err(passphrase_required(path)),
        Err(err) => Err(SshError::Key(format!("{} is not a usable private key: {err}", path.display()))),
    }
}

fn passphrase_required(path: &Path) -> SshError {
    SshError::Key(format!(
        "{} is passphrase-protected; load it into an SSH agent instead",
        path.display()
    ))
}

fn rejected() -> AuthResult {
    AuthResult::Failure {
        remaining_methods: MethodSet::empty(),
        partial_success: false,
    }
}

async fn authenticate_public_keys(
    session: &mut Handle<ClientHandler>,
    username: &str,
    keys: &[Arc<keys::PrivateKey>],
    rsa_hint: Option<HashAlg>,
) -> SshResult<AuthResult> {
    for key in keys {
        debug!(key = ?key.algorithm(), "attempting public-key auth");
        let hash_alg = if key.algorithm().is_rsa() { rsa_hint } else { None };
        let signed = PrivateKeyWithHashAlg::new(Arc::clone(key), hash_alg);
        match session.authenticate_publickey(username.to_string(), signed).await {
            Ok(result) if result.success() => return Ok(result),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "public-key authentication attempt failed"),
        }
    }
    Ok(rejected())
}

#[cfg(unix)]
async fn authenticate_via_agent(
    session: &mut Handle<ClientHandler>,
    username: &str,
    socket: &Path,
    rsa_hint: Option<HashAlg>,
) -> SshResult<AuthResult> {
    use tokio::net::UnixStream;

    let stream = UnixStream::connect(socket).await?;
    let mut agent = keys::agent::client::AgentClient::connect(stream);
    let identities = agent
        .request_identities()
        .await
        .map_err(|err| SshError::AuthFailed(format!("failed to list identities from SSH agent: {err}")))?;
    if identities.is_empty() {
        return Err(SshError::AuthFailed("SSH agent has no loaded keys".to_string()));
    }

    debug!(count = identities.len(), "attempting agent-based authentication");
    for key in identities {
        let hash_alg = if key.algorithm().is_rsa() { rsa_hint } else { None };
        match session
            .authenticate_publickey_with(username.to_string(), key, hash_alg, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(result),
            Ok(_) => {}
            Err(err) => warn!(error = ?err, "agent authentication attempt failed"),
        }
    }
    Ok(rejected())
}

#[cfg(not(unix))]
async fn authenticate_via_agent(
    _session: &mut Handle<ClientHandler>,
    _username: &str,
    _socket: &Path,
    _rsa_hint: Option<HashAlg>,
) -> SshResult<AuthResult> {
    warn!("agent authentication is not supported on this platform");
    Ok(rejected())
}
