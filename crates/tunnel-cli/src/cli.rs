use std::{env, path::PathBuf, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use clap::{ArgAction, Parser};
use secrecy::SecretString;
use ssh_transport::SshOptions;
use tunnel_types::{AuthParams, HostKeyPolicy, LocalForward, TunnelConfig, parse_local_forward, parse_ssh_target};

#[derive(Debug, Parser)]
#[command(name = "sshtunnel", about = "Forward a local TCP port to a remote address through an SSH server")]
pub struct TunnelArgs {
    /// SSH server; supports optional [user@]host[:port] syntax
    #[arg(value_name = "HOST")]
    target: String,
    /// Local forward in OpenSSH form: [bind_address:]port:host:hostport
    #[arg(short = 'L', long = "local-forward", value_name = "SPEC")]
    local_forward: String,
    /// Override remote username (defaults to user@host or current user)
    #[arg(short = 'l', long = "username", value_name = "USER")]
    username: Option<String>,
    /// Override the parsed port (defaults to 22 or the :port suffix)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,
    /// Give up if the SSH connection is not established within N seconds
    #[arg(long = "connect-timeout", value_name = "SECONDS", default_value_t = 15)]
    connect_timeout: u64,
    /// Send keepalive probes every N seconds (default 30, 0 disables)
    #[arg(long = "keepalive-interval", value_name = "SECONDS")]
    keepalive_interval: Option<u64>,
    /// Disconnect after this many unanswered keepalives (default 3)
    #[arg(long = "keepalive-max", value_name = "COUNT")]
    keepalive_max: Option<usize>,
    /// Allow SHA-1 key exchange and CBC ciphers for old servers
    #[arg(long = "legacy-crypto", action = ArgAction::SetTrue)]
    legacy_crypto: bool,
    /// Private key to use for public-key authentication (repeatable)
    #[arg(short = 'i', long = "identity", value_name = "KEY", action = ArgAction::Append, help_heading = "Auth Options")]
    identities: Vec<PathBuf>,
    /// Attempt authentication via the SSH agent specified in SSH_AUTH_SOCK
    #[arg(long = "agent-auth", action = ArgAction::SetTrue, help_heading = "Auth Options")]
    agent_auth: bool,
    /// Password for password authentication
    #[arg(long, env = "SSHTUNNEL_PASSWORD", hide_env_values = true, value_name = "PASSWORD", help_heading = "Auth Options")]
    password: Option<String>,
    /// Verify the host key against this known_hosts file (default ~/.ssh/known_hosts)
    #[arg(long = "known-hosts", value_name = "FILE", help_heading = "Host Key Options")]
    known_hosts: Option<PathBuf>,
    /// Accept only a host key with this SHA256 fingerprint
    #[arg(long, value_name = "SHA256", conflicts_with = "known_hosts", help_heading = "Host Key Options")]
    fingerprint: Option<String>,
    /// Skip host key verification entirely
    #[arg(
        long = "insecure-accept-any-hostkey",
        action = ArgAction::SetTrue,
        conflicts_with_all = ["known_hosts", "fingerprint"],
        help_heading = "Host Key Options"
    )]
    insecure_accept_any_hostkey: bool,
    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,
    /// Decrease log verbosity (repeatable)
    #[arg(short = 'q', long = "quiet", action = ArgAction::Count)]
    quiet: u8,
}

/// Everything needed to run one tunnel.
#[derive(Debug)]
pub struct TunnelPlan {
    pub config: TunnelConfig,
    pub options: SshOptions,
    pub forward: LocalForward,
}

impl TunnelArgs {
    pub fn parse_args() -> Self {
        TunnelArgs::parse()
    }

    pub fn verbosity(&self) -> i8 {
        let verbose = i8::try_from(self.verbose).unwrap_or(i8::MAX);
        let quiet = i8::try_from(self.quiet).unwrap_or(i8::MAX);
        verbose.saturating_sub(quiet)
    }

    pub fn into_plan(self) -> Result<TunnelPlan> {
        TunnelPlan::try_from(self)
    }
}

impl TryFrom<TunnelArgs> for TunnelPlan {
    type Error = anyhow::Error;

    fn try_from(args: TunnelArgs) -> Result<Self> {
        let TunnelArgs {
            target,
            local_forward,
            username,
            port,
            connect_timeout,
            keepalive_interval,
            keepalive_max,
            legacy_crypto,
            identities,
            agent_auth,
            password,
            known_hosts,
            fingerprint,
            insecure_accept_any_hostkey,
            ..
        } = args;

        let target = parse_ssh_target(&target).with_context(|| format!("invalid SSH target {target:?}"))?;
        let mut server = target.endpoint;
        if let Some(port) = port {
            server.port = port;
        }
        let forward =
            parse_local_forward(&local_forward).with_context(|| format!("invalid local forward {local_forward:?}"))?;

        let username = username
            .or(target.inferred_username)
            .or_else(fallback_username)
            .ok_or_else(|| anyhow!("unable to determine username; use --username or user@host"))?;

        if connect_timeout == 0 {
            bail!("--connect-timeout must be greater than zero");
        }

        let host_key = if insecure_accept_any_hostkey {
            HostKeyPolicy::AcceptAny
        } else if let Some(fingerprint) = fingerprint {
            HostKeyPolicy::Fingerprint(fingerprint)
        } else {
            HostKeyPolicy::KnownHosts(known_hosts.map_or_else(default_known_hosts, Ok)?)
        };

        let mut auth = AuthParams::new(username, host_key);
        for identity in identities {
            auth = auth.with_identity(identity);
        }
        if agent_auth {
            let socket = env::var_os("SSH_AUTH_SOCK").ok_or_else(|| anyhow!("SSH_AUTH_SOCK must be set to use --agent-auth"))?;
            auth = auth.with_agent(socket);
        }
        if let Some(password) = password {
            auth = auth.with_password(SecretString::new(password.into_boxed_str()));
        }
        if !auth.has_methods() {
            bail!("no authentication method given; use --identity, --agent-auth, or --password");
        }

        let defaults = SshOptions::default();
        let options = SshOptions {
            keepalive_interval: match keepalive_interval {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.keepalive_interval,
            },
            keepalive_max: keepalive_max.unwrap_or(defaults.keepalive_max),
            inactivity_timeout: defaults.inactivity_timeout,
            legacy_crypto,
        };

        let config = TunnelConfig::new(server.to_string(), forward.target.to_string(), forward.bind.to_string(), auth)
            .with_connect_timeout(Duration::from_secs(connect_timeout));

        Ok(TunnelPlan { config, options, forward })
    }
}

fn fallback_username() -> Option<String> {
    for key in ["SSHTUNNEL_USER", "USER", "LOGNAME", "USERNAME"] {
        if let Ok(value) = env::var(key)
            && !value.is_empty()
        {
            return Some(value);
        }
    }
    let current = whoami::username();
    if current.is_empty() { None } else { Some(current) }
}

fn default_known_hosts() -> Result<PathBuf> {
    let home = env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .ok_or_else(|| anyhow!("cannot locate ~/.ssh/known_hosts; pass --known-hosts, --fingerprint, or --insecure-accept-any-hostkey"))?;
    Ok(PathBuf::from(home).join(".ssh").join("known_hosts"))
}
