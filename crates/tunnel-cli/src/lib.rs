pub mod cli;

use anyhow::{Context, Result, bail};
use ssh_transport::SshConnector;
use tracing::{info, level_filters::LevelFilter, warn};
use tunnel_core::TunnelSession;

use crate::cli::TunnelPlan;

const LEVELS: [LevelFilter; 5] = [
    LevelFilter::ERROR,
    LevelFilter::WARN,
    LevelFilter::INFO,
    LevelFilter::DEBUG,
    LevelFilter::TRACE,
];

/// Level for a `-v`/`-q` balance; `0` is info.
pub fn level_for(verbosity: i8) -> LevelFilter {
    let idx = (2 + i32::from(verbosity)).clamp(0, 4);
    LEVELS[idx as usize]
}

/// `RUST_LOG` wins over the command-line verbosity when set.
pub fn init_tracing(verbosity: i8) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level_for(verbosity).to_string()));
    let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
}

/// Bring the tunnel up and keep it running until Ctrl-C.
pub async fn run_tunnel(plan: TunnelPlan) -> Result<()> {
    let TunnelPlan { config, options, forward } = plan;
    let ssh = config.ssh_address.clone();
    let session = TunnelSession::new(config, SshConnector::new(options));

    let local = session
        .open()
        .await
        .with_context(|| format!("unable to establish tunnel via {ssh}"))?;
    info!(%local, target = %forward.target, via = %ssh, "forwarding; press Ctrl-C to stop");

    let interrupted = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("interrupt received; closing tunnel");
            true
        }
        state = session.terminated() => {
            warn!(%state, "tunnel stopped on its own");
            false
        }
    };

    session.close().await;
    if !interrupted {
        bail!("tunnel via {ssh} stopped unexpectedly");
    }
    Ok(())
}
