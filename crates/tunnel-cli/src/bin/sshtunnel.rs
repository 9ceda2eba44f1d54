use anyhow::Result;
use tunnel_cli::{cli::TunnelArgs, init_tracing, run_tunnel};

#[tokio::main]
async fn main() -> Result<()> {
    let args = TunnelArgs::parse_args();
    init_tracing(args.verbosity());
    run_tunnel(args.into_plan()?).await
}
