use anyhow::Result;
use clap::Parser;
use tokio::time::Duration;
use tracing::info;

use beach_pier::{
    cli::{self, Cli, Commands},
    config::Config,
    telemetry::Telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();

    if let Some(Commands::Probe {
        url,
        count,
        timeout_secs,
    }) = cli.command
    {
        let report = cli::run_probe(&url, count, Duration::from_secs(timeout_secs)).await?;
        cli::print_probe_report(&report);
        return Ok(());
    }

    let config = Config::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        redis = config.redis_url.is_some(),
        upstream = ?config.upstream_url.as_ref().map(|url| url.as_str()),
        "starting beach-pier"
    );

    beach_pier::serve(config, telemetry.metrics_handle()).await
}
