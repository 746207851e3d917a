mod cli;
mod commands;
mod config;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use blobkit_backends::{open_with_retry, BackendConfig};
use blobkit_common::{Backend, ConnectionInfo, OpContext, RetryPolicy};
use blobkit_conformance::unique_prefix;

use cli::{Cli, Command};
use config::CliConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let (backend_config, policy) = resolve(&cli)?;

    // Ctrl-C cancels whatever operation is in flight.
    let ctx = OpContext::background();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            canceller.cancel();
        }
    });

    // Verification writes and deletes; keep it away from real data.
    let backend_config = match cli.command {
        Command::Verify => backend_config.with_sub_prefix(&unique_prefix()),
        _ => backend_config,
    };

    let backend = open_with_retry(&ctx, &backend_config, policy).await?;
    info!(backend = %backend.display_name(), "Backend opened");

    let result = match &cli.command {
        Command::Ls { prefix, long } => commands::ls(&ctx, &backend, prefix, *long).await,
        Command::Get {
            id,
            offset,
            length,
            output,
        } => commands::get(&ctx, &backend, id, *offset, *length, output.as_deref()).await,
        Command::Put { id, file } => commands::put(&ctx, &backend, id, file).await,
        Command::Rm { id } => commands::rm(&ctx, &backend, id).await,
        Command::Info { show_token } => {
            commands::info(&backend, *show_token);
            Ok(())
        }
        Command::Verify => commands::verify(&ctx, &backend).await,
    };

    // The command's own error wins over a failed close.
    let closed = backend.close(&ctx).await;
    match (result, closed) {
        (Err(e), Err(close_err)) => {
            warn!(error = %close_err, "Failed to close backend");
            Err(e)
        }
        (result, closed) => {
            closed?;
            result
        }
    }
}

/// Backend and retry policy from `--token`, or else the config file.
fn resolve(cli: &Cli) -> anyhow::Result<(BackendConfig, RetryPolicy)> {
    match &cli.token {
        Some(token) => {
            let info = ConnectionInfo::from_token(token)?;
            Ok((BackendConfig::from_connection_info(&info)?, RetryPolicy::default()))
        }
        None => {
            let config = CliConfig::load(&cli.config)?;
            Ok((config.backend, config.retry))
        }
    }
}
