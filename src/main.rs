use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use loanvault::cli::{Cli, Command, FetchArgs, ServeArgs};
use loanvault::{fetch, ServerRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so `fetch` can stream the file to stdout.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Fetch(args) => fetch_to_output(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = args.into_config().context("Invalid server configuration")?;
    let registry = ServerRegistry::new();

    let handle = registry
        .ensure_started(config)
        .await
        .context("Failed to start SFTP server")?;

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutting down");
            registry.stop().await;
        }
        _ = handle.wait() => {
            info!("Listener on {} exited", handle.local_addr());
        }
    }
    Ok(())
}

async fn fetch_to_output(args: FetchArgs) -> Result<()> {
    let config = args.fetch_config();
    let data = fetch(&config, &args.remote_path)
        .await
        .with_context(|| format!("Failed to fetch {}", args.remote_path))?;

    match &args.output {
        Some(path) => {
            tokio::fs::write(path, &data)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Wrote {} bytes to {}", data.len(), path.display());
        }
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&data).await?;
            stdout.flush().await?;
        }
    }
    Ok(())
}
