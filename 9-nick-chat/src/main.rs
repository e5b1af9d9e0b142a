use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use nick_chat::{cli::Cli, client, server::ChatServer};

fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.server {
        init_tracing("info");
        let server = ChatServer::bind(&cli.address, cli.server_config()).await?;
        let addr = server.local_addr()?;
        info!("server started on {}", addr);
        if let Err(err) = server.run_until_ctrl_c().await {
            warn!("server exited with error: {err:?}");
            return Err(err);
        }
    } else {
        // Client stdout is the chat transcript; keep routine logs out of it.
        init_tracing("warn");
        client::run(&cli.address).await?;
    }

    Ok(())
}
