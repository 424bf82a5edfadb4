use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use sundial_core::o11y::{self, LogFormat};
use sundial_core::{CredentialVault, SundialConfig};
use sundial_server::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cmd = cli.command.unwrap_or(Commands::Serve {
        host: "0.0.0.0".to_string(),
        port: 8000,
        sync_interval_secs: None,
    });

    if let Commands::GenerateKey = cmd {
        println!("{}", CredentialVault::generate_key());
        return Ok(());
    }

    let format: LogFormat = cli.log_format.parse()?;
    o11y::init_global(format)?;
    let cfg = SundialConfig::from_env()?;

    match cmd {
        Commands::Serve {
            host,
            port,
            sync_interval_secs,
        } => {
            let addr: SocketAddr = format!("{host}:{port}").parse()?;
            let state = sundial_server::wiring::build_state(&cfg).await?;
            let interval = sync_interval_secs.filter(|s| *s > 0).map(Duration::from_secs);
            sundial_server::server::serve(addr, state, interval).await?;
        }
        Commands::SyncAll => {
            let state = sundial_server::wiring::build_state(&cfg).await?;
            let runs = state.engine.sync_all_users().await?;
            println!("{}", serde_json::to_string_pretty(&runs)?);
        }
        Commands::GenerateKey => {}
    }
    Ok(())
}
