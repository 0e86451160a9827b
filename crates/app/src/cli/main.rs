//! Minstrel CLI Application

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use minstrel_app::{assemble, settle_main_connection, spawn};
use minstrel_core::control::{Command, CommandExecutor, CommandResult};
use minstrel_core::domain::{
    Connection, ConfigManager, ConfigOrigin, MainConnection, MinstrelConfig, SinkId, SourceId,
};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "minstrel")]
#[command(about = "In-vehicle audio routing control plane", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Write the factory default configuration
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print every registered domain, endpoint and gateway
    Topology,
    /// Print the candidate routes between a source and a sink
    Routes { source: u16, sink: u16 },
    /// Connect a source to a sink and wait for the result
    Connect {
        source: u16,
        sink: u16,
        /// How long to wait for every hop to be acknowledged
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
}

#[derive(Serialize)]
struct ConnectReport {
    main_connection: MainConnection,
    connections: Vec<Connection>,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn config_manager() -> anyhow::Result<ConfigManager> {
    Ok(ConfigManager::new(ConfigManager::default_config_dir()?))
}

async fn load_config(path: Option<&PathBuf>) -> anyhow::Result<MinstrelConfig> {
    match path {
        Some(path) => MinstrelConfig::load_from_file(path)
            .await
            .with_context(|| format!("loading {}", path.display())),
        None => {
            let loaded = config_manager()?.load().await?;
            if let ConfigOrigin::Recovered { rejected } = &loaded.origin {
                tracing::warn!(rejected = %rejected.display(), "Using factory topology");
            }
            Ok(loaded.config)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    tracing::info!("🎼 Minstrel starting...");

    if let CliCommand::InitConfig { force } = cli.command {
        let config = MinstrelConfig::factory_default();
        match &cli.config {
            Some(path) => {
                if path.exists() && !force {
                    bail!("{} already exists, use --force to overwrite", path.display());
                }
                config.save_to_file(path).await?;
                println!("{}", path.display());
            }
            None => {
                let manager = config_manager()?;
                if manager.exists() && !force {
                    bail!("{} already exists, use --force to overwrite", manager.config_path().display());
                }
                manager.save(&config).await?;
                println!("{}", manager.config_path().display());
            }
        }
        return Ok(());
    }

    let config = load_config(cli.config.as_ref()).await?;
    let runtime = spawn(assemble(&config)?);
    let handle = runtime.handle.clone();

    match cli.command {
        CliCommand::InitConfig { .. } => {}
        CliCommand::Topology => {
            if let CommandResult::Topology(topology) = handle.execute(Command::Topology).await.into_result()? {
                print_json(&topology)?;
            }
        }
        CliCommand::Routes { source, sink } => {
            let result = handle
                .execute(Command::ResolveRoutes {
                    source: SourceId::new(source),
                    sink: SinkId::new(sink),
                })
                .await
                .into_result()?;
            if let CommandResult::Routes(routes) = result {
                print_json(&routes)?;
            }
        }
        CliCommand::Connect {
            source,
            sink,
            timeout_ms,
        } => {
            let mut notifications = handle.subscribe();
            let result = handle
                .execute(Command::Connect {
                    source: SourceId::new(source),
                    sink: SinkId::new(sink),
                })
                .await
                .into_result()?;
            let CommandResult::MainConnection(main) = result else {
                bail!("unexpected reply to connect: {result:?}");
            };

            let main_connection =
                settle_main_connection(&handle, &mut notifications, main, Duration::from_millis(timeout_ms)).await?;
            let connections = match handle.execute(Command::ListConnections).await.into_result()? {
                CommandResult::Connections(all) => all
                    .into_iter()
                    .filter(|c| main_connection.connections.contains(&c.id))
                    .collect(),
                _ => Vec::new(),
            };
            print_json(&ConnectReport {
                main_connection,
                connections,
            })?;
        }
    }

    handle.execute(Command::Shutdown).await;
    let plane = runtime.task.await?;
    tracing::info!(outstanding = plane.list_handles().len(), "Minstrel stopped");

    Ok(())
}
