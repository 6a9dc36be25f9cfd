use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncBufReadExt;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod console;
mod orchestrator;

use console::Console;
use orchestrator::BackupOrchestrator;

const DEFAULT_SETTINGS_FILE: &str = "keeper.json";

#[derive(Parser)]
#[command(name = "bedrock-keeperd")]
#[command(about = "Supervises a Bedrock dedicated server and takes crash-safe world backups", long_about = None)]
struct Cli {
    /// Bedrock server installation directory
    #[arg(long, default_value = ".")]
    root: PathBuf,
    /// Backup settings file (defaults to keeper.json under the server root)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Server executable to launch
    #[arg(long, default_value = "./bedrock_server")]
    server_bin: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let settings_path = cli
        .config
        .unwrap_or_else(|| cli.root.join(DEFAULT_SETTINGS_FILE));
    let settings = match config::load_settings(&settings_path)? {
        Some(settings) => settings,
        None => {
            info!("no settings at {}, using defaults", settings_path.display());
            config::BackupSettings::default()
        }
    };

    let console = Console::spawn(&cli.root, &cli.server_bin)
        .with_context(|| format!("Failed to start server from {}", cli.root.display()))?;

    let _orchestrator = BackupOrchestrator::init(
        console.handle(),
        console.subscribe_lines(),
        console.subscribe_connections(),
        settings,
        cli.root.clone(),
    )
    .await?;

    // pass the operator's own console input through to the server
    let operator = console.handle();
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            operator.execute_command(&line);
        }
    });

    let status = console.wait().await?;
    info!("server exited with {status}");
    Ok(())
}
