use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{
    AddCommand, ClearCommand, ConfigCommand, DeleteCommand, ExportCommand, ListCommand,
    ProfileCommand, ProfileSubcommand, SyncCommand, UpdateCommand,
};
use vitalog::{Config, HealthStore, HttpGateway};

#[derive(Parser)]
#[command(name = "vita")]
#[command(version)]
#[command(about = "An offline-first personal health tracker", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a record
    Add(AddCommand),

    /// List records
    List(ListCommand),

    /// Update fields of an existing record
    Update(UpdateCommand),

    /// Delete a record
    Delete(DeleteCommand),

    /// Manage profile entries
    Profile(ProfileCommand),

    /// Sync with the configured backend
    Sync(SyncCommand),

    /// Dump all local data as JSON
    Export(ExportCommand),

    /// Delete all local data
    Clear(ClearCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    // Log to stderr so command output stays clean on stdout
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vitalog=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config)?;

    let Some(command) = cli.command else {
        println!("Use --help to see available commands");
        return Ok(());
    };

    // Config inspection needs no database
    if let Commands::Config(cmd) = &command {
        return cmd.run(&config);
    }

    let store = HealthStore::open(&config).await?;

    // Auto-sync BEFORE read commands so they show fresh data
    if is_read_command(&command) {
        try_auto_sync(&store, &config).await;
    }

    let result = execute_command(&command, &store, &config).await;

    // Auto-sync AFTER write commands (only if the command succeeded)
    if result.is_ok() && is_write_command(&command) {
        try_auto_sync(&store, &config).await;
    }

    result
}

async fn execute_command(
    command: &Commands,
    store: &HealthStore<HttpGateway>,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Add(cmd) => cmd.run(store).await,
        Commands::List(cmd) => cmd.run(store).await,
        Commands::Update(cmd) => cmd.run(store).await,
        Commands::Delete(cmd) => cmd.run(store).await,
        Commands::Profile(cmd) => cmd.run(store).await,
        Commands::Sync(cmd) => cmd.run(store, config).await,
        Commands::Export(cmd) => cmd.run(store).await,
        Commands::Clear(cmd) => cmd.run(store).await,
        Commands::Config(_) => Ok(()),
    }
}

/// Returns true if the command reads data worth freshening first.
fn is_read_command(cmd: &Commands) -> bool {
    matches!(cmd, Commands::List(_) | Commands::Export(_))
        || matches!(cmd, Commands::Profile(p) if matches!(p.command, ProfileSubcommand::Get { .. }))
}

/// Returns true if the command queues changes that should push right away.
fn is_write_command(cmd: &Commands) -> bool {
    matches!(
        cmd,
        Commands::Add(_) | Commands::Update(_) | Commands::Delete(_)
    ) || matches!(cmd, Commands::Profile(p) if matches!(p.command, ProfileSubcommand::Set { .. }))
}

/// Syncs when auto-sync is enabled and a backend is configured. Errors
/// are reported and swallowed so the CLI keeps working offline.
async fn try_auto_sync(store: &HealthStore<HttpGateway>, config: &Config) {
    if !config.sync.auto_sync || !config.sync.is_configured() {
        return;
    }
    if let Err(e) = store.sync_now().await {
        eprintln!("Auto-sync: {}", e);
    }
}
