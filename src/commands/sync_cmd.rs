//! Sync CLI commands.

use chrono::{Local, TimeZone};
use clap::{Args, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use vitalog::{Config, Gateway, HealthStore};

/// Sync with the configured backend
#[derive(Args)]
pub struct SyncCommand {
    /// Keep running and sync on an interval until interrupted
    #[arg(long)]
    pub watch: bool,

    #[command(subcommand)]
    pub command: Option<SyncSubcommand>,
}

#[derive(Subcommand)]
pub enum SyncSubcommand {
    /// Show sync configuration, queue depth and backend status
    Status,

    /// List queue entries abandoned after repeated failures
    Failed,
}

impl SyncCommand {
    pub async fn run<G: Gateway>(
        &self,
        store: &HealthStore<G>,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            None if self.watch => self.watch_loop(store, config).await,
            None => self.sync_once(store, config).await,
            Some(SyncSubcommand::Status) => self.status(store, config).await,
            Some(SyncSubcommand::Failed) => self.failed(store).await,
        }
    }

    async fn sync_once<G: Gateway>(
        &self,
        store: &HealthStore<G>,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        if !config.sync.is_configured() {
            return Err(
                "Sync is not configured. Run 'vita sync status' for setup instructions.".into(),
            );
        }

        println!("Syncing with backend...");
        let outcome = store.sync_now().await?;
        let status = store.status().await?;

        println!("  {}", outcome);
        println!();
        if !status.online {
            println!("Backend unreachable; changes stay queued for the next sync.");
        } else if outcome.errors > 0 {
            println!(
                "Sync finished with {} error(s); {} entr{} still queued.",
                outcome.errors,
                status.pending,
                if status.pending == 1 { "y" } else { "ies" }
            );
        } else {
            println!("Sync complete.");
        }

        Ok(())
    }

    async fn watch_loop<G: Gateway>(
        &self,
        store: &HealthStore<G>,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        if !config.sync.is_configured() {
            return Err(
                "Sync is not configured. Run 'vita sync status' for setup instructions.".into(),
            );
        }

        println!("Watching for changes. Press Ctrl-C to stop.");
        let mut outcomes = store.subscribe();
        let timer = store.start_background_sync();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                outcome = outcomes.recv() => match outcome {
                    Ok(outcome) => {
                        println!("  [{}] {}", Local::now().format("%H:%M:%S"), outcome);
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
            }
        }

        timer.abort();
        println!("Stopped.");
        Ok(())
    }

    async fn status<G: Gateway>(
        &self,
        store: &HealthStore<G>,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        println!("Sync Configuration");
        println!("==================");
        println!();

        if !config.sync.is_configured() {
            println!("Status: Not configured");
            println!();
            println!("To enable sync, add to your config file:");
            println!();
            println!("  sync:");
            println!("    script_url: \"https://script.google.com/macros/s/.../exec\"");
            println!("    auto_sync: true");
            println!();
            println!("Or set the environment variable:");
            println!("  VITA_SYNC_URL");
            return Ok(());
        }

        let status = store.status().await?;

        println!("Script URL: {}", config.sync.script_url.as_deref().unwrap_or(""));
        println!(
            "Auto-sync:  {}",
            if config.sync.auto_sync {
                "enabled"
            } else {
                "disabled"
            }
        );
        println!(
            "Queue:      {} pending, {} failed",
            status.pending, status.dead_letters
        );
        if let Some(outcome) = status.last_outcome {
            println!("Last cycle: {}", outcome);
        }
        println!();

        print!("Backend status: ");
        if store.engine().check_connectivity().await {
            println!("✓ connected");
        } else {
            println!("✗ unreachable");
        }

        Ok(())
    }

    async fn failed<G: Gateway>(
        &self,
        store: &HealthStore<G>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let letters = store.dead_letters().await?;

        if letters.is_empty() {
            println!("No failed entries.");
            return Ok(());
        }

        println!(
            "{:<6}  {:<12}  {:<8}  {:<20}  ABANDONED",
            "ID", "KIND", "ACTION", "KEY"
        );
        println!("{}", "-".repeat(76));
        for letter in &letters {
            println!(
                "{:<6}  {:<12}  {:<8}  {:<20}  {}",
                letter.queue_id,
                letter.kind,
                letter.action,
                letter.key,
                format_millis(letter.abandoned_at)
            );
        }
        println!(
            "\nTotal: {} failed entr{}",
            letters.len(),
            if letters.len() == 1 { "y" } else { "ies" }
        );

        Ok(())
    }
}

fn format_millis(millis: i64) -> String {
    match Local.timestamp_millis_opt(millis).single() {
        Some(when) => when.format("%Y-%m-%d %H:%M").to_string(),
        None => millis.to_string(),
    }
}
