use clap::Args;
use std::io::{self, Write};

use vitalog::{Gateway, HealthStore};

/// Dump all local data as JSON
#[derive(Args)]
pub struct ExportCommand {}

impl ExportCommand {
    pub async fn run<G: Gateway>(
        &self,
        store: &HealthStore<G>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let export = store.export().await?;
        println!("{}", serde_json::to_string_pretty(&export)?);
        Ok(())
    }
}

/// Delete all local data
#[derive(Args)]
pub struct ClearCommand {
    /// Skip confirmation prompt
    #[arg(long)]
    pub yes: bool,
}

impl ClearCommand {
    pub async fn run<G: Gateway>(
        &self,
        store: &HealthStore<G>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        if !self.yes {
            print!("Delete ALL local records, queued changes and failed entries? [y/N] ");
            io::stdout().flush()?;

            let mut input = String::new();
            io::stdin().read_line(&mut input)?;

            if !input.trim().eq_ignore_ascii_case("y") {
                println!("Clear cancelled.");
                return Ok(());
            }
        }

        store.clear().await?;
        println!("All local data deleted.");
        Ok(())
    }
}
