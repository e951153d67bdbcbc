use clap::{Args, Subcommand};
use serde_json::Value;

use vitalog::{Gateway, HealthStore};

#[derive(Args)]
pub struct ProfileCommand {
    #[command(subcommand)]
    pub command: ProfileSubcommand,
}

#[derive(Subcommand)]
pub enum ProfileSubcommand {
    /// Show a profile entry
    Get {
        /// Entry name (height_cm, birth_date, ...)
        name: String,
    },

    /// Set a profile entry
    Set {
        /// Entry name
        name: String,

        /// Entry value
        value: String,
    },
}

impl ProfileCommand {
    pub async fn run<G: Gateway>(
        &self,
        store: &HealthStore<G>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ProfileSubcommand::Get { name } => {
                match store.profile_value(name).await? {
                    Some(value) => println!("{}", display_value(&value)),
                    None => return Err(format!("Profile entry not set: {}", name).into()),
                }
                Ok(())
            }

            ProfileSubcommand::Set { name, value } => {
                if name.trim().is_empty() {
                    return Err("Profile entry name cannot be empty".into());
                }

                let value = parse_value(value);
                let record = store.set_profile_value(name.trim(), value).await?;
                let status = if record.synced { "synced" } else { "pending sync" };
                println!(
                    "Set {} = {} ({})",
                    record.key,
                    record
                        .fields
                        .get("value")
                        .map(display_value)
                        .unwrap_or_default(),
                    status
                );
                Ok(())
            }
        }
    }
}

/// Numbers, booleans and `null` keep their JSON type, everything else
/// stays a string.
fn parse_value(raw: &str) -> Value {
    match serde_json::from_str(raw) {
        Ok(v @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => v,
        _ => Value::String(raw.to_string()),
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
