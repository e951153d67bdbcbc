use chrono::{Local, NaiveDate};
use clap::{Args, ValueEnum};
use serde_json::{Map, Value};
use std::io::{self, Write};

use vitalog::{EntityKind, Gateway, HealthStore, Record, RecordQuery};

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Add a record
#[derive(Args)]
pub struct AddCommand {
    /// Entity kind (health, medications, water, ...)
    pub kind: String,

    /// Field values as name=value pairs
    #[arg(required = true, value_name = "FIELD=VALUE")]
    pub fields: Vec<String>,
}

impl AddCommand {
    pub async fn run<G: Gateway>(
        &self,
        store: &HealthStore<G>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let kind = parse_kind(&self.kind)?;
        let mut fields = parse_fields(&self.fields)?;

        // Dated kinds default to today when no date is given
        if kind.is_date_indexed() && !fields.contains_key("date") {
            let today = Local::now().date_naive().to_string();
            fields.insert("date".to_string(), Value::String(today));
        }

        let record = store.save(kind, fields).await?;
        println!("Added {} record:", kind);
        print_record(kind, &record);
        Ok(())
    }
}

/// List records
#[derive(Args)]
pub struct ListCommand {
    /// Entity kind (health, medications, water, ...)
    pub kind: String,

    /// Only records on this date (YYYY-MM-DD)
    #[arg(long, conflicts_with_all = ["from", "to"])]
    pub date: Option<String>,

    /// Start of date range, inclusive (YYYY-MM-DD)
    #[arg(long)]
    pub from: Option<String>,

    /// End of date range, inclusive (YYYY-MM-DD)
    #[arg(long)]
    pub to: Option<String>,

    /// Keep only the most recent N records
    #[arg(long)]
    pub limit: Option<u32>,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

impl ListCommand {
    pub async fn run<G: Gateway>(
        &self,
        store: &HealthStore<G>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let kind = parse_kind(&self.kind)?;

        let mut query = match &self.date {
            Some(date) => RecordQuery::on(parse_date(date)?),
            None => {
                let mut q = RecordQuery::all();
                if let Some(from) = &self.from {
                    q.from = Some(parse_date(from)?);
                }
                if let Some(to) = &self.to {
                    q.to = Some(parse_date(to)?);
                }
                q
            }
        };
        if let Some(limit) = self.limit {
            query = query.with_limit(limit);
        }

        let records = store.get(kind, &query).await?;

        if records.is_empty() {
            println!("No {} records found", kind);
            return Ok(());
        }

        match self.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&records)?);
            }
            OutputFormat::Text => {
                let key_width = records
                    .iter()
                    .map(|r| r.key.len())
                    .max()
                    .unwrap_or(0)
                    .max(3);
                println!("{:<key_width$}  {:<8}  FIELDS", "KEY", "STATUS");
                println!("{}", "-".repeat(72));
                for record in &records {
                    let status = if record.synced { "synced" } else { "pending" };
                    println!(
                        "{:<key_width$}  {:<8}  {}",
                        record.key,
                        status,
                        fields_summary(kind, record)
                    );
                }
                println!("\nTotal: {} record(s)", records.len());
            }
        }
        Ok(())
    }
}

/// Update fields of an existing record
#[derive(Args)]
pub struct UpdateCommand {
    /// Entity kind (health, medications, water, ...)
    pub kind: String,

    /// Record key
    pub key: String,

    /// Field values as name=value pairs (value `null` clears a field)
    #[arg(required = true, value_name = "FIELD=VALUE")]
    pub fields: Vec<String>,
}

impl UpdateCommand {
    pub async fn run<G: Gateway>(
        &self,
        store: &HealthStore<G>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let kind = parse_kind(&self.kind)?;
        let patch = parse_fields(&self.fields)?;

        match store.update(kind, &self.key, patch).await? {
            Some(record) => {
                println!("Updated {} record:", kind);
                print_record(kind, &record);
                Ok(())
            }
            None => Err(format!("{} record not found: {}", kind, self.key).into()),
        }
    }
}

/// Delete a record
#[derive(Args)]
pub struct DeleteCommand {
    /// Entity kind (health, medications, water, ...)
    pub kind: String,

    /// Record key
    pub key: String,

    /// Skip confirmation prompt
    #[arg(long, short)]
    pub force: bool,
}

impl DeleteCommand {
    pub async fn run<G: Gateway>(
        &self,
        store: &HealthStore<G>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let kind = parse_kind(&self.kind)?;

        let record = store.get_by_key(kind, &self.key).await?;
        if record.is_none() {
            return Err(format!("{} record not found: {}", kind, self.key).into());
        }

        if !self.force {
            print!("Delete {} record '{}'? [y/N] ", kind, self.key);
            io::stdout().flush()?;

            let mut input = String::new();
            io::stdin().read_line(&mut input)?;

            if !input.trim().eq_ignore_ascii_case("y") {
                println!("Deletion cancelled.");
                return Ok(());
            }
        }

        store.delete(kind, &self.key).await?;
        println!("Deleted {} record: {}", kind, self.key);
        Ok(())
    }
}

pub fn parse_kind(name: &str) -> Result<EntityKind, String> {
    name.parse()
}

pub fn parse_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| format!("Invalid date format '{}'. Use YYYY-MM-DD.", value))
}

/// Parses `name=value` arguments. Values that read as JSON numbers,
/// booleans or `null` keep that type; everything else is a string.
pub fn parse_fields(args: &[String]) -> Result<Map<String, Value>, String> {
    let mut fields = Map::new();
    for arg in args {
        let (name, value) = parse_field(arg)?;
        fields.insert(name, value);
    }
    Ok(fields)
}

fn parse_field(arg: &str) -> Result<(String, Value), String> {
    let (name, raw) = arg
        .split_once('=')
        .ok_or_else(|| format!("Invalid field '{}'. Use name=value.", arg))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("Invalid field '{}'. Use name=value.", arg));
    }
    let value = match serde_json::from_str(raw) {
        Ok(v @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => v,
        _ => Value::String(raw.to_string()),
    };
    Ok((name.to_string(), value))
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One-line `name=value` summary in schema column order, extras last.
fn fields_summary(kind: EntityKind, record: &Record) -> String {
    let mut parts = Vec::new();
    for col in kind.columns() {
        if let Some(value) = record.fields.get(*col) {
            if !value.is_null() {
                parts.push(format!("{}={}", col, display_value(value)));
            }
        }
    }
    for (name, value) in &record.fields {
        if !kind.columns().contains(&name.as_str()) && !value.is_null() {
            parts.push(format!("{}={}", name, display_value(value)));
        }
    }
    parts.join("  ")
}

pub fn print_record(kind: EntityKind, record: &Record) {
    println!("  key: {}", record.key);
    for col in kind.columns() {
        if let Some(value) = record.fields.get(*col) {
            if !value.is_null() {
                println!("  {}: {}", col, display_value(value));
            }
        }
    }
    for (name, value) in &record.fields {
        if !kind.columns().contains(&name.as_str()) && !value.is_null() {
            println!("  {}: {}", name, display_value(value));
        }
    }
    let status = if record.synced { "synced" } else { "pending sync" };
    println!("  status: {}", status);
}
