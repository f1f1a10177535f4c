//! Roomwatch CLI Tool
//!
//! Offline replay of captured sensor traffic and inspection of the active
//! configuration.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use roomwatch_engine::{Collaborators, DispatchOutcome, Dispatcher, RoomRouter, Routed, Rule};
use roomwatch_io::memory::{MemoryFactSink, MemoryPublisher, MemoryStateSink};
use roomwatch_io::{Delivery, RoomStateRow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod config;

use config::AppConfig;

#[derive(Parser)]
#[command(name = "roomwatch-cli")]
#[command(author = "Roomwatch Team")]
#[command(version = "0.1.0")]
#[command(about = "Roomwatch room monitoring CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to the standard search paths)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed a JSON-lines capture through an in-memory pipeline
    Replay {
        /// Capture file, one {"topic", "body"} object per line
        file: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Table)]
        format: Format,

        /// Override the configured time zone
        #[arg(short, long)]
        timezone: Option<String>,
    },

    /// Show the active fault rule table
    Rules,

    /// Generate sample configuration
    Config {
        /// Output path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Table,
    Json,
}

/// One captured delivery
#[derive(Debug, Deserialize)]
struct CapturedDelivery {
    topic: String,
    /// JSON body, or the raw body as a string
    body: serde_json::Value,
    /// Arrival time; replay time when absent
    #[serde(default)]
    received_at: Option<DateTime<Utc>>,
}

impl CapturedDelivery {
    fn into_delivery(self) -> (Delivery, Option<DateTime<Utc>>) {
        let payload = match self.body {
            serde_json::Value::String(raw) => raw.into_bytes(),
            other => other.to_string().into_bytes(),
        };
        (Delivery::unacked(self.topic, payload), self.received_at)
    }
}

/// Everything a replay produced
struct ReplayReport {
    deliveries: usize,
    rejected: usize,
    outcomes: Vec<DispatchOutcome>,
    published: Vec<(String, serde_json::Value)>,
    room_states: Vec<RoomStateRow>,
    facts: usize,
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Replay { file, format, timezone } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(timezone) = timezone {
                config.timezone = timezone;
            }

            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let report = runtime.block_on(replay(&config, &file))?;
            print_replay(&report, format)?;
        }

        Commands::Rules => {
            let config = load_config(cli.config.as_deref())?;
            show_rules(&config)?;
        }

        Commands::Config { output } => {
            generate_config(output)?;
        }
    }

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
}

async fn replay(config: &AppConfig, file: &Path) -> Result<ReplayReport> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let publisher = Arc::new(MemoryPublisher::new());
    let facts = Arc::new(MemoryFactSink::new());
    let states = Arc::new(MemoryStateSink::new());

    let dispatcher = Dispatcher::new(
        config.engine_config()?,
        Collaborators {
            publisher: publisher.clone(),
            facts: facts.clone(),
            states: states.clone(),
        },
    );
    let (mut router, mut outcome_rx) = RoomRouter::with_outcomes(Arc::new(dispatcher));

    let mut deliveries = 0;
    let mut rejected = 0;
    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let captured: CapturedDelivery = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: not a captured delivery", file.display(), number + 1))?;
        let (delivery, received_at) = captured.into_delivery();

        deliveries += 1;
        if router.route_at(delivery, received_at.unwrap_or_else(Utc::now)) == Routed::Rejected {
            rejected += 1;
        }
    }

    router.shutdown().await;

    let mut outcomes = Vec::new();
    while let Some(outcome) = outcome_rx.recv().await {
        outcomes.push(outcome);
    }

    let published = publisher
        .published()
        .into_iter()
        .map(|(topic, payload)| {
            let body = serde_json::from_slice(&payload)
                .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&payload).into_owned()));
            (topic, body)
        })
        .collect();

    Ok(ReplayReport {
        deliveries,
        rejected,
        outcomes,
        published,
        room_states: states.room_states(),
        facts: facts.facts().len(),
    })
}

fn print_replay(report: &ReplayReport, format: Format) -> Result<()> {
    let snapshots = report.outcomes.iter().filter(|o| o.snapshot.is_some()).count();

    if format == Format::Json {
        let published: Vec<_> = report
            .published
            .iter()
            .map(|(topic, body)| serde_json::json!({ "topic": topic, "body": body }))
            .collect();
        let json = serde_json::json!({
            "deliveries": report.deliveries,
            "rejected": report.rejected,
            "snapshots": snapshots,
            "facts": report.facts,
            "published": published,
            "room_states": report.room_states,
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }

    println!("╭──────────────────────────────────────────────────────────────╮");
    println!("│                       Replay Summary                         │");
    println!("╰──────────────────────────────────────────────────────────────╯\n");
    println!("  Deliveries: {} ({} rejected)", report.deliveries, report.rejected);
    println!("  Snapshots:  {}", snapshots);
    println!("  Facts:      {}", report.facts);

    if report.published.is_empty() {
        println!("\nNo alerts published.");
    } else {
        println!("\nPublished alerts:");
        println!("╭──────────────────────┬───────────────────────────────────────────────────╮");
        println!("│ Topic                │ Detail                                            │");
        println!("├──────────────────────┼───────────────────────────────────────────────────┤");
        for (topic, body) in &report.published {
            println!("│ {:20} │ {:49} │", truncate(topic, 20), truncate(&alert_detail(body), 49));
        }
        println!("╰──────────────────────┴───────────────────────────────────────────────────╯");
    }

    if !report.room_states.is_empty() {
        println!("\nRoom states:");
        println!("╭────────────┬──────────┬──────────┬───────────────────────────╮");
        println!("│ Room       │ Occupied │ Health   │ Updated                   │");
        println!("├────────────┼──────────┼──────────┼───────────────────────────┤");
        for row in &report.room_states {
            println!("│ {:10} │ {:8} │ {:8} │ {:25} │",
                truncate(&row.room_id, 10),
                if row.is_occupied { "yes" } else { "no" },
                row.health_status.as_str(),
                row.vacancy_last_updated.to_rfc3339());
        }
        println!("╰────────────┴──────────┴──────────┴───────────────────────────╯");
    }

    Ok(())
}

/// One-line description of an alert body
fn alert_detail(body: &serde_json::Value) -> String {
    if let Some(occupied) = body.get("is_occupied").and_then(|v| v.as_bool()) {
        return if occupied { "occupied".to_string() } else { "vacant".to_string() };
    }
    if let Some(faults) = body.get("faults").and_then(|v| v.as_array()) {
        return faults
            .iter()
            .filter_map(|f| f.as_str())
            .collect::<Vec<_>>()
            .join("; ");
    }
    body.to_string()
}

fn show_rules(config: &AppConfig) -> Result<()> {
    let engine = config.engine_config()?;

    println!("╭────────────────┬──────────────────────────────────────────────╮");
    println!("│ Datapoint      │ Rule                                         │");
    println!("├────────────────┼──────────────────────────────────────────────┤");
    for rule in &engine.faults.rules {
        let description = match &rule.rule {
            Rule::Range { min: Some(min), max: Some(max) } => format!("{} ≤ value ≤ {}", min, max),
            Rule::Range { min: Some(min), max: None } => format!("value ≥ {}", min),
            Rule::Range { min: None, max: Some(max) } => format!("value ≤ {}", max),
            Rule::Range { min: None, max: None } => "any number".to_string(),
            Rule::Allowed { values } => format!("one of: {}", values.join(", ")),
        };
        println!("│ {:14} │ {:44} │", rule.datapoint.as_str(), truncate(&description, 44));
    }
    println!("╰────────────────┴──────────────────────────────────────────────╯");
    println!("\nTime zone: {}", engine.timezone);
    config.validate_rooms()?;
    println!("Rooms: {}", config.rooms.join(", "));

    Ok(())
}

fn generate_config(output: Option<PathBuf>) -> Result<()> {
    let example = format!(
        "# Roomwatch Configuration File\n\
         #\n\
         # Copy this file to /etc/roomwatch/config.toml or ~/.config/roomwatch/config.toml\n\n{}",
        AppConfig::example()?
    );

    if let Some(path) = output {
        std::fs::write(&path, example)?;
        println!("Configuration written to: {:?}", path);
    } else {
        println!("{}", example);
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
