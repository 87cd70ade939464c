// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Northgate CLI
//!
//! # Usage
//!
//! ```bash
//! # Run the gateway
//! northgate run --config gateway.toml
//!
//! # Generate an example configuration
//! northgate gen-config --output gateway.toml
//!
//! # Check a configuration file
//! northgate validate --config gateway.toml
//!
//! # Show history queries and their status
//! northgate history --config gateway.toml
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use northgate::history::{HistoryQueryRepository, SqliteHistoryRepository};
use northgate::status::LogStatusSink;
use northgate::{ConnectorStatsSnapshot, DriverRegistry, Engine, GatewayConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Northgate store-and-forward gateway
#[derive(Parser, Debug)]
#[command(name = "northgate")]
#[command(about = "Northgate - store-and-forward industrial data gateway")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway until Ctrl+C
    Run {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,

        /// Statistics reporting interval (seconds, 0 to disable)
        #[arg(long, default_value = "60")]
        stats_interval: u64,
    },

    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "gateway.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },

    /// List history queries and their status
    History {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Run {
            config,
            stats_interval,
        } => cmd_run(config, stats_interval, args.log_level).await,
        Commands::GenConfig { output } => {
            init_logging(args.log_level.as_deref().unwrap_or("info"));
            cmd_gen_config(output)
        }
        Commands::Validate { config } => {
            init_logging(args.log_level.as_deref().unwrap_or("info"));
            cmd_validate(config)
        }
        Commands::History { config } => {
            init_logging(args.log_level.as_deref().unwrap_or("info"));
            cmd_history(config)
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn cmd_run(
    config_path: PathBuf,
    stats_interval: u64,
    log_level: Option<String>,
) -> anyhow::Result<()> {
    let config = GatewayConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    init_logging(log_level.as_deref().unwrap_or(&config.engine.log_level));

    let registry = DriverRegistry::with_builtins();
    let mut engine = Engine::new(config, registry, Arc::new(LogStatusSink))?;

    println!("Northgate v{}", env!("CARGO_PKG_VERSION"));
    println!("=====================================");
    println!();
    for south in &engine.config().souths {
        println!(
            "South: {} ({}, {} items)",
            south.id,
            south.type_name,
            south.items.len()
        );
    }
    for north in &engine.config().norths {
        println!("North: {} ({})", north.id, north.type_name);
    }
    println!();
    println!("Press Ctrl+C to stop...");
    println!();

    engine.start().await?;

    let mut ticker = tokio::time::interval(Duration::from_secs(stats_interval.max(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            _ = ticker.tick(), if stats_interval > 0 => print_stats(&engine.stats()),
        }
    }

    println!("\nShutting down...");
    engine.stop().await;
    Ok(())
}

fn cmd_gen_config(output: PathBuf) -> anyhow::Result<()> {
    let toml_str = GatewayConfig::example().to_toml()?;
    let content = format!(
        r#"# Northgate Configuration
# Generated by northgate gen-config

{}
"#,
        toml_str
    );
    std::fs::write(&output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> anyhow::Result<()> {
    match GatewayConfig::from_file(&config_path) {
        Ok(config) => {
            let registry = DriverRegistry::with_builtins();
            println!("Configuration valid!");
            println!();
            println!("Gateway: {}", config.engine.name);
            println!("Scan modes: {}", config.scan_modes.len());
            for south in &config.souths {
                println!(
                    "  South {} ({}){}",
                    south.id,
                    south.type_name,
                    known(&registry.south_types(), &south.type_name)
                );
            }
            for north in &config.norths {
                println!(
                    "  North {} ({}){}",
                    north.id,
                    north.type_name,
                    known(&registry.north_types(), &north.type_name)
                );
            }
            println!("History queries: {}", config.history_queries.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}

fn known(types: &[&str], type_name: &str) -> &'static str {
    if types.contains(&type_name) {
        ""
    } else {
        " [no built-in driver]"
    }
}

fn cmd_history(config_path: PathBuf) -> anyhow::Result<()> {
    let config = GatewayConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    let repository =
        SqliteHistoryRepository::open(&config.engine.data_folder.join("history.db"))?;
    repository.seed(&config.history_queries)?;

    let queries = repository.list()?;
    if queries.is_empty() {
        println!("No history query configured.");
        return Ok(());
    }
    for query in queries {
        println!(
            "[{}] {} {} ({} -> {}) {} .. {}{}",
            query.config.order,
            query.id(),
            query.status,
            query.config.south_id,
            query.config.north_id,
            query.config.start_time,
            query.config.end_time,
            if query.config.enabled { "" } else { " [disabled]" }
        );
    }
    Ok(())
}

fn print_stats(stats: &[ConnectorStatsSnapshot]) {
    println!("--- Connector Statistics ---");
    for stat in stats {
        println!(
            "  {}: {} values ({:.1} values/s), {} files, {} discarded, {} errors",
            stat.connector_id,
            stat.values,
            stat.values_per_sec(),
            stat.files,
            stat.discarded,
            stat.errors
        );
    }
}
