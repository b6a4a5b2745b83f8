//! TreeCR command-line tool
//!
//! Replays two-participant scenarios through conflict resolution and manages
//! the resolver configuration file.

mod scenario;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scenario::Scenario;
use treecr_core::CrConfig;

#[derive(Parser, Debug)]
#[command(name = "treecr")]
#[command(author = "TreeCR Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Tree conflict resolution scenario runner")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Directory holding treecr.json
    #[arg(long, global = true, default_value = ".")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Replay a scenario file and print the merged tree
    Replay {
        scenario: PathBuf,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage the resolver configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Write the default configuration
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    match cli.command {
        Commands::Replay { scenario, json } => {
            let config = CrConfig::load(&cli.config_dir)?;
            run_replay(&scenario, config, json).await?;
        }

        Commands::Config { command } => match command {
            ConfigCommand::Init { force } => {
                let path = CrConfig::file_path(&cli.config_dir);
                if path.exists() && !force {
                    bail!("{:?} already exists (use --force to overwrite)", path);
                }
                CrConfig::default().save(&cli.config_dir)?;
                println!("Wrote default configuration to {}", path.display());
            }
            ConfigCommand::Show => {
                let config = CrConfig::load(&cli.config_dir)?;
                println!("{}", serde_json::to_string_pretty(&config)?);
            }
        },
    }

    Ok(())
}

async fn run_replay(path: &Path, config: CrConfig, json: bool) -> Result<()> {
    let loaded = Scenario::load(path)?;
    let replay = scenario::replay(&loaded, config).await?;
    let tree = scenario::render_tree(&replay.tree);
    let records = replay
        .report
        .as_ref()
        .map(|report| scenario::summarize(report, &replay.tree))
        .unwrap_or_default();

    if json {
        let output = serde_json::json!({
            "head": replay.head.to_hex(),
            "tree": tree,
            "resolutions": records,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Head: {}", replay.head.short());
    println!();
    for line in &tree {
        println!("  {}", line);
    }
    if replay.report.is_none() {
        println!();
        println!("Nothing to merge");
        return Ok(());
    }
    println!();
    println!("Resolutions:");
    for record in &records {
        let location = record.path.as_deref().unwrap_or("(removed)");
        println!("  {:<18} {} [{}] {}", format!("{:?}", record.resolution), location, record.node, record.detail);
    }
    Ok(())
}
