mod commands;
mod offline;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "nuptial")]
#[command(about = "Multi-agent wedding planning orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one planning session from a criteria file and print the plan
    Plan {
        /// Criteria JSON file (presupuesto_total, guest_count, ...)
        #[arg(short, long)]
        criteria: PathBuf,

        /// Provider seed records (JSON array)
        #[arg(short, long)]
        providers: Option<PathBuf>,

        /// Abort the session after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout: u64,

        /// Session memory directory
        #[arg(long, default_value = ".nuptial/sessions")]
        sessions: PathBuf,
    },

    /// Run one crawler sweep over seed records and print the report
    Sweep {
        /// Provider seed records (JSON array)
        #[arg(short, long)]
        providers: PathBuf,
    },

    /// Validate and list provider seed records
    Providers {
        /// Provider seed records (JSON array)
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Plan {
            criteria,
            providers,
            timeout,
            sessions,
        } => {
            commands::plan::run(&criteria, providers.as_deref(), timeout, &sessions).await?;
        }
        Commands::Sweep { providers } => {
            commands::sweep::run(&providers).await?;
        }
        Commands::Providers { file } => {
            commands::providers::run(&file)?;
        }
    }

    Ok(())
}
