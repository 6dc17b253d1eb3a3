//! Vigil: scheduled batch workflows
//!
//! Main binary with subcommands:
//! - `run`: Register the workflow triggers and run until Ctrl-C
//! - `validate-cron`: Check a cron expression and preview its fire times

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod daemon;
mod trigger_store;

#[derive(Parser)]
#[command(name = "vigil")]
#[command(about = "Checkpointed batch workflow engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and workflow service (dry-run collaborators)
    Run(config::RunArgs),

    /// Validate a cron expression and print its next fire times
    ValidateCron {
        /// Six-field expression (sec min hour dom mon dow) or @descriptor
        #[arg(value_name = "EXPR")]
        expr: String,

        /// Number of upcoming fire times to print
        #[arg(long, default_value = "5")]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "vigil=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            let config = args.into_config().into_diagnostic()?;
            daemon::run(config).await
        }

        Commands::ValidateCron { expr, count } => validate_cron(&expr, count),
    }
}

fn validate_cron(expr: &str, count: usize) -> Result<()> {
    let schedule = vigil_scheduler::parse_cron(expr).into_diagnostic()?;

    println!("valid: {}", expr.trim());
    for fire in schedule.upcoming(chrono::Utc).take(count) {
        println!("  {}", fire.to_rfc3339());
    }
    Ok(())
}
