//! Tandem CLI - run notebook cells against a scenario from the command line.

mod cell;
mod inspect;
mod run;
mod session;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tandem_core::{Language, Theme};

use crate::cell::CellArg;

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Dual-engine (SQL + script) notebook core")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Session configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a scenario and run cells in order
    Run {
        /// Path to the scenario (.json file)
        scenario: PathBuf,

        /// Cell to run, as `<lang>:<code>` (repeatable)
        #[arg(short = 'c', long = "cell", required = true)]
        cells: Vec<CellArg>,

        /// Chart theme
        #[arg(long, default_value = "dark")]
        theme: Theme,

        /// Pretty-print each result
        #[arg(long)]
        pretty: bool,
    },

    /// List the tables visible to one language
    Symbols {
        /// Path to the scenario (.json file)
        scenario: PathBuf,

        /// Language to introspect
        #[arg(long, default_value = "script")]
        lang: Language,
    },

    /// Load a scenario and report the script runtime status
    Status {
        /// Path to the scenario (.json file)
        scenario: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    // stdout carries results
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    // Helper to format tandem-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(tandem_err) = err.downcast_ref::<tandem_core::Error>() {
            anyhow::anyhow!("{}", tandem_err.with_hint())
        } else {
            err
        }
    };

    let config = cli.config.as_deref();
    match cli.command {
        Commands::Run {
            scenario,
            cells,
            theme,
            pretty,
        } => {
            run::execute(&scenario, config, &cells, theme, pretty)
                .await
                .map_err(format_error)?;
        }

        Commands::Symbols { scenario, lang } => {
            inspect::symbols(&scenario, config, lang)
                .await
                .map_err(format_error)?;
        }

        Commands::Status { scenario } => {
            inspect::status(&scenario, config).await.map_err(format_error)?;
        }
    }

    Ok(())
}
