mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mastery_common::types::Track;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mastery-cli")]
#[command(about = "Mastery CLI - Run, grade and check challenges in a local sandbox", long_about = None)]
struct Cli {
    /// Track configuration file (defaults to config/tracks.json or built-in settings)
    #[arg(long, global = true)]
    tracks: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a source file and print the raw result as JSON
    Run {
        /// Track to run under (sql, python)
        #[arg(short, long)]
        track: Track,

        /// Seed script loaded into the database first (SQL only)
        #[arg(short, long)]
        seed: Option<PathBuf>,

        /// Source file to execute
        file: PathBuf,
    },

    /// Grade a source file against a challenge definition
    Grade {
        /// JSON file holding one challenge or an array of them
        #[arg(short, long)]
        challenge: PathBuf,

        /// Challenge id when the file holds several
        #[arg(long)]
        id: Option<String>,

        /// Source file to grade
        file: PathBuf,
    },

    /// Grade every reference solution in a content directory
    Check {
        /// Content directory
        #[arg(short, long, default_value = "content")]
        content: PathBuf,
    },

    /// List the challenges in a content directory
    List {
        /// Content directory
        #[arg(short, long, default_value = "content")]
        content: PathBuf,

        /// Only show one track
        #[arg(short, long)]
        track: Option<Track>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so JSON on stdout stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let tracks = commands::load_tracks(cli.tracks.as_deref())?;

    match cli.command {
        Commands::Run { track, seed, file } => {
            commands::run_file(&tracks, track, seed.as_deref(), &file).await?;
        }
        Commands::Grade {
            challenge,
            id,
            file,
        } => {
            let passed = commands::grade_file(&tracks, &challenge, id.as_deref(), &file).await?;
            if !passed {
                std::process::exit(1);
            }
        }
        Commands::Check { content } => {
            let failures = commands::check_content(&tracks, &content).await?;
            if failures > 0 {
                std::process::exit(1);
            }
        }
        Commands::List { content, track } => {
            commands::list_challenges(&content, track)?;
        }
    }

    Ok(())
}
