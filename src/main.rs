mod cmd;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use skippy::Config;

const LOG_ENV: &str = "SKIPPY_LOG";

#[derive(Parser)]
#[command(
    name = "skippy",
    version,
    about = "Predictive test skipping - inspect and maintain the test-impact snapshot",
    long_about = "Decides which tests can reuse their previous outcome because nothing they covered has changed, and maintains the per-project snapshot those decisions are based on."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Project root (snapshot, config and class roots resolve against it)
    #[arg(short, long, default_value = ".", global = true)]
    project: PathBuf,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Decision for every recorded test against the current workspace
    Status {
        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },

    /// Decide whether one test must run
    Decide {
        /// Test id: <class>#<method>, or a class name with --class
        test: String,

        /// Decide for every recorded method of the class at once
        #[arg(long)]
        class: bool,

        #[arg(long)]
        json: bool,
    },

    /// Record the coverage of a test that ran, merging it into the snapshot
    Record {
        /// Test id: <class>#<method>
        test: String,

        /// File listing covered units one per line ("-" for stdin)
        #[arg(short, long)]
        covered: PathBuf,
    },

    /// Print the stored snapshot
    Show {
        #[arg(long)]
        json: bool,
    },

    /// Recorded tests whose last run covered a unit
    Impacted {
        /// Fully-qualified unit name
        unit: String,
    },

    /// Fingerprint one unit, or every unit under the class roots
    Fingerprint {
        /// Fully-qualified unit name
        unit: Option<String>,
    },

    /// Delete the stored snapshot (every test runs next session)
    Clean,

    /// Show the effective configuration
    Config,
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let project = cli.project;
    if let Commands::Config = cli.command {
        return cmd::show_config(&project);
    }
    let config = Config::load(&project)?;

    match cli.command {
        Commands::Status { json } => {
            cmd::status(&project, &config, json, cli.verbose)?;
        }

        Commands::Decide { test, class, json } => {
            cmd::decide(&project, &config, &test, class, json)?;
        }

        Commands::Record { test, covered } => {
            cmd::record(&project, &config, &test, &covered)?;
        }

        Commands::Show { json } => {
            cmd::show(&project, &config, json)?;
        }

        Commands::Impacted { unit } => {
            cmd::impacted(&project, &config, &unit)?;
        }

        Commands::Fingerprint { unit } => {
            cmd::fingerprint(&project, &config, unit.as_deref())?;
        }

        Commands::Clean => {
            cmd::clean(&project, &config)?;
        }

        Commands::Config => {
            cmd::show_config(&project)?;
        }
    }

    Ok(())
}
