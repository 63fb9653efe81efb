//! regilo — container init entry point.
//!
//! Child output goes to stdout through the output sink; supervisor
//! diagnostics go to stderr via tracing.

use anyhow::Result;
use clap::Parser;
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

use regilo::config;
use regilo::envfile;
use regilo::output::OutputSink;
use regilo::signals;
use regilo::startup;
use regilo::supervisor::Supervisor;

#[derive(Debug, Parser)]
#[command(name = "regilo")]
#[command(about = "Container init and process supervisor", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Override the configuration file path (default /etc/regilo.json).
    #[arg(long)]
    config: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    // Logs always go to stderr so stdout stays reserved for child output.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Err(err) = run(cli) {
        tracing::error!("fatal: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config_path = config::resolve_config_path(cli.config.as_deref());
    let config = config::load_config(&config_path)?;
    if let Some(title) = &config.title {
        info!("{title}");
    }

    signals::install()?;

    let sink = OutputSink::stdout();

    envfile::write_env_file(Path::new("env"), &config.environment)?;
    startup::run_all(
        &config.startup,
        &config::resolve_state_path(),
        &sink,
        &config.environment,
    )?;

    let mut supervisor = Supervisor::new(&config, sink)?;
    supervisor.run()?;

    info!("Shutdown complete");
    Ok(())
}
