use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;
mod moves;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Check(args) => args.run(),
        Command::Run(args) => args.run(),
    }
}

#[derive(Parser)]
#[command(name = "legato", about = "Motion core harness for Legato")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a machine configuration and print a summary.
    Check(cli::check::CheckArgs),
    /// Run a move list through the planner on a simulated coprocessor.
    Run(cli::run::RunArgs),
}
