pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "expensa",
    about = "Expensa operator CLI",
    long_about = "Operate the expense approval runtime: migrations, config inspection, readiness checks and one-off escalation passes.",
    after_help = "Examples:\n  expensa doctor --json\n  expensa config\n  expensa escalate --stale-after-hours 48"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Run one escalation pass over stale approvals and print its summary")]
    Escalate {
        #[arg(long, help = "Override escalation.stale_after_hours for this run")]
        stale_after_hours: Option<u32>,
    },
    #[command(about = "Validate config, DB connectivity and migration state")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Escalate { stale_after_hours } => commands::escalate::run(stale_after_hours),
        Command::Doctor { json } => commands::doctor::run(json),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
