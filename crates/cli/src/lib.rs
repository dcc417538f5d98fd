pub mod commands;

use clap::{Parser, Subcommand};
use parley_core::config::{AppConfig, LoadOptions};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "parley",
    about = "Parley assistant CLI",
    long_about = "Chat with the parley assistant from a terminal, inspect discovered tools, and check runtime readiness.",
    after_help = "Examples:\n  parley chat\n  parley tools --json\n  parley doctor --json"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Start an interactive chat session (`new`, `threads`, `quit` are commands)")]
    Chat,
    #[command(about = "Send a fixed script of questions on one conversation and print replies")]
    Auto,
    #[command(about = "Discover backend operations and list them grouped by backend")]
    Tools {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Validate config, database connectivity and backend discovery")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    // Commands that start backends log to stderr; config errors surface in
    // the command result instead.
    if matches!(cli.command, Command::Chat | Command::Auto | Command::Tools { .. }) {
        if let Ok(config) = AppConfig::load(LoadOptions::default()) {
            parley_server::init_logging(&config);
        }
    }

    let result = match cli.command {
        Command::Chat => commands::chat::run(),
        Command::Auto => commands::auto::run(),
        Command::Tools { json } => commands::tools::run(json),
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Migrate => commands::migrate::run(),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
