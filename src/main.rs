// file: src/main.rs
// version: 2.0.0
// guid: 053d947c-fb90-4b24-a003-96c59e569c28

//! container-host-setup - Main entry point

use clap::Parser;
use colored::Colorize;
use container_host_setup::{
    cli::{
        args::{Cli, Commands},
        commands::{check_command, ports_command, setup_command},
    },
    logging::{init_logger, LogOptions},
    Result,
};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let log_file = init_logger(&LogOptions {
        verbose: cli.verbose,
        quiet: cli.quiet,
        json: cli.json_logs,
        file: Some(cli.log_file.clone()),
    })?;

    match cli.command {
        Commands::Setup(args) => setup_command(args, log_file).await,
        Commands::Check(args) => check_command(args).await.map(|()| 0),
        Commands::Ports { action, ports_file } => ports_command(action, &ports_file).map(|()| 0),
    }
}
