//! Conductor command-line entry point.
//!
//! Binary name: `cndr`
//!
//! Parses CLI arguments, initializes tracing and the workflow engine, then
//! dispatches to the appropriate command handler.

mod cli;
mod demo;
mod state;
mod templates;

use clap::Parser;
use clap_complete::generate;
use conductor_observe::tracing_setup::{
    filter_for_verbosity, init_tracing, shutdown_tracing, TracingOptions,
};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = TracingOptions {
        default_filter: filter_for_verbosity(cli.verbose, cli.quiet).to_string(),
        json: cli.json,
        enable_otel: cli.otel,
    };
    init_tracing(&options).map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let result = run(cli).await;
    shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Commands that don't need the engine
    match &cli.command {
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(*shell, &mut cmd, "cndr", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Example {
            template,
            url,
            format,
        } => {
            return cli::workflow::example(*template, url, *format);
        }
        _ => {}
    }

    let state = AppState::init().await?;
    let json = cli.json;

    match cli.command {
        Commands::Submit { file } => cli::workflow::submit(&state, &file, json).await,
        Commands::Run { target } => cli::workflow::run(&state, &target, json).await,
        Commands::Status { id } => cli::workflow::status(&state, &id, json).await,
        Commands::List { status } => cli::workflow::list(&state, status, json).await,
        Commands::Delete { id } => cli::workflow::delete(&state, &id, json).await,
        Commands::Completions { .. } | Commands::Example { .. } => Ok(()),
    }
}
