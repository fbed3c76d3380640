use clap::Parser;
use tracing_subscriber::EnvFilter;

mod app;
mod catalog;
mod cli;
mod config;
mod credentials;
mod lock;
mod provider;
mod refresh;
mod rerank;
mod retry;
mod semantic;
#[cfg(test)]
mod tests;
mod web;

use app::AppFactory;
use cli::Command;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();
    let config = AppFactory::load_config()?;

    match args.command {
        Command::Serve { addr, no_refresh } => cli::handle_serve(&config, addr, no_refresh),
        Command::Query { targets, progress } => cli::handle_query(&config, targets, progress),
        Command::Search { query } => cli::handle_search(&config, query),
        Command::Reindex {} => cli::handle_reindex(&config),
        Command::Refresh { daemon } => cli::handle_refresh(&config, daemon),
        Command::ConfigureToken {} => cli::handle_configure_token(&config),
    }
}
