use clap::{Parser, Subcommand};

mod handlers;

pub use handlers::*;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP service with the daily catalog refresh.
    Serve {
        /// Listen address, overrides `server.addr`
        #[clap(short, long)]
        addr: Option<String>,

        /// Do not run the catalog refresh scheduler
        #[clap(long, default_value = "false")]
        no_refresh: bool,
    },

    /// Find the catalog products most similar to each target
    Query {
        /// Target product descriptions
        #[clap(required = true, allow_hyphen_values = true)]
        targets: Vec<String>,

        /// Print progress events to stderr as JSON lines
        #[clap(short, long, default_value = "false")]
        progress: bool,
    },

    /// Show retriever candidates and their distances, without reranking
    Search {
        #[clap(allow_hyphen_values = true)]
        query: String,
    },

    /// Delete the vector index and build it again
    Reindex {},

    /// Fetch the catalog from the upstream service
    Refresh {
        /// Keep running and refresh daily at `refresh.daily_at`
        #[clap(short, long, default_value = "false")]
        daemon: bool,
    },

    /// Store the catalog service token
    ConfigureToken {},
}
