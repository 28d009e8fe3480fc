use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load the cache from the durable store and serve the HTTP API.
    Serve {
        /// Address to listen on, overrides config and DOCSIFT_LISTEN_ADDR
        #[clap(short, long)]
        listen: Option<String>,

        /// Run a warmup in the background after the cold start
        #[clap(long, default_value = "false")]
        warmup: bool,
    },

    /// Index the source folder unless the durable store already holds chunks.
    Warmup {},

    /// Re-index the source folder unconditionally.
    Refresh {},

    /// Search indexed documents
    Search {
        /// Query text. Omit to list the first cached chunks.
        query: Vec<String>,

        /// Maximum number of results
        #[clap(short = 'k', long)]
        top_k: Option<usize>,

        /// Print the full response as JSON instead of formatted citations
        #[clap(long, default_value = "false")]
        json: bool,
    },

    /// Print cache status
    Status {},

    /// Drop every cached chunk, in memory and in the durable store.
    Clear {
        /// Auto confirm
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },
}
