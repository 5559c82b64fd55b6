//! Command-line interface for the harvey launcher

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "harvey", version, about = "H.A.R.V.E.Y. pricing intelligence agent")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP service (the default)
    Serve {
        /// Bind address override (otherwise HTTP_HOST)
        #[arg(long)]
        host: Option<String>,
        /// Port override (otherwise HTTP_PORT)
        #[arg(long)]
        port: Option<u16>,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Serve {
            host: None,
            port: None,
        }
    }
}
