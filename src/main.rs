//! `harvey` - the pricing intelligence agent service
//!
//! Launches the HTTP facade around the Harvey agent core. Exit codes are
//! part of the contract: 0 ok, 2 configuration error, 3 bind failure,
//! 4 upstream unreachable at startup.

use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use harvey_core::error::HarveyError;
use harvey_core::server;
use harvey_core::Settings;

use crate::cli::{Cli, Commands};

mod cli;

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 2;
const EXIT_BIND: i32 = 3;
const EXIT_UPSTREAM: i32 = 4;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    let mut settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("harvey: {err}");
            return EXIT_CONFIG;
        }
    };

    init_tracing(&settings.log_level);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        git = env!("GIT_HASH"),
        "starting harvey"
    );

    match cli.command.unwrap_or_default() {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                settings.http_host = host;
            }
            if let Some(port) = port {
                settings.http_port = port;
            }
            serve(settings).await
        }
    }
}

async fn serve(settings: Settings) -> i32 {
    if let Err(err) = settings.validate_for_serve() {
        error!(%err, "invalid configuration");
        return EXIT_CONFIG;
    }

    if let Some(unreachable) = probe_upstreams(&settings).await {
        error!(upstream = %unreachable, "upstream unreachable at startup");
        return EXIT_UPSTREAM;
    }

    let state = match server::build_state(&settings).await {
        Ok(state) => state,
        Err(err) => {
            error!(%err, "failed to initialise service");
            return EXIT_CONFIG;
        }
    };

    match server::serve(&settings, state).await {
        Ok(()) => EXIT_OK,
        Err(HarveyError::BindError { addr, message }) => {
            error!(%addr, %message, "failed to bind");
            EXIT_BIND
        }
        Err(err) => {
            error!(%err, "server terminated");
            1
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Probe the configured upstream services; any HTTP response counts as
/// reachable, only transport failures do not. Returns the first
/// unreachable base URL.
async fn probe_upstreams(settings: &Settings) -> Option<String> {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
    {
        Ok(client) => client,
        Err(_) => return None,
    };

    for base_url in [&settings.amint_base_url, &settings.analysis_base_url]
        .into_iter()
        .flatten()
    {
        if client.get(base_url.as_str()).send().await.is_err() {
            return Some(base_url.clone());
        }
        info!(upstream = %base_url, "upstream reachable");
    }
    None
}
