//! sphinx-oracled — the SPHINX password oracle daemon.
//!
//! Startup sequence:
//!   1. Parse the TOML configuration (`[server]` section)
//!   2. Initialise tracing
//!   3. Load the TLS certificate and key
//!   4. Run the accept loop; one bounded worker per connection

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use sphinx_server::{supervisor, Config};

#[derive(Parser, Debug)]
#[command(
    name = "sphinx-oracled",
    version,
    about = "SPHINX oracle — evaluates blinded password requests without ever seeing one"
)]
struct Args {
    /// Path to the configuration file.
    #[arg(long, default_value = "/etc/sphinx/oracle.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                let default = if config.verbose { "debug" } else { "info" };
                default.parse().expect("static filter string is valid")
            }),
        )
        .init();

    info!("SPHINX oracle starting");
    if config.verbose {
        config.log_settings();
    }

    supervisor::run(config).await
}
