#![cfg(not(tarpaulin_include))]

use glucolog::{app, config::Config};

/// Starts the glucolog HTTP server
///
/// Configuration comes from the environment, see [`Config::load`]. Log
/// verbosity follows `RUST_LOG` and defaults to `info`.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load()?;
    app::run(config).await
}
