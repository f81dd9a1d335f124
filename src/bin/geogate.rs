//! geogate: forward-auth server for country based allow/block lists.

use anyhow::Context;
use geogate::{Config, MaxMindProvider, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log_filter()))
        .init();

    let server = Server::<MaxMindProvider>::new(&config).context("startup failed")?;
    server.run().await?;

    Ok(())
}
