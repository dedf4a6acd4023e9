use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use stevedore_http::Stevedore;
use stevedore_registry::Registry;

mod config;
use crate::config::Config;

#[derive(Parser)]
struct Cli {
    #[arg(short, long)]
    config_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .compact()
        .init();

    // load configuration
    let mut dev_config = File::open(cli.config_file.unwrap_or("./dev-config.yml".into()))?;
    let mut s = String::new();
    dev_config.read_to_string(&mut s)?;
    let config: Config = serde_yaml::from_str(&s)?;

    // initialize persistence layer
    let records = config.metadata.new_records().await?;
    let registry = Registry::new(records, &config.storage).await?;

    let router = Stevedore::new(registry).router()?;

    // run HTTP server
    tracing::info!("listening on {}", config.listen);
    axum::Server::bind(&config.listen)
        .serve(router.into_make_service())
        .await?;

    Ok(())
}
