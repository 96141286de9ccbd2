use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::prelude::*;

use sso_coord::config::{CoordinatorConfig, load_config};

mod remote;
mod simulation;

use crate::simulation::Scenario;

#[derive(Parser, Debug)]
#[command(name = "sso-tabs")]
#[command(about = "Simulate browser tabs sharing one SSO authorization flow")]
struct Cli {
    /// Number of tabs to open
    #[arg(short, long, default_value = "3")]
    tabs: usize,

    /// Organization enforcing SAML SSO
    #[arg(short, long, default_value = "acme")]
    organization: String,

    /// Repository the tabs are working in
    #[arg(short, long)]
    repository: Option<String>,

    /// Delay before the simulated human completes authorization (or clicks "later")
    #[arg(long, default_value = "4000")]
    authorize_after_ms: u64,

    /// Dismiss the prompt with "remind me later" instead of authorizing
    #[arg(long)]
    later: bool,

    /// Use a file-backed coordination store at this path
    #[arg(long)]
    store: Option<PathBuf>,

    /// Coordinator config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the polling interval
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Cli {
    fn scenario(&self) -> Scenario {
        Scenario {
            tabs: self.tabs,
            organization: self.organization.clone(),
            repository: self.repository.clone(),
            authorize_after: Duration::from_millis(self.authorize_after_ms),
            later: self.later,
            store: self.store.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so the report on stdout stays machine-readable.
    let default_directive = if cli.debug {
        "sso_coord=debug,sso_tabs=debug,info"
    } else {
        "sso_coord=info,sso_tabs=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let mut config: CoordinatorConfig = load_config(cli.config.as_deref())
        .extract()
        .context("failed to load coordinator config")?;
    if let Some(interval) = cli.poll_interval_ms {
        config.poll_interval_ms = interval;
    }

    info!(
        tabs = cli.tabs,
        organization = %cli.organization,
        cooldown_ms = config.cooldown_ms,
        poll_interval_ms = config.poll_interval_ms,
        "starting simulation"
    );

    let report = simulation::run(&cli.scenario(), config).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to encode report")?
    );
    Ok(())
}
