use drover_core::campaign::Campaign;
use drover_core::config::CampaignConfig;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{Level, debug, error, info};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Campaign configuration, JSON or `.toml`.
    #[clap(value_parser)]
    config: PathBuf,
    /// Log at debug level regardless of `debugMode`.
    #[clap(short, long)]
    verbose: bool,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let config = CampaignConfig::load_from_file(&cli.config)
        .with_context(|| format!("Could not load campaign configuration {:?}", cli.config))?;

    let level = if config.debug_mode || cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    info!(config = ?cli.config, "loaded configuration");
    debug!("Effective configuration: {config:#?}");

    let campaign = Campaign::new(Arc::new(config));
    match campaign.run() {
        Ok(summary) => {
            println!(
                "\nCampaign finished in {:.2?}: {} iterations, {} crashes, {} interesting.",
                summary.elapsed,
                summary.totals.iterations,
                summary.totals.crashes,
                summary.totals.interesting
            );
            Ok(())
        }
        Err(e) => {
            error!(error = ?e, "campaign aborted");
            Err(e.into())
        }
    }
}
