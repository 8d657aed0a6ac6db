use std::panic;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, LevelFilter};
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::Config;
use prometheus::Registry;

use agent::config::parse_configs;
use agent::goprofile::GoProfile;
use common::common::collector::{Collector, ProfileSample};

#[derive(Debug, Parser)]
#[command(name = "goprofile-agent", about = "Pulls pprof profiles from Go processes")]
struct CliArgs {
    /// JSON file with the list of jobs.
    #[arg(long, short)]
    config: PathBuf,

    #[arg(long, default_value = "info")]
    log_level: LevelFilter,
}

/// Writes a one-line summary of every sample to the log.
struct LogCollector;

impl Collector for LogCollector {
    fn collect(&self, sample: ProfileSample) {
        info!(
            "{} {} {}: {} stacks, total {} {} ({})",
            sample.labels,
            sample.profile_kind,
            sample.name,
            sample.stacks.len(),
            sample.total(),
            sample.units,
            sample.aggregation
        );
    }
}

fn init_logging(level: LevelFilter) -> Result<()> {
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d(%Y-%m-%dT%H:%M:%S%.3f)} {l:<5} {t} - {m}{n}")))
        .build();
    let config = Config::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(level))?;
    log4rs::init_config(config)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level)?;

    panic::set_hook(Box::new(|panic_info| {
        error!("{}", panic_info);
        let backtrace = std::backtrace::Backtrace::capture();
        error!("backtrace: {:#?}", backtrace);
    }));

    let raw = tokio::fs::read_to_string(&args.config)
        .await
        .with_context(|| format!("reading {}", args.config.display()))?;
    let configs = parse_configs(&raw)?;

    let registry = Registry::new();
    let goprofile = GoProfile::new(Arc::new(LogCollector), &registry)?;
    goprofile.start(configs).await?;

    info!("agent started");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    goprofile.stop().await;
    Ok(())
}
