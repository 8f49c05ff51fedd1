use anyhow::Result;
use clap::{value_parser, Arg, ArgAction, Command};
use dirsvc_handle_table::HandleTable;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dirsvc_node::version::{git_commit_hash, DIRSVC_VERSION};
use dirsvc_node::{memory_dispatcher, AppConfig};

fn cli() -> Command {
    Command::new("dirsvc-node")
        .version(DIRSVC_VERSION)
        .about("Directory-service daemon")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path"),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .action(ArgAction::SetTrue)
                .help("Validate the configuration, then exit"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "json"])
                .help("Select log output format"),
        )
        .arg(
            Arg::new("stats-interval")
                .long("stats-interval")
                .value_name("SECS")
                .value_parser(value_parser!(u64))
                .help("Seconds between handle table stats snapshots"),
        )
        .arg(
            Arg::new("disable-stats")
                .long("disable-stats")
                .action(ArgAction::SetTrue)
                .help("Do not log periodic handle table stats"),
        )
}

fn load_config_with_overrides(matches: &clap::ArgMatches) -> Result<AppConfig> {
    let config_path = matches
        .get_one::<String>("config")
        .map(|value| value.as_str());
    let mut config = AppConfig::load(config_path)?;
    apply_overrides(matches, &mut config);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(matches: &clap::ArgMatches, config: &mut AppConfig) {
    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }

    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.clone();
    }

    if let Some(interval) = matches.get_one::<u64>("stats-interval") {
        config.stats_interval_secs = *interval;
    }

    if matches.get_flag("disable-stats") {
        config.stats_enabled = false;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    let config = load_config_with_overrides(&matches)?;

    if matches.get_flag("check") {
        println!(
            "dirsvc-node {} (commit {}): configuration from {} is valid",
            DIRSVC_VERSION,
            git_commit_hash(),
            config.source()
        );
        return Ok(());
    }

    init_logging(&config)?;
    info!(
        version = DIRSVC_VERSION,
        commit = git_commit_hash(),
        config = config.source(),
        "Starting directory-service daemon"
    );

    let table = HandleTable::new(config.limits.clone())?;
    let dispatcher = memory_dispatcher(table.clone(), config.search_chunk_size);
    info!(
        handle_capacity = config.limits.handles.capacity(),
        continuation_capacity = config.limits.continuations.capacity(),
        client_high_water = config.limits.client_high_water,
        "Handle table ready"
    );

    let stats_reporter = config.stats_enabled.then(|| {
        let table = table.clone();
        let period = Duration::from_secs(config.stats_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                log_stats(&table);
            }
        })
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down directory-service daemon");

    if let Some(reporter) = stats_reporter {
        reporter.abort();
    }

    // Release whatever connected clients still hold.
    let mut released = 0;
    for client in table.clients() {
        released += dispatcher.client_disconnected(&client);
    }
    log_stats(&table);

    info!(released, "Directory-service daemon shutdown complete");
    Ok(())
}

fn log_stats(table: &HandleTable) {
    match serde_json::to_string(&table.stats()) {
        Ok(snapshot) => info!(target: "dirsvc::stats", stats = %snapshot, "handle table stats"),
        Err(err) => warn!(error = %err, "failed to encode handle table stats"),
    }
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    Ok(())
}
