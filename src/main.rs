use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use gbfs_loader::{Delivery, FeedName, SubscribeError, SubscriptionManager};
use std::path::PathBuf;
use std::time::Duration;

mod config;

use config::Config;

#[derive(Parser, Debug)]
#[command(
    name = "gbfs-loader",
    about = "Keep GBFS bikeshare feeds fresh and log every update"
)]
struct Args {
    /// Configuration file listing the systems to follow
    #[arg(long, value_name = "FILE", default_value = "gbfs.toml")]
    config: PathBuf,

    /// Seconds between refresh ticks (overrides the config file)
    #[arg(long, value_name = "SECONDS")]
    interval: Option<u64>,

    /// Refresh every system once, then exit
    #[arg(long)]
    once: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from '{}'", args.config.display()))?;
    if let Some(interval) = args.interval {
        config.interval_secs = interval;
    }

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(threads) = config.worker_threads {
        builder.worker_threads(threads.max(1));
    }
    let runtime = builder.build().context("Failed to start Tokio runtime")?;

    runtime.block_on(run(config, args.once))
}

fn log_delivery(system: &str, delivery: &Delivery) {
    let count = |name: FeedName, key: &str| {
        delivery
            .feed(name)
            .and_then(|feed| feed.records(key))
            .map_or(0, <[_]>::len)
    };
    let vehicle_key = match delivery.version() {
        gbfs_loader::GbfsVersion::V2 => "bikes",
        gbfs_loader::GbfsVersion::V3 => "vehicles",
    };

    tracing::info!(
        system,
        feeds = delivery.feeds().len(),
        stations = count(FeedName::StationStatus, "stations"),
        vehicles = delivery
            .vehicle_status()
            .and_then(|feed| feed.records(vehicle_key))
            .map_or(0, <[_]>::len),
        "Received delivery"
    );

    if let Some(result) = delivery.validation_result() {
        for (feed, file) in result.files.iter().filter(|(_, file)| !file.is_valid()) {
            tracing::warn!(system, %feed, errors = ?file.errors, "Validation errors");
        }
    }
}

async fn run(config: Config, once: bool) -> Result<()> {
    let manager = SubscriptionManager::new();
    let token_client = reqwest::Client::new();

    for system in &config.systems {
        let options = system
            .to_options(&token_client)
            .with_context(|| format!("Invalid configuration for system '{}'", system.name))?;

        let name = system.name.clone();
        let result = manager
            .subscribe_with_interceptor(
                system.version,
                options,
                move |delivery: Delivery| log_delivery(&name, &delivery),
                None,
            )
            .await;

        match result {
            Ok(id) => tracing::info!(system = %system.name, subscription = %id, "Following system"),
            Err(SubscribeError::Unreachable(e)) => {
                tracing::warn!(system = %system.name, error = %e, "System unreachable, skipping");
            }
            Err(SubscribeError::Configuration(e)) => {
                tracing::error!(system = %system.name, error = %e, "System misconfigured, skipping");
            }
        }
    }

    if manager.is_empty() {
        anyhow::bail!("No system could be subscribed");
    }

    if once {
        manager.update();
    } else {
        let mut ticker = tokio::time::interval(config.interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => manager.update(),
                signal = tokio::signal::ctrl_c() => {
                    signal.context("Failed to listen for Ctrl-C")?;
                    tracing::info!("Shutting down");
                    break;
                }
            }
        }
    }

    shutdown(&manager, config.unsubscribe_timeout()).await;
    Ok(())
}

async fn shutdown(manager: &SubscriptionManager, timeout: Duration) {
    let pending = manager
        .ids()
        .into_iter()
        .map(|id| {
            let wait = manager.unsubscribe_async_with_timeout(&id, timeout);
            async move { (id, wait.await) }
        })
        .collect::<Vec<_>>();

    for (id, result) in join_all(pending).await {
        if let Err(e) = result {
            tracing::warn!(subscription = %id, error = %e, "Unsubscribe did not complete cleanly");
        }
    }
}
