use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use price_relay_core::{
    config::load_price_config, types::DurationInSeconds, Controller, ControllerConfig,
    DryRunLedger, FeedId, Observation, PriceCallback, PriceStreamClient, SchedulerConfig,
    SessionConfig,
};
use price_relay_hermes::{HermesClient, HermesConfig};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Log level or filter directive (e.g. `info`, `price_relay_core=debug`).
    #[clap(long, global = true, default_value = "info")]
    log_level: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to the price stream and log every update.
    Stream(StreamArgs),
    /// Run the relayer against an in-memory ledger.
    DryRun(DryRunArgs),
}

#[derive(Args, Debug)]
struct EndpointArgs {
    /// Price service WebSocket endpoint URL.
    #[clap(short = 'w', long, default_value = "wss://xc-mainnet.pyth.network/ws")]
    price_service_ws_endpoint: String,

    /// Price service REST endpoint URL.
    #[clap(short = 's', long, default_value = "https://xc-mainnet.pyth.network")]
    price_service_endpoint: String,
}

#[derive(Args, Debug)]
struct StreamArgs {
    #[clap(flatten)]
    endpoints: EndpointArgs,

    /// Feed ids to follow. Used together with `--price-config`.
    #[clap(long = "id")]
    ids: Vec<String>,

    /// Path to a price configuration YAML file whose feeds are followed.
    #[clap(short = 'c', long)]
    price_config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct DryRunArgs {
    #[clap(flatten)]
    endpoints: EndpointArgs,

    /// Path to the price configuration YAML file.
    #[clap(short = 'c', long, default_value = "price-config.yaml")]
    price_config: PathBuf,

    /// Frequency (in seconds) for checking and pushing price updates.
    #[clap(long, default_value_t = 10)]
    pushing_frequency: DurationInSeconds,

    /// Frequency (in seconds) of one-shot source price polls.
    #[clap(long, default_value_t = 5)]
    polling_frequency: DurationInSeconds,

    /// Seconds the first flagged feed waits for others to join its batch.
    #[clap(long, default_value_t = 0)]
    batching_duration: DurationInSeconds,

    /// Seconds a pushed feed is left alone before it is checked again.
    #[clap(long, default_value_t = 10)]
    cooldown_duration: DurationInSeconds,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).context("Invalid log level specified")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();
    debug!(?cli, "Parsed command line arguments");

    match cli.command {
        Command::Stream(args) => run_stream(args).await,
        Command::DryRun(args) => run_dry_run(args).await,
    }
}

async fn run_stream(args: StreamArgs) -> Result<()> {
    let mut feed_ids = args
        .ids
        .iter()
        .map(|id| id.parse::<FeedId>().with_context(|| format!("Invalid feed id: {}", id)))
        .collect::<Result<Vec<_>>>()?;
    if let Some(path) = &args.price_config {
        let configs = load_price_config(path)?;
        feed_ids.extend(configs.iter().map(|c| c.id));
    }
    if feed_ids.is_empty() {
        anyhow::bail!("No feeds to follow: pass --id or --price-config");
    }

    let stream = PriceStreamClient::new(SessionConfig::new(args.endpoints.price_service_ws_endpoint))?;
    let hermes = HermesClient::new(HermesConfig::new(args.endpoints.price_service_endpoint))?;

    match stream.refresh(&hermes, &feed_ids).await {
        Ok(count) => info!(count, "Fetched initial prices"),
        Err(e) => error!(error = %e, "Initial price fetch failed"),
    }

    let callback: PriceCallback = Arc::new(|feed_id: &FeedId, observation: &Observation| {
        info!(
            %feed_id,
            price = observation.price,
            conf = observation.conf,
            expo = observation.expo,
            publish_time = observation.publish_time,
            "Price update"
        );
    });
    let handle = stream.subscribe(&feed_ids, callback).await;
    info!(count = feed_ids.len(), "Subscribed to price feeds. Press Ctrl-C to exit.");

    tokio::signal::ctrl_c().await?;
    stream.unsubscribe(handle.feed_ids(), Some(&handle)).await;
    stream.stop().await;
    Ok(())
}

async fn run_dry_run(args: DryRunArgs) -> Result<()> {
    info!("Starting price relay in dry-run mode...");

    let price_configs = load_price_config(&args.price_config)
        .with_context(|| format!("Failed to load price config from {:?}", args.price_config))?;
    info!(count = price_configs.len(), path = %args.price_config.display(), "Loaded price configs");

    let stream = Arc::new(PriceStreamClient::new(SessionConfig::new(
        args.endpoints.price_service_ws_endpoint,
    ))?);
    let hermes = Arc::new(HermesClient::new(HermesConfig::new(
        args.endpoints.price_service_endpoint,
    ))?);
    let ledger = Arc::new(DryRunLedger::new(Arc::clone(stream.cache())));

    let config = ControllerConfig {
        pushing_frequency: Duration::from_secs(args.pushing_frequency),
        polling_frequency: Duration::from_secs(args.polling_frequency),
        scheduler: SchedulerConfig {
            batching_window: Duration::from_secs(args.batching_duration),
            cooldown: Duration::from_secs(args.cooldown_duration),
        },
    };
    info!(?config, "Initializing Controller");
    let controller = Controller::new(price_configs, Arc::clone(&stream), hermes, ledger, config)?;

    let run = controller.start();
    tokio::pin!(run);
    let result = tokio::select! {
        result = &mut run => result,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown requested");
            controller.stop();
            run.await
        }
    };
    stream.stop().await;

    if let Err(e) = result {
        error!(error = %e, "Controller loop exited with error");
        return Err(e).context("Controller failed");
    }
    Ok(())
}
