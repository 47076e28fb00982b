use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, warn};

use feedrelay::{
    Config, HttpFetcher, JsonFileStore, Poller, Scheduler, SharedState, StateStore, TelegramSink,
};

#[tokio::main]
async fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load_with_env("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    // Initialize logging
    if let Err(e) = feedrelay::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        feedrelay::logging::init_console_only(&config.logging.level);
    }

    info!("feedrelay - Feed notification relay");

    if let Err(e) = config.validate() {
        error!("{}", e);
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> feedrelay::Result<()> {
    let store = JsonFileStore::new(&config.storage.data_dir);
    info!("State directory: {}", store.dir().display());
    let store: Arc<dyn StateStore> = Arc::new(store);
    let shared = Arc::new(SharedState::load(store)?);

    let fetcher = Arc::new(HttpFetcher::new(&config.fetch)?);
    let sink = Arc::new(TelegramSink::new(&config.telegram)?);
    let poller = Arc::new(Poller::new(
        Arc::clone(&shared),
        fetcher,
        sink,
        config.relay.mirror_to_channel,
    ));
    let scheduler = Scheduler::new(Arc::clone(&poller), config.relay.default_interval_minutes);

    if config.relay.poll_on_startup {
        info!("Running startup poll");
        poller.run_all().await;
    }

    let scheduled = scheduler.schedule_all().await?;
    info!("Scheduled {} subscriber(s)", scheduled);

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutting down");
    scheduler.shutdown();
    shared.flush().await?;
    info!("State saved");
    Ok(())
}
