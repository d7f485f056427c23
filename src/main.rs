use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fintrack_sync::handlers::{log_state_changes, CompositeNoticeHandler, ConsoleNoticeHandler};
use fintrack_sync::{
    Collaborators, Config, FinanceTracker, FunctionMarketData, HttpAssetPriceProvider, MemoryRemote, StateError,
    SupabaseClient, SupabaseRealtime,
};

fn collaborators(config: &Config) -> Collaborators {
    let mut notices = CompositeNoticeHandler::new();
    notices.add_handler(Arc::new(ConsoleNoticeHandler::new()));
    let notices = Arc::new(notices);
    let fallback_prices = Arc::new(HttpAssetPriceProvider::new(config.price_fallback_url.clone()));

    match (&config.supabase_url, config.realtime_endpoint()) {
        (Some(url), Some(realtime_url)) => {
            info!("Supabase URL: {}", url);
            let client = Arc::new(SupabaseClient::new(url.clone(), config.anon_key.clone(), config.access_token.clone()));
            if !client.has_session() {
                warn!("SUPABASE_ACCESS_TOKEN not set; remote sync needs a signed-in session");
            }
            Collaborators {
                remote: client.clone(),
                feed: Arc::new(SupabaseRealtime::new(realtime_url, config.access_token.clone())),
                functions: client.clone(),
                market_data: Arc::new(FunctionMarketData::new(client.clone())),
                fallback_prices,
                refresher: client,
                notices,
            }
        }
        _ => {
            warn!("SUPABASE_URL not set; using the in-memory remote");
            let remote = Arc::new(MemoryRemote::with_user("local"));
            Collaborators {
                remote: remote.clone(),
                feed: remote.clone(),
                functions: remote.clone(),
                market_data: Arc::new(FunctionMarketData::new(remote.clone())),
                fallback_prices,
                refresher: remote,
                notices,
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_level(true)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    let config = Config::from_env();

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?
        .block_on(async {
            info!("Initializing finance tracker v{}...", fintrack_sync::VERSION);
            let tracker = FinanceTracker::new(config.clone(), collaborators(&config));
            let _change_log = log_state_changes(tracker.store());

            match tracker.start().await {
                Ok(report) => info!(
                    applied = report.applied.len(),
                    kept = report.kept.len(),
                    failed = report.failed.len(),
                    "initial sync complete"
                ),
                Err(StateError::AuthRequired) => warn!("no signed-in session; running local-only"),
                Err(err) => warn!("initial sync failed; continuing: {}", err),
            }

            info!("Finance tracker is running. Press Ctrl+C to stop.");
            tokio::signal::ctrl_c().await?;

            info!("Shutting down...");
            tracker.shutdown().await;
            Ok::<(), anyhow::Error>(())
        })
}
