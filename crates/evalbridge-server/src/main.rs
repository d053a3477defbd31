//! Evalbridge - evaluate code in a connected browser page.
//!
//! The page connects over WebSocket at `/ws`. Code posted to `/eval`, or
//! written to any watched file, is forwarded to the page and the result is
//! returned to the caller.

mod handler;
mod server;
mod ws;

use anyhow::Result;
use clap::Parser;
use evalbridge_core::{
    BridgeConfig, Broker, CancellationToken, ChangeFeed, FeedConfig, FeedSettings, ServerConfig,
    SessionSettings,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "evalbridge")]
#[command(about = "Bridge code evaluation requests to a connected browser page")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value_t = ServerConfig::DEFAULT_PORT)]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = ServerConfig::DEFAULT_HOST)]
    host: String,

    /// Seconds a submitted call waits for its reply
    #[arg(long, default_value_t = BridgeConfig::PENDING_CALL_TIMEOUT.as_secs())]
    pending_timeout_secs: u64,

    /// Seconds between keepalive pings (0 = disabled)
    #[arg(long, default_value_t = BridgeConfig::KEEPALIVE_INTERVAL.as_secs())]
    keepalive_secs: u64,

    /// Seconds to wait for a keepalive reply
    #[arg(long, default_value_t = BridgeConfig::KEEPALIVE_REPLY_TIMEOUT.as_secs())]
    keepalive_timeout_secs: u64,

    /// Seconds an `/eval` request waits for the page
    #[arg(long, default_value_t = ServerConfig::EVAL_REQUEST_TIMEOUT.as_secs())]
    eval_timeout_secs: u64,

    /// Files to evaluate whenever they are written
    #[arg(long, default_value = FeedConfig::DEFAULT_PATTERN)]
    watch: String,

    /// Milliseconds between rescans of the watch pattern
    #[arg(long, default_value_t = FeedConfig::RESCAN_INTERVAL.as_millis() as u64)]
    rescan_ms: u64,

    /// Disable the file watcher
    #[arg(long)]
    no_watch: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting evalbridge");

    let settings = SessionSettings::new()
        .with_pending_timeout(Duration::from_secs(args.pending_timeout_secs))
        .with_keepalive_interval(Duration::from_secs(args.keepalive_secs))
        .with_keepalive_timeout(Duration::from_secs(args.keepalive_timeout_secs));
    let broker = Arc::new(Broker::new(settings));

    let feed_token = CancellationToken::new();
    let feed_task = if args.no_watch {
        None
    } else {
        let feed_settings = FeedSettings::new()
            .with_pattern(args.watch.clone())
            .with_rescan_interval(Duration::from_millis(args.rescan_ms.max(1)));
        let feed = ChangeFeed::new(broker.clone(), feed_settings)?;
        Some(feed.spawn(feed_token.clone()))
    };

    let eval_timeout = Duration::from_secs(args.eval_timeout_secs);
    let addr = server::start_server(broker.clone(), eval_timeout, &args.host, args.port).await?;

    // Machine-readable port line for launchers and tests
    println!("EVALBRIDGE_PORT={}", addr.port());

    info!("Listening on {} (peer at ws://{}{})", addr, addr, ServerConfig::WS_PATH);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    broker.shutdown();
    feed_token.cancel();
    if let Some(task) = feed_task {
        if let Err(e) = task.await {
            error!("Change feed task failed: {}", e);
        }
    }

    Ok(())
}
