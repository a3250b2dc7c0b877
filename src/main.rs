use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use oco_tpsl_bot::config::{Config, LoggingConfig};
use oco_tpsl_bot::exchange::{BybitAuth, BybitClient, OrderFill, OrderStream};
use oco_tpsl_bot::oco::{BracketRequest, FillOutcome, OcoOrderManager, SymbolStatus};
use oco_tpsl_bot::TelegramNotifier;

type Manager = OcoOrderManager<BybitClient>;

const FILL_CHANNEL_CAPACITY: usize = 256;

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_logging(&config.logging)?;

    info!("🚀 OCO TP/SL manager starting...");
    info!("   Testnet: {}", config.bybit.testnet);
    info!("   REST URL: {}", config.bybit.rest_url);
    info!("   Hedge mode: {}", config.bybit.hedge_mode);

    let tg = match (&config.telegram.bot_token, &config.telegram.chat_id) {
        (Some(token), Some(chat_id)) if config.telegram.enabled && !token.is_empty() => {
            let notifier = TelegramNotifier::new(token.clone(), chat_id.clone());
            if let Err(e) = notifier.notify_startup(config.bybit.testnet).await {
                warn!("Failed to send startup notification: {}", e);
            }
            info!("📱 Telegram notifications enabled");
            Some(notifier)
        }
        _ => {
            info!("📱 Telegram notifications disabled");
            None
        }
    };

    let client = BybitClient::new(&config.bybit).context("failed to build Bybit client")?;
    let manager: Arc<Manager> = Arc::new(OcoOrderManager::new(
        Arc::new(client),
        config.manager_config(),
    ));
    info!("✅ OCO manager initialized");

    if config.reconciliation.enabled {
        let every = Duration::from_secs(config.reconciliation.interval_secs.max(1));
        tokio::spawn(run_reconciliation(manager.clone(), every, tg.clone()));
        info!("✅ Reconciliation every {}s", every.as_secs());
    }

    let stream_task = match (&config.bybit.api_key, &config.bybit.api_secret) {
        (Some(key), Some(secret)) if config.bybit.has_credentials() => {
            let (tx, rx) = mpsc::channel(FILL_CHANNEL_CAPACITY);
            let stream = OrderStream::new(
                config.bybit.ws_private_url.clone(),
                BybitAuth::new(key.clone(), secret.clone()),
            );
            tokio::spawn(dispatch_fills(manager.clone(), rx, tg.clone()));
            info!("✅ Fill stream configured");
            Some(tokio::spawn(stream.run(tx)))
        }
        _ => {
            warn!("No API credentials, fill events will only be picked up by reconciliation");
            None
        }
    };

    tokio::spawn(read_bracket_requests(manager.clone(), tg.clone()));
    info!("📥 Reading bracket requests (JSON lines) from stdin");

    match stream_task {
        Some(task) => {
            tokio::select! {
                result = task => match result {
                    Ok(Err(e)) => error!("Fill stream stopped: {:#}", e),
                    Err(e) => error!("Fill stream task panicked: {}", e),
                    Ok(Ok(())) => info!("Fill stream finished"),
                },
                _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received");
        }
    }

    let remaining = manager.tracked_symbols();
    if !remaining.is_empty() {
        warn!("Stopping with {} tracked symbol(s): {:?}", remaining.len(), remaining);
    }
    if let Some(tg) = tg {
        if let Err(e) = tg.notify_shutdown(remaining.len()).await {
            warn!("Failed to send shutdown notification: {}", e);
        }
    }

    info!("👋 Manager stopped");
    Ok(())
}

fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .context("invalid log level")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    let installed = if cfg.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install log subscriber: {}", e))
}

async fn run_reconciliation(manager: Arc<Manager>, every: Duration, tg: Option<TelegramNotifier>) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let report = manager.update_position_status().await;

        for entry in report.closed() {
            if let (Some(tg), SymbolStatus::Closed { reason, cancellations }) = (&tg, &entry.status) {
                if let Err(e) = tg
                    .notify_position_closed(entry.symbol.as_str(), reason, cancellations)
                    .await
                {
                    warn!("Failed to send close notification: {}", e);
                }
            }
        }
    }
}

async fn dispatch_fills(
    manager: Arc<Manager>,
    mut fills: mpsc::Receiver<OrderFill>,
    tg: Option<TelegramNotifier>,
) {
    while let Some(fill) = fills.recv().await {
        let kind = manager
            .order_kind(&fill.symbol, &fill.order_id)
            .or_else(|| fill.stop_order_type.parse().ok());

        let outcome = manager
            .dispatch_fill(&fill.symbol, &fill.order_id, &fill.stop_order_type)
            .await;

        if let (Some(tg), Some(kind), FillOutcome::Resolved { cancellations, .. }) = (&tg, kind, &outcome) {
            if let Err(e) = tg
                .notify_oco_triggered(&fill.symbol, kind, &fill.order_id, cancellations)
                .await
            {
                warn!("Failed to send OCO notification: {}", e);
            }
        }
    }
    info!("Fill channel closed");
}

async fn read_bracket_requests(manager: Arc<Manager>, tg: Option<TelegramNotifier>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: BracketRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Invalid bracket request {:?}: {}", line, e);
                continue;
            }
        };

        let manager = manager.clone();
        let tg = tg.clone();
        tokio::spawn(async move {
            let result = manager.place_main_order_with_tpsl(request.clone()).await;
            if result.fully_protected() {
                info!("🛡️  Bracket for {} fully placed", request.symbol);
            } else if result.main_placed() {
                warn!("⚠️  Bracket for {} placed with unprotected legs: {:?}", request.symbol, result);
            } else {
                warn!("❌ Bracket for {} rejected: {:?}", request.symbol, result.main_order);
            }

            if let Some(tg) = tg {
                if let Err(e) = tg.notify_bracket(&request, &result).await {
                    warn!("Failed to send bracket notification: {}", e);
                }
            }
        });
    }

    info!("Bracket request input closed");
}
