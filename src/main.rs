use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rust_decimal_macros::dec;
use tracing_subscriber::{EnvFilter, fmt};

use chimera::audit::{AuditSink, ChannelSink, LogSink};
use chimera::core::{Market, Side, Symbol};
use chimera::exchange::PaperExchange;
use chimera::execution::{TransferRequest, spawn_guard_stop_monitor};
use chimera::strategy::{StaticConfigSource, spawn_config_refresher};
use chimera::supervisor::shutdown_channel;
use chimera::{Config, DecideRequest, Pipeline};

const AUDIT_CAPACITY: usize = 4096;

fn load_config() -> anyhow::Result<Config> {
    let path = std::env::var("CHIMERA_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.toml"));
    if path.exists() {
        Config::load(&path).with_context(|| format!("loading {}", path.display()))
    } else {
        Ok(Config::default())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let config = load_config()?;

    // 1. Logger
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.app.log_level));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    tracing::info!("🦀 Chimera starting ({:?} mode)...", config.app.mode);

    // 2. Audit worker: channel → JSON log lines
    let (sink, audit_rx) = ChannelSink::bounded(AUDIT_CAPACITY);
    let audit_worker = tokio::spawn(async move {
        while let Ok(event) = audit_rx.recv_async().await {
            LogSink.record(event);
        }
    });

    // 3. Paper venue
    let exchange = Arc::new(PaperExchange::default());
    let btc = Symbol::new("BTCUSDT");
    exchange.set_quote(&btc, Market::Spot, dec!(50000), dec!(50001));
    exchange.set_quote(&btc, Market::Fut, dec!(50005), dec!(50006));

    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let pipeline = Pipeline::new(&config, exchange.clone(), Arc::new(sink), shutdown_rx.clone())?;

    // 4. Background loops
    let source = Arc::new(StaticConfigSource::new());
    let refresher = spawn_config_refresher(
        pipeline.cache().clone(),
        source,
        Duration::from_secs(config.execution.config_refresh_secs),
        shutdown_rx.clone(),
    );
    let monitor = spawn_guard_stop_monitor(
        pipeline.engine().clone(),
        Duration::from_millis(config.execution.monitor_interval_ms),
        shutdown_rx,
    );

    // 5. Demo signals
    let features = [
        ("funding_next", 0.0001),
        ("spread_bps", 0.4),
        ("depth_top1_usdt", 25_000.0),
        ("rv_pctile_30d", 0.18),
        ("atr_pct", 0.6),
    ];
    for (signal_id, market) in [("demo-spot", Market::Spot), ("demo-fut", Market::Fut)] {
        let req = DecideRequest {
            signal_id: signal_id.to_string(),
            symbol: btc.clone(),
            market,
            side: Side::Buy,
            features: features.iter().map(|(k, v)| (k.to_string(), (*v).into())).collect(),
            reference_price: Some(50_000.5),
            dry_run: false,
        };
        match pipeline.decide_and_route(req).await {
            Ok((resp, results)) => {
                for r in results {
                    tracing::info!(
                        "📊 {} {:?}: {} qty={} avg={}",
                        resp.signal_id, resp.decision.action, r.status, r.executed_qty, r.avg_price
                    );
                }
            }
            Err(e) => tracing::error!("Signal {} failed: {}", signal_id, e),
        }
    }

    let receipt = pipeline
        .transfer(TransferRequest {
            from: Market::Spot,
            to: Market::Fut,
            amount_usdt: dec!(100),
            reason: "demo margin top-up".into(),
            idempotency_key: None,
        })
        .await?;
    tracing::info!("Transfer {} {:?}", receipt.transfer_id, receipt.result);

    tracing::info!("⏳ Running. Ctrl-C to stop.");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    pipeline.engine().cancel_all();
    shutdown_tx.send_replace(true);
    let _ = tokio::join!(refresher, monitor);
    drop(pipeline);
    let _ = audit_worker.await;

    Ok(())
}
