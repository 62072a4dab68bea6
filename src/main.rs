//! limitup_agent - entry point.
//!
//! Startup order mirrors the trading-day checklist: logging first, then
//! config, whitelist, broker session, ceiling seed, monitor, and only then
//! the feed. Any failure before ingestion arms exits non-zero.
//!
//! ```text
//! ┌────────┐   ┌──────────┐   ┌────────────┐   ┌────────────┐
//! │ Config │──▶│ Broker   │──▶│ Ceilings   │──▶│ Feed/Replay│
//! │ + WL   │   │ login    │   │ + Monitor  │   │ + Worker   │
//! └────────┘   └──────────┘   └────────────┘   └────────────┘
//! ```

use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::info;

use limitup_agent::broker::BrokerApi;
use limitup_agent::config::{Settings, Whitelist};
use limitup_agent::loop_log::DEFAULT_LOOP_LOG_PATH;
use limitup_agent::monitor::FollowUpMonitor;
use limitup_agent::order_machine::{AccountInfo, OrderAgent};
use limitup_agent::ring_bus::RingBus;
use limitup_agent::symbol_engine::SymbolEngine;
use limitup_agent::{SimBroker, dispatcher, logging, replay};

struct Args {
    config_path: String,
    whitelist_path: String,
    replay_path: Option<String>,
}

fn parse_args() -> Args {
    let mut args = Args {
        config_path: "account.json".to_string(),
        whitelist_path: "white_list.json".to_string(),
        replay_path: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => args.config_path = iter.next().unwrap_or_default(),
            "--whitelist" => args.whitelist_path = iter.next().unwrap_or_default(),
            "--replay" => args.replay_path = iter.next(),
            other => eprintln!("ignoring unknown argument: {}", other),
        }
    }
    args
}

fn main() -> anyhow::Result<()> {
    let args = parse_args();

    let settings =
        Settings::load(&args.config_path).context("startup failed: account settings")?;
    let _log_guard = logging::init_logging(&settings.log);

    let whitelist =
        Whitelist::load(&args.whitelist_path).context("startup failed: whitelist")?;
    if whitelist.is_empty() {
        info!("whitelist empty: monitor-all mode, market-wide subscription");
    } else {
        info!(
            "whitelist loaded: {} symbols, subscription={}",
            whitelist.len(),
            whitelist.subscription_string()
        );
    }

    // The vendor feed library is external; this build drives the pipeline
    // from a capture file against the broker simulator.
    let Some(replay_path) = args.replay_path else {
        bail!("no feed source configured: pass --replay <capture.csv>");
    };
    let records = replay::load_capture(&replay_path).context("startup failed: capture")?;

    let broker = Arc::new(SimBroker::new());
    broker.seed_ceilings(replay::extract_ceilings(&records));

    if broker.login() <= 0 {
        bail!("startup failed: broker login");
    }
    let (sh_holder, sz_holder) = broker
        .query_account_holders()
        .context("startup failed: holder accounts")?;
    info!(
        "broker session up: khh={} sh_holder={} sz_holder={}",
        settings.trading.khh, sh_holder, sz_holder
    );

    let account = AccountInfo {
        khh: settings.trading.khh.clone(),
        sh_holder,
        sz_holder: sz_holder.clone(),
    };
    let agent = Arc::new(OrderAgent::new(
        broker.clone(),
        account,
        DEFAULT_LOOP_LOG_PATH,
    ));
    broker.set_confirm_sink(agent.clone());

    let monitor = Arc::new(FollowUpMonitor::new(
        &whitelist,
        sz_holder,
        broker.clone(),
    ));
    agent.set_trade_return_monitor(monitor.clone());

    let engine = Arc::new(SymbolEngine::new(&whitelist, agent.clone()));

    // Symbols cannot be traded without a known ceiling: query failure is fatal.
    let quotes = broker
        .query_ceiling_prices(whitelist.codes())
        .context("startup failed: ceiling-price query")?;
    let applied = engine.update_limit_up_price_from_query(&quotes);
    info!("ceiling query applied to {} symbols", applied);

    // Replay mode runs the 09:17 snapshot immediately and drops the
    // wall-clock gate (the tape carries its own times); live mode would
    // sleep on the monitor thread instead.
    monitor.snapshot_now();
    monitor.set_open_gate(0);

    let bus = Arc::new(RingBus::new(whitelist.clone()));
    let worker = agent.start();
    let dispatcher_handle = dispatcher::spawn(bus.clone(), engine.clone());

    let pushed = replay::run_replay_sharded(&bus, &records, 2, replay::REPLAY_BATCH_ITEMS);
    info!("replay complete: {} records pushed", pushed);

    // Teardown: feed done → drain bus → stop worker → flush.
    bus.stop();
    dispatcher_handle
        .join()
        .map_err(|_| anyhow::anyhow!("dispatcher panicked"))?;
    agent.shutdown();
    worker
        .join()
        .map_err(|_| anyhow::anyhow!("order worker panicked"))?;
    agent.flush_log();

    let stats = bus.stats().snapshot();
    info!(
        "clean shutdown: max_depth={} filtered={} dropped(ord/tx)={}/{}",
        stats.max_depth, stats.filtered, stats.dropped_order, stats.dropped_transaction
    );
    agent.with_perf(|perf| {
        info!(
            "closed loops: {} (signal→ack avg {:?} ns, max {:?} ns)",
            perf.loops_completed(),
            perf.avg_latency(),
            perf.max_latency()
        );
    });
    Ok(())
}
