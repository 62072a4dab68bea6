//! End-to-end scenarios: feed records through the ring bus, dispatcher,
//! signal engine, and order worker against the broker simulator, then
//! assert on order flow and the time_spend.log tape.

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use limitup_agent::broker::{BrokerApi, ConfirmKind, ConfirmMsg, Side, SimBroker, TodayOrder};
use limitup_agent::config::{Whitelist, pad_symbol_key};
use limitup_agent::dispatcher;
use limitup_agent::feed::{
    FeedRecord, MarketSnap, RawBatch, SIDE_BUY, SIDE_SELL, TickOrder, TickTrade,
};
use limitup_agent::monitor::FollowUpMonitor;
use limitup_agent::order_machine::{AccountInfo, ORDER_QTY, OrderAgent};
use limitup_agent::ring_bus::RingBus;
use limitup_agent::symbol_engine::SymbolEngine;
use limitup_agent::{OrderKind, Phase};

// ============================================================
// PIPELINE HARNESS
// ============================================================

struct Pipeline {
    bus: Arc<RingBus>,
    engine: Arc<SymbolEngine>,
    agent: Arc<OrderAgent>,
    broker: Arc<SimBroker>,
    monitor: Arc<FollowUpMonitor>,
    worker: Option<thread::JoinHandle<()>>,
    dispatcher: Option<thread::JoinHandle<()>>,
    log_path: String,
}

impl Pipeline {
    fn start(codes: &[&str], log_tag: &str) -> Self {
        let whitelist = Whitelist::from_codes(codes.iter().copied());
        let broker = Arc::new(SimBroker::new());
        let log_path = format!("/tmp/limitup_scenarios_{}.log", log_tag);
        fs::remove_file(&log_path).ok();

        let account = AccountInfo {
            khh: "10001".to_string(),
            sh_holder: "A100000001".to_string(),
            sz_holder: "0100000002".to_string(),
        };
        let agent = Arc::new(OrderAgent::new(broker.clone(), account, &log_path));
        broker.set_confirm_sink(agent.clone());

        let monitor = Arc::new(FollowUpMonitor::new(
            &whitelist,
            "0100000002".to_string(),
            broker.clone(),
        ));
        monitor.set_open_gate(0);
        agent.set_trade_return_monitor(monitor.clone());

        let engine = Arc::new(SymbolEngine::new(&whitelist, agent.clone()));
        let bus = Arc::new(RingBus::with_capacity(1 << 12, whitelist));

        let worker = agent.start();
        let dispatcher = dispatcher::spawn(bus.clone(), engine.clone());

        Self {
            bus,
            engine,
            agent,
            broker,
            monitor,
            worker: Some(worker),
            dispatcher: Some(dispatcher),
            log_path,
        }
    }

    fn push(&self, records: &[FeedRecord]) {
        let batch = RawBatch::from_records(records).expect("uniform batch");
        self.bus.push(1, &batch);
    }

    fn wait_for(&self, what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn finish(mut self) -> String {
        self.bus.stop();
        self.dispatcher.take().unwrap().join().expect("dispatcher");
        self.agent.shutdown();
        self.worker.take().unwrap().join().expect("worker");
        self.agent.flush_log();
        let log = fs::read_to_string(&self.log_path).unwrap_or_default();
        fs::remove_file(&self.log_path).ok();
        log
    }
}

fn market(symbol: &str, high_limited: i64) -> FeedRecord {
    FeedRecord::Market(MarketSnap {
        symbol_key: pad_symbol_key(symbol),
        time: 92500000,
        high_limited,
        low_limited: 0,
        last: 0,
    })
}

fn sell(symbol: &str, time: i32, order_no: i64, price_raw: i64, volume: i64) -> FeedRecord {
    FeedRecord::Order(TickOrder {
        symbol_key: pad_symbol_key(symbol),
        time,
        order_no,
        price_raw,
        volume,
        function_code: SIDE_SELL,
        order_kind: 0,
    })
}

fn trade(symbol: &str, time: i32, price_raw: i64, volume: i64, bs_flag: u8) -> FeedRecord {
    FeedRecord::Trade(TickTrade {
        symbol_key: pad_symbol_key(symbol),
        time,
        trade_no: time as i64,
        ask_order: 0,
        bid_order: 0,
        price_raw,
        volume,
        bs_flag,
        function_code: 0,
    })
}

// ============================================================
// SCENARIOS
// ============================================================

/// S1: three ceiling sells cumulate past 50万 and arm exactly one loop.
#[test]
fn s1_sell_sum_first_trigger_places_ceiling_sell() {
    let p = Pipeline::start(&["600001"], "s1");
    p.push(&[market("600001.SH", 110_000)]);
    p.push(&[
        sell("600001.SH", 93000100, 100, 110_000, 20_000),
        sell("600001.SH", 93000200, 101, 110_000, 40_000),
        sell("600001.SH", 93000300, 102, 110_000, 6_000),
    ]);

    p.wait_for("first loop to close", || {
        p.agent
            .snapshot("600001.SH")
            .is_some_and(|s| s.phase == Phase::Idle && s.seq == 1)
    });

    let (sum, flag, count) = p
        .engine
        .with_state("600001.SH", |s| {
            (s.sum_raw, s.flag_order, s.sum_trigger_count)
        })
        .unwrap();
    assert_eq!(sum, 0);
    assert_eq!(flag, 102);
    assert_eq!(count, 1);

    let sent = p.broker.sent_orders();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].side, Side::Sell);
    assert_eq!(sent[0].qty, ORDER_QTY);
    assert_eq!(sent[0].exchange, "SH");
    assert!((sent[0].price - 11.0).abs() < 1e-9);

    let log = p.finish();
    let lines: Vec<&str> = log.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("v1,ORDER_SEND,600001.SH,1,SELL_SUM_50W,93000300,"));
    assert!(lines[1].starts_with("v1,ORDER_ACK,600001.SH,1,"));
}

/// A second 50万 trigger replaces the live order: new send, then cancel of
/// the prior sys_id, both confirmed.
#[test]
fn second_loop_cancels_prior_order() {
    let p = Pipeline::start(&["600001"], "second_loop");
    p.push(&[market("600001.SH", 110_000)]);
    p.push(&[
        sell("600001.SH", 93000100, 100, 110_000, 20_000),
        sell("600001.SH", 93000200, 101, 110_000, 50_000),
    ]);
    p.wait_for("first loop", || {
        p.agent
            .snapshot("600001.SH")
            .is_some_and(|s| s.phase == Phase::Idle && s.seq == 1)
    });
    let first_sys_id = p.agent.snapshot("600001.SH").unwrap().active_sys_id;

    p.push(&[sell("600001.SH", 93010000, 200, 110_000, 50_000)]);
    p.wait_for("second loop", || {
        p.agent
            .snapshot("600001.SH")
            .is_some_and(|s| s.phase == Phase::Idle && s.seq == 2)
    });

    let snap = p.agent.snapshot("600001.SH").unwrap();
    assert_ne!(snap.active_sys_id, first_sys_id);
    assert_eq!(snap.to_cancel_sys_id, 0);
    assert_eq!(p.broker.cancel_calls(), vec![first_sys_id]);

    let log = p.finish();
    let tags: Vec<&str> = log
        .lines()
        .map(|l| l.splitn(3, ',').nth(1).unwrap())
        .collect();
    assert_eq!(
        tags,
        vec![
            "ORDER_SEND",
            "ORDER_ACK",
            "ORDER_SEND",
            "ORDER_ACK",
            "CANCEL_SEND",
            "CANCEL_ACK"
        ]
    );
}

/// S2: a print above 1.07× base arms the symbol once; later sells can still
/// fire 50万 loops but no second PRICE_107 ever fires.
#[test]
fn s2_price107_fires_once_then_sum_takes_over() {
    let p = Pipeline::start(&["000002"], "s2");
    p.push(&[market("000002.SZ", 11_000_000)]);
    // 1.07 × base(10_000_000) = 10_700_000; strict inequality required.
    p.push(&[
        trade("000002.SZ", 93000100, 10_700_000, 100, SIDE_BUY),
        trade("000002.SZ", 93000200, 10_710_000, 100, SIDE_BUY),
    ]);

    p.wait_for("price107 loop", || {
        p.agent
            .snapshot("000002.SZ")
            .is_some_and(|s| s.phase == Phase::Idle && s.seq == 1)
    });

    // Further high prints must not re-arm.
    p.push(&[trade("000002.SZ", 93000300, 10_720_000, 100, SIDE_BUY)]);
    // Cumulative sells at the ceiling may still fire a 50万 loop.
    p.push(&[
        sell("000002.SZ", 93010100, 300, 11_000_000, 200),
        sell("000002.SZ", 93010200, 301, 11_000_000, 500),
    ]);
    p.wait_for("50万 loop after price107", || {
        p.agent
            .snapshot("000002.SZ")
            .is_some_and(|s| s.phase == Phase::Idle && s.seq == 2)
    });

    let log = p.finish();
    let reasons: Vec<&str> = log
        .lines()
        .filter(|l| l.contains("ORDER_SEND"))
        .map(|l| l.split(',').nth(4).unwrap())
        .collect();
    assert_eq!(reasons, vec!["PRICE_107", "SELL_SUM_50W"]);
}

/// S3: a sell execution at the ceiling seals the symbol and stops trading.
#[test]
fn s3_seal_stops_symbol_for_the_day() {
    let p = Pipeline::start(&["600001"], "s3");
    p.push(&[market("600001.SH", 110_000)]);
    p.push(&[trade("600001.SH", 93001000, 110_000, 500, SIDE_SELL)]);

    p.wait_for("seal to stop the loop", || {
        p.agent
            .snapshot("600001.SH")
            .is_some_and(|s| s.phase == Phase::Stopped)
    });
    assert!(p.engine.with_state("600001.SH", |s| s.sealed).unwrap());

    // Heavy ceiling selling after the seal: tracker frozen, nothing sent.
    p.push(&[
        sell("600001.SH", 93002000, 400, 110_000, 1_000_000),
        sell("600001.SH", 93002100, 401, 110_000, 1_000_000),
    ]);
    thread::sleep(Duration::from_millis(50));
    assert!(p.broker.sent_orders().is_empty());
    assert_eq!(p.engine.with_state("600001.SH", |s| s.sum_raw).unwrap(), 0);

    let log = p.finish();
    assert!(log.is_empty(), "sealed symbol produced closed-loop lines");
}

/// Ring filter: records for unlisted symbols never reach the engine.
#[test]
fn whitelist_filter_blocks_foreign_symbols() {
    let p = Pipeline::start(&["600001"], "filter");
    p.push(&[market("600001.SH", 110_000)]);
    p.push(&[
        sell("999999.SZ", 93000100, 100, 110_000, 1_000_000),
        sell("600001.SH", 93000200, 100, 110_000, 100),
    ]);

    p.wait_for("whitelisted record to land", || {
        p.engine
            .with_state("600001.SH", |s| s.flag_order_initialized)
            .unwrap_or(false)
    });

    assert_eq!(p.bus.stats().snapshot().filtered, 1);
    assert_eq!(p.engine.symbol_count(), 1);
    p.finish();
}

/// S6 wiring: PUSH_MATCH confirms reach the monitor through the worker and
/// the twin follow-up buys go out exactly once.
#[test]
fn s6_followup_through_the_worker() {
    let p = Pipeline::start(&["000002"], "s6");
    p.broker.seed_today_orders(vec![TodayOrder {
        order_id: 500,
        market: "SZ".to_string(),
        stock_code: "000002".to_string(),
        side: Side::Sell,
        order_price: 10.0,
        order_qty: 1000,
        entrust_time: "091500".to_string(),
        brow_index: 1,
    }]);
    p.monitor.snapshot_now();
    assert_eq!(p.monitor.recorded_order("000002").unwrap().order_id, 500);

    let mk_match = |order_id: i64, serial: &str| {
        let mut msg = ConfirmMsg::new(ConfirmKind::PushMatch);
        msg.order_id = order_id;
        msg.market = "SZ".to_string();
        msg.stock_code = "000002".to_string();
        msg.side = Side::Sell;
        msg.order_price = 10.0;
        msg.match_price = 10.0;
        msg.match_qty = 100;
        msg.match_serial = serial.to_string();
        msg
    };

    // Execution of the recorded order: classified, no follow-up.
    p.broker.emit(mk_match(500, "A1"));
    // Second sale at the recorded price on another order: twin buys.
    p.broker.emit(mk_match(777, "B1"));
    p.wait_for("followup emission", || p.monitor.followup_sent("000002"));

    // A third matching execution emits nothing further.
    p.broker.emit(mk_match(888, "C1"));
    thread::sleep(Duration::from_millis(50));

    let buys: Vec<_> = p
        .broker
        .sent_orders()
        .into_iter()
        .filter(|o| o.side == Side::Buy)
        .collect();
    assert_eq!(buys.len(), 2);
    assert_eq!(buys[0].kind, OrderKind::Limit);
    assert_eq!(buys[1].kind, OrderKind::BestOwnSide);
    for buy in &buys {
        assert_eq!(buy.qty, 100);
        assert!((buy.price - 10.0).abs() < 1e-9);
        assert_eq!(buy.code, "000002");
    }
    p.finish();
}

/// S4 through the live worker: every cancel comes back PUSH_INVALID, the
/// machine retries twice more and then parks in WAIT_CANCEL_ACK.
#[test]
fn s4_cancel_retry_exhaustion_through_worker() {
    use limitup_agent::broker::SimCancelMode;

    let p = Pipeline::start(&["600001"], "s4");
    p.push(&[market("600001.SH", 110_000)]);
    p.push(&[
        sell("600001.SH", 93000100, 100, 110_000, 100),
        sell("600001.SH", 93000200, 101, 110_000, 50_000),
    ]);
    p.wait_for("first loop", || {
        p.agent
            .snapshot("600001.SH")
            .is_some_and(|s| s.phase == Phase::Idle && s.seq == 1)
    });
    let s1 = p.agent.snapshot("600001.SH").unwrap().active_sys_id;

    p.broker.set_cancel_mode(SimCancelMode::PushInvalid);
    p.push(&[sell("600001.SH", 93010000, 200, 110_000, 50_000)]);

    p.wait_for("retry exhaustion", || {
        p.agent
            .snapshot("600001.SH")
            .is_some_and(|s| s.phase == Phase::WaitCancelAck && s.cancel_attempts == 3)
    });
    assert_eq!(p.broker.cancel_calls(), vec![s1, s1, s1]);

    // The prior order is still live, so it stays on the revocable list.
    let revocable = p.agent.revocable_orders("600001");
    assert!(revocable.iter().any(|o| o.sys_id == s1));

    let log = p.finish();
    let invalids = log
        .lines()
        .filter(|l| l.contains("CANCEL_INVALID"))
        .count();
    assert_eq!(invalids, 3);
}

/// Monitor-all mode: with no whitelist every symbol is admitted lazily and
/// nothing is filtered at the bus.
#[test]
fn monitor_all_mode_admits_any_symbol() {
    let p = Pipeline::start(&[], "monitor_all");
    p.push(&[market("999999.SZ", 110_000)]);
    p.push(&[
        sell("999999.SZ", 93000100, 100, 110_000, 100),
        sell("999999.SZ", 93000200, 101, 110_000, 50_000),
    ]);

    p.wait_for("lazily admitted loop", || {
        p.agent
            .snapshot("999999.SZ")
            .is_some_and(|s| s.phase == Phase::Idle && s.seq == 1)
    });
    assert_eq!(p.bus.stats().snapshot().filtered, 0);
    assert_eq!(p.engine.symbol_count(), 1);
    p.finish();
}

/// Busy-suppression under load: a burst of threshold crossings while one
/// loop is in flight arms no extra loops.
#[test]
fn burst_triggers_suppressed_while_busy() {
    let p = Pipeline::start(&["600001"], "burst");
    p.broker.set_auto_ack_orders(false); // first loop parks in WAIT_NEW_ACK
    p.push(&[market("600001.SH", 110_000)]);
    p.push(&[sell("600001.SH", 93000100, 100, 110_000, 100)]);

    // Each of these crosses the threshold on its own.
    let burst: Vec<FeedRecord> = (0..5)
        .map(|i| sell("600001.SH", 93000200 + i, 101 + i as i64, 110_000, 50_000))
        .collect();
    p.push(&burst);

    p.wait_for("suppressed triggers to accumulate", || {
        p.agent
            .snapshot("600001.SH")
            .is_some_and(|s| s.phase == Phase::WaitNewAck && s.suppressed_while_busy >= 1)
    });

    let snap = p.agent.snapshot("600001.SH").unwrap();
    assert_eq!(snap.seq, 1, "only the first crossing armed a loop");
    assert_eq!(p.broker.sent_orders().len(), 1);
    p.finish();
}
