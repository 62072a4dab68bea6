//! Follow-up Monitor - morning-order replay and twin buy emission.
//!
//! At 09:17 local time the monitor snapshots today's own SZ sell orders
//! (paginated query), keeping per symbol the single earliest one entrusted
//! at or before 09:17. After the 09:30 open, every SZ sell execution on a
//! watched symbol is classified:
//!
//! - execution of a recorded order itself → `recorded_0917_order`
//! - a *different* order executing at the recorded price →
//!   `same_price_second_sale`, and (once per symbol) two follow-up buys are
//!   entrusted: a 100-share limit and a 100-share best-own-side, both at
//!   the recorded price.
//!
//! Executions are deduplicated so broker re-pushes never double-fire.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{error, info, warn};

use crate::broker::{BrokerApi, ConfirmMsg, OrderKind, Side, TodayOrder};
use crate::config::Whitelist;
use crate::core_types::{Qty, SysId};
use crate::encoding::gbk_to_utf8;
use crate::time_util::{local_hhmmss, local_time_string, until_local_time};

/// Follow-up entrust size, matching the closed-loop order size.
const FOLLOWUP_QTY: Qty = 100;

/// Snapshot query page size.
const SNAPSHOT_PAGE_ROWS: usize = 200;

/// Entrust-time cutoff (HHMMSS string compare, matching the broker field).
const SNAPSHOT_CUTOFF_HHMMSS: &str = "091700";

/// Post-open gate for match processing.
const OPEN_GATE_HHMMSS: i32 = 93000;

// ============================================================
// RECORDS
// ============================================================

/// The per-symbol "morning order": earliest entrust at or before 09:17.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedOrder {
    pub order_id: SysId,
    pub order_price: f64,
    pub order_qty: Qty,
    pub stock_code: String,
    pub entrust_time_hhmmss: String,
}

/// Execution identity for dedup. Prefer the match serial; fall back to the
/// (time, qty, price) tuple when the serial is absent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DedupKey {
    Serial(SysId, String),
    Fields(SysId, String, Qty, i64),
}

fn make_dedup_key(msg: &ConfirmMsg) -> DedupKey {
    if !msg.match_serial.is_empty() {
        DedupKey::Serial(msg.order_id, msg.match_serial.clone())
    } else {
        DedupKey::Fields(
            msg.order_id,
            msg.match_time.clone(),
            msg.match_qty,
            (msg.match_price * 10000.0).round() as i64,
        )
    }
}

/// Strip any ".SH"/".SZ" suffix and whitespace, leaving the bare code.
fn normalize_stock_code(s: &str) -> String {
    let bare = match s.find('.') {
        Some(dot) => &s[..dot],
        None => s,
    };
    bare.chars().filter(|c| !c.is_whitespace()).collect()
}

/// First six digits of an entrust-time field, or empty.
fn extract_hhmmss6(s: &str) -> String {
    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).take(6).collect();
    if digits.len() == 6 { digits } else { String::new() }
}

fn is_sz_market(market: &str) -> bool {
    market.starts_with("SZ")
}

// ============================================================
// MONITOR
// ============================================================

#[derive(Default)]
struct MonitorInner {
    recorded_by_stock: FxHashMap<String, RecordedOrder>,
    recorded_order_ids: FxHashSet<SysId>,
    printed_keys: FxHashSet<DedupKey>,
    followup_sent_stocks: FxHashSet<String>,
}

pub struct FollowUpMonitor {
    sz_holder: String,
    watch_codes: FxHashSet<String>,
    filter_by_whitelist: bool,
    broker: Arc<dyn BrokerApi>,
    started: AtomicBool,
    snapshot_ready: AtomicBool,
    /// Matches before this local HHMMSS are ignored. Relaxed in replay
    /// mode, where the wall clock is unrelated to the captured tape.
    open_gate_hhmmss: AtomicI32,
    inner: Mutex<MonitorInner>,
}

impl FollowUpMonitor {
    pub fn new(whitelist: &Whitelist, sz_holder: String, broker: Arc<dyn BrokerApi>) -> Self {
        let watch_codes: FxHashSet<String> = whitelist
            .codes()
            .iter()
            .map(|s| normalize_stock_code(s))
            .filter(|s| !s.is_empty())
            .collect();
        let filter_by_whitelist = !watch_codes.is_empty();
        Self {
            sz_holder,
            watch_codes,
            filter_by_whitelist,
            broker,
            started: AtomicBool::new(false),
            snapshot_ready: AtomicBool::new(false),
            open_gate_hhmmss: AtomicI32::new(OPEN_GATE_HHMMSS),
            inner: Mutex::new(MonitorInner::default()),
        }
    }

    /// Override the post-open gate (replay mode).
    pub fn set_open_gate(&self, hhmmss: i32) {
        self.open_gate_hhmmss.store(hhmmss, Ordering::Release);
    }

    fn lock(&self) -> MutexGuard<'_, MonitorInner> {
        self.inner.lock().expect("monitor state poisoned")
    }

    fn is_watch_stock(&self, code: &str) -> bool {
        !self.filter_by_whitelist || self.watch_codes.contains(code)
    }

    pub fn snapshot_ready(&self) -> bool {
        self.snapshot_ready.load(Ordering::Acquire)
    }

    pub fn recorded_order(&self, code: &str) -> Option<RecordedOrder> {
        self.lock().recorded_by_stock.get(code).cloned()
    }

    pub fn followup_sent(&self, code: &str) -> bool {
        self.lock().followup_sent_stocks.contains(code)
    }

    /// Spawn the snapshot thread: sleep until 09:17 local, query, arm.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let monitor = self.clone();
        Some(
            thread::Builder::new()
                .name("snapshot-0917".to_string())
                .spawn(move || {
                    let wait = until_local_time(9, 17);
                    if !wait.is_zero() {
                        thread::sleep(wait);
                    }
                    monitor.snapshot_now();
                })
                .expect("spawn snapshot thread"),
        )
    }

    /// Run the 09:17 snapshot immediately (replay mode and tests).
    pub fn snapshot_now(&self) {
        let t_start = Instant::now();
        let mut brow_index = 0i64;
        let mut total_rows = 0usize;
        let mut pages = 0usize;

        loop {
            let prev_brow_index = brow_index;
            let rows = match self
                .broker
                .query_today_orders("SZ", SNAPSHOT_PAGE_ROWS, brow_index)
            {
                Ok(rows) => rows,
                Err(e) => {
                    error!("snapshot query failed: {}", e);
                    break;
                }
            };
            pages += 1;
            total_rows += rows.len();

            for drwt in &rows {
                self.consider_snapshot_row(drwt);
            }

            if rows.len() < SNAPSHOT_PAGE_ROWS || rows.is_empty() {
                break;
            }
            brow_index = rows.last().expect("rows non-empty").brow_index;
            if brow_index == prev_brow_index {
                break;
            }
        }

        let recorded_count = self.lock().recorded_by_stock.len();
        info!(
            "snapshot 09:17 done: recorded_stocks={} rows={} pages={} cost_ms={}",
            recorded_count,
            total_rows,
            pages,
            t_start.elapsed().as_millis()
        );
        self.snapshot_ready.store(true, Ordering::Release);
    }

    fn consider_snapshot_row(&self, drwt: &TodayOrder) {
        if !is_sz_market(&drwt.market) || drwt.side != Side::Sell {
            return;
        }
        let stock_key = normalize_stock_code(&drwt.stock_code);
        if stock_key.is_empty() || !self.is_watch_stock(&stock_key) {
            return;
        }
        let hhmmss = extract_hhmmss6(&drwt.entrust_time);
        if !hhmmss.is_empty() && hhmmss.as_str() > SNAPSHOT_CUTOFF_HHMMSS {
            return;
        }

        let candidate = RecordedOrder {
            order_id: drwt.order_id,
            order_price: drwt.order_price,
            order_qty: drwt.order_qty,
            stock_code: stock_key.clone(),
            entrust_time_hhmmss: hhmmss,
        };

        let mut inner = self.lock();
        match inner.recorded_by_stock.get(&stock_key) {
            None => {
                inner.recorded_order_ids.insert(candidate.order_id);
                inner.recorded_by_stock.insert(stock_key, candidate);
            }
            Some(existing) => {
                let should_replace = if !candidate.entrust_time_hhmmss.is_empty()
                    && !existing.entrust_time_hhmmss.is_empty()
                {
                    candidate.entrust_time_hhmmss < existing.entrust_time_hhmmss
                        || (candidate.entrust_time_hhmmss == existing.entrust_time_hhmmss
                            && candidate.order_id < existing.order_id)
                } else {
                    candidate.order_id < existing.order_id
                };
                if should_replace {
                    let old_id = existing.order_id;
                    inner.recorded_order_ids.remove(&old_id);
                    inner.recorded_order_ids.insert(candidate.order_id);
                    inner.recorded_by_stock.insert(stock_key, candidate);
                }
            }
        }
    }

    // --------------------------------------------------------
    // MATCH PROCESSING
    // --------------------------------------------------------

    /// Entry point from the order worker for every PUSH_MATCH.
    pub fn on_match(&self, msg: &ConfirmMsg) {
        self.on_match_gated(msg, local_hhmmss());
    }

    /// Same as [`on_match`] with the wall-clock gate injected, so replay
    /// and tests are independent of the actual time of day.
    pub fn on_match_gated(&self, msg: &ConfirmMsg, now_hhmmss: i32) {
        if now_hhmmss < self.open_gate_hhmmss.load(Ordering::Acquire) {
            return;
        }
        if !self.snapshot_ready() {
            return;
        }
        if !is_sz_market(&msg.market) || msg.side != Side::Sell {
            return;
        }
        let stock_key = normalize_stock_code(&msg.stock_code);
        if stock_key.is_empty() || !self.is_watch_stock(&stock_key) {
            return;
        }

        let local_time = local_time_string();
        let dedup_key = make_dedup_key(msg);

        let (reason, recorded, send_followup) = {
            let mut inner = self.lock();
            if inner.printed_keys.contains(&dedup_key) {
                return;
            }

            let reason;
            let mut send_followup = false;
            let recorded;

            if inner.recorded_order_ids.contains(&msg.order_id) {
                reason = "recorded_0917_order";
                recorded = inner.recorded_by_stock.get(&stock_key).cloned();
            } else {
                let Some(rec) = inner.recorded_by_stock.get(&stock_key).cloned() else {
                    return;
                };
                if msg.order_id == rec.order_id {
                    return;
                }
                if (msg.order_price - rec.order_price).abs() >= 1e-6 {
                    return;
                }
                reason = "same_price_second_sale";
                if inner.followup_sent_stocks.insert(stock_key.clone()) {
                    send_followup = true;
                }
                recorded = Some(rec);
            }

            inner.printed_keys.insert(dedup_key);
            (reason, recorded, send_followup)
        };

        self.log_match(msg, reason, recorded.as_ref(), &local_time);

        if send_followup {
            let price = recorded
                .as_ref()
                .expect("followup implies a recorded order")
                .order_price;
            self.send_followup_orders(&stock_key, price);
        }
    }

    /// The twin buys: a plain limit and a best-own-side, both at the
    /// recorded price. Best-own-side still carries the real price; a zero
    /// price trips the venue price cage and comes back invalid.
    fn send_followup_orders(&self, stock_key: &str, price: f64) {
        if self.sz_holder.is_empty() {
            error!(
                "followup skipped: missing SZ holder. stock={} price={}",
                stock_key, price
            );
            return;
        }

        let ret = self.broker.send_buy(
            "SZ",
            stock_key,
            FOLLOWUP_QTY,
            price,
            OrderKind::Limit,
            &self.sz_holder,
        );
        if ret > 0 {
            info!(
                "followup limit buy sent: stock={} price={} qty={} sys_id={}",
                stock_key, price, FOLLOWUP_QTY, ret
            );
        } else {
            error!(
                "followup limit buy failed: stock={} price={} ret={} err={}",
                stock_key,
                price,
                ret,
                gbk_to_utf8(&self.broker.last_error())
            );
        }

        let ret2 = self.broker.send_buy(
            "SZ",
            stock_key,
            FOLLOWUP_QTY,
            price,
            OrderKind::BestOwnSide,
            &self.sz_holder,
        );
        if ret2 > 0 {
            info!(
                "followup best-own-side buy sent: stock={} price={} qty={} sys_id={}",
                stock_key, price, FOLLOWUP_QTY, ret2
            );
        } else {
            error!(
                "followup best-own-side buy failed: stock={} price={} ret={} err={}",
                stock_key,
                price,
                ret2,
                gbk_to_utf8(&self.broker.last_error())
            );
        }
    }

    fn log_match(
        &self,
        msg: &ConfirmMsg,
        reason: &str,
        recorded: Option<&RecordedOrder>,
        local_time: &str,
    ) {
        match recorded {
            Some(rec) => info!(
                "[MATCH] local_time={} reason={} stock={} order_id={} order_price={} order_qty={} \
                 match_serial={} match_time={} match_qty={} match_price={} match_amt={} \
                 total_match_qty={} total_match_amt={} status={} withdraw_flag={} result={} \
                 recorded_order_id={} recorded_price={} recorded_time={}",
                local_time,
                reason,
                msg.stock_code,
                msg.order_id,
                msg.order_price,
                msg.order_qty,
                msg.match_serial,
                msg.match_time,
                msg.match_qty,
                msg.match_price,
                msg.match_amt,
                msg.total_match_qty,
                msg.total_match_amt,
                msg.order_status,
                msg.withdraw_flag,
                msg.result_info,
                rec.order_id,
                rec.order_price,
                rec.entrust_time_hhmmss
            ),
            None => warn!(
                "[MATCH] local_time={} reason={} stock={} order_id={} with no recorded order",
                local_time, reason, msg.stock_code, msg.order_id
            ),
        }
    }
}

// ============================================================
// TESTS
// ============================================================
