//! Broker Gateway seam.
//!
//! The brokerage client library is external; the core depends only on the
//! [`BrokerApi`] trait. Synchronous calls return a positive id/status on
//! success and `<= 0` on rejection, with the reason available through
//! `last_error()` (re-encode with [`crate::encoding::gbk_to_utf8`] before
//! logging). Asynchronous confirmations arrive as [`ConfirmMsg`] values
//! through whatever [`ConfirmSink`] was registered.
//!
//! [`SimBroker`] is the deterministic in-process implementation used by the
//! replay binary mode and the test suite.

use std::sync::{Arc, Mutex, RwLock};

use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::debug;

use crate::core_types::{Qty, RawPrice, SysId};

// ============================================================
// MESSAGE TYPES
// ============================================================

/// Order side as the broker reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

/// Broker order-status codes as reported in confirmations.
pub mod order_status {
    pub const WAITING: i32 = 0;
    pub const CONFIRMED: i32 = 2;
    pub const PART_FILLED: i32 = 4;
    pub const FILLED: i32 = 6;
    pub const WITHDRAWN: i32 = 8;
    pub const INVALID: i32 = 9;
}

/// Venue order kind for buy entrusts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    /// Plain limit order.
    Limit,
    /// "Best own side": joins the best standing price on the submitting
    /// side. Still requires a real limit price or the price cage rejects it.
    BestOwnSide,
}

/// Asynchronous confirmation push type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmKind {
    PushOrder,
    PushMatch,
    PushWithdraw,
    PushInvalid,
}

/// One confirmation callback from the broker.
#[derive(Debug, Clone)]
pub struct ConfirmMsg {
    pub kind: ConfirmKind,
    /// Broker-side push timestamp string.
    pub push_time: String,
    pub order_id: SysId,
    /// For withdraw confirmations: the id of the order being cancelled.
    pub cx_order_id: SysId,
    /// "SH" / "SZ".
    pub market: String,
    /// Bare 6-digit code.
    pub stock_code: String,
    pub side: Side,
    /// Decimal yuan, as the broker reports prices.
    pub order_price: f64,
    pub order_qty: Qty,
    pub total_match_qty: Qty,
    pub match_serial: String,
    pub match_time: String,
    pub match_qty: Qty,
    pub match_price: f64,
    pub match_amt: f64,
    pub total_match_amt: f64,
    pub order_status: i32,
    pub withdraw_flag: String,
    pub confirm_time: String,
    pub result_info: String,
}

impl ConfirmMsg {
    /// Blank message with the given kind; builders fill what they know.
    pub fn new(kind: ConfirmKind) -> Self {
        Self {
            kind,
            push_time: String::new(),
            order_id: 0,
            cx_order_id: 0,
            market: String::new(),
            stock_code: String::new(),
            side: Side::Sell,
            order_price: 0.0,
            order_qty: 0,
            total_match_qty: 0,
            match_serial: String::new(),
            match_time: String::new(),
            match_qty: 0,
            match_price: 0.0,
            match_amt: 0.0,
            total_match_amt: 0.0,
            order_status: 0,
            withdraw_flag: String::new(),
            confirm_time: String::new(),
            result_info: String::new(),
        }
    }

    /// Canonical "NNNNNN.SH|SZ" of this confirmation.
    pub fn symbol(&self) -> String {
        format!("{}.{}", self.stock_code, self.market)
    }
}

/// One row of the today-orders query (morning snapshot source).
#[derive(Debug, Clone)]
pub struct TodayOrder {
    pub order_id: SysId,
    pub market: String,
    pub stock_code: String,
    pub side: Side,
    pub order_price: f64,
    pub order_qty: Qty,
    /// Entrust time; the first six digits are HHMMSS.
    pub entrust_time: String,
    /// Pagination cursor for the next query page.
    pub brow_index: i64,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker query failed: {0}")]
    Query(String),
    #[error("broker session not established")]
    NotConnected,
}

/// Receiver of asynchronous confirmations (the order agent).
pub trait ConfirmSink: Send + Sync {
    fn push_confirm(&self, msg: ConfirmMsg);
}

// ============================================================
// BROKER API (trait)
// ============================================================

/// Synchronous brokerage surface used by the agent.
pub trait BrokerApi: Send + Sync {
    /// Establish the session. Positive token on success.
    fn login(&self) -> i64;

    /// Register the confirmation callback. Must precede any entrust.
    fn set_confirm_sink(&self, sink: Arc<dyn ConfirmSink>);

    /// (SH holder, SZ holder) for the logged-in account.
    fn query_account_holders(&self) -> Result<(String, String), BrokerError>;

    /// Place a limit sell. Positive sys_id on success, `<= 0` on rejection.
    fn send_sell_limit(
        &self,
        exchange: &str,
        code: &str,
        qty: Qty,
        price: f64,
        holder: &str,
    ) -> SysId;

    /// Place a buy with the given order kind. Positive sys_id on success.
    fn send_buy(
        &self,
        exchange: &str,
        code: &str,
        qty: Qty,
        price: f64,
        kind: OrderKind,
        holder: &str,
    ) -> SysId;

    /// Cancel a working order by sys_id. `> 0` accepted, `<= 0` rejected.
    fn cancel(&self, exchange: &str, sys_id: SysId) -> i64;

    /// One page of today's own orders, `row_count` rows from `brow_index`.
    fn query_today_orders(
        &self,
        exchange: &str,
        row_count: usize,
        brow_index: i64,
    ) -> Result<Vec<TodayOrder>, BrokerError>;

    /// One-shot ceiling-price query for the watched codes. Keys are
    /// canonical symbols, or bare codes when the venue field is missing.
    fn query_ceiling_prices(
        &self,
        codes: &[String],
    ) -> Result<FxHashMap<String, RawPrice>, BrokerError>;

    /// Last rejection reason, possibly in the local code page.
    fn last_error(&self) -> Vec<u8>;
}

// ============================================================
// SIM BROKER (deterministic in-process implementation)
// ============================================================

/// How the simulator answers cancels. Drives the retry/timeout scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimCancelMode {
    /// Accept and confirm with PUSH_WITHDRAW.
    #[default]
    AckWithdraw,
    /// Accept the call but confirm with PUSH_INVALID (exchange rejected).
    PushInvalid,
    /// Accept the call and never confirm (timeout path).
    Silent,
    /// Reject the call itself (`cancel` returns <= 0).
    RejectCall,
}

/// One entrust the simulator received, for assertions.
#[derive(Debug, Clone)]
pub struct SimSentOrder {
    pub sys_id: SysId,
    pub exchange: String,
    pub code: String,
    pub side: Side,
    pub kind: OrderKind,
    pub qty: Qty,
    pub price: f64,
    pub holder: String,
}

#[derive(Default)]
struct SimInner {
    next_sys_id: SysId,
    sent: Vec<SimSentOrder>,
    cancels: Vec<SysId>,
    today_orders: Vec<TodayOrder>,
    ceilings: FxHashMap<String, RawPrice>,
    last_error: Vec<u8>,
    reject_sends: bool,
    auto_ack_orders: bool,
    cancel_mode: SimCancelMode,
    fail_ceiling_query: bool,
}

/// Deterministic broker simulator.
///
/// Entrusts are acknowledged synchronously from the caller's thread through
/// the registered sink, which exercises the same queue path a real callback
/// thread would.
pub struct SimBroker {
    inner: Mutex<SimInner>,
    sink: RwLock<Option<Arc<dyn ConfirmSink>>>,
    holders: (String, String),
}

impl Default for SimBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBroker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SimInner {
                next_sys_id: 1000,
                auto_ack_orders: true,
                cancel_mode: SimCancelMode::AckWithdraw,
                ..SimInner::default()
            }),
            sink: RwLock::new(None),
            holders: ("A100000001".to_string(), "0100000002".to_string()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimInner> {
        self.inner.lock().expect("sim broker poisoned")
    }

    /// Confirm through the registered sink, if any.
    pub fn emit(&self, msg: ConfirmMsg) {
        let sink = self.sink.read().expect("sim sink poisoned").clone();
        if let Some(sink) = sink {
            sink.push_confirm(msg);
        }
    }

    // ---- test/replay configuration ----

    pub fn seed_ceilings(&self, ceilings: FxHashMap<String, RawPrice>) {
        self.lock().ceilings = ceilings;
    }

    pub fn seed_today_orders(&self, orders: Vec<TodayOrder>) {
        self.lock().today_orders = orders;
    }

    pub fn set_reject_sends(&self, reject: bool, reason: &str) {
        let mut inner = self.lock();
        inner.reject_sends = reject;
        inner.last_error = reason.as_bytes().to_vec();
    }

    /// When false, entrusts are accepted but no PUSH_ORDER is emitted; the
    /// test drives acks by hand.
    pub fn set_auto_ack_orders(&self, auto_ack: bool) {
        self.lock().auto_ack_orders = auto_ack;
    }

    pub fn set_cancel_mode(&self, mode: SimCancelMode) {
        self.lock().cancel_mode = mode;
    }

    pub fn set_fail_ceiling_query(&self, fail: bool) {
        self.lock().fail_ceiling_query = fail;
    }

    pub fn sent_orders(&self) -> Vec<SimSentOrder> {
        self.lock().sent.clone()
    }

    pub fn cancel_calls(&self) -> Vec<SysId> {
        self.lock().cancels.clone()
    }

    fn record_send(
        &self,
        exchange: &str,
        code: &str,
        side: Side,
        kind: OrderKind,
        qty: Qty,
        price: f64,
        holder: &str,
    ) -> SysId {
        let (sys_id, auto_ack) = {
            let mut inner = self.lock();
            if inner.reject_sends {
                return -1;
            }
            inner.next_sys_id += 1;
            let sys_id = inner.next_sys_id;
            inner.sent.push(SimSentOrder {
                sys_id,
                exchange: exchange.to_string(),
                code: code.to_string(),
                side,
                kind,
                qty,
                price,
                holder: holder.to_string(),
            });
            (sys_id, inner.auto_ack_orders)
        };
        debug!(
            "sim entrust: sys_id={} {}.{} {:?} {:?} qty={} price={}",
            sys_id, code, exchange, side, kind, qty, price
        );
        if auto_ack {
            let mut msg = ConfirmMsg::new(ConfirmKind::PushOrder);
            msg.order_id = sys_id;
            msg.market = exchange.to_string();
            msg.stock_code = code.to_string();
            msg.side = side;
            msg.order_price = price;
            msg.order_qty = qty;
            msg.order_status = order_status::CONFIRMED;
            msg.withdraw_flag = "O".to_string();
            self.emit(msg);
        }
        sys_id
    }
}

impl BrokerApi for SimBroker {
    fn login(&self) -> i64 {
        1
    }

    fn set_confirm_sink(&self, sink: Arc<dyn ConfirmSink>) {
        *self.sink.write().expect("sim sink poisoned") = Some(sink);
    }

    fn query_account_holders(&self) -> Result<(String, String), BrokerError> {
        Ok(self.holders.clone())
    }

    fn send_sell_limit(
        &self,
        exchange: &str,
        code: &str,
        qty: Qty,
        price: f64,
        holder: &str,
    ) -> SysId {
        self.record_send(exchange, code, Side::Sell, OrderKind::Limit, qty, price, holder)
    }

    fn send_buy(
        &self,
        exchange: &str,
        code: &str,
        qty: Qty,
        price: f64,
        kind: OrderKind,
        holder: &str,
    ) -> SysId {
        self.record_send(exchange, code, Side::Buy, kind, qty, price, holder)
    }

    fn cancel(&self, exchange: &str, sys_id: SysId) -> i64 {
        let mode = {
            let mut inner = self.lock();
            if inner.cancel_mode == SimCancelMode::RejectCall {
                inner.last_error = "cancel rejected".as_bytes().to_vec();
                return -1;
            }
            inner.cancels.push(sys_id);
            inner.cancel_mode
        };
        match mode {
            SimCancelMode::AckWithdraw => {
                let mut msg = ConfirmMsg::new(ConfirmKind::PushWithdraw);
                msg.cx_order_id = sys_id;
                msg.order_id = sys_id;
                msg.market = exchange.to_string();
                msg.order_status = order_status::WITHDRAWN;
                msg.withdraw_flag = "W".to_string();
                self.emit(msg);
            }
            SimCancelMode::PushInvalid => {
                let mut msg = ConfirmMsg::new(ConfirmKind::PushInvalid);
                msg.cx_order_id = sys_id;
                msg.market = exchange.to_string();
                msg.result_info = "withdraw rejected by exchange".to_string();
                self.emit(msg);
            }
            SimCancelMode::Silent => {}
            SimCancelMode::RejectCall => unreachable!(),
        }
        1
    }

    fn query_today_orders(
        &self,
        exchange: &str,
        row_count: usize,
        brow_index: i64,
    ) -> Result<Vec<TodayOrder>, BrokerError> {
        let inner = self.lock();
        let rows: Vec<TodayOrder> = inner
            .today_orders
            .iter()
            .filter(|o| o.market == exchange && o.brow_index > brow_index)
            .take(row_count)
            .cloned()
            .collect();
        Ok(rows)
    }

    fn query_ceiling_prices(
        &self,
        codes: &[String],
    ) -> Result<FxHashMap<String, RawPrice>, BrokerError> {
        let inner = self.lock();
        if inner.fail_ceiling_query {
            return Err(BrokerError::Query("ceiling query unavailable".to_string()));
        }
        if codes.is_empty() {
            return Ok(inner.ceilings.clone());
        }
        let mut out = FxHashMap::default();
        for code in codes {
            if let Some(&px) = inner.ceilings.get(code) {
                out.insert(code.clone(), px);
            }
        }
        Ok(out)
    }

    fn last_error(&self) -> Vec<u8> {
        self.lock().last_error.clone()
    }
}

// ============================================================
// TESTS
// ============================================================
