//! Order State Machine - the per-symbol sell/cancel closed loop.
//!
//! A single worker thread serializes every state transition. It drains three
//! event sources:
//!
//! ```text
//!   trigger mailbox ──┐
//!   broker confirms ──┼──▶ worker ──▶ broker send/cancel + time_spend.log
//!   100ms tick      ──┘
//! ```
//!
//! Per symbol the loop is: trigger → send new sell at the ceiling → ack →
//! cancel the prior live sell → cancel ack → idle. A seal event latches
//! `stop_after_done`; the machine parks in STOPPED once the loop closes.
//!
//! Triggers arriving while a symbol is mid-loop are dropped at ingress
//! (busy-suppression), so at most one loop is in flight per symbol.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerApi, ConfirmKind, ConfirmMsg, ConfirmSink, order_status};
use crate::core_types::{ExchTime, MARKET_OPEN_TIME, Qty, RAW_PER_YUAN, RawPrice, SteadyNs, SysId};
use crate::encoding::gbk_to_utf8;
use crate::loop_log::LoopLogWriter;
use crate::monitor::FollowUpMonitor;
use crate::perf::PerfMetrics;
use crate::time_util::steady_now_ns;
use crate::trigger::{Trigger, TriggerKind, TriggerSink};

// ============================================================
// TUNABLES
// ============================================================

/// Fixed entrust size of every closed-loop order.
pub const ORDER_QTY: Qty = 100;

/// Cancel re-sends are capped at this many attempts per prior order.
pub const CANCEL_RETRY_MAX: u32 = 3;

/// A cancel with no confirmation for this long is re-sent.
pub const CANCEL_TIMEOUT_NS: SteadyNs = 2_000_000_000;

/// Worker wakes at least this often so timeout retries can fire.
const WORKER_TICK: Duration = Duration::from_millis(100);

/// Broker confirm queue depth. Confirms are tiny and drained fast.
const CONFIRM_QUEUE_CAPACITY: usize = 16384;

// ============================================================
// STATE
// ============================================================

/// Closed-loop phase of one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Trigger accepted, queued for the worker.
    WaitSend,
    /// New sell sent, awaiting entrust confirmation.
    WaitNewAck,
    /// Cancel of the prior sell sent, awaiting withdraw confirmation.
    WaitCancelAck,
    /// Terminal for the session (symbol sealed).
    Stopped,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "IDLE",
            Phase::WaitSend => "WAIT_SEND",
            Phase::WaitNewAck => "WAIT_NEW_ACK",
            Phase::WaitCancelAck => "WAIT_CANCEL_ACK",
            Phase::Stopped => "STOPPED",
        }
    }
}

/// Per-symbol order-loop state. Mutated only by the worker, except for the
/// ingress fields touched under the agent lock in `post_trigger`.
#[derive(Debug)]
struct OrderState {
    phase: Phase,
    stop_after_done: bool,
    seq: u32,
    suppressed_while_busy: u32,

    active_sys_id: SysId,
    pending_sys_id: SysId,
    to_cancel_sys_id: SysId,
    cancel_attempts: u32,
    last_cancel_send_ns: SteadyNs,

    // Context of the loop in flight, for time_spend.log lines.
    reason: &'static str,
    trigger_time: ExchTime,
    signal_steady_ns: SteadyNs,
    send_steady_ns: SteadyNs,
    limit_up_raw: RawPrice,
    base_raw: RawPrice,
    tick_raw: RawPrice,
    sum_trigger_count: u32,
}

impl OrderState {
    fn new() -> Self {
        Self {
            phase: Phase::Idle,
            stop_after_done: false,
            seq: 0,
            suppressed_while_busy: 0,
            active_sys_id: 0,
            pending_sys_id: 0,
            to_cancel_sys_id: 0,
            cancel_attempts: 0,
            last_cancel_send_ns: 0,
            reason: "",
            trigger_time: 0,
            signal_steady_ns: 0,
            send_steady_ns: 0,
            limit_up_raw: 0,
            base_raw: 0,
            tick_raw: 0,
            sum_trigger_count: 0,
        }
    }

    fn ever_armed(&self) -> bool {
        self.seq > 0 || self.active_sys_id != 0 || self.pending_sys_id != 0
    }

    /// Close the current loop: back to IDLE, or STOPPED if the seal latch
    /// is set.
    fn finish_loop(&mut self) {
        self.phase = if self.stop_after_done {
            Phase::Stopped
        } else {
            Phase::Idle
        };
    }
}

/// Read-only copy of one symbol's order state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderStateSnapshot {
    pub phase: Phase,
    pub seq: u32,
    pub active_sys_id: SysId,
    pub pending_sys_id: SysId,
    pub to_cancel_sys_id: SysId,
    pub cancel_attempts: u32,
    pub stop_after_done: bool,
    pub suppressed_while_busy: u32,
}

/// Trading route: customer id plus per-venue holder accounts.
#[derive(Debug, Clone)]
pub struct AccountInfo {
    pub khh: String,
    pub sh_holder: String,
    pub sz_holder: String,
}

/// "NNNNNN.SH" → ("NNNNNN", "SH").
pub fn split_symbol(symbol: &str) -> Option<(&str, &str)> {
    let (code, market) = symbol.split_once('.')?;
    if code.len() == 6 && (market == "SH" || market == "SZ") {
        Some((code, market))
    } else {
        None
    }
}

// ============================================================
// REVOCABLE ORDERS
// ============================================================

/// One cancelable working order, tracked from confirmation pushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocableOrder {
    pub sys_id: SysId,
    pub market: String,
    pub stock_code: String,
    pub order_qty: Qty,
    pub total_match_qty: Qty,
    pub order_status: i32,
}

/// A working order stays cancelable while it is not withdrawn, not fully
/// matched, and still in a live entrust status.
fn is_revocable(msg: &ConfirmMsg) -> bool {
    let not_revoked = msg.withdraw_flag != "W";
    let unfilled = msg.order_qty > msg.total_match_qty;
    let live_status = matches!(
        msg.order_status,
        order_status::WAITING | order_status::CONFIRMED | order_status::PART_FILLED
    );
    not_revoked && unfilled && live_status
}

// ============================================================
// ORDER AGENT
// ============================================================

struct AgentInner {
    states: FxHashMap<String, OrderState>,
    triggers: VecDeque<Trigger>,
    revocables: Vec<RevocableOrder>,
}

/// The order-side agent: trigger mailbox + confirm queue + worker state.
///
/// Constructed once at startup and shared as `Arc`; the signal engine posts
/// triggers through [`TriggerSink`], the broker pushes confirmations through
/// [`ConfirmSink`], and one spawned worker consumes both.
pub struct OrderAgent {
    inner: Mutex<AgentInner>,
    cv: Condvar,
    confirms: ArrayQueue<ConfirmMsg>,
    running: AtomicBool,
    broker: Arc<dyn BrokerApi>,
    account: AccountInfo,
    log: Mutex<LoopLogWriter>,
    perf: Mutex<PerfMetrics>,
    monitor: RwLock<Option<Arc<FollowUpMonitor>>>,
}

impl OrderAgent {
    pub fn new(broker: Arc<dyn BrokerApi>, account: AccountInfo, loop_log_path: &str) -> Self {
        Self {
            inner: Mutex::new(AgentInner {
                states: FxHashMap::default(),
                triggers: VecDeque::new(),
                revocables: Vec::new(),
            }),
            cv: Condvar::new(),
            confirms: ArrayQueue::new(CONFIRM_QUEUE_CAPACITY),
            running: AtomicBool::new(false),
            broker,
            account,
            log: Mutex::new(LoopLogWriter::new(loop_log_path)),
            perf: Mutex::new(PerfMetrics::new(1)),
            monitor: RwLock::new(None),
        }
    }

    /// Attach the follow-up monitor; PUSH_MATCH confirms are forwarded to it.
    pub fn set_trade_return_monitor(&self, monitor: Arc<FollowUpMonitor>) {
        *self.monitor.write().expect("monitor slot poisoned") = Some(monitor);
    }

    pub fn snapshot(&self, symbol: &str) -> Option<OrderStateSnapshot> {
        let inner = self.lock_inner();
        inner.states.get(symbol).map(|st| OrderStateSnapshot {
            phase: st.phase,
            seq: st.seq,
            active_sys_id: st.active_sys_id,
            pending_sys_id: st.pending_sys_id,
            to_cancel_sys_id: st.to_cancel_sys_id,
            cancel_attempts: st.cancel_attempts,
            stop_after_done: st.stop_after_done,
            suppressed_while_busy: st.suppressed_while_busy,
        })
    }

    pub fn flush_log(&self) {
        self.log.lock().expect("loop log poisoned").flush();
    }

    /// Read the closed-loop timing metrics.
    pub fn with_perf<R>(&self, f: impl FnOnce(&PerfMetrics) -> R) -> R {
        let perf = self.perf.lock().expect("perf poisoned");
        f(&perf)
    }

    /// Cancelable working orders, all symbols when `stock_code` is empty,
    /// largest entrust first.
    pub fn revocable_orders(&self, stock_code: &str) -> Vec<RevocableOrder> {
        let inner = self.lock_inner();
        let mut out: Vec<RevocableOrder> = inner
            .revocables
            .iter()
            .filter(|o| stock_code.is_empty() || o.stock_code == stock_code)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.order_qty.cmp(&a.order_qty));
        out
    }

    fn lock_inner(&self) -> MutexGuard<'_, AgentInner> {
        self.inner.lock().expect("agent state poisoned")
    }

    fn with_log(&self, f: impl FnOnce(&mut LoopLogWriter)) {
        let mut log = self.log.lock().expect("loop log poisoned");
        f(&mut log);
    }

    // --------------------------------------------------------
    // WORKER
    // --------------------------------------------------------

    /// Spawn the single worker thread.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.running.store(true, Ordering::Release);
        let agent = self.clone();
        thread::Builder::new()
            .name("order-worker".to_string())
            .spawn(move || agent.worker_loop())
            .expect("spawn order worker")
    }

    /// Request worker exit after the queues drain.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.cv.notify_all();
    }

    fn worker_loop(&self) {
        info!("order worker started");
        loop {
            let worked = self.drain_events();
            if worked {
                continue;
            }
            if !self.running.load(Ordering::Acquire) {
                let inner = self.lock_inner();
                if inner.triggers.is_empty() && self.confirms.is_empty() {
                    break;
                }
                continue;
            }
            let inner = self.lock_inner();
            // Re-check under the lock so a notify between drain and wait is
            // not lost.
            if inner.triggers.is_empty() && self.confirms.is_empty() {
                let _unused = self
                    .cv
                    .wait_timeout(inner, WORKER_TICK)
                    .expect("agent state poisoned");
            }
        }
        self.flush_log();
        info!("order worker exited");
    }

    /// Process everything currently queued plus due timeouts. Public so the
    /// replay driver and tests can run the machine deterministically without
    /// the worker thread.
    pub fn drain_events(&self) -> bool {
        let mut worked = false;

        while let Some(msg) = self.confirms.pop() {
            worked = true;
            if msg.kind == ConfirmKind::PushMatch {
                let monitor = self.monitor.read().expect("monitor slot poisoned").clone();
                if let Some(monitor) = monitor {
                    monitor.on_match(&msg);
                }
            }
            self.handle_confirm(&msg);
        }

        loop {
            let next = self.lock_inner().triggers.pop_front();
            match next {
                Some(trigger) => {
                    worked = true;
                    self.handle_trigger(trigger);
                }
                None => break,
            }
        }

        if self.handle_timeouts() {
            worked = true;
        }
        worked
    }

    // --------------------------------------------------------
    // TRIGGER INGRESS (module D semantics)
    // --------------------------------------------------------

    fn admit_trigger(&self, t: Trigger) {
        if t.event_time < MARKET_OPEN_TIME || t.limit_up_raw <= 0 {
            debug!(
                "{} trigger {} rejected at ingress: time={} limit_up_raw={}",
                t.symbol,
                t.kind.as_str(),
                t.event_time,
                t.limit_up_raw
            );
            return;
        }

        let mut inner = self.lock_inner();
        let st = inner
            .states
            .entry(t.symbol.clone())
            .or_insert_with(OrderState::new);

        if t.kind == TriggerKind::SealedStop {
            st.stop_after_done = true;
            if matches!(st.phase, Phase::Idle | Phase::WaitSend) {
                st.phase = Phase::Stopped;
                info!("{} sealed: order loop stopped", t.symbol);
            } else {
                info!(
                    "{} sealed: stop latched, current phase {}",
                    t.symbol,
                    st.phase.as_str()
                );
            }
            return;
        }

        if t.kind == TriggerKind::Price107 && st.ever_armed() {
            debug!("{} PRICE_107 dropped: symbol already armed", t.symbol);
            return;
        }

        if st.phase != Phase::Idle {
            st.suppressed_while_busy += 1;
            debug!(
                "{} trigger {} suppressed while {} (total {})",
                t.symbol,
                t.kind.as_str(),
                st.phase.as_str(),
                st.suppressed_while_busy
            );
            return;
        }

        st.phase = Phase::WaitSend;
        inner.triggers.push_back(t);
        drop(inner);
        self.cv.notify_one();
    }

    // --------------------------------------------------------
    // SEND PATH
    // --------------------------------------------------------

    fn handle_trigger(&self, t: Trigger) {
        let seq = {
            let mut inner = self.lock_inner();
            let Some(st) = inner.states.get_mut(&t.symbol) else {
                return;
            };
            // A seal between ingress and here parks the symbol; the queued
            // trigger is then stale.
            if st.phase != Phase::WaitSend {
                return;
            }
            st.seq += 1;
            st.reason = t.kind.as_str();
            st.trigger_time = t.event_time;
            st.signal_steady_ns = t.signal_steady_ns;
            st.limit_up_raw = t.limit_up_raw;
            st.base_raw = t.base_raw;
            st.tick_raw = t.tick_raw;
            st.sum_trigger_count = t.sum_trigger_count;
            st.seq
        };

        let Some((code, market)) = split_symbol(&t.symbol) else {
            warn!("{} unroutable symbol, dropping trigger", t.symbol);
            let mut inner = self.lock_inner();
            if let Some(st) = inner.states.get_mut(&t.symbol) {
                st.finish_loop();
            }
            return;
        };
        let holder = if market == "SH" {
            self.account.sh_holder.as_str()
        } else {
            self.account.sz_holder.as_str()
        };
        let price = t.limit_up_raw as f64 / RAW_PER_YUAN as f64;

        let send_ns = steady_now_ns();
        let sys_id = self
            .broker
            .send_sell_limit(market, code, ORDER_QTY, price, holder);

        let mut inner = self.lock_inner();
        let Some(st) = inner.states.get_mut(&t.symbol) else {
            return;
        };
        if sys_id <= 0 {
            let err = gbk_to_utf8(&self.broker.last_error());
            error!(
                "{} seq={} sell entrust rejected: ret={} err={}",
                t.symbol, seq, sys_id, err
            );
            st.finish_loop();
            return;
        }
        st.pending_sys_id = sys_id;
        st.send_steady_ns = send_ns;
        st.phase = Phase::WaitNewAck;
        drop(inner);

        self.perf
            .lock()
            .expect("perf poisoned")
            .add_signal_to_send((send_ns - t.signal_steady_ns).max(0) as u64);
        self.with_log(|log| {
            log.order_send(
                &t.symbol,
                seq,
                t.kind.as_str(),
                t.event_time,
                t.signal_steady_ns,
                send_ns,
                t.limit_up_raw,
                t.base_raw,
                t.tick_raw,
                sys_id,
                t.sum_trigger_count,
            )
        });
        info!(
            "{} seq={} sell sent: sys_id={} price_raw={} qty={}",
            t.symbol, seq, sys_id, t.limit_up_raw, ORDER_QTY
        );
    }

    // --------------------------------------------------------
    // CONFIRM PATH
    // --------------------------------------------------------

    fn find_by_pending(inner: &AgentInner, sys_id: SysId) -> Option<String> {
        inner
            .states
            .iter()
            .find(|(_, st)| st.phase == Phase::WaitNewAck && st.pending_sys_id == sys_id)
            .map(|(symbol, _)| symbol.clone())
    }

    fn find_by_cancel_target(inner: &AgentInner, msg: &ConfirmMsg) -> Option<String> {
        inner
            .states
            .iter()
            .find(|(_, st)| {
                st.phase == Phase::WaitCancelAck
                    && st.to_cancel_sys_id != 0
                    && (st.to_cancel_sys_id == msg.order_id
                        || st.to_cancel_sys_id == msg.cx_order_id)
            })
            .map(|(symbol, _)| symbol.clone())
    }

    fn handle_confirm(&self, msg: &ConfirmMsg) {
        self.update_revocables(msg);
        match msg.kind {
            ConfirmKind::PushOrder => self.on_order_ack(msg),
            ConfirmKind::PushInvalid => self.on_invalid(msg),
            ConfirmKind::PushWithdraw => self.on_withdraw_ack(msg),
            // Executions only feed the follow-up monitor.
            ConfirmKind::PushMatch => {}
        }
    }

    /// Keep the cancelable-order list current across all push kinds: a
    /// revocable order is inserted or refreshed, anything else is removed.
    fn update_revocables(&self, msg: &ConfirmMsg) {
        // A rejected cancel request says nothing about the working order it
        // targeted; that order is still live.
        if msg.kind == ConfirmKind::PushInvalid && msg.order_id == 0 {
            return;
        }
        let sys_id = if msg.order_id != 0 {
            msg.order_id
        } else {
            msg.cx_order_id
        };
        if sys_id == 0 {
            return;
        }
        let mut inner = self.lock_inner();
        let found = inner.revocables.iter().position(|o| o.sys_id == sys_id);
        if is_revocable(msg) {
            let entry = RevocableOrder {
                sys_id,
                market: msg.market.clone(),
                stock_code: msg.stock_code.clone(),
                order_qty: msg.order_qty,
                total_match_qty: msg.total_match_qty,
                order_status: msg.order_status,
            };
            match found {
                Some(i) => inner.revocables[i] = entry,
                None => inner.revocables.push(entry),
            }
        } else if let Some(i) = found {
            inner.revocables.remove(i);
        }
    }

    fn on_order_ack(&self, msg: &ConfirmMsg) {
        let now = steady_now_ns();
        let (symbol, seq, prior, send_ns, signal_ns) = {
            let mut inner = self.lock_inner();
            let Some(symbol) = Self::find_by_pending(&inner, msg.order_id) else {
                // Unknown sys_id or out-of-phase: no state change.
                return;
            };
            let st = inner.states.get_mut(&symbol).expect("state just found");
            let prior = st.active_sys_id;
            st.active_sys_id = st.pending_sys_id;
            st.pending_sys_id = 0;
            if prior != 0 {
                st.to_cancel_sys_id = prior;
                st.cancel_attempts = 1;
                st.last_cancel_send_ns = now;
                st.phase = Phase::WaitCancelAck;
            } else {
                st.finish_loop();
            }
            (symbol, st.seq, prior, st.send_steady_ns, st.signal_steady_ns)
        };

        {
            let mut perf = self.perf.lock().expect("perf poisoned");
            perf.add_send_to_ack((now - send_ns).max(0) as u64);
            perf.add_loop_latency((now - signal_ns).max(0) as u64);
        }

        self.with_log(|log| {
            log.order_ack(
                &symbol,
                seq,
                msg.order_id,
                &msg.push_time,
                &msg.confirm_time,
                now,
                msg.order_status,
                &msg.result_info,
            )
        });
        info!("{} seq={} sell acked: sys_id={}", symbol, seq, msg.order_id);

        if prior != 0 {
            self.issue_cancel(&symbol, seq, prior, 1);
        }
    }

    fn on_invalid(&self, msg: &ConfirmMsg) {
        let now = steady_now_ns();

        // New-order rejection?
        {
            let mut inner = self.lock_inner();
            if let Some(symbol) = Self::find_by_pending(&inner, msg.order_id) {
                let st = inner.states.get_mut(&symbol).expect("state just found");
                let seq = st.seq;
                st.pending_sys_id = 0;
                st.finish_loop();
                drop(inner);
                error!(
                    "{} seq={} sell invalid: sys_id={} status={} info={}",
                    symbol, seq, msg.order_id, msg.order_status, msg.result_info
                );
                self.with_log(|log| {
                    log.order_invalid(
                        &symbol,
                        seq,
                        msg.order_id,
                        &msg.push_time,
                        &msg.confirm_time,
                        now,
                        msg.order_status,
                        &msg.result_info,
                    )
                });
                return;
            }
        }

        // Cancel rejection?
        let retry = {
            let mut inner = self.lock_inner();
            let Some(symbol) = Self::find_by_cancel_target(&inner, msg) else {
                return;
            };
            let st = inner.states.get_mut(&symbol).expect("state just found");
            let seq = st.seq;
            let target = st.to_cancel_sys_id;
            let attempt = st.cancel_attempts;
            let retry = if st.cancel_attempts < CANCEL_RETRY_MAX {
                st.cancel_attempts += 1;
                st.last_cancel_send_ns = now;
                Some((symbol.clone(), seq, target, st.cancel_attempts))
            } else {
                None
            };
            drop(inner);
            self.with_log(|log| {
                log.cancel_invalid(
                    &symbol,
                    seq,
                    target,
                    attempt,
                    &msg.push_time,
                    &msg.confirm_time,
                    now,
                    msg.order_status,
                    &msg.result_info,
                )
            });
            if retry.is_none() {
                error!(
                    "{} seq={} cancel of {} failed {} times, giving up automatic retry",
                    symbol, seq, target, CANCEL_RETRY_MAX
                );
            }
            retry
        };

        if let Some((symbol, seq, target, attempt)) = retry {
            self.issue_cancel(&symbol, seq, target, attempt);
        }
    }

    fn on_withdraw_ack(&self, msg: &ConfirmMsg) {
        let now = steady_now_ns();
        let (symbol, seq, target, cancel_send_ns) = {
            let mut inner = self.lock_inner();
            let Some(symbol) = Self::find_by_cancel_target(&inner, msg) else {
                return;
            };
            let st = inner.states.get_mut(&symbol).expect("state just found");
            let seq = st.seq;
            let target = st.to_cancel_sys_id;
            let cancel_send_ns = st.last_cancel_send_ns;
            st.to_cancel_sys_id = 0;
            st.cancel_attempts = 0;
            st.last_cancel_send_ns = 0;
            st.finish_loop();
            (symbol, seq, target, cancel_send_ns)
        };

        self.perf
            .lock()
            .expect("perf poisoned")
            .add_cancel_roundtrip((now - cancel_send_ns).max(0) as u64);

        self.with_log(|log| {
            log.cancel_ack(
                &symbol,
                seq,
                target,
                &msg.push_time,
                &msg.confirm_time,
                now,
                msg.order_status,
                &msg.result_info,
            )
        });
        info!("{} seq={} cancel acked: sys_id={}", symbol, seq, target);
    }

    // --------------------------------------------------------
    // CANCEL SEND + TIMEOUTS
    // --------------------------------------------------------

    /// Send (or re-send) the cancel for a prior live order. On immediate
    /// rejection the loop closes; retries only happen via PUSH_INVALID or
    /// the 2 s timeout.
    fn issue_cancel(&self, symbol: &str, seq: u32, target: SysId, attempt: u32) {
        let Some((_, market)) = split_symbol(symbol) else {
            return;
        };
        let send_ns = steady_now_ns();
        let ret = self.broker.cancel(market, target);

        self.with_log(|log| log.cancel_send(symbol, seq, target, attempt, send_ns));

        if ret <= 0 {
            let err = gbk_to_utf8(&self.broker.last_error());
            error!(
                "{} seq={} cancel entrust rejected: target={} attempt={} ret={} err={}",
                symbol, seq, target, attempt, ret, err
            );
            let mut inner = self.lock_inner();
            if let Some(st) = inner.states.get_mut(symbol) {
                if st.phase == Phase::WaitCancelAck && st.to_cancel_sys_id == target {
                    st.to_cancel_sys_id = 0;
                    st.cancel_attempts = 0;
                    st.finish_loop();
                }
            }
            return;
        }
        let mut inner = self.lock_inner();
        if let Some(st) = inner.states.get_mut(symbol) {
            if st.phase == Phase::WaitCancelAck && st.to_cancel_sys_id == target {
                st.last_cancel_send_ns = send_ns;
            }
        }
        info!(
            "{} seq={} cancel sent: target={} attempt={}",
            symbol, seq, target, attempt
        );
    }

    /// Re-send cancels whose confirmation is overdue. Returns true when any
    /// retry fired.
    fn handle_timeouts(&self) -> bool {
        let now = steady_now_ns();
        let due: Vec<(String, u32, SysId, u32)> = {
            let mut inner = self.lock_inner();
            let mut due = Vec::new();
            for (symbol, st) in inner.states.iter_mut() {
                if st.phase == Phase::WaitCancelAck
                    && st.to_cancel_sys_id != 0
                    && st.cancel_attempts < CANCEL_RETRY_MAX
                    && now - st.last_cancel_send_ns >= CANCEL_TIMEOUT_NS
                {
                    st.cancel_attempts += 1;
                    st.last_cancel_send_ns = now;
                    due.push((symbol.clone(), st.seq, st.to_cancel_sys_id, st.cancel_attempts));
                }
            }
            due
        };
        for (symbol, seq, target, attempt) in &due {
            warn!(
                "{} seq={} cancel timeout, re-sending: target={} attempt={}",
                symbol, seq, target, attempt
            );
            self.issue_cancel(symbol, *seq, *target, *attempt);
        }
        !due.is_empty()
    }

    #[cfg(test)]
    fn age_cancel_for_test(&self, symbol: &str, age_ns: SteadyNs) {
        let mut inner = self.lock_inner();
        if let Some(st) = inner.states.get_mut(symbol) {
            st.last_cancel_send_ns -= age_ns;
        }
    }
}

impl TriggerSink for OrderAgent {
    fn post_trigger(&self, trigger: Trigger) {
        self.admit_trigger(trigger);
    }
}

impl ConfirmSink for OrderAgent {
    fn push_confirm(&self, msg: ConfirmMsg) {
        if self.confirms.push(msg).is_err() {
            warn!("confirm queue full, dropping broker push");
            return;
        }
        self.cv.notify_one();
    }
}

// ============================================================
// TESTS
// ============================================================
