//! Symbol Engine - per-symbol limit-up pressure detection.
//!
//! One `SymbolState` per watched symbol tracks three things:
//!
//! - the daily ceiling (`limit_up_raw`) and the base price derived from it,
//! - the cumulative notional of *new* sell orders at the ceiling above an
//!   exchange-order-id watermark (`flag_order`), decremented by cancels and
//!   executions that reference ids above the watermark,
//! - seal state (first sell execution printing exactly at the ceiling).
//!
//! Records for one symbol arrive effectively sequentially, so the per-symbol
//! mutex is uncontended; it exists to make the engine safe under any
//! dispatcher arrangement.

use std::sync::{Arc, Mutex, RwLock};

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::config::{Whitelist, symbol_from_key};
use crate::core_types::{ExchTime, MARKET_OPEN_TIME, OrderNo, RAW_PER_YUAN, RawPrice};
use crate::feed::{MarketSnap, SIDE_SELL, TickOrder, TickTrade};
use crate::time_util::steady_now_ns;
use crate::trigger::{Trigger, TriggerKind, TriggerSink};

// ============================================================
// THRESHOLDS
// ============================================================

/// 50万 yuan in raw notional units (price_raw × volume).
pub const SELL_SUM_THRESHOLD_RAW: i64 = 500_000 * RAW_PER_YUAN;

/// Price-107 fires when `tick_raw * 100 > base_raw * 107`.
const PRICE_107_NUM: i64 = 107;
const PRICE_107_DEN: i64 = 100;

// ============================================================
// SYMBOL STATE
// ============================================================

/// Signal state for one symbol. All prices raw (×10000).
#[derive(Debug)]
pub struct SymbolState {
    pub symbol: String,

    // Reference prices
    pub limit_up_raw: RawPrice,
    pub base_raw: RawPrice,
    pub base_ready: bool,

    // Seal state
    pub sealed: bool,
    pub seal_time: ExchTime,

    // Cumulative sell tracker
    pub flag_order_initialized: bool,
    pub flag_order: OrderNo,
    pub sum_raw: i64,

    // Trigger counters
    pub sum_trigger_count: u32,
    pub price107_triggered: bool,
}

impl SymbolState {
    pub fn new(symbol: String) -> Self {
        Self {
            symbol,
            limit_up_raw: 0,
            base_raw: 0,
            base_ready: false,
            sealed: false,
            seal_time: 0,
            flag_order_initialized: false,
            flag_order: 0,
            sum_raw: 0,
            sum_trigger_count: 0,
            price107_triggered: false,
        }
    }

    /// Record the daily ceiling. Derives the base price once, on the first
    /// positive ceiling seen; later snapshots only refresh the ceiling.
    pub fn set_limit_up(&mut self, limit_up_raw: RawPrice) {
        if limit_up_raw <= 0 {
            return;
        }
        self.limit_up_raw = limit_up_raw;
        if !self.base_ready {
            // Ceiling = base × 1.1 rounded to the 0.01 tick grid, so the
            // base comes back by dividing on that same grid.
            let limit_up_tick = self.limit_up_raw / 100;
            let base_tick = (limit_up_tick as f64 / 1.1 + 1e-6).round() as i64;
            self.base_raw = base_tick * 100;
            self.base_ready = self.base_raw > 0;
            info!(
                "{} ceiling set: limit_up_raw={} base_raw={}",
                self.symbol, self.limit_up_raw, self.base_raw
            );
        }
    }

    /// Tick-by-tick entrusted order. Returns a trigger when the cumulative
    /// sell notional crosses the 50万 threshold.
    pub fn on_order(&mut self, o: &TickOrder) -> Option<Trigger> {
        if o.function_code != SIDE_SELL
            || o.time < MARKET_OPEN_TIME
            || o.order_no <= 0
            || self.limit_up_raw <= 0
            || o.price_raw != self.limit_up_raw
        {
            return None;
        }

        let is_cancel = o.is_sh_cancel();

        // First non-cancel ceiling sell sets the watermark and nothing else.
        if !self.flag_order_initialized {
            if is_cancel {
                return None;
            }
            self.flag_order = o.order_no;
            self.sum_raw = 0;
            self.flag_order_initialized = true;
            debug!("{} flag_order initialized at {}", self.symbol, o.order_no);
            return None;
        }

        if o.order_no <= self.flag_order {
            return None;
        }
        let delta = o.price_raw.checked_mul(o.volume).unwrap_or(0);
        if delta <= 0 {
            return None;
        }

        if is_cancel {
            self.sum_raw = (self.sum_raw - delta).max(0);
            return None;
        }
        if self.sealed {
            return None;
        }

        self.sum_raw += delta;
        if self.sum_raw < SELL_SUM_THRESHOLD_RAW {
            return None;
        }

        // Threshold hit: reset the watermark, latch out price-107.
        self.flag_order = o.order_no;
        self.sum_raw = 0;
        self.sum_trigger_count += 1;
        self.price107_triggered = true;
        info!(
            "{} SELL_SUM_50W #{} at order_no={} time={}",
            self.symbol, self.sum_trigger_count, o.order_no, o.time
        );
        Some(self.make_trigger(TriggerKind::SellSum50w, o.time, 0))
    }

    /// Tick-by-tick execution. Returns a trigger on seal or price-107.
    pub fn on_transaction(&mut self, t: &TickTrade) -> Option<Trigger> {
        if t.time < MARKET_OPEN_TIME {
            return None;
        }
        let is_cancel = t.is_sz_cancel();
        let mut fired = None;

        if !is_cancel {
            // Seal: first sell execution printing exactly at the ceiling.
            if !self.sealed
                && t.bs_flag == SIDE_SELL
                && self.limit_up_raw > 0
                && t.price_raw == self.limit_up_raw
            {
                self.sealed = true;
                self.seal_time = t.time;
                info!("{} sealed at {}", self.symbol, t.time);
                fired = Some(self.make_trigger(TriggerKind::SealedStop, t.time, t.price_raw));
            }

            // Price-107: strictly above 1.07× base, once, before any seal
            // and before any 50万 trigger armed the symbol.
            if fired.is_none()
                && !self.sealed
                && !self.price107_triggered
                && self.base_ready
                && t.price_raw * PRICE_107_DEN > self.base_raw * PRICE_107_NUM
            {
                self.price107_triggered = true;
                info!(
                    "{} PRICE_107 at tick_raw={} base_raw={} time={}",
                    self.symbol, t.price_raw, self.base_raw, t.time
                );
                fired = Some(self.make_trigger(TriggerKind::Price107, t.time, t.price_raw));
            }
        }

        // Sell pressure drains when executions or SZ cancels consume orders
        // above the watermark. Cancels report no price; the ceiling stands in.
        if self.flag_order_initialized && t.ask_order > self.flag_order {
            let price = if is_cancel {
                self.limit_up_raw
            } else {
                t.price_raw
            };
            if is_cancel || t.price_raw == self.limit_up_raw {
                let delta = price.checked_mul(t.volume).unwrap_or(0);
                if delta > 0 {
                    self.sum_raw = (self.sum_raw - delta).max(0);
                }
            }
        }

        fired
    }

    fn make_trigger(&self, kind: TriggerKind, event_time: ExchTime, tick_raw: RawPrice) -> Trigger {
        Trigger {
            kind,
            symbol: self.symbol.clone(),
            event_time,
            limit_up_raw: self.limit_up_raw,
            base_raw: if self.base_ready { self.base_raw } else { 0 },
            tick_raw,
            signal_steady_ns: steady_now_ns(),
            sum_trigger_count: self.sum_trigger_count,
        }
    }
}

// ============================================================
// SYMBOL ENGINE (registry)
// ============================================================

/// Process-wide registry of symbol states, keyed by canonical symbol.
///
/// Built from the whitelist at startup. With an empty whitelist the agent
/// monitors everything, so unseen symbols are admitted lazily.
pub struct SymbolEngine {
    states: RwLock<FxHashMap<String, Arc<Mutex<SymbolState>>>>,
    monitor_all: bool,
    triggers: Arc<dyn TriggerSink>,
}

impl SymbolEngine {
    pub fn new(whitelist: &Whitelist, triggers: Arc<dyn TriggerSink>) -> Self {
        let mut states = FxHashMap::default();
        for symbol in whitelist.codes() {
            states.insert(
                symbol.clone(),
                Arc::new(Mutex::new(SymbolState::new(symbol.clone()))),
            );
        }
        Self {
            states: RwLock::new(states),
            monitor_all: whitelist.is_empty(),
            triggers,
        }
    }

    pub fn symbol_count(&self) -> usize {
        self.states.read().expect("engine registry poisoned").len()
    }

    fn state_for(&self, symbol: &str) -> Option<Arc<Mutex<SymbolState>>> {
        {
            let map = self.states.read().expect("engine registry poisoned");
            if let Some(state) = map.get(symbol) {
                return Some(state.clone());
            }
        }
        if !self.monitor_all || symbol.is_empty() {
            return None;
        }
        let mut map = self.states.write().expect("engine registry poisoned");
        Some(
            map.entry(symbol.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(SymbolState::new(symbol.to_string()))))
                .clone(),
        )
    }

    /// Run `f` under the symbol's lock. No-op for unregistered symbols.
    pub fn with_state<R>(&self, symbol: &str, f: impl FnOnce(&mut SymbolState) -> R) -> Option<R> {
        let state = self.state_for(symbol)?;
        let mut guard = state.lock().expect("symbol state poisoned");
        Some(f(&mut guard))
    }

    pub fn process_market(&self, md: &MarketSnap) {
        let symbol = symbol_from_key(&md.symbol_key).to_string();
        let _ = self.with_state(&symbol, |state| state.set_limit_up(md.high_limited));
    }

    pub fn process_order(&self, o: &TickOrder) {
        let symbol = symbol_from_key(&o.symbol_key).to_string();
        let fired = self.with_state(&symbol, |state| state.on_order(o)).flatten();
        if let Some(trigger) = fired {
            self.triggers.post_trigger(trigger);
        }
    }

    pub fn process_transaction(&self, t: &TickTrade) {
        let symbol = symbol_from_key(&t.symbol_key).to_string();
        let fired = self
            .with_state(&symbol, |state| state.on_transaction(t))
            .flatten();
        if let Some(trigger) = fired {
            self.triggers.post_trigger(trigger);
        }
    }

    /// Seed ceilings from the one-shot startup broker query.
    ///
    /// Keys may be canonical ("600001.SH") or bare 6-digit codes when the
    /// broker omits the market field; bare codes try ".SH" then ".SZ".
    pub fn update_limit_up_price_from_query(&self, quotes: &FxHashMap<String, RawPrice>) -> usize {
        let mut applied = 0;
        for (key, &limit_up_raw) in quotes {
            if limit_up_raw <= 0 {
                continue;
            }
            let candidates: Vec<String> = if key.contains('.') {
                vec![key.clone()]
            } else {
                vec![format!("{}.SH", key), format!("{}.SZ", key)]
            };
            for symbol in candidates {
                let hit = {
                    let map = self.states.read().expect("engine registry poisoned");
                    map.get(&symbol).cloned()
                };
                if let Some(state) = hit {
                    state
                        .lock()
                        .expect("symbol state poisoned")
                        .set_limit_up(limit_up_raw);
                    applied += 1;
                    break;
                }
            }
        }
        applied
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::pad_symbol_key;
    use crate::feed::{SH_CANCEL_ORDER_KIND, SIDE_BUY, SZ_CANCEL_FUNCTION_CODE};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink(StdMutex<Vec<Trigger>>);

    impl TriggerSink for RecordingSink {
        fn post_trigger(&self, trigger: Trigger) {
            self.0.lock().unwrap().push(trigger);
        }
    }

    fn sell(symbol: &str, order_no: i64, price_raw: i64, volume: i64) -> TickOrder {
        TickOrder {
            symbol_key: pad_symbol_key(symbol),
            time: 93001000,
            order_no,
            price_raw,
            volume,
            function_code: SIDE_SELL,
            order_kind: 0,
        }
    }

    fn trade(symbol: &str, ask_order: i64, price_raw: i64, volume: i64, bs: u8) -> TickTrade {
        TickTrade {
            symbol_key: pad_symbol_key(symbol),
            time: 93002000,
            trade_no: 1,
            ask_order,
            bid_order: 0,
            price_raw,
            volume,
            bs_flag: bs,
            function_code: 0,
        }
    }

    fn engine_with(symbols: &[&str]) -> (SymbolEngine, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let wl = Whitelist::from_codes(symbols.iter().copied());
        (SymbolEngine::new(&wl, sink.clone()), sink)
    }

    #[test]
    fn test_base_price_derivation() {
        let mut state = SymbolState::new("000002.SZ".into());
        state.set_limit_up(11_000_000);
        assert!(state.base_ready);
        // base_tick = round(11000000/100 / 1.1) = 100000 -> base_raw = 10000000
        assert_eq!(state.base_raw, 10_000_000);

        // Idempotent: a different later ceiling refreshes limit_up only
        state.set_limit_up(11_110_000);
        assert_eq!(state.limit_up_raw, 11_110_000);
        assert_eq!(state.base_raw, 10_000_000);
    }

    #[test]
    fn test_sell_sum_accumulates_and_resets() {
        let (engine, sink) = engine_with(&["600001"]);
        // ceiling 11.00 yuan = 110000 raw; 50万 yuan needs 5e9 raw notional
        engine.with_state("600001.SH", |s| s.set_limit_up(110_000)).unwrap();

        engine.process_order(&sell("600001.SH", 100, 110_000, 20_000));
        assert_eq!(
            engine.with_state("600001.SH", |s| s.flag_order).unwrap(),
            100
        );
        assert!(sink.0.lock().unwrap().is_empty());

        // 110000 * 40000 = 4.4e9 < 5e9
        engine.process_order(&sell("600001.SH", 101, 110_000, 40_000));
        assert_eq!(
            engine.with_state("600001.SH", |s| s.sum_raw).unwrap(),
            4_400_000_000
        );
        assert!(sink.0.lock().unwrap().is_empty());

        // + 110000 * 6000 = 6.6e8 -> 5.06e9 >= 5e9: trigger
        engine.process_order(&sell("600001.SH", 102, 110_000, 6_000));
        let fired = sink.0.lock().unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].kind, TriggerKind::SellSum50w);
        assert_eq!(fired[0].sum_trigger_count, 1);
        assert_eq!(fired[0].limit_up_raw, 110_000);
        drop(fired);

        let (sum, flag, count, latched) = engine
            .with_state("600001.SH", |s| {
                (s.sum_raw, s.flag_order, s.sum_trigger_count, s.price107_triggered)
            })
            .unwrap();
        assert_eq!(sum, 0);
        assert_eq!(flag, 102);
        assert_eq!(count, 1);
        assert!(latched, "50万 trigger latches out price-107");
    }

    #[test]
    fn test_order_filters() {
        let (engine, sink) = engine_with(&["600001"]);
        engine.with_state("600001.SH", |s| s.set_limit_up(110_000)).unwrap();
        engine.process_order(&sell("600001.SH", 100, 110_000, 100));

        // Not at ceiling
        engine.process_order(&sell("600001.SH", 101, 109_900, 1_000_000));
        // Buy side
        let mut buy = sell("600001.SH", 102, 110_000, 1_000_000);
        buy.function_code = SIDE_BUY;
        engine.process_order(&buy);
        // Pre-open
        let mut early = sell("600001.SH", 103, 110_000, 1_000_000);
        early.time = 92500000;
        engine.process_order(&early);
        // Stale order number
        engine.process_order(&sell("600001.SH", 99, 110_000, 1_000_000));

        assert_eq!(engine.with_state("600001.SH", |s| s.sum_raw).unwrap(), 0);
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_sh_cancel_decrements_not_initializes() {
        let (engine, _sink) = engine_with(&["600001"]);
        engine.with_state("600001.SH", |s| s.set_limit_up(110_000)).unwrap();

        // Cancel before initialization is ignored
        let mut cxl = sell("600001.SH", 50, 110_000, 1000);
        cxl.order_kind = SH_CANCEL_ORDER_KIND;
        engine.process_order(&cxl);
        assert!(
            !engine
                .with_state("600001.SH", |s| s.flag_order_initialized)
                .unwrap()
        );

        engine.process_order(&sell("600001.SH", 100, 110_000, 100));
        engine.process_order(&sell("600001.SH", 101, 110_000, 10_000));
        assert_eq!(
            engine.with_state("600001.SH", |s| s.sum_raw).unwrap(),
            1_100_000_000
        );

        // Cancel above the watermark subtracts, floored at zero
        let mut cxl2 = sell("600001.SH", 102, 110_000, 20_000);
        cxl2.order_kind = SH_CANCEL_ORDER_KIND;
        engine.process_order(&cxl2);
        assert_eq!(engine.with_state("600001.SH", |s| s.sum_raw).unwrap(), 0);
    }

    #[test]
    fn test_s2_price107_then_sum_latches() {
        let (engine, sink) = engine_with(&["000002"]);
        engine.with_state("000002.SZ", |s| s.set_limit_up(11_000_000)).unwrap();
        // base_raw = 10_000_000; 1.07x = 10_700_000

        // At exactly 1.07x: strict inequality, no fire
        engine.process_transaction(&trade("000002.SZ", 0, 10_700_000, 100, SIDE_BUY));
        assert!(sink.0.lock().unwrap().is_empty());

        engine.process_transaction(&trade("000002.SZ", 0, 10_710_000, 100, SIDE_BUY));
        {
            let fired = sink.0.lock().unwrap();
            assert_eq!(fired.len(), 1);
            assert_eq!(fired[0].kind, TriggerKind::Price107);
            assert_eq!(fired[0].tick_raw, 10_710_000);
            assert_eq!(fired[0].base_raw, 10_000_000);
        }

        // Second high print: no second PRICE_107 ever
        engine.process_transaction(&trade("000002.SZ", 0, 10_720_000, 100, SIDE_BUY));
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_s3_seal_freezes_tracker() {
        let (engine, sink) = engine_with(&["600001"]);
        engine.with_state("600001.SH", |s| s.set_limit_up(110_000)).unwrap();
        engine.process_order(&sell("600001.SH", 100, 110_000, 100));

        engine.process_transaction(&trade("600001.SH", 0, 110_000, 500, SIDE_SELL));
        {
            let fired = sink.0.lock().unwrap();
            assert_eq!(fired.len(), 1);
            assert_eq!(fired[0].kind, TriggerKind::SealedStop);
        }
        let (sealed, seal_time) = engine
            .with_state("600001.SH", |s| (s.sealed, s.seal_time))
            .unwrap();
        assert!(sealed);
        assert_eq!(seal_time, 93002000);

        // Tracker is frozen: huge sell adds nothing, no 50万 after seal
        engine.process_order(&sell("600001.SH", 200, 110_000, 1_000_000));
        assert_eq!(engine.with_state("600001.SH", |s| s.sum_raw).unwrap(), 0);
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_sz_cancel_substitutes_ceiling_price() {
        let (engine, _sink) = engine_with(&["000002"]);
        engine.with_state("000002.SZ", |s| s.set_limit_up(110_000)).unwrap();
        engine.process_order(&sell("000002.SZ", 100, 110_000, 100));
        engine.process_order(&sell("000002.SZ", 101, 110_000, 10_000));
        assert_eq!(
            engine.with_state("000002.SZ", |s| s.sum_raw).unwrap(),
            1_100_000_000
        );

        // SZ cancel carries no price; ceiling is substituted
        let mut cxl = trade("000002.SZ", 101, 0, 4_000, 0);
        cxl.function_code = SZ_CANCEL_FUNCTION_CODE;
        engine.process_transaction(&cxl);
        assert_eq!(
            engine.with_state("000002.SZ", |s| s.sum_raw).unwrap(),
            1_100_000_000 - 110_000 * 4_000
        );
    }

    #[test]
    fn test_execution_below_watermark_ignored() {
        let (engine, _sink) = engine_with(&["600001"]);
        engine.with_state("600001.SH", |s| s.set_limit_up(110_000)).unwrap();
        engine.process_order(&sell("600001.SH", 100, 110_000, 100));
        engine.process_order(&sell("600001.SH", 101, 110_000, 10_000));

        // Execution referencing the watermark order itself: not counted
        engine.process_transaction(&trade("600001.SH", 100, 110_000, 10_000, SIDE_BUY));
        assert_eq!(
            engine.with_state("600001.SH", |s| s.sum_raw).unwrap(),
            1_100_000_000
        );

        // Execution above the watermark at the ceiling: subtracted
        engine.process_transaction(&trade("600001.SH", 101, 110_000, 2_000, SIDE_BUY));
        assert_eq!(
            engine.with_state("600001.SH", |s| s.sum_raw).unwrap(),
            1_100_000_000 - 110_000 * 2_000
        );
    }

    #[test]
    fn test_registry_respects_whitelist() {
        let (engine, _sink) = engine_with(&["600001"]);
        assert_eq!(engine.symbol_count(), 1);
        engine.process_order(&sell("999999.SZ", 100, 110_000, 100));
        assert_eq!(engine.symbol_count(), 1, "unlisted symbols are dropped");
    }

    #[test]
    fn test_monitor_all_admits_lazily() {
        let sink = Arc::new(RecordingSink::default());
        let engine = SymbolEngine::new(&Whitelist::default(), sink);
        assert_eq!(engine.symbol_count(), 0);
        engine.process_order(&sell("999999.SZ", 100, 110_000, 100));
        assert_eq!(engine.symbol_count(), 1);
    }

    #[test]
    fn test_ceiling_query_with_market_fallback() {
        let (engine, _sink) = engine_with(&["600001", "000002"]);
        let mut quotes = FxHashMap::default();
        quotes.insert("600001.SH".to_string(), 110_000i64);
        quotes.insert("000002".to_string(), 220_000i64); // bare: tries .SH then .SZ
        quotes.insert("300750".to_string(), 330_000i64); // not watched
        assert_eq!(engine.update_limit_up_price_from_query(&quotes), 2);

        assert_eq!(
            engine.with_state("600001.SH", |s| s.limit_up_raw).unwrap(),
            110_000
        );
        assert_eq!(
            engine.with_state("000002.SZ", |s| s.limit_up_raw).unwrap(),
            220_000
        );
    }
}
