//! Trigger messages from the signal engine to the order worker.
//!
//! A trigger is the engine's only output: it says "this symbol just crossed
//! a limit-up pressure condition". Admission into the worker's mailbox is
//! gated by the order-side state (busy-suppression), so the worker only ever
//! sees one in-flight closed loop per symbol.

use crate::core_types::{ExchTime, RawPrice, SteadyNs};

/// Why a trigger fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    /// A trade printed strictly above 1.07× the derived base price.
    /// Startup-only: fires at most once per symbol per session.
    Price107,
    /// Cumulative new sell notional at the ceiling crossed 50万 yuan.
    SellSum50w,
    /// A sell execution printed at exactly the ceiling: the symbol sealed.
    SealedStop,
}

impl TriggerKind {
    /// Reason tag used in the closed-loop log.
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Price107 => "PRICE_107",
            TriggerKind::SellSum50w => "SELL_SUM_50W",
            TriggerKind::SealedStop => "SEALED_STOP",
        }
    }
}

/// One signal-engine event, carrying everything the closed-loop log needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub kind: TriggerKind,
    /// Canonical "NNNNNN.SH" / "NNNNNN.SZ".
    pub symbol: String,
    /// Exchange time HHMMSSmmm of the record that fired the trigger.
    pub event_time: ExchTime,
    pub limit_up_raw: RawPrice,
    /// 0 until the base price is derived.
    pub base_raw: RawPrice,
    /// Trade price for Price107/SealedStop; 0 for SellSum50w.
    pub tick_raw: RawPrice,
    /// Steady clock when the signal was recognized.
    pub signal_steady_ns: SteadyNs,
    /// Cumulative 50万 trigger count at fire time.
    pub sum_trigger_count: u32,
}

/// Ingress seam: the signal engine posts triggers without knowing the order
/// machine. The order agent implements this with the busy-suppression rules;
/// tests implement it with a recording stub.
pub trait TriggerSink: Send + Sync {
    fn post_trigger(&self, trigger: Trigger);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Recording sink used across the engine tests.
    #[derive(Default)]
    pub struct RecordingSink(pub Mutex<Vec<Trigger>>);

    impl TriggerSink for RecordingSink {
        fn post_trigger(&self, trigger: Trigger) {
            self.0.lock().unwrap().push(trigger);
        }
    }

    #[test]
    fn test_reason_tags() {
        assert_eq!(TriggerKind::Price107.as_str(), "PRICE_107");
        assert_eq!(TriggerKind::SellSum50w.as_str(), "SELL_SUM_50W");
        assert_eq!(TriggerKind::SealedStop.as_str(), "SEALED_STOP");
    }

    #[test]
    fn test_sink_object_safety() {
        let sink: Box<dyn TriggerSink> = Box::<RecordingSink>::default();
        sink.post_trigger(Trigger {
            kind: TriggerKind::SellSum50w,
            symbol: "600001.SH".into(),
            event_time: 93001000,
            limit_up_raw: 110000,
            base_raw: 100000,
            tick_raw: 0,
            signal_steady_ns: 1,
            sum_trigger_count: 1,
        });
    }
}
