//! limitup_agent - A-share limit-up pressure trading agent
//!
//! Watches a curated symbol set on the exchange tick streams, detects two
//! limit-up pressure signals (price above 1.07× base, cumulative 50万 sell
//! notional at the ceiling), and runs a send → ack → cancel-prior → ack
//! closed loop of 100-share ceiling sells per symbol. A sealed symbol stops
//! for the day. A secondary monitor replays the morning's own SZ sells and
//! emits twin follow-up buys on a second execution at a recorded price.
//!
//! # Modules
//!
//! - [`core_types`] - Scalar aliases (RawPrice, SysId, ExchTime, ...)
//! - [`config`] - account.json / white_list.json loading, symbol classing
//! - [`feed`] - Tick record types, wire codec, vendor adapter seam
//! - [`ring_bus`] - Bounded MPSC ring between feed callback and dispatcher
//! - [`dispatcher`] - Single consumer decode-and-route loop
//! - [`symbol_engine`] - Per-symbol signal detection
//! - [`trigger`] - Signal→order trigger messages
//! - [`order_machine`] - Per-symbol order closed loop (single worker)
//! - [`broker`] - Brokerage trait + deterministic simulator
//! - [`monitor`] - 09:17 snapshot + follow-up buy emission
//! - [`loop_log`] - time_spend.log closed-loop record writer/parser
//! - [`perf`] - Closed-loop timing metrics
//! - [`replay`] - Capture CSV loader and offline feed driver

// Core types - must be first!
pub mod core_types;

// Configuration and ambient plumbing
pub mod config;
pub mod encoding;
pub mod logging;
pub mod time_util;

// Market-data path
pub mod dispatcher;
pub mod feed;
pub mod ring_bus;
pub mod symbol_engine;

// Order path
pub mod broker;
pub mod loop_log;
pub mod monitor;
pub mod order_machine;
pub mod perf;
pub mod trigger;

// Offline driver
pub mod replay;

// Convenient re-exports at crate root
pub use broker::{BrokerApi, ConfirmKind, ConfirmMsg, ConfirmSink, OrderKind, SimBroker};
pub use config::{Settings, Whitelist, classify_code};
pub use core_types::{ExchTime, OrderNo, Qty, RawPrice, SteadyNs, SysId};
pub use feed::{DataType, FeedRecord, FeedSink, RawBatch};
pub use monitor::FollowUpMonitor;
pub use order_machine::{AccountInfo, OrderAgent, Phase};
pub use ring_bus::{RingBus, RingRecord};
pub use symbol_engine::SymbolEngine;
pub use trigger::{Trigger, TriggerKind, TriggerSink};
