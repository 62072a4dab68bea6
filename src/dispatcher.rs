//! Dispatcher - the single bus consumer.
//!
//! Pops records off the ring, decodes the inline payload, and routes by
//! data type to the symbol engine. A record that fails to decode is logged
//! and dropped; the loop only ends when the bus is stopped and drained.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{info, warn};

use crate::feed::{FeedRecord, decode_item};
use crate::ring_bus::{RingBus, RingRecord};
use crate::symbol_engine::SymbolEngine;

/// Consume the bus until it stops. Runs on the dedicated consumer thread.
pub fn run(bus: &RingBus, engine: &SymbolEngine) {
    let mut record = RingRecord::empty();
    let mut processed = 0u64;
    let mut decode_failures = 0u64;

    info!("dispatcher started");
    while bus.pop(&mut record) {
        match decode_item(record.data_type, record.payload_bytes()) {
            Ok(FeedRecord::Market(md)) => engine.process_market(&md),
            Ok(FeedRecord::Order(o)) => engine.process_order(&o),
            Ok(FeedRecord::Trade(t)) => engine.process_transaction(&t),
            Err(e) => {
                decode_failures += 1;
                warn!(
                    "undecodable {} record ({} bytes) dropped: {}",
                    record.data_type.as_str(),
                    record.payload_len,
                    e
                );
                continue;
            }
        }
        processed += 1;
    }
    info!(
        "dispatcher exited: processed={} decode_failures={}",
        processed, decode_failures
    );
}

/// Spawn the consumer thread.
pub fn spawn(bus: Arc<RingBus>, engine: Arc<SymbolEngine>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("dispatcher".to_string())
        .spawn(move || run(&bus, &engine))
        .expect("spawn dispatcher")
}

// ============================================================
// TESTS
// ============================================================
