//! Capture replay - offline feed driver.
//!
//! Loads a tick capture (CSV, one record per line) and pushes it through
//! the ring bus exactly as the vendor callback would: consecutive records
//! of one type are packed into multi-item batches. This is the binary's
//! offline mode and the integration tests' front door.
//!
//! # Capture format
//!
//! ```text
//! MARKET,<symbol>,<time>,<high_limited>,<low_limited>,<last>
//! ORDER,<symbol>,<time>,<order_no>,<price_raw>,<volume>,<function_code>,<order_kind>
//! TRANSACTION,<symbol>,<time>,<trade_no>,<ask_order>,<bid_order>,<price_raw>,<volume>,<bs_flag>,<function_code>
//! ```
//!
//! Times are HHMMSSmmm, prices raw (×10000), single-character codes are
//! literal (`S`, `B`, `D`, `C`, `0`). Blank lines and `#` comments are
//! skipped.

use std::fs;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::thread;

use rustc_hash::{FxHashMap, FxHasher};
use thiserror::Error;
use tracing::info;

use crate::config::pad_symbol_key;
use crate::core_types::RawPrice;
use crate::feed::{FeedRecord, MarketSnap, RawBatch, TickOrder, TickTrade};
use crate::ring_bus::RingBus;

/// Default number of items packed into one pushed batch.
pub const REPLAY_BATCH_ITEMS: usize = 32;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("cannot read capture {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("capture line {line_no}: {msg}")]
    Line { line_no: usize, msg: String },
}

fn parse_i64(field: &str, name: &str) -> Result<i64, String> {
    field
        .trim()
        .parse::<i64>()
        .map_err(|_| format!("bad {} field: {:?}", name, field))
}

fn parse_i32(field: &str, name: &str) -> Result<i32, String> {
    field
        .trim()
        .parse::<i32>()
        .map_err(|_| format!("bad {} field: {:?}", name, field))
}

fn parse_code(field: &str, name: &str) -> Result<u8, String> {
    let t = field.trim();
    if t.len() == 1 {
        Ok(t.as_bytes()[0])
    } else {
        Err(format!("bad {} field: {:?}", name, field))
    }
}

fn parse_line(line: &str) -> Result<FeedRecord, String> {
    let fields: Vec<&str> = line.split(',').collect();
    let tag = fields[0].trim();
    match tag {
        "MARKET" => {
            if fields.len() != 6 {
                return Err(format!("MARKET needs 6 fields, got {}", fields.len()));
            }
            Ok(FeedRecord::Market(MarketSnap {
                symbol_key: pad_symbol_key(fields[1].trim()),
                time: parse_i32(fields[2], "time")?,
                high_limited: parse_i64(fields[3], "high_limited")?,
                low_limited: parse_i64(fields[4], "low_limited")?,
                last: parse_i64(fields[5], "last")?,
            }))
        }
        "ORDER" => {
            if fields.len() != 8 {
                return Err(format!("ORDER needs 8 fields, got {}", fields.len()));
            }
            Ok(FeedRecord::Order(TickOrder {
                symbol_key: pad_symbol_key(fields[1].trim()),
                time: parse_i32(fields[2], "time")?,
                order_no: parse_i64(fields[3], "order_no")?,
                price_raw: parse_i64(fields[4], "price_raw")?,
                volume: parse_i64(fields[5], "volume")?,
                function_code: parse_code(fields[6], "function_code")?,
                order_kind: parse_code(fields[7], "order_kind")?,
            }))
        }
        "TRANSACTION" => {
            if fields.len() != 10 {
                return Err(format!("TRANSACTION needs 10 fields, got {}", fields.len()));
            }
            Ok(FeedRecord::Trade(TickTrade {
                symbol_key: pad_symbol_key(fields[1].trim()),
                time: parse_i32(fields[2], "time")?,
                trade_no: parse_i64(fields[3], "trade_no")?,
                ask_order: parse_i64(fields[4], "ask_order")?,
                bid_order: parse_i64(fields[5], "bid_order")?,
                price_raw: parse_i64(fields[6], "price_raw")?,
                volume: parse_i64(fields[7], "volume")?,
                bs_flag: parse_code(fields[8], "bs_flag")?,
                function_code: parse_code(fields[9], "function_code")?,
            }))
        }
        other => Err(format!("unknown record tag {:?}", other)),
    }
}

/// Load a capture file into typed records, preserving line order.
pub fn load_capture(path: &str) -> Result<Vec<FeedRecord>, ReplayError> {
    let text = fs::read_to_string(path).map_err(|source| ReplayError::Io {
        path: path.to_string(),
        source,
    })?;
    let mut records = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let record = parse_line(trimmed).map_err(|msg| ReplayError::Line {
            line_no: idx + 1,
            msg,
        })?;
        records.push(record);
    }
    info!("capture {} loaded: {} records", path, records.len());
    Ok(records)
}

/// Latest positive ceiling per symbol, for seeding the startup query in
/// replay mode.
pub fn extract_ceilings(records: &[FeedRecord]) -> FxHashMap<String, RawPrice> {
    let mut out = FxHashMap::default();
    for record in records {
        if let FeedRecord::Market(md) = record {
            if md.high_limited > 0 {
                let symbol = crate::config::symbol_from_key(&md.symbol_key).to_string();
                out.insert(symbol, md.high_limited);
            }
        }
    }
    out
}

/// Push the records through the bus in vendor-shaped batches: consecutive
/// same-type records are packed together, up to `max_batch_items` per push.
/// Returns the number of records handed to the bus (accepted or dropped
/// there; the bus does its own accounting).
pub fn run_replay(bus: &RingBus, records: &[FeedRecord], max_batch_items: usize) -> usize {
    let mut pushed = 0usize;
    let mut i = 0usize;
    while i < records.len() {
        let data_type = records[i].data_type();
        let mut j = i + 1;
        while j < records.len()
            && j - i < max_batch_items.max(1)
            && records[j].data_type() == data_type
        {
            j += 1;
        }
        let batch = RawBatch::from_records(&records[i..j]).expect("uniform batch packs");
        bus.push(1, &batch);
        pushed += j - i;
        i = j;
    }
    pushed
}

/// Replay through `producers` concurrent feed threads, sharding records by
/// symbol key. Per-symbol relative order is preserved inside each shard,
/// which is the only ordering the signal engine depends on; interleaving
/// between shards exercises the bus's multi-producer path.
pub fn run_replay_sharded(
    bus: &Arc<RingBus>,
    records: &[FeedRecord],
    producers: usize,
    max_batch_items: usize,
) -> usize {
    if producers <= 1 {
        return run_replay(bus, records, max_batch_items);
    }

    let mut shards: Vec<Vec<FeedRecord>> = vec![Vec::new(); producers];
    for record in records {
        let mut hasher = FxHasher::default();
        record.symbol_key().hash(&mut hasher);
        shards[(hasher.finish() as usize) % producers].push(*record);
    }

    let mut pushed = 0usize;
    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(producers);
        for (i, shard) in shards.iter().enumerate() {
            let bus = bus.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("feed-{}", i))
                    .spawn_scoped(scope, move || run_replay(&bus, shard, max_batch_items))
                    .expect("spawn feed shard"),
            );
        }
        for handle in handles {
            pushed += handle.join().expect("feed shard panicked");
        }
    });
    pushed
}

// ============================================================
// TESTS
// ============================================================
