//! Feed records and the vendor adapter seam.
//!
//! The vendor SDK delivers batched messages: a header declaring
//! `item_count`/`item_size` plus a contiguous payload of fixed-size items.
//! Only this module knows the item layouts; everything downstream works with
//! the typed records decoded here.
//!
//! # Payload Layout
//!
//! Every item starts with a 32-byte NUL-padded symbol key, so the bus can
//! whitelist-filter on raw bytes without decoding. The rest of the item is
//! the bincode fixed-width little-endian encoding of the record struct
//! (field order below is the wire order):
//!
//! ```text
//! ┌────────────┬──────────┬───────────────────────────────────┐
//! │ symbol_key │ 32 bytes │ "NNNNNN.SH\0..." — filter key     │
//! │ fields     │ fixed    │ i32/i64/u8 fields, little-endian  │
//! └────────────┴──────────┴───────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::config::SYMBOL_KEY_LEN;
use crate::core_types::{ExchTime, OrderNo, Qty, RawPrice};

// ============================================================
// DATA TYPES AND VENUE CONSTANTS
// ============================================================

/// Wire tag of a feed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    /// Snapshot with reference prices (carries the daily ceiling).
    Market = 1,
    /// Tick-by-tick entrusted order.
    Order = 2,
    /// Tick-by-tick execution.
    Transaction = 3,
}

impl DataType {
    pub fn from_wire(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(DataType::Market),
            2 => Some(DataType::Order),
            3 => Some(DataType::Transaction),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Market => "MARKET",
            DataType::Order => "ORDER",
            DataType::Transaction => "TRANSACTION",
        }
    }
}

/// Sell side marker on both streams.
pub const SIDE_SELL: u8 = b'S';
/// Buy side marker.
pub const SIDE_BUY: u8 = b'B';
/// SH reports cancels on the order stream with this order kind.
pub const SH_CANCEL_ORDER_KIND: u8 = b'D';
/// SZ reports cancels on the transaction stream with this function code.
pub const SZ_CANCEL_FUNCTION_CODE: u8 = b'C';

// ============================================================
// TYPED RECORDS
// ============================================================

/// Market snapshot item. Only the fields the engine consumes are carried.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarketSnap {
    pub symbol_key: [u8; SYMBOL_KEY_LEN],
    /// Exchange time HHMMSSmmm.
    pub time: ExchTime,
    /// Daily ceiling price, raw (×10000). 0 when the venue omits it.
    pub high_limited: RawPrice,
    /// Daily floor price, raw.
    pub low_limited: RawPrice,
    /// Last trade price, raw.
    pub last: RawPrice,
}

/// Tick-by-tick entrusted order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickOrder {
    pub symbol_key: [u8; SYMBOL_KEY_LEN],
    pub time: ExchTime,
    /// Exchange-assigned order number, strictly increasing per side.
    pub order_no: OrderNo,
    pub price_raw: RawPrice,
    pub volume: Qty,
    /// `SIDE_SELL` / `SIDE_BUY`.
    pub function_code: u8,
    /// `SH_CANCEL_ORDER_KIND` marks an SH cancel; otherwise venue-specific.
    pub order_kind: u8,
}

impl TickOrder {
    #[inline]
    pub fn is_sh_cancel(&self) -> bool {
        self.order_kind == SH_CANCEL_ORDER_KIND
    }
}

/// Tick-by-tick execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickTrade {
    pub symbol_key: [u8; SYMBOL_KEY_LEN],
    pub time: ExchTime,
    /// Execution serial within the channel.
    pub trade_no: OrderNo,
    /// Exchange order number of the resting/ask side.
    pub ask_order: OrderNo,
    /// Exchange order number of the bid side.
    pub bid_order: OrderNo,
    pub price_raw: RawPrice,
    pub volume: Qty,
    /// Active side of the print: `SIDE_SELL` / `SIDE_BUY`.
    pub bs_flag: u8,
    /// `SZ_CANCEL_FUNCTION_CODE` marks an SZ cancel.
    pub function_code: u8,
}

impl TickTrade {
    #[inline]
    pub fn is_sz_cancel(&self) -> bool {
        self.function_code == SZ_CANCEL_FUNCTION_CODE
    }
}

/// A decoded feed record of any type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedRecord {
    Market(MarketSnap),
    Order(TickOrder),
    Trade(TickTrade),
}

impl FeedRecord {
    pub fn data_type(&self) -> DataType {
        match self {
            FeedRecord::Market(_) => DataType::Market,
            FeedRecord::Order(_) => DataType::Order,
            FeedRecord::Trade(_) => DataType::Transaction,
        }
    }

    pub fn symbol_key(&self) -> &[u8; SYMBOL_KEY_LEN] {
        match self {
            FeedRecord::Market(m) => &m.symbol_key,
            FeedRecord::Order(o) => &o.symbol_key,
            FeedRecord::Trade(t) => &t.symbol_key,
        }
    }

    pub fn time(&self) -> ExchTime {
        match self {
            FeedRecord::Market(m) => m.time,
            FeedRecord::Order(o) => o.time,
            FeedRecord::Trade(t) => t.time,
        }
    }

    /// Header order-number field for the ring slot (0 for snapshots).
    pub fn order_no(&self) -> OrderNo {
        match self {
            FeedRecord::Market(_) => 0,
            FeedRecord::Order(o) => o.order_no,
            FeedRecord::Trade(t) => t.trade_no,
        }
    }
}

// ============================================================
// WIRE CODEC
// ============================================================

/// Encode one record into `buf`, returning the number of bytes written.
///
/// The symbol key lands at offset 0 because it is the first struct field and
/// fixed-size arrays encode with no length prefix.
pub fn encode_item(record: &FeedRecord, buf: &mut [u8]) -> Option<usize> {
    let bytes = match record {
        FeedRecord::Market(m) => bincode::serialize(m),
        FeedRecord::Order(o) => bincode::serialize(o),
        FeedRecord::Trade(t) => bincode::serialize(t),
    }
    .ok()?;
    if bytes.len() > buf.len() {
        return None;
    }
    buf[..bytes.len()].copy_from_slice(&bytes);
    Some(bytes.len())
}

/// Decode one item of the given type.
pub fn decode_item(data_type: DataType, bytes: &[u8]) -> Result<FeedRecord, bincode::Error> {
    match data_type {
        DataType::Market => bincode::deserialize(bytes).map(FeedRecord::Market),
        DataType::Order => bincode::deserialize(bytes).map(FeedRecord::Order),
        DataType::Transaction => bincode::deserialize(bytes).map(FeedRecord::Trade),
    }
}

/// Fixed encoded size of one item of the given type.
pub fn item_size(data_type: DataType) -> usize {
    // All fields are fixed width, so any value of the type has the same size.
    let key = [0u8; SYMBOL_KEY_LEN];
    let probe = match data_type {
        DataType::Market => FeedRecord::Market(MarketSnap {
            symbol_key: key,
            time: 0,
            high_limited: 0,
            low_limited: 0,
            last: 0,
        }),
        DataType::Order => FeedRecord::Order(TickOrder {
            symbol_key: key,
            time: 0,
            order_no: 0,
            price_raw: 0,
            volume: 0,
            function_code: 0,
            order_kind: 0,
        }),
        DataType::Transaction => FeedRecord::Trade(TickTrade {
            symbol_key: key,
            time: 0,
            trade_no: 0,
            ask_order: 0,
            bid_order: 0,
            price_raw: 0,
            volume: 0,
            bs_flag: 0,
            function_code: 0,
        }),
    };
    let mut buf = [0u8; 256];
    encode_item(&probe, &mut buf).expect("probe record encodes")
}

// ============================================================
// RAW BATCH (vendor callback unit)
// ============================================================

/// One vendor callback worth of data: a header plus `item_count` items of
/// `item_size` bytes each, packed back to back.
#[derive(Debug, Clone)]
pub struct RawBatch {
    pub data_type: u8,
    pub item_count: i32,
    pub item_size: i32,
    /// Exchange time of the first item (HHMMSSmmm).
    pub exch_time: ExchTime,
    /// Order-number field of the first item (0 for snapshots).
    pub order_no: OrderNo,
    pub payload: Vec<u8>,
}

impl RawBatch {
    /// Pack typed records into one batch. All records must share a type.
    pub fn from_records(records: &[FeedRecord]) -> Option<Self> {
        let first = records.first()?;
        let data_type = first.data_type();
        let size = item_size(data_type);
        let mut payload = vec![0u8; size * records.len()];
        for (i, record) in records.iter().enumerate() {
            if record.data_type() != data_type {
                return None;
            }
            let written = encode_item(record, &mut payload[i * size..(i + 1) * size])?;
            debug_assert_eq!(written, size);
        }
        Some(Self {
            data_type: data_type as u8,
            item_count: records.len() as i32,
            item_size: size as i32,
            exch_time: first.time(),
            order_no: first.order_no(),
            payload,
        })
    }

    /// Borrow item `i`'s bytes, if the declared geometry holds.
    pub fn item_bytes(&self, i: usize) -> Option<&[u8]> {
        let size = self.item_size as usize;
        let start = i.checked_mul(size)?;
        let end = start.checked_add(size)?;
        self.payload.get(start..end)
    }
}

/// Seam between the vendor adapter and the core.
///
/// The vendor callback thread hands every batch to this trait; the ring bus
/// is the production implementation. The adapter is the only code that knows
/// vendor types, so the core stays SDK-free.
pub trait FeedSink: Send + Sync {
    fn on_batch(&self, handle: u64, batch: &RawBatch);
}

// ============================================================
// TESTS
// ============================================================
