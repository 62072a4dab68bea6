//! Ring Bus - bounded MPSC ring buffer between the feed callback and the
//! dispatcher.
//!
//! ```text
//! feed thread(s)                                  dispatcher thread
//! ┌────────────┐   push (explode batch items)    ┌───────────────┐
//! │ vendor cb  │ ───────────────────────────────▶│  pop loop     │
//! │ (1..N)     │   whitelist filter + drop acct  │  (single)     │
//! └────────────┘                                 └───────────────┘
//! ```
//!
//! # Key Design
//!
//! - **Bounded, never blocks producers**: overflow is counted and dropped;
//!   the vendor callback must return quickly no matter what.
//! - **Per-slot sequence stamps**: unbounded u64 cursors, slot index is
//!   `pos & mask`. A slot is writable when `seq == pos`, readable when
//!   `seq == pos + 1`; the consumer releases it with `seq = pos + capacity`.
//! - **Inline payload**: one item per slot, copied into a fixed 1 KiB
//!   buffer. No heap traffic on the hot path.
//! - **Timed consumer wait**: `pop` parks on a condvar for at most 50 ms so
//!   stop requests are honored promptly.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::{SYMBOL_KEY_LEN, Whitelist};
use crate::core_types::{ExchTime, OrderNo, SteadyNs};
use crate::feed::{DataType, FeedSink, RawBatch};
use crate::time_util::steady_now_ns;

// ============================================================
// CAPACITY CONFIGURATION
// ============================================================

/// Default number of ring slots. Power of two.
pub const RING_CAPACITY: usize = 1 << 16;

/// Inline payload capacity per slot. Must hold the largest single item the
/// vendor emits (probed well below 1 KiB for all three types).
pub const SLOT_PAYLOAD_CAPACITY: usize = 1024;

/// Consumer park time per wait round.
const POP_WAIT: Duration = Duration::from_millis(50);

/// Minimum interval between aggregated stats log lines.
const STATS_EMIT_INTERVAL_NS: SteadyNs = 2_000_000_000;

/// ORDER/TRANSACTION drops emit a warning every this many drops.
const DROP_WARN_EVERY: u64 = 100;

// ============================================================
// RING RECORD (slot value)
// ============================================================

/// One exploded feed item, as stored in a ring slot.
///
/// Written once by a producer, read once by the consumer, then the slot is
/// recycled. The payload array is rebuilt from zeroes on every write, so no
/// bytes from a previous occupant ever reach the consumer.
#[derive(Clone, Copy)]
pub struct RingRecord {
    /// Opaque feed session handle.
    pub handle: u64,
    pub data_type: DataType,
    /// Exchange time HHMMSSmmm from the batch header.
    pub exch_time: ExchTime,
    /// Order/serial number from the batch header.
    pub order_no: OrderNo,
    pub payload_len: u16,
    pub payload: [u8; SLOT_PAYLOAD_CAPACITY],
    /// Steady clock at enqueue, for queue-dwell accounting.
    pub enqueue_steady_ns: SteadyNs,
}

impl RingRecord {
    pub fn empty() -> Self {
        Self {
            handle: 0,
            data_type: DataType::Market,
            exch_time: 0,
            order_no: 0,
            payload_len: 0,
            payload: [0u8; SLOT_PAYLOAD_CAPACITY],
            enqueue_steady_ns: 0,
        }
    }

    #[inline]
    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload[..self.payload_len as usize]
    }
}

struct Slot {
    seq: AtomicU64,
    value: UnsafeCell<RingRecord>,
}

// ============================================================
// BUS STATISTICS
// ============================================================

/// Monotonic bus counters. All relaxed; exact ordering between counters is
/// not needed, only eventual totals.
#[derive(Default)]
pub struct BusStats {
    pub dropped_market: AtomicU64,
    pub dropped_order: AtomicU64,
    pub dropped_transaction: AtomicU64,
    /// Batches with an unknown type tag or broken geometry.
    pub malformed: AtomicU64,
    /// Items rejected by the whitelist.
    pub filtered: AtomicU64,
    pub max_depth: AtomicU64,
    /// Worst single `push` call duration.
    pub max_callback_enqueue_ns: AtomicI64,
    /// Worst enqueue→dequeue dwell.
    pub max_queue_delay_ns: AtomicI64,
    last_stats_emit_ns: AtomicI64,
}

/// Point-in-time copy of the counters, for tests and the stats log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusStatsSnapshot {
    pub dropped_market: u64,
    pub dropped_order: u64,
    pub dropped_transaction: u64,
    pub malformed: u64,
    pub filtered: u64,
    pub max_depth: u64,
    pub max_callback_enqueue_ns: i64,
    pub max_queue_delay_ns: i64,
}

#[inline]
fn atomic_max_u64(dst: &AtomicU64, v: u64) {
    let mut cur = dst.load(Ordering::Relaxed);
    while v > cur {
        match dst.compare_exchange_weak(cur, v, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => cur = actual,
        }
    }
}

#[inline]
fn atomic_max_i64(dst: &AtomicI64, v: i64) {
    let mut cur = dst.load(Ordering::Relaxed);
    while v > cur {
        match dst.compare_exchange_weak(cur, v, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => cur = actual,
        }
    }
}

impl BusStats {
    /// Count one dropped item; returns the new per-type total.
    fn count_drop(&self, data_type: DataType, n: u64) -> u64 {
        let counter = match data_type {
            DataType::Market => &self.dropped_market,
            DataType::Order => &self.dropped_order,
            DataType::Transaction => &self.dropped_transaction,
        };
        counter.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn snapshot(&self) -> BusStatsSnapshot {
        BusStatsSnapshot {
            dropped_market: self.dropped_market.load(Ordering::Relaxed),
            dropped_order: self.dropped_order.load(Ordering::Relaxed),
            dropped_transaction: self.dropped_transaction.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            max_depth: self.max_depth.load(Ordering::Relaxed),
            max_callback_enqueue_ns: self.max_callback_enqueue_ns.load(Ordering::Relaxed),
            max_queue_delay_ns: self.max_queue_delay_ns.load(Ordering::Relaxed),
        }
    }
}

// ============================================================
// RING BUS
// ============================================================

/// Bounded MPSC ring bus for feed records.
pub struct RingBus {
    slots: Box<[Slot]>,
    mask: u64,
    /// Unbounded producer cursor; next slot to claim.
    write_index: AtomicU64,
    /// Unbounded consumer cursor; next slot to read.
    read_index: AtomicU64,
    whitelist: Whitelist,
    stopped: AtomicBool,
    stats: BusStats,
    wait_lock: Mutex<()>,
    wait_cv: Condvar,
}

// Safety: slot values are only touched between a successful cursor CAS and
// the matching seq release store, so each UnsafeCell has exactly one accessor
// at a time. Same protocol as the pack's MPSC ring crates.
unsafe impl Send for RingBus {}
unsafe impl Sync for RingBus {}

impl RingBus {
    pub fn new(whitelist: Whitelist) -> Self {
        Self::with_capacity(RING_CAPACITY, whitelist)
    }

    /// `capacity` must be a power of two.
    pub fn with_capacity(capacity: usize, whitelist: Whitelist) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be 2^n");
        let slots = (0..capacity)
            .map(|i| Slot {
                seq: AtomicU64::new(i as u64),
                value: UnsafeCell::new(RingRecord::empty()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: (capacity - 1) as u64,
            write_index: AtomicU64::new(0),
            read_index: AtomicU64::new(0),
            whitelist,
            stopped: AtomicBool::new(false),
            stats: BusStats::default(),
            wait_lock: Mutex::new(()),
            wait_cv: Condvar::new(),
        }
    }

    /// Replace the whitelist. Must happen before the producer callback is
    /// armed; the set is read without synchronization afterwards.
    pub fn set_whitelist(&mut self, whitelist: Whitelist) {
        self.whitelist = whitelist;
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Records currently enqueued.
    #[inline]
    pub fn depth(&self) -> u64 {
        let write = self.write_index.load(Ordering::Relaxed);
        let read = self.read_index.load(Ordering::Relaxed);
        write.saturating_sub(read)
    }

    pub fn stats(&self) -> &BusStats {
        &self.stats
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    // --------------------------------------------------------
    // PRODUCER SIDE
    // --------------------------------------------------------

    /// Ingest one vendor batch: validate, explode into per-item slots with
    /// whitelist filtering, account every drop. Never blocks.
    ///
    /// Returns the number of records actually enqueued.
    pub fn push(&self, handle: u64, batch: &RawBatch) -> usize {
        let t_start = steady_now_ns();

        let Some(data_type) = DataType::from_wire(batch.data_type) else {
            self.stats.malformed.fetch_add(1, Ordering::Relaxed);
            return 0;
        };
        if batch.item_count <= 0 || batch.item_size <= 0 {
            self.stats.malformed.fetch_add(1, Ordering::Relaxed);
            return 0;
        }
        let item_count = batch.item_count as usize;
        let item_size = batch.item_size as usize;
        // Every item must at least carry the symbol key.
        if item_size < SYMBOL_KEY_LEN {
            self.stats.malformed.fetch_add(1, Ordering::Relaxed);
            return 0;
        }
        if item_size > SLOT_PAYLOAD_CAPACITY {
            let total = self.stats.count_drop(data_type, item_count as u64);
            error!(
                "oversize {} batch dropped: item_size={} > slot capacity {} (dropped total {})",
                data_type.as_str(),
                item_size,
                SLOT_PAYLOAD_CAPACITY,
                total
            );
            return 0;
        }
        if batch.payload.len() < item_count * item_size {
            self.stats.malformed.fetch_add(1, Ordering::Relaxed);
            return 0;
        }

        let filtering = !self.whitelist.is_empty();
        let mut written = 0usize;

        for i in 0..item_count {
            let bytes = &batch.payload[i * item_size..(i + 1) * item_size];

            if filtering {
                let mut key = [0u8; SYMBOL_KEY_LEN];
                key.copy_from_slice(&bytes[..SYMBOL_KEY_LEN]);
                if !self.whitelist.contains_key(&key) {
                    self.stats.filtered.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            }

            if !self.enqueue_item(handle, data_type, batch, bytes) {
                let total = self.stats.count_drop(data_type, 1);
                if matches!(data_type, DataType::Order | DataType::Transaction)
                    && total % DROP_WARN_EVERY == 0
                {
                    warn!(
                        "ring full: dropped {} {} records so far",
                        total,
                        data_type.as_str()
                    );
                }
                continue;
            }
            written += 1;
        }

        if written > 0 {
            atomic_max_u64(&self.stats.max_depth, self.depth());
            self.wait_cv.notify_one();
        }
        atomic_max_i64(
            &self.stats.max_callback_enqueue_ns,
            steady_now_ns() - t_start,
        );
        self.maybe_emit_stats();
        written
    }

    /// Claim the next write slot and copy one item into it.
    /// Returns false when the ring has no free space.
    fn enqueue_item(
        &self,
        handle: u64,
        data_type: DataType,
        batch: &RawBatch,
        bytes: &[u8],
    ) -> bool {
        let mut pos = self.write_index.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[(pos & self.mask) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let dif = seq as i64 - pos as i64;
            if dif == 0 {
                match self.write_index.compare_exchange_weak(
                    pos,
                    pos + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        let mut record = RingRecord::empty();
                        record.handle = handle;
                        record.data_type = data_type;
                        record.exch_time = batch.exch_time;
                        record.order_no = batch.order_no;
                        record.payload_len = bytes.len() as u16;
                        record.payload[..bytes.len()].copy_from_slice(bytes);
                        record.enqueue_steady_ns = steady_now_ns();
                        unsafe { slot.value.get().write(record) };
                        slot.seq.store(pos + 1, Ordering::Release);
                        return true;
                    }
                    Err(actual) => pos = actual,
                }
            } else if dif < 0 {
                // Consumer has not released this slot yet: ring is full.
                return false;
            } else {
                pos = self.write_index.load(Ordering::Relaxed);
            }
        }
    }

    // --------------------------------------------------------
    // CONSUMER SIDE
    // --------------------------------------------------------

    /// Take the next record. Blocks in ≤ 50 ms rounds while the ring is
    /// empty; returns false only after `stop()` with the ring drained.
    pub fn pop(&self, out: &mut RingRecord) -> bool {
        loop {
            if self.try_pop(out) {
                atomic_max_i64(
                    &self.stats.max_queue_delay_ns,
                    steady_now_ns() - out.enqueue_steady_ns,
                );
                return true;
            }
            if self.is_stopped() {
                // Re-check after the stop flag: a producer may have published
                // between the failed pop and the flag load.
                if self.try_pop(out) {
                    return true;
                }
                return false;
            }
            let guard = self.wait_lock.lock().expect("bus wait lock poisoned");
            let _unused = self
                .wait_cv
                .wait_timeout(guard, POP_WAIT)
                .expect("bus wait lock poisoned");
        }
    }

    fn try_pop(&self, out: &mut RingRecord) -> bool {
        let pos = self.read_index.load(Ordering::Relaxed);
        let slot = &self.slots[(pos & self.mask) as usize];
        let seq = slot.seq.load(Ordering::Acquire);
        if seq != pos + 1 {
            return false;
        }
        // Single consumer: no contention on read_index.
        self.read_index.store(pos + 1, Ordering::Relaxed);
        *out = unsafe { slot.value.get().read() };
        slot.seq.store(pos + self.mask + 1, Ordering::Release);
        true
    }

    /// Signal shutdown and wake all waiters. Idempotent.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wait_cv.notify_all();
    }

    /// Discard everything currently enqueued. Only safe while the consumer
    /// is quiescent.
    pub fn clear(&self) {
        let mut scratch = RingRecord::empty();
        while self.try_pop(&mut scratch) {}
    }

    fn maybe_emit_stats(&self) {
        let now = steady_now_ns();
        let last = self.stats.last_stats_emit_ns.load(Ordering::Relaxed);
        if now - last < STATS_EMIT_INTERVAL_NS {
            return;
        }
        if self
            .stats
            .last_stats_emit_ns
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let s = self.stats.snapshot();
        info!(
            "bus stats: depth={} max_depth={} filtered={} dropped(mkt/ord/tx)={}/{}/{} malformed={} max_push_ns={} max_dwell_ns={}",
            self.depth(),
            s.max_depth,
            s.filtered,
            s.dropped_market,
            s.dropped_order,
            s.dropped_transaction,
            s.malformed,
            s.max_callback_enqueue_ns,
            s.max_queue_delay_ns
        );
    }
}

impl FeedSink for RingBus {
    fn on_batch(&self, handle: u64, batch: &RawBatch) {
        self.push(handle, batch);
    }
}

// ============================================================
// TESTS
// ============================================================
