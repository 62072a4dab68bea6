//! Core types used throughout the system
//!
//! These are fundamental type aliases used by all modules.
//! They provide semantic meaning and enable future type evolution.

/// Price scaled by 10000 (0.0001 yuan resolution).
///
/// # Constraints:
/// - All comparisons against reference prices are exact integer compares
/// - A tick on the A-share cash market is 0.01 yuan = 100 raw units
pub type RawPrice = i64;

/// Share quantity / volume.
pub type Qty = i64;

/// Exchange-assigned order number from the tick stream.
///
/// Strictly increasing per side at the exchange; the cumulative-sell
/// watermark (`flag_order`) relies on this monotonicity.
pub type OrderNo = i64;

/// Broker-assigned system-unique id of a live working order.
pub type SysId = i64;

/// Exchange timestamp as HHMMSSmmm (e.g. 93000000 = 09:30:00.000).
pub type ExchTime = i32;

/// Monotonic nanoseconds from the process steady clock.
pub type SteadyNs = i64;

/// 09:30:00.000 in HHMMSSmmm, the continuous-auction open.
pub const MARKET_OPEN_TIME: ExchTime = 93000000;

/// One yuan in raw price units.
pub const RAW_PER_YUAN: i64 = 10000;
