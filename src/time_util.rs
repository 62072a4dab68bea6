//! Clock helpers: monotonic nanoseconds and local wall-clock gates.
//!
//! All latency accounting uses a single process-wide steady clock so that
//! differences are meaningful across threads. Wall-clock is only consulted
//! for session gates (09:17 snapshot, 09:30 open) and log stamps.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use chrono::{Datelike, Local, TimeZone, Timelike};

use crate::core_types::SteadyNs;

static PROCESS_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since the first call in this process. Monotonic.
#[inline]
pub fn steady_now_ns() -> SteadyNs {
    let epoch = PROCESS_EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as SteadyNs
}

/// Local wall-clock time as HHMMSS (e.g. 92959).
pub fn local_hhmmss() -> i32 {
    let now = Local::now();
    (now.hour() * 10000 + now.minute() * 100 + now.second()) as i32
}

/// Local wall-clock "YYYY-MM-DD HH:MM:SS.mmm" for human-facing log lines.
pub fn local_time_string() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// How long until the next occurrence of `hh:mm:00` local time.
///
/// Returns `Duration::ZERO` when the moment has already passed today, so a
/// late start runs the gated work immediately.
pub fn until_local_time(hh: u32, mm: u32) -> Duration {
    let now = Local::now();
    let today = now.date_naive();
    let target = Local
        .with_ymd_and_hms(today.year(), today.month(), today.day(), hh, mm, 0)
        .single();
    match target {
        Some(t) if t > now => (t - now).to_std().unwrap_or(Duration::ZERO),
        _ => Duration::ZERO,
    }
}

/// Split HHMMSSmmm into (hh, mm, ss, mmm) for display.
pub fn split_hhmmssmmm(t: i32) -> (i32, i32, i32, i32) {
    let mmm = t % 1000;
    let ss = (t / 1000) % 100;
    let mm = (t / 100_000) % 100;
    let hh = t / 10_000_000;
    (hh, mm, ss, mmm)
}
