//! latency_report - offline breakdown of the closed-loop tape.
//!
//! Reads `time_spend.log`, pairs sends with their confirmations per
//! (symbol, seq), and prints the signal→send→ack timing breakdown with
//! latency percentiles.
//!
//! ```bash
//! latency_report [time_spend.log]
//! ```

use std::fs;

use rustc_hash::FxHashMap;

use limitup_agent::loop_log::{LoopEvent, parse_line};
use limitup_agent::perf::PerfMetrics;

fn main() {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "time_spend.log".to_string());
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("cannot read {}: {}", path, e);
            std::process::exit(2);
        }
    };

    let mut perf = PerfMetrics::new(1);
    let mut sends: FxHashMap<(String, u32), (i64, i64)> = FxHashMap::default();
    let mut cancel_sends: FxHashMap<(String, u32), i64> = FxHashMap::default();
    let mut invalids = 0u64;
    let mut cancel_invalids = 0u64;
    let mut unparsed = 0u64;

    for line in content.lines() {
        let Some(event) = parse_line(line) else {
            unparsed += 1;
            continue;
        };
        match event {
            LoopEvent::OrderSend {
                symbol,
                seq,
                signal_steady_ns,
                send_steady_ns,
                ..
            } => {
                perf.add_signal_to_send((send_steady_ns - signal_steady_ns).max(0) as u64);
                sends.insert((symbol, seq), (signal_steady_ns, send_steady_ns));
            }
            LoopEvent::OrderAck {
                symbol,
                seq,
                now_ns,
                ..
            } => {
                if let Some((signal_ns, send_ns)) = sends.remove(&(symbol, seq)) {
                    perf.add_send_to_ack((now_ns - send_ns).max(0) as u64);
                    perf.add_loop_latency((now_ns - signal_ns).max(0) as u64);
                }
            }
            LoopEvent::OrderInvalid { symbol, seq, .. } => {
                invalids += 1;
                sends.remove(&(symbol, seq));
            }
            LoopEvent::CancelSend {
                symbol,
                seq,
                send_ns,
                ..
            } => {
                // Retries overwrite; the roundtrip is measured from the
                // attempt that got confirmed.
                cancel_sends.insert((symbol, seq), send_ns);
            }
            LoopEvent::CancelAck {
                symbol,
                seq,
                now_ns,
                ..
            } => {
                if let Some(send_ns) = cancel_sends.remove(&(symbol, seq)) {
                    perf.add_cancel_roundtrip((now_ns - send_ns).max(0) as u64);
                }
            }
            LoopEvent::CancelInvalid { .. } => cancel_invalids += 1,
        }
    }

    println!("=== Closed-loop latency report: {} ===", path);
    println!(
        "loops completed: {}   unacked sends: {}   invalids: {}   cancel invalids: {}   unparsed lines: {}",
        perf.loops_completed(),
        sends.len(),
        invalids,
        cancel_invalids,
        unparsed
    );

    let (sig, ack, cxl) = perf.breakdown_pct();
    println!("\nTime breakdown (of {} ns tracked):", perf.total_tracked_ns());
    println!("  signal → send    : {:>6.2}%", sig);
    println!("  send   → ack     : {:>6.2}%", ack);
    println!("  cancel roundtrip : {:>6.2}%", cxl);

    println!("\nSignal→ack latency (ns):");
    match (perf.min_latency(), perf.avg_latency(), perf.max_latency()) {
        (Some(min), Some(avg), Some(max)) => {
            println!("  min {:>12}   avg {:>12}   max {:>12}", min, avg, max);
            for p in [50.0, 90.0, 99.0, 99.9] {
                if let Some(v) = perf.percentile(p) {
                    println!("  P{:<5} {:>12}", p, v);
                }
            }
        }
        _ => println!("  no completed loops in tape"),
    }
}
