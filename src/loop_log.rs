//! Closed-loop timing log (`time_spend.log`).
//!
//! One line per closed-loop event, comma separated, line buffered, written
//! only by the order worker. The file is the offline source of truth for
//! signal→send→ack latency analysis, so the schema is versioned (`v1`) and
//! free-form fields are sanitized before they can break the column count.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};

use tracing::warn;

use crate::core_types::{ExchTime, RawPrice, SteadyNs, SysId};

pub const DEFAULT_LOOP_LOG_PATH: &str = "time_spend.log";

/// Replace comma/CR/LF so a broker string cannot add columns or lines.
pub fn sanitize_csv_field(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            ',' | '\r' | '\n' => ' ',
            other => other,
        })
        .collect()
}

/// Append-only writer with lazy open: an unwritable path is retried on the
/// next line and never takes the trading loop down.
pub struct LoopLogWriter {
    path: String,
    writer: Option<BufWriter<File>>,
    open_failed_logged: bool,
    lines_written: u64,
}

impl LoopLogWriter {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            writer: None,
            open_failed_logged: false,
            lines_written: 0,
        }
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }

    fn ensure_open(&mut self) -> bool {
        if self.writer.is_some() {
            return true;
        }
        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(file) => {
                self.writer = Some(BufWriter::new(file));
                self.open_failed_logged = false;
                true
            }
            Err(e) => {
                if !self.open_failed_logged {
                    warn!("cannot open {}: {} (will retry)", self.path, e);
                    self.open_failed_logged = true;
                }
                false
            }
        }
    }

    fn write_line(&mut self, line: &str) {
        if !self.ensure_open() {
            return;
        }
        let writer = self.writer.as_mut().expect("writer just opened");
        let ok = writeln!(writer, "{}", line).is_ok() && writer.flush().is_ok();
        if ok {
            self.lines_written += 1;
        } else {
            // Drop the handle so the next line re-opens.
            warn!("write to {} failed, will reopen", self.path);
            self.writer = None;
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }

    // --------------------------------------------------------
    // v1 RECORD SCHEMAS
    // --------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn order_send(
        &mut self,
        symbol: &str,
        seq: u32,
        reason: &str,
        trigger_time: ExchTime,
        signal_steady_ns: SteadyNs,
        send_steady_ns: SteadyNs,
        limit_up_raw: RawPrice,
        base_raw: RawPrice,
        tick_raw: RawPrice,
        sys_id: SysId,
        sum_trigger_count: u32,
    ) {
        self.write_line(&format!(
            "v1,ORDER_SEND,{},{},{},{},{},{},{},{},{},{},{}",
            symbol,
            seq,
            sanitize_csv_field(reason),
            trigger_time,
            signal_steady_ns,
            send_steady_ns,
            limit_up_raw,
            base_raw,
            tick_raw,
            sys_id,
            sum_trigger_count
        ));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn order_ack(
        &mut self,
        symbol: &str,
        seq: u32,
        sys_id: SysId,
        push_time: &str,
        confirm_time: &str,
        now_ns: SteadyNs,
        order_status: i32,
        result_info: &str,
    ) {
        self.write_line(&format!(
            "v1,ORDER_ACK,{},{},{},{},{},{},{},{}",
            symbol,
            seq,
            sys_id,
            sanitize_csv_field(push_time),
            sanitize_csv_field(confirm_time),
            now_ns,
            order_status,
            sanitize_csv_field(result_info)
        ));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn order_invalid(
        &mut self,
        symbol: &str,
        seq: u32,
        sys_id: SysId,
        push_time: &str,
        confirm_time: &str,
        now_ns: SteadyNs,
        order_status: i32,
        result_info: &str,
    ) {
        self.write_line(&format!(
            "v1,ORDER_INVALID,{},{},{},{},{},{},{},{}",
            symbol,
            seq,
            sys_id,
            sanitize_csv_field(push_time),
            sanitize_csv_field(confirm_time),
            now_ns,
            order_status,
            sanitize_csv_field(result_info)
        ));
    }

    pub fn cancel_send(
        &mut self,
        symbol: &str,
        seq: u32,
        target_sys_id: SysId,
        attempt: u32,
        send_ns: SteadyNs,
    ) {
        self.write_line(&format!(
            "v1,CANCEL_SEND,{},{},{},{},{}",
            symbol, seq, target_sys_id, attempt, send_ns
        ));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn cancel_ack(
        &mut self,
        symbol: &str,
        seq: u32,
        target_sys_id: SysId,
        push_time: &str,
        confirm_time: &str,
        now_ns: SteadyNs,
        order_status: i32,
        result_info: &str,
    ) {
        self.write_line(&format!(
            "v1,CANCEL_ACK,{},{},{},{},{},{},{},{}",
            symbol,
            seq,
            target_sys_id,
            sanitize_csv_field(push_time),
            sanitize_csv_field(confirm_time),
            now_ns,
            order_status,
            sanitize_csv_field(result_info)
        ));
    }

    #[allow(clippy::too_many_arguments)]
    pub fn cancel_invalid(
        &mut self,
        symbol: &str,
        seq: u32,
        target_sys_id: SysId,
        attempt: u32,
        push_time: &str,
        confirm_time: &str,
        now_ns: SteadyNs,
        order_status: i32,
        result_info: &str,
    ) {
        self.write_line(&format!(
            "v1,CANCEL_INVALID,{},{},{},{},{},{},{},{},{}",
            symbol,
            seq,
            target_sys_id,
            attempt,
            sanitize_csv_field(push_time),
            sanitize_csv_field(confirm_time),
            now_ns,
            order_status,
            sanitize_csv_field(result_info)
        ));
    }
}

impl Drop for LoopLogWriter {
    fn drop(&mut self) {
        self.flush();
    }
}

// ============================================================
// v1 RECORD PARSER (offline analysis)
// ============================================================

/// Parsed view of one `v1` tape line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEvent {
    OrderSend {
        symbol: String,
        seq: u32,
        reason: String,
        signal_steady_ns: SteadyNs,
        send_steady_ns: SteadyNs,
        sys_id: SysId,
    },
    OrderAck {
        symbol: String,
        seq: u32,
        sys_id: SysId,
        now_ns: SteadyNs,
    },
    OrderInvalid {
        symbol: String,
        seq: u32,
        sys_id: SysId,
        now_ns: SteadyNs,
    },
    CancelSend {
        symbol: String,
        seq: u32,
        target_sys_id: SysId,
        attempt: u32,
        send_ns: SteadyNs,
    },
    CancelAck {
        symbol: String,
        seq: u32,
        target_sys_id: SysId,
        now_ns: SteadyNs,
    },
    CancelInvalid {
        symbol: String,
        seq: u32,
        target_sys_id: SysId,
        attempt: u32,
        now_ns: SteadyNs,
    },
}

fn field<T: std::str::FromStr>(fields: &[&str], idx: usize) -> Option<T> {
    fields.get(idx)?.parse().ok()
}

/// Parse one tape line. Unknown versions/tags and short lines yield `None`.
pub fn parse_line(line: &str) -> Option<LoopEvent> {
    let fields: Vec<&str> = line.split(',').collect();
    if fields.first() != Some(&"v1") {
        return None;
    }
    let symbol = fields.get(2)?.to_string();
    let seq: u32 = field(&fields, 3)?;
    match *fields.get(1)? {
        "ORDER_SEND" => Some(LoopEvent::OrderSend {
            symbol,
            seq,
            reason: fields.get(4)?.to_string(),
            signal_steady_ns: field(&fields, 6)?,
            send_steady_ns: field(&fields, 7)?,
            sys_id: field(&fields, 11)?,
        }),
        "ORDER_ACK" => Some(LoopEvent::OrderAck {
            symbol,
            seq,
            sys_id: field(&fields, 4)?,
            now_ns: field(&fields, 7)?,
        }),
        "ORDER_INVALID" => Some(LoopEvent::OrderInvalid {
            symbol,
            seq,
            sys_id: field(&fields, 4)?,
            now_ns: field(&fields, 7)?,
        }),
        "CANCEL_SEND" => Some(LoopEvent::CancelSend {
            symbol,
            seq,
            target_sys_id: field(&fields, 4)?,
            attempt: field(&fields, 5)?,
            send_ns: field(&fields, 6)?,
        }),
        "CANCEL_ACK" => Some(LoopEvent::CancelAck {
            symbol,
            seq,
            target_sys_id: field(&fields, 4)?,
            now_ns: field(&fields, 7)?,
        }),
        "CANCEL_INVALID" => Some(LoopEvent::CancelInvalid {
            symbol,
            seq,
            target_sys_id: field(&fields, 4)?,
            attempt: field(&fields, 5)?,
            now_ns: field(&fields, 8)?,
        }),
        _ => None,
    }
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_csv_field("a,b\r\nc"), "a b  c");
        assert_eq!(sanitize_csv_field("clean"), "clean");
    }

    #[test]
    fn test_order_send_schema() {
        let path = "/tmp/test_loop_log_send.log";
        fs::remove_file(path).ok();
        {
            let mut log = LoopLogWriter::new(path);
            log.order_send(
                "600001.SH",
                1,
                "SELL_SUM_50W",
                93001000,
                111,
                222,
                110000,
                100000,
                0,
                5001,
                1,
            );
            assert_eq!(log.lines_written(), 1);
        }
        let content = fs::read_to_string(path).unwrap();
        assert_eq!(
            content.trim_end(),
            "v1,ORDER_SEND,600001.SH,1,SELL_SUM_50W,93001000,111,222,110000,100000,0,5001,1"
        );
        fs::remove_file(path).ok();
    }

    #[test]
    fn test_ack_sanitizes_result_info() {
        let path = "/tmp/test_loop_log_ack.log";
        fs::remove_file(path).ok();
        {
            let mut log = LoopLogWriter::new(path);
            log.order_ack("600001.SH", 2, 5001, "09:30:01", "093001", 333, 2, "ok,done\n");
        }
        let content = fs::read_to_string(path).unwrap();
        assert_eq!(
            content.trim_end(),
            "v1,ORDER_ACK,600001.SH,2,5001,09:30:01,093001,333,2,ok done "
        );
        fs::remove_file(path).ok();
    }

    #[test]
    fn test_cancel_lines_append() {
        let path = "/tmp/test_loop_log_cancel.log";
        fs::remove_file(path).ok();
        {
            let mut log = LoopLogWriter::new(path);
            log.cancel_send("000002.SZ", 3, 777, 1, 444);
            log.cancel_invalid("000002.SZ", 3, 777, 1, "p", "c", 555, 9, "bad");
            log.cancel_ack("000002.SZ", 3, 777, "p", "c", 666, 4, "done");
        }
        let content = fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("v1,CANCEL_SEND,000002.SZ,3,777,1,"));
        assert!(lines[1].starts_with("v1,CANCEL_INVALID,000002.SZ,3,777,1,"));
        assert!(lines[2].starts_with("v1,CANCEL_ACK,000002.SZ,3,777,"));
    }

    #[test]
    fn test_parse_roundtrip() {
        let path = "/tmp/test_loop_log_parse.log";
        fs::remove_file(path).ok();
        {
            let mut log = LoopLogWriter::new(path);
            log.order_send(
                "600001.SH",
                1,
                "PRICE_107",
                93001000,
                111,
                222,
                110000,
                100000,
                107100,
                5001,
                0,
            );
            log.order_ack("600001.SH", 1, 5001, "p", "c", 333, 2, "ok");
            log.cancel_send("600001.SH", 1, 4001, 2, 444);
            log.cancel_ack("600001.SH", 1, 4001, "p", "c", 555, 8, "done");
            log.cancel_invalid("600001.SH", 1, 4001, 3, "p", "c", 666, 9, "bad");
        }
        let content = fs::read_to_string(path).unwrap();
        fs::remove_file(path).ok();

        let events: Vec<LoopEvent> = content.lines().filter_map(parse_line).collect();
        assert_eq!(events.len(), 5);
        assert_eq!(
            events[0],
            LoopEvent::OrderSend {
                symbol: "600001.SH".to_string(),
                seq: 1,
                reason: "PRICE_107".to_string(),
                signal_steady_ns: 111,
                send_steady_ns: 222,
                sys_id: 5001,
            }
        );
        assert_eq!(
            events[1],
            LoopEvent::OrderAck {
                symbol: "600001.SH".to_string(),
                seq: 1,
                sys_id: 5001,
                now_ns: 333,
            }
        );
        assert_eq!(
            events[2],
            LoopEvent::CancelSend {
                symbol: "600001.SH".to_string(),
                seq: 1,
                target_sys_id: 4001,
                attempt: 2,
                send_ns: 444,
            }
        );
        assert_eq!(
            events[3],
            LoopEvent::CancelAck {
                symbol: "600001.SH".to_string(),
                seq: 1,
                target_sys_id: 4001,
                now_ns: 555,
            }
        );
        assert_eq!(
            events[4],
            LoopEvent::CancelInvalid {
                symbol: "600001.SH".to_string(),
                seq: 1,
                target_sys_id: 4001,
                attempt: 3,
                now_ns: 666,
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("v2,ORDER_SEND,600001.SH,1"), None);
        assert_eq!(parse_line("v1,UNKNOWN_TAG,600001.SH,1"), None);
        assert_eq!(parse_line("v1,ORDER_ACK,600001.SH,notanum,5001"), None);
    }

    #[test]
    fn test_unwritable_path_never_panics() {
        let mut log = LoopLogWriter::new("/nonexistent_dir/time_spend.log");
        log.cancel_send("600001.SH", 1, 1, 1, 1);
        log.cancel_send("600001.SH", 1, 2, 1, 2);
        assert_eq!(log.lines_written(), 0);
    }
}
