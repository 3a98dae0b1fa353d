//! Event log
//!
//! A single append-only log shared by the executive, the mailbox manager,
//! and the registry. Subscribers (control-plane sessions) hold cursors into
//! it; eviction advances a floor below the minimum live cursor or the
//! retention deadline. Every event carries a globally monotonic `seq`.

use serde::Serialize;
use std::collections::VecDeque;

/// Maximum serialised payload text; longer stdout/stderr is truncated.
pub const MAX_EVENT_TEXT: usize = 64 * 1024;

/// Default retention for delivered events, milliseconds.
pub const DEFAULT_RETENTION_MS: i64 = 5_000;

/// Memory access detail inside a `trace_step` event.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MemAccessInfo {
    pub op: String,
    pub address: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<u32>,
}

/// Event payload, serialised as `"type"` + `"data"`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    TraceStep {
        pc: u32,
        next_pc: u32,
        opcode: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        flags: Option<u32>,
        regs: Vec<u32>,
        steps: u64,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        changed_regs: Vec<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        mem_access: Option<MemAccessInfo>,
    },
    DebugBreak {
        pc: u32,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        breakpoint_id: Option<u32>,
    },
    TaskState {
        prev_state: String,
        new_state: String,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
    Scheduler {
        state: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        prev_pid: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_pid: Option<u32>,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        quantum_remaining: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        prev_state: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        post_state: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_state: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        executed: Option<u64>,
        source: String,
    },
    MailboxSend {
        descriptor: u32,
        target: String,
        src_pid: u32,
        len: u32,
        channel: u8,
    },
    MailboxRecv {
        descriptor: u32,
        target: String,
        pid: u32,
        len: u32,
    },
    MailboxWait {
        descriptor: u32,
        target: String,
        pid: u32,
        op: String,
    },
    MailboxWake {
        descriptor: u32,
        target: String,
        pid: u32,
    },
    MailboxTimeout {
        descriptor: u32,
        pid: u32,
    },
    MailboxOverrun {
        descriptor: u32,
        target: String,
        pid: u32,
        dropped_len: u32,
    },
    MailboxError {
        descriptor: u32,
        pid: u32,
        status: i32,
    },
    MailboxExhausted {
        requested: String,
        pid: u32,
    },
    ValueChanged {
        oid: u16,
        old: f32,
        new: f32,
    },
    WatchUpdate {
        id: u32,
        expr: String,
        address: u32,
        length: u32,
        bytes: String,
        prev: String,
    },
    Stdout {
        text: String,
    },
    Stderr {
        text: String,
    },
    Clock {
        state: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        rate: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        throttle_reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_wait_s: Option<f64>,
    },
    Warning {
        message: String,
        category: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pending: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        high_water: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        drops: Option<u64>,
    },
}

impl EventPayload {
    /// Category name as it appears on the wire (`"type"`).
    pub fn category(&self) -> &'static str {
        match self {
            EventPayload::TraceStep { .. } => "trace_step",
            EventPayload::DebugBreak { .. } => "debug_break",
            EventPayload::TaskState { .. } => "task_state",
            EventPayload::Scheduler { .. } => "scheduler",
            EventPayload::MailboxSend { .. } => "mailbox_send",
            EventPayload::MailboxRecv { .. } => "mailbox_recv",
            EventPayload::MailboxWait { .. } => "mailbox_wait",
            EventPayload::MailboxWake { .. } => "mailbox_wake",
            EventPayload::MailboxTimeout { .. } => "mailbox_timeout",
            EventPayload::MailboxOverrun { .. } => "mailbox_overrun",
            EventPayload::MailboxError { .. } => "mailbox_error",
            EventPayload::MailboxExhausted { .. } => "mailbox_exhausted",
            EventPayload::ValueChanged { .. } => "value_changed",
            EventPayload::WatchUpdate { .. } => "watch_update",
            EventPayload::Stdout { .. } => "stdout",
            EventPayload::Stderr { .. } => "stderr",
            EventPayload::Clock { .. } => "clock",
            EventPayload::Warning { .. } => "warning",
        }
    }
}

/// One event in the shared log.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Event {
    pub seq: u64,
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// Append-only log with retention + cursor-floor eviction.
pub struct EventLog {
    events: VecDeque<Event>,
    next_seq: u64,
    floor: u64,
    retention_ms: i64,
}

impl EventLog {
    pub fn new(retention_ms: i64) -> Self {
        Self {
            events: VecDeque::new(),
            next_seq: 1,
            floor: 0,
            retention_ms,
        }
    }

    pub fn set_retention_ms(&mut self, retention_ms: i64) {
        self.retention_ms = retention_ms.max(0);
    }

    pub fn emit(&mut self, pid: Option<u32>, mut payload: EventPayload) -> u64 {
        match &mut payload {
            EventPayload::Stdout { text } | EventPayload::Stderr { text } => {
                if text.len() > MAX_EVENT_TEXT {
                    text.truncate(MAX_EVENT_TEXT);
                }
            }
            _ => {}
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.events.push_back(Event {
            seq,
            ts: chrono::Utc::now().timestamp_millis(),
            pid,
            payload,
        });
        seq
    }

    /// Highest sequence emitted so far (0 when none).
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Lowest sequence still retained; anything at or below is evicted.
    pub fn floor(&self) -> u64 {
        self.floor
    }

    pub fn is_evicted(&self, seq: u64) -> bool {
        seq < self.floor
    }

    /// Events with `seq > cursor`, oldest first.
    pub fn since(&self, cursor: u64) -> Vec<Event> {
        self.events
            .iter()
            .filter(|e| e.seq > cursor)
            .cloned()
            .collect()
    }

    /// Drop events all live subscribers have passed or whose retention
    /// expired. `min_live_cursor` is `None` when there are no subscribers.
    pub fn evict(&mut self, min_live_cursor: Option<u64>, now_ms: i64) {
        let deadline = now_ms - self.retention_ms;
        while let Some(front) = self.events.front() {
            let passed = min_live_cursor.map_or(true, |c| front.seq <= c);
            let expired = front.ts <= deadline;
            if passed || expired {
                self.floor = self.floor.max(front.seq);
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_monotonic() {
        let mut log = EventLog::default();
        let a = log.emit(None, EventPayload::Stdout { text: "a".into() });
        let b = log.emit(Some(1), EventPayload::Stdout { text: "b".into() });
        assert!(b > a);
        assert_eq!(log.since(a).len(), 1);
        assert_eq!(log.since(0).len(), 2);
    }

    #[test]
    fn test_evict_below_cursor() {
        let mut log = EventLog::default();
        for i in 0..5 {
            log.emit(None, EventPayload::Stdout { text: format!("{i}") });
        }
        let now = chrono::Utc::now().timestamp_millis();
        log.evict(Some(3), now);
        assert_eq!(log.len(), 2);
        assert!(log.is_evicted(2));
        assert!(!log.is_evicted(4));
    }

    #[test]
    fn test_wire_shape() {
        let mut log = EventLog::default();
        log.emit(Some(7), EventPayload::DebugBreak { pc: 16, reason: "BRK".into(), breakpoint_id: None });
        let json = serde_json::to_value(&log.since(0)[0]).unwrap();
        assert_eq!(json["type"], "debug_break");
        assert_eq!(json["pid"], 7);
        assert_eq!(json["data"]["pc"], 16);
    }

    #[test]
    fn test_stdout_truncated_at_cap() {
        let mut log = EventLog::default();
        log.emit(None, EventPayload::Stdout { text: "x".repeat(MAX_EVENT_TEXT + 10) });
        match &log.since(0)[0].payload {
            EventPayload::Stdout { text } => assert_eq!(text.len(), MAX_EVENT_TEXT),
            _ => unreachable!(),
        }
    }
}
