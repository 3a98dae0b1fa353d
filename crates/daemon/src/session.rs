//! Session registry
//!
//! Control-plane clients negotiate capabilities at `session.open`, refresh
//! with keepalives, and hold PID locks so at most one session steers a
//! task. Expiry releases locks atomically; a PID is lockable by exactly one
//! session at a time.

use crate::proto::Capabilities;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;

pub const MAX_SESSIONS: usize = 20;
pub const DEFAULT_HEARTBEAT_S: u64 = 30;
pub const HEARTBEAT_MIN_S: u64 = 5;
pub const HEARTBEAT_MAX_S: u64 = 120;
pub const DEFAULT_MAX_EVENTS: usize = 512;
pub const MAX_EVENTS_CAP: usize = 4096;

/// Features this daemon can switch on for a client.
pub const SUPPORTED_FEATURES: &[&str] = &["events", "stack", "trace", "disasm", "watch"];

/// Event categories accepted in `events.subscribe` filters.
pub const KNOWN_CATEGORIES: &[&str] = &[
    "trace_step",
    "debug_break",
    "task_state",
    "scheduler",
    "mailbox_send",
    "mailbox_recv",
    "mailbox_wait",
    "mailbox_wake",
    "mailbox_timeout",
    "mailbox_overrun",
    "mailbox_error",
    "mailbox_exhausted",
    "value_changed",
    "watch_update",
    "stdout",
    "stderr",
    "clock",
    "warning",
];

/// One event stream bound to a session.
pub struct Subscription {
    pub max_events: usize,
    /// Highest log seq this subscription has considered.
    pub cursor: u64,
    /// Seqs delivered but not yet acknowledged, oldest first.
    pub unacked: VecDeque<u64>,
    pub delivered: u64,
    pub acked_seq: u64,
    pub drops: u64,
    pub categories: Option<HashSet<String>>,
    pub warned_slow: bool,
    /// Outbound line queue of the owning connection.
    pub tx: UnboundedSender<String>,
}

impl Subscription {
    pub fn new(max_events: usize, cursor: u64, categories: Option<HashSet<String>>, tx: UnboundedSender<String>) -> Self {
        Self {
            max_events,
            cursor,
            unacked: VecDeque::new(),
            delivered: 0,
            acked_seq: 0,
            drops: 0,
            categories,
            warned_slow: false,
            tx,
        }
    }

    pub fn pending(&self) -> u64 {
        self.unacked.len() as u64
    }

    /// Advance the ACK cursor; acking past the highest delivered seq is an
    /// idempotent no-op beyond clamping.
    pub fn ack(&mut self, seq: u64) {
        self.acked_seq = self.acked_seq.max(seq);
        while self.unacked.front().is_some_and(|&s| s <= seq) {
            self.unacked.pop_front();
        }
        if self.pending() < self.max_events as u64 {
            self.warned_slow = false;
        }
    }

    pub fn wants(&self, category: &str) -> bool {
        self.categories
            .as_ref()
            .map_or(true, |set| set.contains(category))
    }

    /// The eviction floor this subscriber still needs.
    pub fn floor_needed(&self) -> u64 {
        self.unacked.front().copied().map(|s| s - 1).unwrap_or(self.cursor)
    }
}

pub struct Session {
    pub id: String,
    pub client: String,
    pub features: Vec<String>,
    pub heartbeat_s: u64,
    pub last_keepalive: Instant,
    pub locks: HashSet<u32>,
    pub subscription: Option<Subscription>,
}

/// Negotiated values echoed by `session.open`.
#[derive(Debug)]
pub struct OpenOutcome {
    pub id: String,
    pub heartbeat_s: u64,
    pub features: Vec<String>,
    pub pid_lock: Option<u32>,
    pub warnings: Vec<String>,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, Session>,
}

impl SessionRegistry {
    pub fn open(
        &mut self,
        client: Option<String>,
        caps: Option<Capabilities>,
        pid_lock: Option<u32>,
    ) -> Result<OpenOutcome, String> {
        if self.sessions.len() >= MAX_SESSIONS {
            return Err("too_many_sessions".into());
        }
        if let Some(pid) = pid_lock {
            if self.lock_owner(pid).is_some() {
                return Err(format!("pid_locked:{pid}"));
            }
        }
        let caps = caps.unwrap_or_default();
        let mut warnings = Vec::new();

        let mut features = Vec::new();
        for f in &caps.features {
            if SUPPORTED_FEATURES.contains(&f.as_str()) {
                features.push(f.clone());
            } else {
                warnings.push(format!("unsupported_feature:{f}"));
            }
        }

        let mut heartbeat_s = caps.heartbeat_s.unwrap_or(DEFAULT_HEARTBEAT_S);
        let clamped = heartbeat_s.clamp(HEARTBEAT_MIN_S, HEARTBEAT_MAX_S);
        if clamped != heartbeat_s {
            warnings.push("heartbeat_clamped".into());
            heartbeat_s = clamped;
        }
        if caps.max_events.is_some_and(|m| m > MAX_EVENTS_CAP) {
            warnings.push("max_events_clamped".into());
        }

        let id = uuid::Uuid::new_v4().to_string();
        let mut locks = HashSet::new();
        if let Some(pid) = pid_lock {
            locks.insert(pid);
        }
        self.sessions.insert(id.clone(), Session {
            id: id.clone(),
            client: client.unwrap_or_else(|| "anonymous".into()),
            features: features.clone(),
            heartbeat_s,
            last_keepalive: Instant::now(),
            locks,
            subscription: None,
        });
        Ok(OpenOutcome { id, heartbeat_s, features, pid_lock, warnings })
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    pub fn keepalive(&mut self, id: &str) -> Result<(), String> {
        match self.sessions.get_mut(id) {
            Some(s) => {
                s.last_keepalive = Instant::now();
                Ok(())
            }
            None => Err("session_required".into()),
        }
    }

    pub fn close(&mut self, id: &str) -> Option<Session> {
        self.sessions.remove(id)
    }

    pub fn lock_owner(&self, pid: u32) -> Option<&str> {
        self.sessions
            .values()
            .find(|s| s.locks.contains(&pid))
            .map(|s| s.id.as_str())
    }

    /// Gate a mutating RPC: a session is required, and the PID must be
    /// unlocked or locked by that session (acquiring it when unlocked).
    pub fn authorize(&mut self, session: Option<&str>, pid: Option<u32>) -> Result<(), String> {
        let sid = session.ok_or_else(|| "session_required".to_string())?;
        if !self.sessions.contains_key(sid) {
            return Err("session_required".into());
        }
        if let Some(pid) = pid {
            if let Some(owner) = self.lock_owner(pid) {
                if owner != sid {
                    return Err(format!("pid_locked:{pid}"));
                }
            } else if let Some(s) = self.sessions.get_mut(sid) {
                s.locks.insert(pid);
            }
        }
        self.keepalive(sid)
    }

    /// Expire sessions whose keepalive lapsed; their locks and
    /// subscriptions are released atomically.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let dead: Vec<String> = self
            .sessions
            .values()
            .filter(|s| now.duration_since(s.last_keepalive).as_secs() > s.heartbeat_s)
            .map(|s| s.id.clone())
            .collect();
        for id in &dead {
            self.sessions.remove(id);
        }
        dead
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Subscriptions across all sessions, for delivery sweeps.
    pub fn subscriptions_mut(&mut self) -> impl Iterator<Item = (&String, &mut Subscription)> {
        self.sessions
            .iter_mut()
            .filter_map(|(id, s)| s.subscription.as_mut().map(|sub| (id, sub)))
    }

    /// Smallest floor any live subscriber still needs, for log eviction.
    pub fn min_floor(&self) -> Option<u64> {
        self.sessions
            .values()
            .filter_map(|s| s.subscription.as_ref().map(|sub| sub.floor_needed()))
            .min()
    }
}
