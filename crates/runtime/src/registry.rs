//! Value/command registry
//!
//! `(group, value)` addressable half-precision parameters and zero-argument
//! commands, with per-owner isolation, change-epsilon filtering, and
//! mailbox-backed subscriptions. Entries are fixed-size per profile; string
//! metadata lives in a deduplicated pool referenced by 16-bit offsets.

use crate::events::{EventLog, EventPayload};
use crate::profile::Profile;
use half::f16;

/// Status codes returned in R0 (and mapped to JSON errors by the daemon).
pub mod status {
    pub const OK: i32 = 0;
    pub const ENOENT: i32 = -2;
    pub const EPERM: i32 = -13;
    pub const EEXIST: i32 = -17;
    pub const ENOSPC: i32 = -28;
}

/// Value flag bits.
pub const VALUE_READONLY: u8 = 0x01;
/// Command flag bits.
pub const CMD_PIN: u8 = 0x01;
pub const CMD_ASYNC: u8 = 0x02;

/// Notifications are rate limited per value to this interval.
pub const NOTIFY_MIN_INTERVAL_MS: i64 = 10;

/// Occupancy warning thresholds (fire at high, clear at low).
const OCCUPANCY_HIGH: f32 = 0.8;
const OCCUPANCY_LOW: f32 = 0.7;

/// Typed mix-in descriptors chained off a value entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Mixin {
    Name(u16),
    Unit(u16),
    Range { min: u16, max: u16, epsilon: u16 },
    Persist { key: u16, mode: u8 },
    Group(u16),
}

#[derive(Debug, Clone)]
struct MixinNode {
    mixin: Mixin,
    next: Option<u16>,
}

/// Packed value entry plus its descriptor chain head.
#[derive(Debug, Clone)]
pub struct ValueEntry {
    pub group: u8,
    pub value_id: u8,
    pub flags: u8,
    pub auth_level: u8,
    pub owner_pid: u32,
    pub last_half: u16,
    head: Option<u16>,
    last_notify_ms: i64,
}

impl ValueEntry {
    pub fn oid(&self) -> u16 {
        ((self.group as u16) << 8) | self.value_id as u16
    }
}

/// Command entry: handler reference into the owning task's code.
#[derive(Debug, Clone)]
pub struct CommandEntry {
    pub group: u8,
    pub cmd_id: u8,
    pub flags: u8,
    pub auth_level: u8,
    pub owner_pid: u32,
    pub handler_off: u32,
    pub name_off: Option<u16>,
    pub help_off: Option<u16>,
}

impl CommandEntry {
    pub fn oid(&self) -> u16 {
        ((self.group as u16) << 8) | self.cmd_id as u16
    }
}

/// Optional descriptor data supplied at registration.
#[derive(Debug, Clone, Default)]
pub struct ValueDesc {
    pub name: Option<String>,
    pub unit: Option<String>,
    pub epsilon_half: u16,
    pub min_half: u16,
    pub max_half: u16,
    pub persist_key: Option<u16>,
}

/// A framed notification to post to a subscriber mailbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    pub target: String,
    pub subscriber_pid: u32,
    pub frame: Vec<u8>,
}

/// Frame type for value-change notifications.
pub const NOTIFY_VALUE_CHANGED: u8 = 0x01;
/// Frame type for async command completions.
pub const NOTIFY_CMD_DONE: u8 = 0x02;

pub fn value_changed_frame(oid: u16, half: u16) -> Vec<u8> {
    let mut f = vec![NOTIFY_VALUE_CHANGED, 0];
    f.extend_from_slice(&oid.to_le_bytes());
    f.extend_from_slice(&half.to_le_bytes());
    f
}

pub fn cmd_done_frame(oid: u16, rc: i32) -> Vec<u8> {
    let mut f = vec![NOTIFY_CMD_DONE, 0];
    f.extend_from_slice(&oid.to_le_bytes());
    f.extend_from_slice(&rc.to_le_bytes());
    f
}

struct Subscription {
    oid: u16,
    target: String,
    subscriber_pid: u32,
}

pub struct Registry {
    profile: Profile,
    values: Vec<ValueEntry>,
    commands: Vec<CommandEntry>,
    chains: Vec<MixinNode>,
    pool: Vec<u8>,
    subs: Vec<Subscription>,
    values_warned: bool,
    commands_warned: bool,
}

impl Registry {
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            values: Vec::new(),
            commands: Vec::new(),
            chains: Vec::new(),
            pool: Vec::new(),
            subs: Vec::new(),
            values_warned: false,
            commands_warned: false,
        }
    }

    /// Deduplicating string intern; `None` when the pool cap is reached.
    fn intern(&mut self, s: &str) -> Option<u16> {
        let bytes = s.as_bytes();
        let mut at = 0usize;
        while at < self.pool.len() {
            let end = self.pool[at..].iter().position(|&b| b == 0).map(|p| at + p)?;
            if &self.pool[at..end] == bytes {
                return Some(at as u16);
            }
            at = end + 1;
        }
        if self.pool.len() + bytes.len() + 1 > self.profile.max_registry_strings {
            return None;
        }
        let off = self.pool.len() as u16;
        self.pool.extend_from_slice(bytes);
        self.pool.push(0);
        Some(off)
    }

    pub fn pool_str(&self, off: u16) -> Option<&str> {
        let start = off as usize;
        if start >= self.pool.len() {
            return None;
        }
        let end = self.pool[start..].iter().position(|&b| b == 0)? + start;
        std::str::from_utf8(&self.pool[start..end]).ok()
    }

    fn push_mixin(&mut self, head: &mut Option<u16>, mixin: Mixin) {
        let idx = self.chains.len() as u16;
        self.chains.push(MixinNode { mixin, next: *head });
        *head = Some(idx);
    }

    /// Register a value; returns `(status, oid)`.
    pub fn register_value(
        &mut self,
        owner_pid: u32,
        group: u8,
        value_id: u8,
        flags: u8,
        auth_level: u8,
        init_half: u16,
        desc: ValueDesc,
        log: &mut EventLog,
    ) -> (i32, u16) {
        let oid = ((group as u16) << 8) | value_id as u16;
        if self.values.iter().any(|v| v.oid() == oid) {
            return (status::EEXIST, oid);
        }
        if self.values.len() >= self.profile.max_values {
            return (status::ENOSPC, 0);
        }
        let mut head = None;
        if let Some(name) = &desc.name {
            match self.intern(name) {
                Some(off) => self.push_mixin(&mut head, Mixin::Name(off)),
                None => return (status::ENOSPC, 0),
            }
        }
        if let Some(unit) = &desc.unit {
            match self.intern(unit) {
                Some(off) => self.push_mixin(&mut head, Mixin::Unit(off)),
                None => return (status::ENOSPC, 0),
            }
        }
        if desc.epsilon_half != 0 || desc.min_half != 0 || desc.max_half != 0 {
            self.push_mixin(&mut head, Mixin::Range {
                min: desc.min_half,
                max: desc.max_half,
                epsilon: desc.epsilon_half,
            });
        }
        if let Some(key) = desc.persist_key {
            self.push_mixin(&mut head, Mixin::Persist { key, mode: 1 });
        }
        self.values.push(ValueEntry {
            group,
            value_id,
            flags,
            auth_level,
            owner_pid,
            last_half: init_half,
            head,
            last_notify_ms: 0,
        });
        self.check_occupancy(log);
        (status::OK, oid)
    }

    pub fn lookup_value(&self, group: u8, value_id: u8) -> Option<u16> {
        let oid = ((group as u16) << 8) | value_id as u16;
        self.values.iter().find(|v| v.oid() == oid).map(|v| v.oid())
    }

    pub fn value(&self, oid: u16) -> Option<&ValueEntry> {
        self.values.iter().find(|v| v.oid() == oid)
    }

    /// Walk a value's mix-in chain.
    pub fn mixins(&self, oid: u16) -> Vec<Mixin> {
        let mut out = Vec::new();
        let Some(entry) = self.value(oid) else { return out };
        let mut cursor = entry.head;
        while let Some(idx) = cursor {
            let node = &self.chains[idx as usize];
            out.push(node.mixin.clone());
            cursor = node.next;
        }
        out
    }

    fn epsilon_of(&self, oid: u16) -> f32 {
        self.mixins(oid)
            .iter()
            .find_map(|m| match m {
                Mixin::Range { epsilon, .. } if *epsilon != 0 => {
                    Some(f16::from_bits(*epsilon).to_f32())
                }
                _ => None,
            })
            .unwrap_or(0.0)
    }

    /// Persist key when the value carries a Persist mix-in with mode != 0.
    pub fn persist_key_of(&self, oid: u16) -> Option<u16> {
        self.mixins(oid).iter().find_map(|m| match m {
            Mixin::Persist { key, mode } if *mode != 0 => Some(*key),
            _ => None,
        })
    }

    fn authorized(entry_auth: u8, entry_owner: u32, caller: u32, caller_auth: u8) -> bool {
        caller == entry_owner || caller_auth >= entry_auth
    }

    /// `(status, half)`.
    pub fn get(&self, caller: u32, caller_auth: u8, oid: u16) -> (i32, u16) {
        match self.value(oid) {
            None => (status::ENOENT, 0),
            Some(v) if !Self::authorized(v.auth_level, v.owner_pid, caller, caller_auth) => {
                (status::EPERM, 0)
            }
            Some(v) => (status::OK, v.last_half),
        }
    }

    /// Apply a set: epsilon filter, rate limit, notification fan-out.
    ///
    /// Returns the status plus the framed notifications the executive must
    /// post to subscriber mailboxes.
    pub fn set(
        &mut self,
        caller: u32,
        caller_auth: u8,
        oid: u16,
        new_half: u16,
        now_ms: i64,
        log: &mut EventLog,
    ) -> (i32, Vec<Notify>) {
        let epsilon = self.epsilon_of(oid);
        let Some(entry) = self.values.iter_mut().find(|v| v.oid() == oid) else {
            return (status::ENOENT, Vec::new());
        };
        if !Self::authorized(entry.auth_level, entry.owner_pid, caller, caller_auth) {
            return (status::EPERM, Vec::new());
        }
        if entry.flags & VALUE_READONLY != 0 && caller != entry.owner_pid {
            return (status::EPERM, Vec::new());
        }
        let old = f16::from_bits(entry.last_half).to_f32();
        let new = f16::from_bits(new_half).to_f32();
        if epsilon > 0.0 && (new - old).abs() < epsilon {
            // Below the change threshold: no write, no notifications.
            return (status::OK, Vec::new());
        }
        entry.last_half = new_half;
        let rate_limited = now_ms - entry.last_notify_ms < NOTIFY_MIN_INTERVAL_MS
            && entry.last_notify_ms != 0;
        if !rate_limited {
            entry.last_notify_ms = now_ms;
        }
        let owner = entry.owner_pid;
        log.emit(Some(owner), EventPayload::ValueChanged { oid, old, new });
        if rate_limited {
            return (status::OK, Vec::new());
        }
        let frame = value_changed_frame(oid, new_half);
        let notifies = self
            .subs
            .iter()
            .filter(|s| s.oid == oid)
            .map(|s| Notify {
                target: s.target.clone(),
                subscriber_pid: s.subscriber_pid,
                frame: frame.clone(),
            })
            .collect();
        (status::OK, notifies)
    }

    /// `(oid, last_half)` pairs, optionally filtered by group.
    pub fn list_values(&self, group_filter: Option<u8>) -> Vec<(u16, u16)> {
        self.values
            .iter()
            .filter(|v| group_filter.map_or(true, |g| v.group == g))
            .map(|v| (v.oid(), v.last_half))
            .collect()
    }

    /// Subscribe a mailbox target to change notifications.
    pub fn subscribe(&mut self, subscriber_pid: u32, oid: u16, target: &str) -> i32 {
        if self.value(oid).is_none() {
            return status::ENOENT;
        }
        let exists = self
            .subs
            .iter()
            .any(|s| s.oid == oid && s.target == target && s.subscriber_pid == subscriber_pid);
        if !exists {
            self.subs.push(Subscription {
                oid,
                target: target.to_string(),
                subscriber_pid,
            });
        }
        status::OK
    }

    /// Drop a subscriber whose mailbox is gone.
    pub fn prune_subscription(&mut self, target: &str) {
        self.subs.retain(|s| s.target != target);
    }

    /// Toggle persistence for a value.
    pub fn set_persist(&mut self, caller: u32, oid: u16, mode: u8) -> i32 {
        let Some(entry) = self.values.iter().find(|v| v.oid() == oid) else {
            return status::ENOENT;
        };
        if entry.owner_pid != caller {
            return status::EPERM;
        }
        let head = entry.head;
        let mut cursor = head;
        while let Some(idx) = cursor {
            let node = &mut self.chains[idx as usize];
            if let Mixin::Persist { mode: m, .. } = &mut node.mixin {
                *m = mode;
                return status::OK;
            }
            cursor = node.next;
        }
        // No Persist mix-in yet: add one keyed by the OID.
        let mut new_head = head;
        self.push_mixin(&mut new_head, Mixin::Persist { key: oid, mode });
        if let Some(entry) = self.values.iter_mut().find(|v| v.oid() == oid) {
            entry.head = new_head;
        }
        status::OK
    }

    /// Register a command; returns `(status, oid)`.
    pub fn register_command(
        &mut self,
        owner_pid: u32,
        group: u8,
        cmd_id: u8,
        flags: u8,
        auth_level: u8,
        handler_off: u32,
        name: Option<&str>,
        help: Option<&str>,
        log: &mut EventLog,
    ) -> (i32, u16) {
        let oid = ((group as u16) << 8) | cmd_id as u16;
        if self.commands.iter().any(|c| c.oid() == oid) {
            return (status::EEXIST, oid);
        }
        if self.commands.len() >= self.profile.max_commands {
            return (status::ENOSPC, 0);
        }
        let name_off = match name {
            Some(n) => match self.intern(n) {
                Some(off) => Some(off),
                None => return (status::ENOSPC, 0),
            },
            None => None,
        };
        let help_off = match help {
            Some(h) => match self.intern(h) {
                Some(off) => Some(off),
                None => return (status::ENOSPC, 0),
            },
            None => None,
        };
        self.commands.push(CommandEntry {
            group,
            cmd_id,
            flags,
            auth_level,
            owner_pid,
            handler_off,
            name_off,
            help_off,
        });
        self.check_occupancy(log);
        (status::OK, oid)
    }

    pub fn lookup_command(&self, group: u8, cmd_id: u8) -> Option<u16> {
        let oid = ((group as u16) << 8) | cmd_id as u16;
        self.commands.iter().find(|c| c.oid() == oid).map(|c| c.oid())
    }

    pub fn command(&self, oid: u16) -> Option<&CommandEntry> {
        self.commands.iter().find(|c| c.oid() == oid)
    }

    pub fn command_help(&self, oid: u16) -> Option<&str> {
        self.command(oid)
            .and_then(|c| c.help_off)
            .and_then(|off| self.pool_str(off))
    }

    /// Free everything owned by a terminating task.
    pub fn purge_pid(&mut self, pid: u32, log: &mut EventLog) {
        self.values.retain(|v| v.owner_pid != pid);
        self.commands.retain(|c| c.owner_pid != pid);
        self.subs.retain(|s| s.subscriber_pid != pid);
        self.check_occupancy(log);
    }

    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    fn check_occupancy(&mut self, log: &mut EventLog) {
        let vo = self.values.len() as f32 / self.profile.max_values as f32;
        if vo >= OCCUPANCY_HIGH && !self.values_warned {
            self.values_warned = true;
            log.emit(None, EventPayload::Warning {
                message: format!("value registry at {:.0}% occupancy", vo * 100.0),
                category: "registry".into(),
                reason: None,
                pending: None,
                high_water: None,
                drops: None,
            });
        } else if vo <= OCCUPANCY_LOW {
            self.values_warned = false;
        }
        let co = self.commands.len() as f32 / self.profile.max_commands as f32;
        if co >= OCCUPANCY_HIGH && !self.commands_warned {
            self.commands_warned = true;
            log.emit(None, EventPayload::Warning {
                message: format!("command registry at {:.0}% occupancy", co * 100.0),
                category: "registry".into(),
                reason: None,
                pending: None,
                high_water: None,
                drops: None,
            });
        } else if co <= OCCUPANCY_LOW {
            self.commands_warned = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg() -> (Registry, EventLog) {
        (Registry::new(Profile::desktop()), EventLog::default())
    }

    fn half(v: f32) -> u16 {
        f16::from_f32(v).to_bits()
    }

    #[test]
    fn test_register_and_roundtrip() {
        let (mut r, mut log) = reg();
        let (st, oid) = r.register_value(1, 1, 3, 0, 0, half(0.0), ValueDesc::default(), &mut log);
        assert_eq!(st, status::OK);
        assert_eq!(oid, 0x0103);
        let (st, _) = r.set(1, 0, oid, half(2.5), 1000, &mut log);
        assert_eq!(st, status::OK);
        assert_eq!(r.get(1, 0, oid), (status::OK, half(2.5)));
    }

    #[test]
    fn test_duplicate_oid_rejected() {
        let (mut r, mut log) = reg();
        r.register_value(1, 1, 1, 0, 0, 0, ValueDesc::default(), &mut log);
        let (st, _) = r.register_value(1, 1, 1, 0, 0, 0, ValueDesc::default(), &mut log);
        assert_eq!(st, status::EEXIST);
    }

    #[test]
    fn test_epsilon_filter_skips_write_and_events() {
        let (mut r, mut log) = reg();
        let desc = ValueDesc { epsilon_half: half(0.1), ..Default::default() };
        let (_, oid) = r.register_value(1, 1, 3, 0, 0, half(0.0), desc, &mut log);

        let (st, n) = r.set(1, 0, oid, half(0.05), 1000, &mut log);
        assert_eq!(st, status::OK);
        assert!(n.is_empty());
        assert_eq!(r.get(1, 0, oid).1, half(0.0), "below epsilon keeps old value");
        let changed = log
            .since(0)
            .iter()
            .filter(|e| matches!(e.payload, EventPayload::ValueChanged { .. }))
            .count();
        assert_eq!(changed, 0);

        let (st, _) = r.set(1, 0, oid, half(0.2), 2000, &mut log);
        assert_eq!(st, status::OK);
        assert_eq!(r.get(1, 0, oid).1, half(0.2));
        let changed = log
            .since(0)
            .iter()
            .filter(|e| matches!(e.payload, EventPayload::ValueChanged { .. }))
            .count();
        assert_eq!(changed, 1);
    }

    #[test]
    fn test_auth_isolation() {
        let (mut r, mut log) = reg();
        let (_, oid) = r.register_value(1, 2, 1, 0, 3, half(1.0), ValueDesc::default(), &mut log);
        // Owner always passes.
        assert_eq!(r.get(1, 0, oid).0, status::OK);
        // Foreign task below the auth level is refused.
        assert_eq!(r.get(2, 0, oid).0, status::EPERM);
        assert_eq!(r.set(2, 2, oid, half(5.0), 0, &mut log).0, status::EPERM);
        // Foreign task at the auth level passes.
        assert_eq!(r.get(2, 3, oid).0, status::OK);
    }

    #[test]
    fn test_readonly_rejects_foreign_set() {
        let (mut r, mut log) = reg();
        let (_, oid) =
            r.register_value(1, 2, 2, VALUE_READONLY, 0, half(1.0), ValueDesc::default(), &mut log);
        assert_eq!(r.set(2, 0, oid, half(2.0), 0, &mut log).0, status::EPERM);
        assert_eq!(r.set(1, 0, oid, half(2.0), 0, &mut log).0, status::OK);
    }

    #[test]
    fn test_subscription_notifications() {
        let (mut r, mut log) = reg();
        let (_, oid) = r.register_value(1, 1, 1, 0, 0, half(0.0), ValueDesc::default(), &mut log);
        assert_eq!(r.subscribe(2, oid, "pid:2"), status::OK);
        let (_, notifies) = r.set(1, 0, oid, half(3.0), 1000, &mut log);
        assert_eq!(notifies.len(), 1);
        assert_eq!(notifies[0].target, "pid:2");
        assert_eq!(notifies[0].frame[0], NOTIFY_VALUE_CHANGED);
        let oid_read = u16::from_le_bytes([notifies[0].frame[2], notifies[0].frame[3]]);
        assert_eq!(oid_read, oid);
    }

    #[test]
    fn test_rate_limit_suppresses_notifications() {
        let (mut r, mut log) = reg();
        let (_, oid) = r.register_value(1, 1, 1, 0, 0, half(0.0), ValueDesc::default(), &mut log);
        r.subscribe(2, oid, "pid:2");
        let (_, n1) = r.set(1, 0, oid, half(1.0), 1000, &mut log);
        assert_eq!(n1.len(), 1);
        // 2ms later: value updates, notification suppressed.
        let (_, n2) = r.set(1, 0, oid, half(2.0), 1002, &mut log);
        assert!(n2.is_empty());
        assert_eq!(r.get(1, 0, oid).1, half(2.0));
        let (_, n3) = r.set(1, 0, oid, half(3.0), 1020, &mut log);
        assert_eq!(n3.len(), 1);
    }

    #[test]
    fn test_capacity_embedded() {
        let mut r = Registry::new(Profile::embedded());
        let mut log = EventLog::default();
        for i in 0..64u16 {
            let (st, _) = r.register_value(
                1,
                (i >> 8) as u8 + 1,
                (i & 0xFF) as u8,
                0,
                0,
                0,
                ValueDesc::default(),
                &mut log,
            );
            assert_eq!(st, status::OK, "entry {i}");
        }
        let (st, _) = r.register_value(1, 9, 9, 0, 0, 0, ValueDesc::default(), &mut log);
        assert_eq!(st, status::ENOSPC);
        // 80% threshold crossed along the way.
        assert!(log
            .since(0)
            .iter()
            .any(|e| matches!(e.payload, EventPayload::Warning { .. })));
    }

    #[test]
    fn test_command_register_call_metadata() {
        let (mut r, mut log) = reg();
        let (st, oid) = r.register_command(
            1,
            4,
            1,
            CMD_ASYNC,
            0,
            0x0040,
            Some("reset"),
            Some("reset the widget"),
            &mut log,
        );
        assert_eq!(st, status::OK);
        let cmd = r.command(oid).unwrap();
        assert_eq!(cmd.handler_off, 0x0040);
        assert_eq!(r.command_help(oid), Some("reset the widget"));
        assert_eq!(r.lookup_command(4, 1), Some(oid));
    }

    #[test]
    fn test_purge_pid_frees_entries_and_subs() {
        let (mut r, mut log) = reg();
        let (_, oid) = r.register_value(1, 1, 1, 0, 0, 0, ValueDesc::default(), &mut log);
        r.register_command(1, 4, 1, 0, 0, 0, None, None, &mut log);
        r.subscribe(1, oid, "pid:1");
        r.purge_pid(1, &mut log);
        assert_eq!(r.value_count(), 0);
        assert_eq!(r.command_count(), 0);
        let (_, oid2) = r.register_value(2, 1, 1, 0, 0, 0, ValueDesc::default(), &mut log);
        let (_, n) = r.set(2, 0, oid2, half(1.0), 0, &mut log);
        assert!(n.is_empty(), "stale subscription was pruned");
    }

    #[test]
    fn test_string_pool_dedup() {
        let (mut r, _) = reg();
        let a = r.intern("degC").unwrap();
        let b = r.intern("degC").unwrap();
        assert_eq!(a, b);
        assert_eq!(r.pool_str(a), Some("degC"));
    }
}
