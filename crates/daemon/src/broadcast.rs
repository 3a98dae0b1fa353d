//! Event broadcaster
//!
//! Fans the shared event log out to per-session subscriptions. Each
//! subscription holds a cursor into the log and a bound on in-flight
//! (delivered but unacknowledged) events; overflow drops events and
//! synthesises in-band `warning` events, and a consumer that stays too far
//! behind is torn down after a `slow_consumer_drop` notice. Events are
//! serialised under the executive lock but written to sockets by the
//! connection writer tasks, outside every lock.

use crate::session::Subscription;
use crate::state::Daemon;
use hsx_runtime::events::{Event, EventPayload};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Per-sweep outcome for one subscription.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub delivered: u64,
    pub dropped: u64,
    /// The connection is gone; tear the subscription down silently.
    pub disconnected: bool,
}

/// Push a batch of new events into one subscription, honouring its
/// in-flight bound. The cursor advances over every event seen, delivered
/// or not, so drops are permanent.
pub fn deliver_batch(sub: &mut Subscription, events: &[Event]) -> BatchStats {
    let mut stats = BatchStats::default();
    for event in events {
        if event.seq <= sub.cursor {
            continue;
        }
        sub.cursor = event.seq;
        if !sub.wants(event.payload.category()) {
            continue;
        }
        if sub.pending() >= sub.max_events as u64 {
            sub.drops += 1;
            stats.dropped += 1;
            continue;
        }
        let Ok(line) = serde_json::to_string(event) else { continue };
        if sub.tx.send(line).is_err() {
            stats.disconnected = true;
            break;
        }
        sub.unacked.push_back(event.seq);
        sub.delivered += 1;
        stats.delivered += 1;
    }
    stats
}

/// One delivery sweep: snapshot new events per subscription under the
/// executive lock, synthesise back-pressure warnings, tear down dead or
/// hopeless consumers, and advance the log's eviction floor.
pub async fn sweep(daemon: &Daemon) {
    let mut exec = daemon.exec.lock().await;
    let mut sessions = daemon.sessions.lock().await;

    let mut warn_slow: Vec<String> = Vec::new();
    let mut teardown: Vec<(String, bool)> = Vec::new();

    for (id, sub) in sessions.subscriptions_mut() {
        let events = exec.events.since(sub.cursor);
        if events.is_empty() {
            continue;
        }
        let stats = deliver_batch(sub, &events);
        if stats.disconnected {
            teardown.push((id.clone(), false));
            continue;
        }
        if stats.dropped > 0 && !sub.warned_slow {
            sub.warned_slow = true;
            warn_slow.push(id.clone());
        }
        if sub.drops > sub.max_events as u64 {
            teardown.push((id.clone(), true));
        }
    }

    // Warnings are synthesised into the same log, then pushed past the
    // in-flight bound so a stalled consumer still hears about itself.
    for id in warn_slow {
        let (pending, high_water, drops) = match sessions.get(&id).and_then(|s| s.subscription.as_ref()) {
            Some(sub) => (sub.pending(), sub.max_events as u64, sub.drops),
            None => continue,
        };
        let seq = exec.events.emit(None, EventPayload::Warning {
            message: format!("subscriber {id} falling behind"),
            category: "events".into(),
            reason: Some("slow_consumer".into()),
            pending: Some(pending),
            high_water: Some(high_water),
            drops: Some(drops),
        });
        force_deliver(&mut exec.events, &mut sessions, &id, seq);
    }

    for (id, notify) in teardown {
        if notify {
            let drops = sessions
                .get(&id)
                .and_then(|s| s.subscription.as_ref())
                .map(|sub| sub.drops)
                .unwrap_or(0);
            let seq = exec.events.emit(None, EventPayload::Warning {
                message: format!("subscriber {id} torn down"),
                category: "events".into(),
                reason: Some("slow_consumer_drop".into()),
                pending: None,
                high_water: None,
                drops: Some(drops),
            });
            force_deliver(&mut exec.events, &mut sessions, &id, seq);
        }
        if let Some(session) = sessions.get_mut(&id) {
            session.subscription = None;
            debug!(session = %id, "subscription torn down");
        }
    }

    let floor = sessions.min_floor();
    let now = chrono::Utc::now().timestamp_millis();
    exec.events.evict(floor, now);
}

/// Send one just-emitted event to a subscription regardless of its
/// in-flight bound, advancing its cursor past it.
fn force_deliver(
    log: &mut hsx_runtime::events::EventLog,
    sessions: &mut crate::session::SessionRegistry,
    id: &str,
    seq: u64,
) {
    let Some(event) = log.since(seq - 1).into_iter().find(|e| e.seq == seq) else { return };
    let Some(sub) = sessions.get_mut(id).and_then(|s| s.subscription.as_mut()) else { return };
    if let Ok(line) = serde_json::to_string(&event) {
        let _ = sub.tx.send(line);
    }
    sub.cursor = sub.cursor.max(seq);
}

/// Background broadcaster: sweep on every notification, with a coarse
/// fallback tick so retention eviction keeps moving while idle.
pub async fn run(daemon: Arc<Daemon>) {
    loop {
        tokio::select! {
            _ = daemon.events_notify.notified() => {}
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            _ = daemon.shutdown.notified() => return,
        }
        sweep(&daemon).await;
    }
}
