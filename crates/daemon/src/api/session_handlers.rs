//! Session and event-stream handlers

use super::{ApiResult, ConnHandle};
use crate::proto::Capabilities;
use crate::session::{Subscription, DEFAULT_MAX_EVENTS, KNOWN_CATEGORIES, MAX_EVENTS_CAP};
use crate::state::Daemon;
use serde_json::json;
use std::collections::HashSet;
use tracing::info;

pub async fn ping(daemon: &Daemon, session: Option<String>) -> ApiResult {
    if let Some(sid) = session.as_deref() {
        // A ping from a known session doubles as a keepalive.
        let _ = daemon.sessions.lock().await.keepalive(sid);
    }
    Ok(json!({ "pong": true, "ts": chrono::Utc::now().timestamp_millis() }))
}

pub async fn open(
    daemon: &Daemon,
    client: Option<String>,
    capabilities: Option<Capabilities>,
    pid_lock: Option<u32>,
    conn: &ConnHandle,
) -> ApiResult {
    let mut sessions = daemon.sessions.lock().await;
    let out = sessions.open(client.clone(), capabilities, pid_lock)?;
    conn.remember_session(&out.id);
    info!(session = %out.id, client = ?client, "session opened");
    Ok(json!({
        "id": out.id,
        "heartbeat_s": out.heartbeat_s,
        "features": out.features,
        "pid_lock": out.pid_lock,
        "warnings": out.warnings,
    }))
}

pub async fn keepalive(daemon: &Daemon, session: String) -> ApiResult {
    daemon.sessions.lock().await.keepalive(&session)?;
    Ok(json!({ "refreshed": true }))
}

pub async fn close(daemon: &Daemon, session: String) -> ApiResult {
    match daemon.sessions.lock().await.close(&session) {
        Some(s) => {
            info!(session = %session, locks = s.locks.len(), "session closed");
            Ok(json!({ "closed": true }))
        }
        None => Err("session_required".into()),
    }
}

pub async fn subscribe(
    daemon: &Daemon,
    session: String,
    max_events: Option<usize>,
    since_seq: Option<u64>,
    categories: Option<Vec<String>>,
    conn: &ConnHandle,
) -> ApiResult {
    let categories = match categories {
        Some(list) => {
            let mut set = HashSet::new();
            for c in list {
                if !KNOWN_CATEGORIES.contains(&c.as_str()) {
                    return Err(format!("unsupported_category:{c}"));
                }
                set.insert(c);
            }
            Some(set)
        }
        None => None,
    };

    let exec = daemon.exec.lock().await;
    let mut sessions = daemon.sessions.lock().await;
    if sessions.get(&session).is_none() {
        return Err("session_required".into());
    }

    let cursor = match since_seq {
        Some(seq) => {
            if exec.events.is_evicted(seq) && seq < exec.events.last_seq() {
                return Err("seq_evicted".into());
            }
            seq
        }
        None => exec.events.last_seq(),
    };

    let max = max_events.unwrap_or(DEFAULT_MAX_EVENTS).min(MAX_EVENTS_CAP).max(1);
    let s = sessions.get_mut(&session).ok_or("session_required")?;
    s.subscription = Some(Subscription::new(max, cursor, categories, conn.tx.clone()));
    drop(sessions);
    drop(exec);
    daemon.events_notify.notify_waiters();
    Ok(json!({
        "subscribed": true,
        "max_events": max,
        "since_seq": cursor,
    }))
}

pub async fn unsubscribe(daemon: &Daemon, session: String) -> ApiResult {
    let mut sessions = daemon.sessions.lock().await;
    match sessions.get_mut(&session) {
        Some(s) => {
            s.subscription = None;
            Ok(json!({ "unsubscribed": true }))
        }
        None => Err("session_required".into()),
    }
}

pub async fn ack(daemon: &Daemon, session: String, seq: u64) -> ApiResult {
    let mut sessions = daemon.sessions.lock().await;
    let s = sessions.get_mut(&session).ok_or("session_required")?;
    match s.subscription.as_mut() {
        Some(sub) => {
            sub.ack(seq);
            let pending = sub.pending();
            drop(sessions);
            daemon.events_notify.notify_waiters();
            Ok(json!({ "acked": seq, "pending": pending }))
        }
        None => Err("no_subscription".into()),
    }
}
