//! Task lifecycle and clock handlers

use super::{authorize, hex_decode, resolve_pid, ApiResult};
use crate::state::Daemon;
use hsx_runtime::exec::{ClockMode, RUNTIME_VERSION};
use serde_json::json;
use std::path::PathBuf;
use tracing::info;

pub async fn info(daemon: &Daemon, pid: Option<u32>) -> ApiResult {
    let exec = daemon.exec.lock().await;
    if let Some(pid) = pid {
        let t = exec.task_info(pid).map_err(|e| e.wire_code())?;
        return Ok(json!({ "task": t }));
    }
    let sessions = daemon.sessions.lock().await;
    Ok(json!({
        "runtime_version": RUNTIME_VERSION,
        "tasks": exec.ps().len(),
        "sessions": sessions.len(),
        "clock": clock_view(&exec),
        "last_seq": exec.events.last_seq(),
        "uptime_ms": exec.now_ms(),
    }))
}

pub async fn attach(daemon: &Daemon) -> ApiResult {
    let exec = daemon.exec.lock().await;
    Ok(json!({
        "attached": true,
        "runtime_version": RUNTIME_VERSION,
        "pids": exec.pids(),
    }))
}

pub async fn load(daemon: &Daemon, path: String, session: Option<String>) -> ApiResult {
    let loaded = {
        let mut exec = daemon.exec.lock().await;
        exec.load_path(&PathBuf::from(&path)).map_err(|e| e.wire_code())?
    };
    // A session that loads a task owns it from the start.
    if let Some(sid) = session.as_deref() {
        let mut sessions = daemon.sessions.lock().await;
        let _ = sessions.authorize(Some(sid), Some(loaded.pid));
    }
    info!(pid = loaded.pid, app = %loaded.app_name, %path, "loaded");
    Ok(json!({
        "image": {
            "pid": loaded.pid,
            "app_name": loaded.app_name,
            "values": loaded.meta.values,
            "commands": loaded.meta.commands,
            "mailboxes": loaded.meta.mailboxes,
        }
    }))
}

pub async fn ps(daemon: &Daemon) -> ApiResult {
    let exec = daemon.exec.lock().await;
    Ok(json!({ "tasks": exec.ps() }))
}

fn clock_view(exec: &hsx_runtime::exec::Executive) -> serde_json::Value {
    json!({
        "mode": exec.clock_effective_mode().name(),
        "rate": exec.clock.rate_hz,
        "throttle_reason": exec.clock.throttle_reason,
        "last_wait_s": exec.clock.last_wait_s,
    })
}

pub async fn clock(
    daemon: &Daemon,
    op: String,
    steps: Option<u64>,
    pid: Option<u32>,
    rate: Option<f64>,
    session: Option<String>,
) -> ApiResult {
    if pid.is_some() {
        authorize(daemon, session.as_deref(), pid).await?;
    }
    let mut exec = daemon.exec.lock().await;
    match op.as_str() {
        "start" => {
            let mode = if exec.clock.rate_hz > 0.0 { ClockMode::Rate } else { ClockMode::Active };
            exec.clock_set(mode, rate);
        }
        "stop" => exec.clock_set(ClockMode::Stopped, None),
        "rate" => {
            let r = rate.unwrap_or(0.0);
            let mode = if r > 0.0 { ClockMode::Rate } else { ClockMode::Active };
            exec.clock_set(mode, Some(r));
        }
        "step" => {
            let n = steps.unwrap_or(1);
            if let Some(p) = pid {
                resolve_pid(&exec, Some(p))?;
            }
            let report = exec.step_n(n, pid, "manual");
            daemon.events_notify.notify_waiters();
            return Ok(json!({
                "executed": report.executed,
                "stopped": report.stopped,
                "clock": clock_view(&exec),
            }));
        }
        other => return Err(format!("unknown_clock_op:{other}")),
    }
    daemon.events_notify.notify_waiters();
    Ok(json!({ "clock": clock_view(&exec) }))
}

pub async fn pause(daemon: &Daemon, pid: Option<u32>, session: Option<String>) -> ApiResult {
    authorize(daemon, session.as_deref(), pid).await?;
    let mut exec = daemon.exec.lock().await;
    let targets = match pid {
        Some(p) => vec![p],
        None => exec.pids(),
    };
    for p in &targets {
        exec.pause(*p, "user_pause").map_err(|e| e.wire_code())?;
    }
    daemon.events_notify.notify_waiters();
    Ok(json!({ "paused": targets }))
}

pub async fn resume(daemon: &Daemon, pid: Option<u32>, session: Option<String>) -> ApiResult {
    authorize(daemon, session.as_deref(), pid).await?;
    let mut exec = daemon.exec.lock().await;
    let targets = match pid {
        Some(p) => vec![p],
        None => exec.pids(),
    };
    for p in &targets {
        exec.resume(*p).map_err(|e| e.wire_code())?;
    }
    daemon.events_notify.notify_waiters();
    Ok(json!({ "resumed": targets }))
}

pub async fn kill(daemon: &Daemon, pid: u32, session: Option<String>) -> ApiResult {
    authorize(daemon, session.as_deref(), Some(pid)).await?;
    let mut exec = daemon.exec.lock().await;
    exec.kill(pid).map_err(|e| e.wire_code())?;
    daemon.events_notify.notify_waiters();
    Ok(json!({ "killed": pid }))
}

pub async fn sched(
    daemon: &Daemon,
    pid: u32,
    priority: Option<u8>,
    quantum: Option<u32>,
    session: Option<String>,
) -> ApiResult {
    authorize(daemon, session.as_deref(), Some(pid)).await?;
    let mut exec = daemon.exec.lock().await;
    exec.sched_set(pid, priority, quantum).map_err(|e| e.wire_code())?;
    let t = exec.task_info(pid).map_err(|e| e.wire_code())?;
    Ok(json!({ "task": t }))
}

pub async fn restart(daemon: &Daemon, targets: Vec<u32>, session: Option<String>) -> ApiResult {
    for pid in &targets {
        authorize(daemon, session.as_deref(), Some(*pid)).await?;
    }
    let mut exec = daemon.exec.lock().await;
    let infos = exec.restart(&targets).map_err(|e| e.wire_code())?;
    daemon.events_notify.notify_waiters();
    Ok(json!({
        "restarted": infos
            .iter()
            .map(|i| json!({ "pid": i.pid, "app_name": i.app_name }))
            .collect::<Vec<_>>()
    }))
}

pub async fn shutdown(daemon: &Daemon, session: Option<String>) -> ApiResult {
    authorize(daemon, session.as_deref(), None).await?;
    let mut exec = daemon.exec.lock().await;
    exec.shutdown();
    daemon.events_notify.notify_waiters();
    daemon.begin_shutdown();
    info!("shutdown requested over control plane");
    Ok(json!({ "shutdown": true }))
}

pub async fn send(
    daemon: &Daemon,
    target: String,
    data: Option<String>,
    text: Option<String>,
    channel: Option<u8>,
    pid: Option<u32>,
    session: Option<String>,
) -> ApiResult {
    authorize(daemon, session.as_deref(), pid).await?;
    let payload = match (data, text) {
        (Some(hex), _) => hex_decode(&hex)?,
        (None, Some(t)) => t.into_bytes(),
        (None, None) => return Err("missing_payload".into()),
    };
    let mut exec = daemon.exec.lock().await;
    let as_pid = pid.unwrap_or(0);
    let st = exec.post_message(as_pid, &target, &payload, channel.unwrap_or(0));
    daemon.events_notify.notify_waiters();
    if st < 0 {
        return Err(format!("mailbox_status:{st}"));
    }
    Ok(json!({ "sent": payload.len() }))
}

pub async fn mbx(daemon: &Daemon, op: String, id: Option<u32>) -> ApiResult {
    let exec = daemon.exec.lock().await;
    let view = |d: &hsx_runtime::mailbox::Descriptor| {
        json!({
            "id": d.id,
            "name": d.name,
            "owner_pid": d.owner_pid,
            "capacity": d.capacity,
            "mode": d.mode.bits(),
            "depth": d.depth(),
            "bytes_used": d.bytes_used(),
            "waiters": d.waiter_count(),
            "drops": d.drops,
            "tap_drops": d.tap_drops,
        })
    };
    match op.as_str() {
        "list" => Ok(json!({
            "mailboxes": exec.mailboxes.iter().map(view).collect::<Vec<_>>()
        })),
        "peek" => {
            let id = id.ok_or("missing_id")?;
            let d = exec.mailboxes.descriptor(id).ok_or("no_such_descriptor")?;
            Ok(json!({ "mailbox": view(d) }))
        }
        other => Err(format!("unknown_mbx_op:{other}")),
    }
}
