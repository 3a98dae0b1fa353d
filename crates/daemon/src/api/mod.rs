//! RPC dispatch
//!
//! Routes decoded requests to handlers. Mutating commands are gated by the
//! session registry (PID locks); every handler returns either a JSON object
//! merged into the `ok` response or a stable error string.

mod debug_handlers;
mod session_handlers;
mod task_handlers;

use crate::proto::Request;
use crate::state::Daemon;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Per-connection context: the outbound line queue and the sessions this
/// connection opened (released on disconnect).
pub struct ConnHandle {
    pub tx: UnboundedSender<String>,
    pub opened_sessions: std::sync::Mutex<Vec<String>>,
}

impl ConnHandle {
    pub fn new(tx: UnboundedSender<String>) -> Self {
        Self { tx, opened_sessions: std::sync::Mutex::new(Vec::new()) }
    }

    pub fn remember_session(&self, id: &str) {
        if let Ok(mut v) = self.opened_sessions.lock() {
            v.push(id.to_string());
        }
    }

    pub fn take_sessions(&self) -> Vec<String> {
        self.opened_sessions
            .lock()
            .map(|mut v| std::mem::take(&mut *v))
            .unwrap_or_default()
    }
}

/// Ok payload or stable wire error string.
pub type ApiResult = Result<Value, String>;

pub async fn dispatch(daemon: &Arc<Daemon>, req: Request, conn: &ConnHandle) -> ApiResult {
    use Request::*;
    match req {
        Ping { session } => session_handlers::ping(daemon, session).await,
        Info { pid } => task_handlers::info(daemon, pid).await,
        Attach {} => task_handlers::attach(daemon).await,
        Detach {} => Ok(serde_json::json!({ "detached": true })),
        Load { path, session } => task_handlers::load(daemon, path, session).await,
        Ps {} => task_handlers::ps(daemon).await,
        Clock { op, steps, pid, rate, session } => {
            task_handlers::clock(daemon, op, steps, pid, rate, session).await
        }
        Step { steps, pid, session } => {
            task_handlers::clock(daemon, "step".into(), steps, pid, None, session).await
        }
        Trace { pid, mode, op, entries, session } => {
            debug_handlers::trace(daemon, pid, mode, op, entries, session).await
        }
        Bp { op, pid, addr, session } => debug_handlers::bp(daemon, op, pid, addr, session).await,
        VmTraceLast { pid } => debug_handlers::vm_trace_last(daemon, pid).await,
        Disasm { pid, addr, count, mode } => {
            debug_handlers::disasm(daemon, pid, addr, count, mode).await
        }
        Sym { op, pid, path, name, addr, session } => {
            debug_handlers::sym(daemon, op, pid, path, name, addr, session).await
        }
        Symbols { pid, kind, offset, limit } => {
            debug_handlers::symbols(daemon, pid, kind, offset, limit).await
        }
        Stack { pid, max } => debug_handlers::stack(daemon, pid, max).await,
        Memory { pid, .. } => debug_handlers::memory(daemon, pid).await,
        Watch { op, pid, expr, id, length, session, .. } => {
            debug_handlers::watch(daemon, op, pid, expr, id, length, session).await
        }
        Pause { pid, session } => task_handlers::pause(daemon, pid, session).await,
        Resume { pid, session } => task_handlers::resume(daemon, pid, session).await,
        Kill { pid, session } => task_handlers::kill(daemon, pid, session).await,
        Dumpregs { pid } => debug_handlers::dumpregs(daemon, pid).await,
        VmRegGet { reg, pid } => debug_handlers::vm_reg_get(daemon, reg, pid).await,
        VmRegSet { reg, value, pid, session } => {
            debug_handlers::vm_reg_set(daemon, reg, value, pid, session).await
        }
        Peek { pid, addr, length } => debug_handlers::peek(daemon, pid, addr, length).await,
        Poke { pid, addr, data, session } => {
            debug_handlers::poke(daemon, pid, addr, data, session).await
        }
        Sched { pid, priority, quantum, session } => {
            task_handlers::sched(daemon, pid, priority, quantum, session).await
        }
        Restart { targets, session } => task_handlers::restart(daemon, targets, session).await,
        Shutdown { session } => task_handlers::shutdown(daemon, session).await,
        Send { target, data, text, channel, pid, session } => {
            task_handlers::send(daemon, target, data, text, channel, pid, session).await
        }
        Mbx { op, id } => task_handlers::mbx(daemon, op, id).await,
        SessionOpen { client, capabilities, pid_lock } => {
            session_handlers::open(daemon, client, capabilities, pid_lock, conn).await
        }
        SessionKeepalive { session } => session_handlers::keepalive(daemon, session).await,
        SessionClose { session } => session_handlers::close(daemon, session).await,
        EventsSubscribe { session, max_events, since_seq, categories } => {
            session_handlers::subscribe(daemon, session, max_events, since_seq, categories, conn)
                .await
        }
        EventsUnsubscribe { session } => session_handlers::unsubscribe(daemon, session).await,
        EventsAck { session, seq } => session_handlers::ack(daemon, session, seq).await,
    }
}

/// Default a missing `pid` to the only live task, when unambiguous.
pub(crate) fn resolve_pid(
    exec: &hsx_runtime::exec::Executive,
    pid: Option<u32>,
) -> Result<u32, String> {
    match pid {
        Some(p) => {
            if exec.has_task(p) {
                Ok(p)
            } else {
                Err(format!("no_such_pid:{p}"))
            }
        }
        None => {
            let pids = exec.pids();
            match pids.as_slice() {
                [only] => Ok(*only),
                _ => Err("pid_required".into()),
            }
        }
    }
}

/// Gate a mutating RPC behind the session registry.
pub(crate) async fn authorize(
    daemon: &Daemon,
    session: Option<&str>,
    pid: Option<u32>,
) -> Result<(), String> {
    daemon.sessions.lock().await.authorize(session, pid)
}

pub(crate) fn hex_decode(s: &str) -> Result<Vec<u8>, String> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err("bad_hex".into());
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| "bad_hex".to_string()))
        .collect()
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        assert_eq!(hex_decode("00ff10").unwrap(), vec![0, 255, 16]);
        assert_eq!(hex_encode(&[0, 255, 16]), "00ff10");
        assert!(hex_decode("0f0").is_err());
        assert!(hex_decode("zz").is_err());
    }
}
