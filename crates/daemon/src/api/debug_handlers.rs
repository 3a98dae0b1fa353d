//! Debugger surface handlers: breakpoints, watches, trace, memory, symbols

use super::{authorize, hex_decode, hex_encode, resolve_pid, ApiResult};
use crate::state::Daemon;
use hsx_runtime::exec::task::{TraceConfig, TraceEntry};
use serde_json::json;
use std::path::PathBuf;

pub async fn bp(
    daemon: &Daemon,
    op: String,
    pid: u32,
    addr: Option<u32>,
    session: Option<String>,
) -> ApiResult {
    if op != "list" {
        authorize(daemon, session.as_deref(), Some(pid)).await?;
    }
    let mut exec = daemon.exec.lock().await;
    match op.as_str() {
        "set" => {
            let addr = addr.ok_or("missing_addr")?;
            exec.bp_set(pid, addr).map_err(|e| e.wire_code())?;
        }
        "clear" => {
            let addr = addr.ok_or("missing_addr")?;
            exec.bp_clear(pid, addr).map_err(|e| e.wire_code())?;
        }
        "list" => {}
        other => return Err(format!("unknown_bp_op:{other}")),
    }
    let list = exec.bp_list(pid).map_err(|e| e.wire_code())?;
    Ok(json!({ "breakpoints": list }))
}

pub async fn watch(
    daemon: &Daemon,
    op: String,
    pid: u32,
    expr: Option<String>,
    id: Option<u32>,
    length: Option<u32>,
    session: Option<String>,
) -> ApiResult {
    if op != "list" {
        authorize(daemon, session.as_deref(), Some(pid)).await?;
    }
    let mut exec = daemon.exec.lock().await;
    match op.as_str() {
        "add" | "set" => {
            let expr = expr.ok_or("missing_expr")?;
            let wid = exec
                .watch_add(pid, &expr, length.unwrap_or(4))
                .map_err(|e| e.wire_code())?;
            Ok(json!({ "id": wid }))
        }
        "clear" | "remove" => {
            let id = id.ok_or("missing_id")?;
            exec.watch_clear(pid, id).map_err(|e| e.wire_code())?;
            Ok(json!({ "cleared": id }))
        }
        "list" => {
            let list = exec.watch_list(pid).map_err(|e| e.wire_code())?;
            Ok(json!({
                "watches": list
                    .into_iter()
                    .map(|(id, expr, address, length)| json!({
                        "id": id, "expr": expr, "address": address, "length": length
                    }))
                    .collect::<Vec<_>>()
            }))
        }
        other => Err(format!("unknown_watch_op:{other}")),
    }
}

pub async fn trace(
    daemon: &Daemon,
    pid: u32,
    mode: Option<String>,
    op: Option<String>,
    entries: Option<Vec<TraceEntry>>,
    session: Option<String>,
) -> ApiResult {
    authorize(daemon, session.as_deref(), Some(pid)).await?;
    let mut exec = daemon.exec.lock().await;
    match op.as_deref() {
        Some("export") => {
            let entries = exec.trace_export(pid).map_err(|e| e.wire_code())?;
            return Ok(json!({ "entries": entries }));
        }
        Some("import") => {
            let entries = entries.ok_or("missing_entries")?;
            let count = entries.len();
            exec.trace_import(pid, entries).map_err(|e| e.wire_code())?;
            return Ok(json!({ "imported": count }));
        }
        Some("config") | None => {}
        Some(other) => return Err(format!("unknown_trace_op:{other}")),
    }
    let cfg = match mode.as_deref() {
        Some("off") | Some("none") => TraceConfig::default(),
        Some("on") | Some("step") => TraceConfig { enabled: true, ..Default::default() },
        Some("regs") => TraceConfig { enabled: true, include_regs: true, include_mem: false },
        Some("full") => TraceConfig { enabled: true, include_regs: true, include_mem: true },
        None => TraceConfig { enabled: true, ..Default::default() },
        Some(other) => return Err(format!("unknown_trace_mode:{other}")),
    };
    let enabled = cfg.enabled;
    exec.trace_configure(pid, cfg).map_err(|e| e.wire_code())?;
    Ok(json!({ "trace": { "pid": pid, "enabled": enabled } }))
}

pub async fn vm_trace_last(daemon: &Daemon, pid: Option<u32>) -> ApiResult {
    let exec = daemon.exec.lock().await;
    let pid = resolve_pid(&exec, pid)?;
    let last = exec.vm_trace_last(pid).map_err(|e| e.wire_code())?;
    Ok(json!({ "trace_last": last }))
}

pub async fn disasm(
    daemon: &Daemon,
    pid: u32,
    addr: Option<u32>,
    count: Option<usize>,
    _mode: Option<String>,
) -> ApiResult {
    let mut exec = daemon.exec.lock().await;
    let lines = exec
        .disasm(pid, addr, count.unwrap_or(16))
        .map_err(|e| e.wire_code())?;
    Ok(json!({
        "lines": lines
            .into_iter()
            .map(|l| json!({
                "addr": l.addr,
                "word": format!("{:08x}", l.word),
                "text": l.text,
            }))
            .collect::<Vec<_>>()
    }))
}

pub async fn sym(
    daemon: &Daemon,
    op: String,
    pid: u32,
    path: Option<String>,
    name: Option<String>,
    addr: Option<u32>,
    session: Option<String>,
) -> ApiResult {
    if op == "load" {
        authorize(daemon, session.as_deref(), Some(pid)).await?;
    }
    let mut exec = daemon.exec.lock().await;
    match op.as_str() {
        "load" => {
            let path = path.ok_or("missing_path")?;
            let count = exec
                .sym_load(pid, &PathBuf::from(path))
                .map_err(|e| e.wire_code())?;
            Ok(json!({ "symbols_loaded": count }))
        }
        "resolve" => {
            let name = name.ok_or("missing_name")?;
            let table = exec.symbols_of(pid).map_err(|e| e.wire_code())?;
            let addr = table
                .and_then(|t| t.resolve(&name))
                .ok_or("bad_expression")?;
            Ok(json!({ "addr": addr }))
        }
        "lookup" => {
            let addr = addr.ok_or("missing_addr")?;
            let table = exec.symbols_of(pid).map_err(|e| e.wire_code())?;
            let symbol = table.and_then(|t| t.lookup_addr(addr)).cloned();
            Ok(json!({ "symbol": symbol }))
        }
        other => Err(format!("unknown_sym_op:{other}")),
    }
}

pub async fn symbols(
    daemon: &Daemon,
    pid: u32,
    kind: Option<String>,
    offset: Option<usize>,
    limit: Option<usize>,
) -> ApiResult {
    let exec = daemon.exec.lock().await;
    let table = exec.symbols_of(pid).map_err(|e| e.wire_code())?;
    let all: Vec<_> = table
        .map(|t| {
            t.symbols
                .iter()
                .filter(|s| kind.as_deref().map_or(true, |k| s.kind.as_deref() == Some(k)))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    let total = all.len();
    let page: Vec<_> = all
        .into_iter()
        .skip(offset.unwrap_or(0))
        .take(limit.unwrap_or(100))
        .collect();
    Ok(json!({ "symbols": page, "total": total }))
}

pub async fn stack(daemon: &Daemon, pid: u32, max: Option<usize>) -> ApiResult {
    let mut exec = daemon.exec.lock().await;
    let frames = exec
        .stack_walk(pid, max.unwrap_or(16))
        .map_err(|e| e.wire_code())?;
    Ok(json!({
        "frames": frames
            .into_iter()
            .map(|(addr, symbol)| json!({ "addr": addr, "symbol": symbol }))
            .collect::<Vec<_>>()
    }))
}

pub async fn memory(daemon: &Daemon, pid: u32) -> ApiResult {
    let exec = daemon.exec.lock().await;
    let regions = exec.memory_regions(pid).map_err(|e| e.wire_code())?;
    Ok(json!({
        "regions": regions
            .into_iter()
            .map(|(name, base, len)| json!({ "name": name, "base": base, "len": len }))
            .collect::<Vec<_>>()
    }))
}

pub async fn dumpregs(daemon: &Daemon, pid: u32) -> ApiResult {
    let mut exec = daemon.exec.lock().await;
    let (regs, pc, sp, psw) = exec.dumpregs(pid).map_err(|e| e.wire_code())?;
    Ok(json!({ "regs": regs, "pc": pc, "sp": sp, "psw": psw }))
}

pub async fn vm_reg_get(daemon: &Daemon, reg: u32, pid: Option<u32>) -> ApiResult {
    let mut exec = daemon.exec.lock().await;
    let pid = resolve_pid(&exec, pid)?;
    let value = exec.reg_get(pid, reg).map_err(|e| e.wire_code())?;
    Ok(json!({ "reg": reg, "value": value }))
}

pub async fn vm_reg_set(
    daemon: &Daemon,
    reg: u32,
    value: u32,
    pid: Option<u32>,
    session: Option<String>,
) -> ApiResult {
    authorize(daemon, session.as_deref(), pid).await?;
    let mut exec = daemon.exec.lock().await;
    let pid = resolve_pid(&exec, pid)?;
    exec.reg_set(pid, reg, value).map_err(|e| e.wire_code())?;
    Ok(json!({ "reg": reg, "value": value }))
}

pub async fn peek(daemon: &Daemon, pid: u32, addr: u32, length: u32) -> ApiResult {
    let mut exec = daemon.exec.lock().await;
    let bytes = exec
        .read_task_mem(pid, addr, length.min(4096))
        .map_err(|e| e.wire_code())?;
    Ok(json!({ "addr": addr, "data": hex_encode(&bytes) }))
}

pub async fn poke(
    daemon: &Daemon,
    pid: u32,
    addr: u32,
    data: String,
    session: Option<String>,
) -> ApiResult {
    authorize(daemon, session.as_deref(), Some(pid)).await?;
    let bytes = hex_decode(&data)?;
    let mut exec = daemon.exec.lock().await;
    exec.write_task_mem(pid, addr, &bytes).map_err(|e| e.wire_code())?;
    Ok(json!({ "addr": addr, "written": bytes.len() }))
}
