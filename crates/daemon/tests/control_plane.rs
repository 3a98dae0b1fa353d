//! Control-plane integration: real TCP, line-JSON, sessions, events.

use hsx_runtime::image::HxeImage;
use hsx_runtime::profile::Profile;
use hsx_runtime::vm::opcode::*;
use hsxd::{server, Daemon};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;

struct Client {
    lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    tx: tokio::net::tcp::OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (r, tx) = stream.into_split();
        Client { lines: BufReader::new(r).lines(), tx }
    }

    async fn send(&mut self, req: Value) {
        let mut line = req.to_string();
        line.push('\n');
        self.tx.write_all(line.as_bytes()).await.expect("write");
    }

    /// Next line of any kind.
    async fn next_line(&mut self) -> Value {
        let line = tokio::time::timeout(std::time::Duration::from_secs(5), self.lines.next_line())
            .await
            .expect("timeout")
            .expect("read")
            .expect("eof");
        serde_json::from_str(&line).expect("json line")
    }

    /// Next response (skipping streamed events).
    async fn response(&mut self) -> Value {
        loop {
            let v = self.next_line().await;
            if v.get("status").is_some() {
                return v;
            }
        }
    }

    /// Round-trip one request.
    async fn call(&mut self, req: Value) -> Value {
        self.send(req).await;
        self.response().await
    }

    /// Collect streamed events until `n` matching lines arrived.
    async fn events(&mut self, n: usize) -> Vec<Value> {
        let mut out = Vec::new();
        while out.len() < n {
            let v = self.next_line().await;
            if v.get("seq").is_some() {
                out.push(v);
            }
        }
        out
    }
}

async fn start() -> (std::net::SocketAddr, Arc<Daemon>) {
    let daemon = Daemon::new(Profile::desktop());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let d = Arc::clone(&daemon);
    tokio::spawn(async move {
        let _ = server::serve(d, listener).await;
    });
    (addr, daemon)
}

fn demo_image_path(dir: &tempfile::TempDir) -> String {
    let image = HxeImage {
        version: 2,
        flags: 0,
        entry: 0,
        bss_size: 64,
        req_caps: 0,
        app_name: Some("demo".into()),
        code: {
            let mut code = Vec::new();
            for w in [
                encode(OP_LDI, 1, 0, 0, 42),
                encode(OP_LDI32, 2, 0, 0, 0),
                0x0001_0002,
                encode(OP_SVC, 0, 0, 0, 0x100),
                encode(OP_RET, 0, 0, 0, 0),
            ] {
                code.extend_from_slice(&w.to_le_bytes());
            }
            code
        },
        rodata: vec![],
        values: vec![],
        commands: vec![],
        mailboxes: vec![],
        string_pool: vec![],
    };
    let path = dir.path().join("demo.hxe");
    std::fs::write(&path, image.encode()).expect("write image");
    path.display().to_string()
}

#[tokio::test]
async fn test_ping_and_version_gate() {
    let (addr, _daemon) = start().await;
    let mut c = Client::connect(addr).await;

    let resp = c.call(json!({ "version": 1, "cmd": "ping" })).await;
    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["pong"], true);

    let resp = c.call(json!({ "version": 3, "cmd": "ping" })).await;
    assert_eq!(resp["status"], "error");
    assert_eq!(resp["error"], "unsupported_version:3");

    let resp = c.call(json!({ "version": 1, "cmd": "nonsense" })).await;
    assert_eq!(resp["error"], "unknown_cmd:nonsense");
}

#[tokio::test]
async fn test_load_and_step_scenario() {
    let (addr, _daemon) = start().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let path = demo_image_path(&dir);
    let mut c = Client::connect(addr).await;

    let resp = c
        .call(json!({
            "version": 1,
            "cmd": "session.open",
            "client": "test",
            "capabilities": { "features": ["events", "stack"] },
            "pid_lock": 1,
        }))
        .await;
    assert_eq!(resp["status"], "ok");
    let session = resp["id"].as_str().expect("id").to_string();
    assert!(resp["warnings"].as_array().expect("warnings").is_empty());

    let resp = c
        .call(json!({ "version": 1, "cmd": "load", "path": path, "session": session }))
        .await;
    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["image"]["pid"], 1);
    assert_eq!(resp["image"]["app_name"], "demo");

    let resp = c
        .call(json!({
            "version": 1, "cmd": "clock", "op": "step", "steps": 3, "pid": 1,
            "session": session,
        }))
        .await;
    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["executed"], 3);

    let resp = c.call(json!({ "version": 1, "cmd": "vm_trace_last", "pid": 1 })).await;
    assert_eq!(resp["trace_last"]["opcode"], "SVC");

    // The task exited with status 42 and was reaped.
    let resp = c.call(json!({ "version": 1, "cmd": "ps" })).await;
    assert_eq!(resp["tasks"].as_array().expect("tasks").len(), 0);
}

#[tokio::test]
async fn test_pid_lock_blocks_other_sessions() {
    let (addr, _daemon) = start().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let path = demo_image_path(&dir);
    let mut a = Client::connect(addr).await;
    let mut b = Client::connect(addr).await;

    let sa = a
        .call(json!({ "version": 1, "cmd": "session.open", "pid_lock": 1 }))
        .await["id"]
        .as_str()
        .expect("id")
        .to_string();
    let sb = b.call(json!({ "version": 1, "cmd": "session.open" })).await["id"]
        .as_str()
        .expect("id")
        .to_string();

    a.call(json!({ "version": 1, "cmd": "load", "path": path, "session": sa }))
        .await;

    // The other session cannot pause pid 1.
    let resp = b
        .call(json!({ "version": 1, "cmd": "pause", "pid": 1, "session": sb }))
        .await;
    assert_eq!(resp["status"], "error");
    assert_eq!(resp["error"], "pid_locked:1");

    // Without any session, mutation is refused outright.
    let resp = b.call(json!({ "version": 1, "cmd": "pause", "pid": 1 })).await;
    assert_eq!(resp["error"], "session_required");

    // The owner can.
    let resp = a
        .call(json!({ "version": 1, "cmd": "pause", "pid": 1, "session": sa }))
        .await;
    assert_eq!(resp["status"], "ok");
}

#[tokio::test]
async fn test_event_stream_backpressure() {
    let (addr, daemon) = start().await;
    let mut c = Client::connect(addr).await;

    let session = c.call(json!({ "version": 1, "cmd": "session.open" })).await["id"]
        .as_str()
        .expect("id")
        .to_string();
    let resp = c
        .call(json!({
            "version": 1, "cmd": "events.subscribe", "session": session,
            "max_events": 4, "categories": ["stdout", "warning"],
        }))
        .await;
    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["max_events"], 4);

    // Produce 10 stdout events without acking.
    {
        let mut exec = daemon.exec.lock().await;
        for i in 0..10 {
            exec.events.emit(
                Some(1),
                hsx_runtime::events::EventPayload::Stdout { text: format!("line {i}") },
            );
        }
    }
    daemon.events_notify.notify_waiters();

    // Four delivered, then slow_consumer, then slow_consumer_drop.
    let events = c.events(6).await;
    let stdout: Vec<&Value> = events.iter().filter(|e| e["type"] == "stdout").collect();
    assert_eq!(stdout.len(), 4);
    for (i, e) in stdout.iter().enumerate() {
        assert_eq!(e["data"]["text"], format!("line {i}"));
    }
    let warnings: Vec<&Value> = events.iter().filter(|e| e["type"] == "warning").collect();
    assert_eq!(warnings.len(), 2);
    assert_eq!(warnings[0]["data"]["reason"], "slow_consumer");
    assert_eq!(warnings[1]["data"]["reason"], "slow_consumer_drop");

    // Sequences strictly increase across the stream.
    let mut last = 0;
    for e in &events {
        let seq = e["seq"].as_u64().expect("seq");
        assert!(seq > last);
        last = seq;
    }

    // The subscription was torn down and old seqs evicted: resubscribing
    // from zero is refused.
    let resp = c
        .call(json!({
            "version": 1, "cmd": "events.subscribe", "session": session,
            "since_seq": 0,
        }))
        .await;
    assert_eq!(resp["status"], "error");
    assert_eq!(resp["error"], "seq_evicted");
}

#[tokio::test]
async fn test_event_ack_flow() {
    let (addr, daemon) = start().await;
    let mut c = Client::connect(addr).await;
    let session = c.call(json!({ "version": 1, "cmd": "session.open" })).await["id"]
        .as_str()
        .expect("id")
        .to_string();
    c.call(json!({
        "version": 1, "cmd": "events.subscribe", "session": session,
        "max_events": 2, "categories": ["stdout"],
    }))
    .await;

    {
        let mut exec = daemon.exec.lock().await;
        for i in 0..2 {
            exec.events.emit(
                Some(1),
                hsx_runtime::events::EventPayload::Stdout { text: format!("a{i}") },
            );
        }
    }
    daemon.events_notify.notify_waiters();
    let first = c.events(2).await;
    let last_seq = first[1]["seq"].as_u64().expect("seq");

    // Window is full; ack frees it and new events flow.
    let resp = c
        .call(json!({ "version": 1, "cmd": "events.ack", "session": session, "seq": last_seq }))
        .await;
    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["pending"], 0);

    {
        let mut exec = daemon.exec.lock().await;
        exec.events.emit(
            Some(1),
            hsx_runtime::events::EventPayload::Stdout { text: "after".into() },
        );
    }
    daemon.events_notify.notify_waiters();
    let more = c.events(1).await;
    assert_eq!(more[0]["data"]["text"], "after");

    // Acking far beyond the stream is an idempotent no-op.
    let resp = c
        .call(json!({ "version": 1, "cmd": "events.ack", "session": session, "seq": 99999 }))
        .await;
    assert_eq!(resp["status"], "ok");
}

#[tokio::test]
async fn test_breakpoint_flow_over_wire() {
    let (addr, _daemon) = start().await;
    let dir = tempfile::tempdir().expect("tempdir");
    // Five LDIs then a loop; break at 0x10.
    let image = HxeImage {
        version: 2,
        flags: 0,
        entry: 0,
        bss_size: 0,
        req_caps: 0,
        app_name: Some("bp".into()),
        code: {
            let mut code = Vec::new();
            for w in [
                encode(OP_LDI, 1, 0, 0, 1),
                encode(OP_LDI, 2, 0, 0, 2),
                encode(OP_LDI, 3, 0, 0, 3),
                encode(OP_LDI, 4, 0, 0, 4),
                encode(OP_LDI, 5, 0, 0, 5),
                encode(OP_JMP, 0, 0, 0, 0),
            ] {
                code.extend_from_slice(&w.to_le_bytes());
            }
            code
        },
        rodata: vec![],
        values: vec![],
        commands: vec![],
        mailboxes: vec![],
        string_pool: vec![],
    };
    let path = dir.path().join("bp.hxe");
    std::fs::write(&path, image.encode()).expect("write");

    let mut c = Client::connect(addr).await;
    let session = c.call(json!({ "version": 1, "cmd": "session.open" })).await["id"]
        .as_str()
        .expect("id")
        .to_string();
    let resp = c
        .call(json!({
            "version": 1, "cmd": "load",
            "path": path.display().to_string(), "session": session,
        }))
        .await;
    let pid = resp["image"]["pid"].as_u64().expect("pid") as u32;

    c.call(json!({
        "version": 1, "cmd": "bp", "op": "set", "pid": pid, "addr": 0x10,
        "session": session,
    }))
    .await;

    let resp = c
        .call(json!({
            "version": 1, "cmd": "step", "steps": 100, "pid": pid, "session": session,
        }))
        .await;
    assert_eq!(resp["executed"], 4);

    let resp = c.call(json!({ "version": 1, "cmd": "ps" })).await;
    assert_eq!(resp["tasks"][0]["state"], "paused");

    let resp = c
        .call(json!({ "version": 1, "cmd": "resume", "pid": pid, "session": session }))
        .await;
    assert_eq!(resp["status"], "ok");
    let resp = c.call(json!({ "version": 1, "cmd": "ps" })).await;
    assert_eq!(resp["tasks"][0]["state"], "ready");

    let resp = c
        .call(json!({ "version": 1, "cmd": "dumpregs", "pid": pid }))
        .await;
    assert_eq!(resp["regs"][4].as_u64().expect("r4"), 4);
}

#[tokio::test]
async fn test_session_close_releases_lock() {
    let (addr, _daemon) = start().await;
    let mut a = Client::connect(addr).await;
    let sa = a
        .call(json!({ "version": 1, "cmd": "session.open", "pid_lock": 9 }))
        .await["id"]
        .as_str()
        .expect("id")
        .to_string();

    let mut b = Client::connect(addr).await;
    let resp = b
        .call(json!({ "version": 1, "cmd": "session.open", "pid_lock": 9 }))
        .await;
    assert_eq!(resp["error"], "pid_locked:9");

    a.call(json!({ "version": 1, "cmd": "session.close", "session": sa }))
        .await;
    let resp = b
        .call(json!({ "version": 1, "cmd": "session.open", "pid_lock": 9 }))
        .await;
    assert_eq!(resp["status"], "ok");
}
