//! Control protocol types
//!
//! One JSON object per line. Every request carries `version: 1` and a
//! `cmd`; requests are decoded into a tagged sum after envelope
//! validation. Responses echo `version: 1` and set `status` to `ok` or
//! `error` with a stable error string.

use hsx_runtime::exec::task::TraceEntry;
use serde::Deserialize;
use serde_json::{json, Value};

/// The only protocol version this daemon speaks.
pub const PROTOCOL_VERSION: u64 = 1;

/// Typed request sum; `cmd` selects the variant. Unknown keys are
/// ignored, matching the protocol's forward-compatibility rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Ping {
        #[serde(default)]
        session: Option<String>,
    },
    Info {
        #[serde(default)]
        pid: Option<u32>,
    },
    Attach {},
    Detach {},
    #[serde(alias = "exec")]
    Load {
        path: String,
        #[serde(default)]
        session: Option<String>,
    },
    Ps {},
    Clock {
        op: String,
        #[serde(default)]
        steps: Option<u64>,
        #[serde(default)]
        pid: Option<u32>,
        #[serde(default)]
        rate: Option<f64>,
        #[serde(default)]
        session: Option<String>,
    },
    Step {
        #[serde(default)]
        steps: Option<u64>,
        #[serde(default)]
        pid: Option<u32>,
        #[serde(default)]
        session: Option<String>,
    },
    Trace {
        pid: u32,
        #[serde(default)]
        mode: Option<String>,
        #[serde(default)]
        op: Option<String>,
        #[serde(default)]
        entries: Option<Vec<TraceEntry>>,
        #[serde(default)]
        session: Option<String>,
    },
    Bp {
        op: String,
        pid: u32,
        #[serde(default)]
        addr: Option<u32>,
        #[serde(default)]
        session: Option<String>,
    },
    VmTraceLast {
        #[serde(default)]
        pid: Option<u32>,
    },
    Disasm {
        pid: u32,
        #[serde(default)]
        addr: Option<u32>,
        #[serde(default)]
        count: Option<usize>,
        #[serde(default)]
        mode: Option<String>,
    },
    Sym {
        op: String,
        pid: u32,
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        addr: Option<u32>,
        #[serde(default)]
        session: Option<String>,
    },
    Symbols {
        pid: u32,
        #[serde(default, rename = "type")]
        kind: Option<String>,
        #[serde(default)]
        offset: Option<usize>,
        #[serde(default)]
        limit: Option<usize>,
    },
    Stack {
        pid: u32,
        #[serde(default)]
        max: Option<usize>,
    },
    Memory {
        pid: u32,
        #[serde(default)]
        regions: Option<bool>,
    },
    Watch {
        op: String,
        pid: u32,
        #[serde(default)]
        expr: Option<String>,
        #[serde(default)]
        id: Option<u32>,
        #[serde(default, rename = "type")]
        kind: Option<String>,
        #[serde(default)]
        length: Option<u32>,
        #[serde(default)]
        session: Option<String>,
    },
    Pause {
        #[serde(default)]
        pid: Option<u32>,
        #[serde(default)]
        session: Option<String>,
    },
    Resume {
        #[serde(default)]
        pid: Option<u32>,
        #[serde(default)]
        session: Option<String>,
    },
    Kill {
        pid: u32,
        #[serde(default)]
        session: Option<String>,
    },
    Dumpregs {
        pid: u32,
    },
    VmRegGet {
        reg: u32,
        #[serde(default)]
        pid: Option<u32>,
    },
    VmRegSet {
        reg: u32,
        value: u32,
        #[serde(default)]
        pid: Option<u32>,
        #[serde(default)]
        session: Option<String>,
    },
    Peek {
        pid: u32,
        addr: u32,
        length: u32,
    },
    Poke {
        pid: u32,
        addr: u32,
        data: String,
        #[serde(default)]
        session: Option<String>,
    },
    Sched {
        pid: u32,
        #[serde(default)]
        priority: Option<u8>,
        #[serde(default)]
        quantum: Option<u32>,
        #[serde(default)]
        session: Option<String>,
    },
    Restart {
        targets: Vec<u32>,
        #[serde(default)]
        session: Option<String>,
    },
    Shutdown {
        #[serde(default)]
        session: Option<String>,
    },
    Send {
        target: String,
        #[serde(default)]
        data: Option<String>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        channel: Option<u8>,
        #[serde(default)]
        pid: Option<u32>,
        #[serde(default)]
        session: Option<String>,
    },
    Mbx {
        op: String,
        #[serde(default)]
        id: Option<u32>,
    },
    #[serde(rename = "session.open")]
    SessionOpen {
        #[serde(default)]
        client: Option<String>,
        #[serde(default)]
        capabilities: Option<Capabilities>,
        #[serde(default)]
        pid_lock: Option<u32>,
    },
    #[serde(rename = "session.keepalive")]
    SessionKeepalive { session: String },
    #[serde(rename = "session.close")]
    SessionClose { session: String },
    #[serde(rename = "events.subscribe")]
    EventsSubscribe {
        session: String,
        #[serde(default)]
        max_events: Option<usize>,
        #[serde(default)]
        since_seq: Option<u64>,
        #[serde(default)]
        categories: Option<Vec<String>>,
    },
    #[serde(rename = "events.unsubscribe")]
    EventsUnsubscribe { session: String },
    #[serde(rename = "events.ack")]
    EventsAck { session: String, seq: u64 },
}

/// Capability negotiation block in `session.open`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub max_events: Option<usize>,
    #[serde(default)]
    pub heartbeat_s: Option<u64>,
}

/// Envelope failure, before any command runs.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("not a json object")]
    NotObject,
    #[error("missing version")]
    MissingVersion,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u64),
    #[error("missing cmd")]
    MissingCmd,
    #[error("unknown cmd {0}")]
    UnknownCmd(String),
    #[error("malformed request: {0}")]
    Malformed(String),
}

impl ProtoError {
    pub fn wire_code(&self) -> String {
        match self {
            ProtoError::NotObject => "malformed_request".into(),
            ProtoError::MissingVersion => "missing_version".into(),
            ProtoError::UnsupportedVersion(n) => format!("unsupported_version:{n}"),
            ProtoError::MissingCmd => "missing_cmd".into(),
            ProtoError::UnknownCmd(c) => format!("unknown_cmd:{c}"),
            ProtoError::Malformed(_) => "malformed_request".into(),
        }
    }
}

/// Validate the envelope and decode the typed request.
pub fn parse_request(line: &str) -> Result<Request, ProtoError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| ProtoError::Malformed(e.to_string()))?;
    let obj = value.as_object().ok_or(ProtoError::NotObject)?;
    let version = obj
        .get("version")
        .ok_or(ProtoError::MissingVersion)?
        .as_u64()
        .ok_or(ProtoError::MissingVersion)?;
    if version != PROTOCOL_VERSION {
        return Err(ProtoError::UnsupportedVersion(version));
    }
    let cmd = obj
        .get("cmd")
        .and_then(|c| c.as_str())
        .ok_or(ProtoError::MissingCmd)?
        .to_string();
    let mut body = value.clone();
    if let Some(map) = body.as_object_mut() {
        map.remove("version");
    }
    serde_json::from_value(body).map_err(|e| {
        if e.to_string().contains("unknown variant") {
            ProtoError::UnknownCmd(cmd)
        } else {
            ProtoError::Malformed(e.to_string())
        }
    })
}

/// `{"version":1,"status":"ok", ...fields}` as one line.
pub fn ok_line(fields: Value) -> String {
    let mut out = json!({ "version": PROTOCOL_VERSION, "status": "ok" });
    if let (Some(dst), Some(src)) = (out.as_object_mut(), fields.as_object()) {
        for (k, v) in src {
            dst.insert(k.clone(), v.clone());
        }
    }
    out.to_string()
}

/// `{"version":1,"status":"error","error":code}` as one line.
pub fn err_line(code: &str) -> String {
    json!({ "version": PROTOCOL_VERSION, "status": "error", "error": code }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_version_checked() {
        let err = parse_request(r#"{"cmd":"ping"}"#).unwrap_err();
        assert_eq!(err, ProtoError::MissingVersion);
        let err = parse_request(r#"{"version":2,"cmd":"ping"}"#).unwrap_err();
        assert_eq!(err.wire_code(), "unsupported_version:2");
    }

    #[test]
    fn test_unknown_cmd() {
        let err = parse_request(r#"{"version":1,"cmd":"frobnicate"}"#).unwrap_err();
        assert_eq!(err.wire_code(), "unknown_cmd:frobnicate");
    }

    #[test]
    fn test_load_and_exec_alias() {
        let req = parse_request(r#"{"version":1,"cmd":"load","path":"a.hxe"}"#).unwrap();
        assert!(matches!(req, Request::Load { ref path, .. } if path == "a.hxe"));
        let req = parse_request(r#"{"version":1,"cmd":"exec","path":"b.hxe"}"#).unwrap();
        assert!(matches!(req, Request::Load { ref path, .. } if path == "b.hxe"));
    }

    #[test]
    fn test_dotted_cmds() {
        let req = parse_request(
            r#"{"version":1,"cmd":"session.open","client":"dbg","capabilities":{"features":["events"],"max_events":4}}"#,
        )
        .unwrap();
        match req {
            Request::SessionOpen { client, capabilities, .. } => {
                assert_eq!(client.as_deref(), Some("dbg"));
                assert_eq!(capabilities.unwrap().max_events, Some(4));
            }
            other => panic!("{other:?}"),
        }
        let req =
            parse_request(r#"{"version":1,"cmd":"events.ack","session":"s","seq":9}"#).unwrap();
        assert!(matches!(req, Request::EventsAck { seq: 9, .. }));
    }

    #[test]
    fn test_response_lines() {
        let ok = ok_line(json!({ "pong": true }));
        let v: Value = serde_json::from_str(&ok).unwrap();
        assert_eq!(v["version"], 1);
        assert_eq!(v["status"], "ok");
        assert_eq!(v["pong"], true);

        let e: Value = serde_json::from_str(&err_line("pid_locked:3")).unwrap();
        assert_eq!(e["status"], "error");
        assert_eq!(e["error"], "pid_locked:3");
    }

    #[test]
    fn test_malformed_line() {
        assert!(matches!(parse_request("not json"), Err(ProtoError::Malformed(_))));
        assert_eq!(parse_request("[1,2]").unwrap_err(), ProtoError::NotObject);
    }
}
