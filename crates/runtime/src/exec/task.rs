//! Task descriptors and the formal state machine
//!
//! Tasks are plain data records keyed by PID; all VM state lives in the
//! arena window referenced by the saved context. Only the transitions listed
//! in `transition_allowed` are legal; everything else is an error.

use crate::mailbox::WaitCtx;
use crate::symbols::SymbolTable;
use crate::vm::VmContext;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;

/// Scheduler states. Wire names are lowercase (`ready`, `wait_mbx`, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    WaitMbx,
    Sleeping,
    Paused,
    Returned,
    Killed,
}

impl TaskState {
    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Ready => "ready",
            TaskState::Running => "running",
            TaskState::WaitMbx => "wait_mbx",
            TaskState::Sleeping => "sleeping",
            TaskState::Paused => "paused",
            TaskState::Returned => "returned",
            TaskState::Killed => "killed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Returned | TaskState::Killed)
    }

    fn is_live(&self) -> bool {
        !self.is_terminal()
    }
}

/// The legal transition table. `Killed` is reachable from every state.
pub fn transition_allowed(from: TaskState, to: TaskState) -> bool {
    use TaskState::*;
    match (from, to) {
        (_, Killed) => true,
        (Ready, Running) => true,
        (Running, Ready) => true,
        (Running, WaitMbx) => true,
        (Running, Sleeping) => true,
        (Running, Returned) => true,
        (WaitMbx, Ready) => true,
        (Sleeping, Ready) => true,
        (Paused, Ready) => true,
        (from, Paused) => from.is_live(),
        _ => false,
    }
}

/// Per-task trace configuration and bounded history ring.
#[derive(Debug, Clone, Default)]
pub struct TraceConfig {
    pub enabled: bool,
    pub include_regs: bool,
    pub include_mem: bool,
}

/// Entries kept in the per-task trace ring.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TraceEntry {
    pub pc: u32,
    pub next_pc: u32,
    pub word: u32,
    pub opcode: String,
    pub flags: u32,
    pub regs: Vec<u32>,
    pub changed_regs: Vec<u8>,
    pub steps: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_op: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_addr: Option<u32>,
}

/// Trace ring depth per task.
pub const TRACE_RING: usize = 256;

/// A memory watch: resolved address, length, and the last observed bytes.
#[derive(Debug, Clone)]
pub struct Watch {
    pub id: u32,
    pub expr: String,
    pub address: u32,
    pub length: u32,
    pub last: Vec<u8>,
}

/// Metadata summary surfaced by `ps`/`info`.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct MetaSummary {
    pub values: usize,
    pub commands: usize,
    pub mailboxes: usize,
}

/// One admitted task.
pub struct Task {
    pub pid: u32,
    pub path: PathBuf,
    pub app_name: String,
    pub base_name: String,
    pub allow_multiple: bool,
    pub state: TaskState,
    /// Saved VM context; authoritative whenever the task is not mid-step.
    pub ctx: VmContext,
    pub window_base: u32,
    pub window_slot: usize,
    pub entry: u32,
    pub priority: u8,
    pub time_slice: u32,
    pub steps: u64,
    pub auth_level: u8,
    pub sleep_deadline_ms: Option<i64>,
    pub wait: Option<WaitCtx>,
    pub exit_status: Option<i32>,
    pub breakpoints: HashSet<u32>,
    /// Suppress the breakpoint check for the first step after resume.
    pub bp_skip_once: bool,
    pub watches: Vec<Watch>,
    pub next_watch_id: u32,
    pub symbols: Option<SymbolTable>,
    pub meta: MetaSummary,
    pub trace: TraceConfig,
    pub trace_ring: VecDeque<TraceEntry>,
    /// Most recent executed step, kept even when tracing is off.
    pub last_trace: Option<TraceEntry>,
}

impl Task {
    pub fn push_trace(&mut self, entry: TraceEntry) {
        if self.trace_ring.len() >= TRACE_RING {
            self.trace_ring.pop_front();
        }
        self.trace_ring.push_back(entry);
    }
}
