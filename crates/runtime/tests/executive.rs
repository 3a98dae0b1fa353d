//! Executive integration: load, schedule, trap, block, wake, terminate.

use hsx_runtime::events::EventPayload;
use hsx_runtime::exec::{ExecError, Executive};
use hsx_runtime::image::HxeImage;
use hsx_runtime::profile::Profile;
use hsx_runtime::vm::opcode::*;
use std::path::PathBuf;

fn words(ws: &[u32]) -> Vec<u8> {
    let mut out = Vec::new();
    for w in ws {
        out.extend_from_slice(&w.to_le_bytes());
    }
    out
}

fn image_v2(name: &str, allow_multiple: bool, code: &[u32]) -> Vec<u8> {
    HxeImage {
        version: 2,
        flags: if allow_multiple { 1 } else { 0 },
        entry: 0,
        bss_size: 256,
        req_caps: 0,
        app_name: Some(name.to_string()),
        code: words(code),
        rodata: vec![],
        values: vec![],
        commands: vec![],
        mailboxes: vec![],
        string_pool: vec![],
    }
    .encode()
}

fn load(exec: &mut Executive, name: &str, code: &[u32]) -> u32 {
    let bytes = image_v2(name, false, code);
    exec.load_bytes(&bytes, PathBuf::from(format!("{name}.hxe")))
        .expect("load")
        .pid
}

fn task_state_events(exec: &Executive) -> Vec<(String, String, String)> {
    exec.events
        .since(0)
        .into_iter()
        .filter_map(|e| match e.payload {
            EventPayload::TaskState { prev_state, new_state, reason, .. } => {
                Some((prev_state, new_state, reason))
            }
            _ => None,
        })
        .collect()
}

#[test]
fn test_load_step_exit_scenario() {
    let mut exec = Executive::new(Profile::desktop());
    let pid = load(
        &mut exec,
        "demo",
        &[
            encode(OP_LDI, 1, 0, 0, 42),
            encode(OP_LDI32, 2, 0, 0, 0),
            0x0001_0002,
            encode(OP_SVC, 0, 0, 0, 0x100), // task.exit(status = R1)
            encode(OP_RET, 0, 0, 0, 0),
        ],
    );
    assert_eq!(pid, 1);

    let report = exec.step_n(3, Some(pid), "manual");
    assert_eq!(report.executed, 3);

    // Last retired instruction was the SVC trap.
    let eventually = exec
        .events
        .since(0)
        .into_iter()
        .find_map(|e| match e.payload {
            EventPayload::TaskState { new_state, details, .. } if new_state == "returned" => {
                Some(details)
            }
            _ => None,
        })
        .expect("terminal event");
    assert_eq!(eventually.expect("details")["status"], 42);
    assert!(!exec.has_task(pid), "terminal task removed after event");
}

#[test]
fn test_trace_last_opcode_is_svc() {
    let mut exec = Executive::new(Profile::desktop());
    let pid = load(
        &mut exec,
        "tracer",
        &[
            encode(OP_LDI, 1, 0, 0, 1),
            encode(OP_SVC, 0, 0, 0, 0x103), // getpid, non-terminal
            encode(OP_HALT, 0, 0, 0, 0),
        ],
    );
    exec.step_n(2, Some(pid), "manual");
    let last = exec.vm_trace_last(pid).expect("task").expect("trace");
    assert_eq!(last.opcode, "SVC");
    assert_eq!(last.pc, 4);
    // getpid answered in R0.
    assert_eq!(exec.reg_get(pid, 0).expect("reg"), pid);
}

#[test]
fn test_breakpoint_pause_resume() {
    let mut exec = Executive::new(Profile::desktop());
    let pid = load(
        &mut exec,
        "bp",
        &[
            encode(OP_LDI, 1, 0, 0, 1), // 0x0
            encode(OP_LDI, 2, 0, 0, 2), // 0x4
            encode(OP_LDI, 3, 0, 0, 3), // 0x8
            encode(OP_LDI, 4, 0, 0, 4), // 0xC
            encode(OP_LDI, 5, 0, 0, 5), // 0x10
            encode(OP_HALT, 0, 0, 0, 0),
        ],
    );
    exec.bp_set(pid, 0x10).expect("bp");
    exec.bp_set(pid, 0x10).expect("idempotent");
    assert_eq!(exec.bp_list(pid).expect("list"), vec![0x10]);

    let report = exec.step_n(100, Some(pid), "manual");
    // Four instructions retire, then the pre-step check pauses the task.
    assert_eq!(report.executed, 4);
    assert_eq!(
        exec.task_info(pid).expect("info").state,
        "paused".to_string()
    );
    let brk = exec
        .events
        .since(0)
        .into_iter()
        .find_map(|e| match e.payload {
            EventPayload::DebugBreak { pc, reason, .. } => Some((pc, reason)),
            _ => None,
        })
        .expect("debug_break event");
    assert_eq!(brk, (0x10, "BRK".to_string()));

    exec.resume(pid).expect("resume");
    assert_eq!(exec.task_info(pid).expect("info").state, "ready");
    // Resume steps past the breakpoint instead of re-breaking.
    let report = exec.step_n(1, Some(pid), "manual");
    assert_eq!(report.executed, 1);
    assert_eq!(exec.reg_get(pid, 5).expect("reg"), 5);

    // Clearing twice is not an error.
    exec.bp_clear(pid, 0x10).expect("clear");
    exec.bp_clear(pid, 0x10).expect("clear again");
}

#[test]
fn test_round_robin_context_isolation() {
    let mut exec = Executive::new(Profile::desktop());
    // Each task increments R5 forever.
    let looped = [
        encode(OP_ADDI, 5, 5, 0, 1),
        encode(OP_JMP, 0, 0, 0, 0),
    ];
    let a = load(&mut exec, "alpha", &looped);
    let b = load(&mut exec, "beta", &looped);

    let report = exec.step_n(20, None, "manual");
    assert_eq!(report.executed, 20);
    // Strict alternation with quantum 1: 10 instructions each, 5 ADDIs.
    assert_eq!(exec.reg_get(a, 5).expect("a"), 5);
    assert_eq!(exec.reg_get(b, 5).expect("b"), 5);

    // A switch event for the incoming pid precedes its trace steps.
    let switches = exec
        .events
        .since(0)
        .into_iter()
        .filter(|e| matches!(e.payload, EventPayload::Scheduler { .. }))
        .count();
    assert!(switches >= 20);
}

#[test]
fn test_sleep_and_timer_wake() {
    let mut exec = Executive::new(Profile::desktop());
    let pid = load(
        &mut exec,
        "sleeper",
        &[
            encode(OP_LDI, 1, 0, 0, 25),    // ms
            encode(OP_SVC, 0, 0, 0, 0x600), // exec.sleep_ms(R1)
            encode(OP_LDI, 2, 0, 0, 7),
            encode(OP_HALT, 0, 0, 0, 0),
        ],
    );
    let report = exec.step_n(5, Some(pid), "manual");
    assert_eq!(report.executed, 2);
    assert_eq!(exec.task_info(pid).expect("info").state, "sleeping");

    let report = exec.step_n(5, Some(pid), "manual");
    assert_eq!(report.executed, 0, "sleeping task does not run");

    std::thread::sleep(std::time::Duration::from_millis(40));
    let report = exec.step_n(2, Some(pid), "manual");
    assert_eq!(report.executed, 2);
    assert_eq!(exec.reg_get(pid, 2).expect("reg"), 7);
    assert!(task_state_events(&exec)
        .iter()
        .any(|(p, n, r)| p == "sleeping" && n == "ready" && r == "timeout"));
}

// recv on the task's own pid: channel, blocking forever, then exit with the
// first payload byte as status once a message arrives.
fn blocking_recv_code() -> Vec<u32> {
    vec![
        encode(OP_LDI, 1, 0, 0, 0),     // target ptr 0
        encode(OP_LDI, 2, 0, 0, 0),     // target len 0 => own pid channel
        encode(OP_SVC, 0, 0, 0, 0x500), // mailbox.open -> R1 handle
        encode(OP_LDI32, 2, 0, 0, 0),
        0x0000_4100,                    // buffer in bss
        encode(OP_LDI, 3, 0, 0, 64),    // max_len
        encode(OP_LDI, 4, 0, 0, -1),    // timeout 0xFFFF = INFINITE
        encode(OP_LDI, 5, 0, 0, 0),     // no info block
        encode(OP_SVC, 0, 0, 0, 0x503), // mailbox.recv (blocks)
        encode(OP_LDI32, 2, 0, 0, 0),
        0x0000_4100,
        encode(OP_LDB, 0, 2, 0, 0),     // R0 = first payload byte
        encode(OP_HALT, 0, 0, 0, 0),
    ]
}

#[test]
fn test_blocking_recv_woken_by_injected_message() {
    let mut exec = Executive::new(Profile::desktop());
    let pid = load(&mut exec, "rx", &blocking_recv_code());

    let report = exec.step_n(100, Some(pid), "manual");
    assert_eq!(exec.task_info(pid).expect("info").state, "wait_mbx");
    assert!(report.executed >= 8);

    // Control-plane injection onto the task's pid: channel.
    let st = exec.post_message(pid, "", b"ping", 0);
    assert_eq!(st, 0);
    assert_eq!(exec.task_info(pid).expect("info").state, "ready");

    exec.step_n(10, Some(pid), "manual");
    let status = exec
        .events
        .since(0)
        .into_iter()
        .find_map(|e| match e.payload {
            EventPayload::TaskState { new_state, details, .. } if new_state == "returned" => {
                details
            }
            _ => None,
        })
        .expect("returned");
    assert_eq!(status["status"], b'p' as i64);
}

#[test]
fn test_recv_timeout_returns_timeout_status() {
    let mut exec = Executive::new(Profile::desktop());
    let code = vec![
        encode(OP_LDI, 1, 0, 0, 0),
        encode(OP_LDI, 2, 0, 0, 0),
        encode(OP_SVC, 0, 0, 0, 0x500), // open own channel
        encode(OP_LDI, 2, 0, 0, 0x700), // buffer
        encode(OP_LDI, 3, 0, 0, 16),
        encode(OP_LDI, 4, 0, 0, 25),    // 25 ms timeout
        encode(OP_LDI, 5, 0, 0, 0),
        encode(OP_SVC, 0, 0, 0, 0x503), // recv, parks with deadline
        encode(OP_HALT, 0, 0, 0, 0),    // status = R0 (TIMEOUT)
    ];
    let pid = load(&mut exec, "timeout", &code);
    exec.step_n(100, Some(pid), "manual");
    assert_eq!(exec.task_info(pid).expect("info").state, "wait_mbx");

    std::thread::sleep(std::time::Duration::from_millis(40));
    exec.step_n(5, Some(pid), "manual");
    let status = exec
        .events
        .since(0)
        .into_iter()
        .find_map(|e| match e.payload {
            EventPayload::TaskState { new_state, details, .. } if new_state == "returned" => {
                details
            }
            _ => None,
        })
        .expect("returned");
    assert_eq!(status["status"], -5, "TIMEOUT latched in R0");
    assert!(exec
        .events
        .since(0)
        .iter()
        .any(|e| matches!(e.payload, EventPayload::MailboxTimeout { .. })));
}

#[test]
fn test_div_zero_fault_terminates_with_fault_details() {
    let mut exec = Executive::new(Profile::desktop());
    let pid = load(
        &mut exec,
        "crash",
        &[
            encode(OP_LDI, 1, 0, 0, 9),
            encode(OP_LDI, 2, 0, 0, 0),
            encode(OP_DIV, 3, 1, 2, 0),
        ],
    );
    exec.step_n(10, Some(pid), "manual");
    let details = exec
        .events
        .since(0)
        .into_iter()
        .find_map(|e| match e.payload {
            EventPayload::TaskState { new_state, details, .. } if new_state == "returned" => {
                details
            }
            _ => None,
        })
        .expect("returned");
    assert_eq!(details["fault"], "div_zero");
    assert!(details["status"].as_i64().expect("status") != 0);
}

#[test]
fn test_instance_policy() {
    let mut exec = Executive::new(Profile::desktop());
    let single = image_v2("demo", false, &[encode(OP_JMP, 0, 0, 0, 0)]);
    exec.load_bytes(&single, PathBuf::from("demo.hxe")).expect("first");
    let err = exec
        .load_bytes(&single, PathBuf::from("demo.hxe"))
        .expect_err("second must fail");
    assert!(matches!(err, ExecError::InstanceExists(_)));
    assert_eq!(err.wire_code(), "instance_exists");

    let multi = image_v2("multi", true, &[encode(OP_JMP, 0, 0, 0, 0)]);
    let first = exec.load_bytes(&multi, PathBuf::from("multi.hxe")).expect("first");
    let second = exec.load_bytes(&multi, PathBuf::from("multi.hxe")).expect("second");
    assert_eq!(first.app_name, "multi");
    assert_eq!(second.app_name, "multi_#1");
}

#[test]
fn test_kill_from_any_state_single_terminal_event() {
    let mut exec = Executive::new(Profile::desktop());
    let pid = load(&mut exec, "victim", &blocking_recv_code());
    exec.step_n(100, Some(pid), "manual");
    assert_eq!(exec.task_info(pid).expect("info").state, "wait_mbx");

    exec.kill(pid).expect("kill");
    assert!(!exec.has_task(pid));
    let terminal: Vec<_> = task_state_events(&exec)
        .into_iter()
        .filter(|(_, n, _)| n == "killed" || n == "returned")
        .collect();
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].2, "killed");

    assert!(matches!(exec.kill(pid), Err(ExecError::NoSuchPid(_))));
}

#[test]
fn test_pause_while_ready_then_resume() {
    let mut exec = Executive::new(Profile::desktop());
    let pid = load(&mut exec, "pausee", &[encode(OP_JMP, 0, 0, 0, 0)]);
    exec.pause(pid, "user_pause").expect("pause");
    assert_eq!(exec.task_info(pid).expect("info").state, "paused");
    let report = exec.step_n(5, Some(pid), "manual");
    assert_eq!(report.executed, 0);
    exec.resume(pid).expect("resume");
    let report = exec.step_n(5, Some(pid), "manual");
    assert_eq!(report.executed, 5);
}

#[test]
fn test_watch_fires_on_memory_change() {
    let mut exec = Executive::new(Profile::desktop());
    let code = vec![
        encode(OP_LDI, 1, 0, 0, 0x55),
        encode(OP_LDI, 2, 0, 0, 0x700),
        encode(OP_STB, 1, 2, 0, 0),
        encode(OP_HALT, 0, 0, 0, 0),
    ];
    let pid = load(&mut exec, "watched", &code);
    let id = exec.watch_add(pid, "0x700", 1).expect("watch");
    exec.step_n(3, Some(pid), "manual");
    let update = exec
        .events
        .since(0)
        .into_iter()
        .find_map(|e| match e.payload {
            EventPayload::WatchUpdate { id: wid, bytes, prev, .. } => Some((wid, bytes, prev)),
            _ => None,
        })
        .expect("watch_update");
    assert_eq!(update.0, id);
    assert_eq!(update.1, "55");
    assert_eq!(update.2, "00");
}

#[test]
fn test_stdout_routed_to_event_and_mailbox() {
    let mut exec = Executive::new(Profile::desktop());
    // Write "hi" from rodata? Simpler: store bytes to bss then write(fd=1).
    let code = vec![
        encode(OP_LDI, 1, 0, 0, 0x68),  // 'h'
        encode(OP_LDI, 2, 0, 0, 0x700),
        encode(OP_STB, 1, 2, 0, 0),
        encode(OP_LDI, 1, 0, 0, 0x69),  // 'i'
        encode(OP_STB, 1, 2, 0, 1),
        encode(OP_LDI, 1, 0, 0, 1),     // fd 1
        encode(OP_LDI, 2, 0, 0, 0x700), // ptr
        encode(OP_LDI, 3, 0, 0, 2),     // len
        encode(OP_SVC, 0, 0, 0, 0x101), // write
        encode(OP_HALT, 0, 0, 0, 0),
    ];
    let pid = load(&mut exec, "printer", &code);
    exec.step_n(9, Some(pid), "manual");
    let text = exec
        .events
        .since(0)
        .into_iter()
        .find_map(|e| match e.payload {
            EventPayload::Stdout { text } => Some(text),
            _ => None,
        })
        .expect("stdout event");
    assert_eq!(text, "hi");
}

#[test]
fn test_sched_set_quantum() {
    let mut exec = Executive::new(Profile::desktop());
    let looped = [encode(OP_ADDI, 5, 5, 0, 1), encode(OP_JMP, 0, 0, 0, 0)];
    let a = load(&mut exec, "big", &looped);
    let b = load(&mut exec, "small", &looped);
    exec.sched_set(a, None, Some(3)).expect("sched");

    exec.step_n(8, None, "manual");
    // a runs 3, b runs 1, a runs 3, b runs 1.
    assert_eq!(exec.reg_get(a, 5).expect("a"), 3);
    assert_eq!(exec.reg_get(b, 5).expect("b"), 1);
}

#[test]
fn test_restart_allocates_new_pid() {
    let mut exec = Executive::new(Profile::desktop());
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("cycle.hxe");
    std::fs::write(&path, image_v2("cycle", false, &[encode(OP_JMP, 0, 0, 0, 0)]))
        .expect("write image");
    let first = exec.load_path(&path).expect("load");
    let restarted = exec.restart(&[first.pid]).expect("restart");
    assert_eq!(restarted.len(), 1);
    assert!(restarted[0].pid > first.pid);
    assert!(!exec.has_task(first.pid));
    assert!(exec.has_task(restarted[0].pid));
}

#[test]
fn test_dumpregs_and_poke_peek() {
    let mut exec = Executive::new(Profile::desktop());
    let pid = load(&mut exec, "inspect", &[encode(OP_LDI, 7, 0, 0, 77), encode(OP_HALT, 0, 0, 0, 0)]);
    exec.step_n(1, Some(pid), "manual");
    let (regs, pc, _sp, _psw) = exec.dumpregs(pid).expect("dumpregs");
    assert_eq!(regs[7], 77);
    assert_eq!(pc, 4);

    exec.write_task_mem(pid, 0x700, &[1, 2, 3]).expect("poke");
    assert_eq!(exec.read_task_mem(pid, 0x700, 3).expect("peek"), vec![1, 2, 3]);
    assert!(matches!(
        exec.read_task_mem(pid, 0xFFFF_FF00, 4),
        Err(ExecError::BadAddress(_))
    ));

    exec.reg_set(pid, 3, 123).expect("reg_set");
    assert_eq!(exec.reg_get(pid, 3).expect("reg_get"), 123);
    assert!(matches!(exec.reg_get(pid, 16), Err(ExecError::BadRegister(16))));
}

#[test]
fn test_value_epsilon_scenario_via_executive() {
    use half::f16;
    let mut exec = Executive::new(Profile::desktop());
    let pid = load(&mut exec, "holder", &[encode(OP_JMP, 0, 0, 0, 0)]);

    let half = |v: f32| f16::from_f32(v).to_bits();
    let (st, oid) = exec.registry.register_value(
        pid,
        0x01,
        0x03,
        0,
        0,
        half(0.0),
        hsx_runtime::registry::ValueDesc { epsilon_half: half(0.1), ..Default::default() },
        &mut exec.events,
    );
    assert_eq!(st, 0);
    assert_eq!(oid, 0x0103);

    assert_eq!(exec.value_set(pid, 0, oid, half(0.05)), 0);
    assert_eq!(exec.registry.get(pid, 0, oid).1, half(0.0));
    let changed = exec
        .events
        .since(0)
        .iter()
        .filter(|e| matches!(e.payload, EventPayload::ValueChanged { .. }))
        .count();
    assert_eq!(changed, 0);

    assert_eq!(exec.value_set(pid, 0, oid, half(0.2)), 0);
    assert_eq!(exec.registry.get(pid, 0, oid).1, half(0.2));
    let changed: Vec<(f32, f32)> = exec
        .events
        .since(0)
        .into_iter()
        .filter_map(|e| match e.payload {
            EventPayload::ValueChanged { old, new, .. } => Some((old, new)),
            _ => None,
        })
        .collect();
    assert_eq!(changed, vec![(0.0, 0.2)]);
}
