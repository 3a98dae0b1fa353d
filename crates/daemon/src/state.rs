//! Shared daemon state
//!
//! One mutex over the executive guards the task table, VM, mailboxes,
//! registry, and event log; the session registry has its own lock. RPC
//! handlers hold the executive lock only for the duration of one request,
//! and socket writes always happen outside both locks.

use hsx_runtime::exec::Executive;
use hsx_runtime::profile::Profile;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use crate::session::SessionRegistry;

pub struct Daemon {
    pub exec: Mutex<Executive>,
    pub sessions: Mutex<SessionRegistry>,
    /// Pinged after anything that may have appended events.
    pub events_notify: Notify,
    /// Set by `shutdown`; wakes the accept loop and background tasks.
    pub shutdown: Notify,
    shutting_down: AtomicBool,
}

impl Daemon {
    pub fn new(profile: Profile) -> Arc<Self> {
        Arc::new(Self {
            exec: Mutex::new(Executive::new(profile)),
            sessions: Mutex::new(SessionRegistry::default()),
            events_notify: Notify::new(),
            shutdown: Notify::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }
}
