//! Tracing layer that mirrors daemon logs into the event stream
//!
//! Log records become `warning{category:"log"}` events so control-plane
//! clients see runtime logs in-band. Records are queued through a channel
//! and drained by a background task, so emitting a log while the executive
//! lock is held can never deadlock.

use crate::state::Daemon;
use hsx_runtime::events::EventPayload;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

pub struct EventLogLayer {
    tx: UnboundedSender<(String, String)>,
}

impl EventLogLayer {
    /// Returns the layer plus the receiver to hand to `run_drain`.
    pub fn new() -> (Self, UnboundedReceiver<(String, String)>) {
        let (tx, rx) = unbounded_channel();
        (Self { tx }, rx)
    }
}

impl<S> Layer<S> for EventLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        // Only warn and above go onto the wire; info noise stays local.
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        if let Some(msg) = visitor.message {
            let _ = self.tx.send((level.to_string(), msg));
        }
    }
}

/// Drain queued log records into the shared event log.
pub async fn run_drain(daemon: Arc<Daemon>, mut rx: UnboundedReceiver<(String, String)>) {
    while let Some((level, msg)) = rx.recv().await {
        {
            let mut exec = daemon.exec.lock().await;
            exec.events.emit(None, EventPayload::Warning {
                message: format!("[{level}] {msg}"),
                category: "log".into(),
                reason: None,
                pending: None,
                high_water: None,
                drops: None,
            });
        }
        daemon.events_notify.notify_waiters();
    }
}

/// Visitor to extract the message field from a record.
#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        }
    }
}
