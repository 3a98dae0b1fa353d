//! TCP line-JSON server
//!
//! One task per connection: a reader loop parses line-delimited requests
//! and a writer task drains the connection's outbound queue, so event
//! streaming and responses share one ordered pipe per client. Sessions
//! opened on a connection are released when it disconnects.

use crate::api::{self, ConnHandle};
use crate::proto::{self, ProtoError};
use crate::state::Daemon;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, info, warn};

pub async fn serve(daemon: Arc<Daemon>, listener: TcpListener) -> anyhow::Result<()> {
    tokio::spawn(crate::broadcast::run(Arc::clone(&daemon)));
    tokio::spawn(crate::clock::run(Arc::clone(&daemon)));
    tokio::spawn(keepalive_sweeper(Arc::clone(&daemon)));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = accepted?;
                debug!(%peer, "client connected");
                let daemon = Arc::clone(&daemon);
                tokio::spawn(async move {
                    handle_connection(daemon, socket).await;
                    debug!(%peer, "client disconnected");
                });
            }
            _ = daemon.shutdown.notified() => {
                info!("accept loop stopping");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(daemon: Arc<Daemon>, socket: TcpStream) {
    let (read_half, mut write_half) = socket.into_split();
    let (tx, mut rx) = unbounded_channel::<String>();
    let conn = ConnHandle::new(tx);

    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if write_half.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = tokio::select! {
            l = lines.next_line() => l,
            _ = daemon.shutdown.notified() => break,
        };
        let line = match line {
            Ok(Some(l)) => l,
            Ok(None) | Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let response = match proto::parse_request(&line) {
            Ok(req) => match api::dispatch(&daemon, req, &conn).await {
                Ok(fields) => proto::ok_line(fields),
                Err(code) => proto::err_line(&code),
            },
            Err(e @ ProtoError::Malformed(_)) => {
                warn!("malformed request: {e}");
                proto::err_line(&e.wire_code())
            }
            Err(e) => proto::err_line(&e.wire_code()),
        };
        if conn.tx.send(response).is_err() {
            break;
        }
        daemon.events_notify.notify_waiters();
    }

    // Transport disconnect releases this connection's sessions and locks.
    let opened = conn.take_sessions();
    if !opened.is_empty() {
        let mut sessions = daemon.sessions.lock().await;
        for id in opened {
            sessions.close(&id);
        }
    }
    drop(conn);
    let _ = writer.await;
}

/// Expire sessions whose keepalive lapsed.
async fn keepalive_sweeper(daemon: Arc<Daemon>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = daemon.shutdown.notified() => return,
        }
        let dead = {
            let mut sessions = daemon.sessions.lock().await;
            sessions.expire(std::time::Instant::now())
        };
        for id in dead {
            info!(session = %id, "session expired");
        }
    }
}
