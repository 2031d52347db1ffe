//! Heartbeat monitor: evicts silent connections and pings the rest.
//!
//! Runs every `realtime.heartbeat_interval_secs` (30 s by default). A
//! connection whose `last_seen` is older than `realtime.liveness_timeout_secs`
//! (300 s) is torn down with "going away"; every other connection gets a
//! WebSocket ping whose pong refreshes `last_seen`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::ws::Message;
use tokio::task::JoinHandle;

use crate::ws::registry::{CloseReason, ConnectionRegistry, SendError};
use crate::AppState;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    pub pinged: usize,
}

pub fn start(state: Arc<AppState>) -> JoinHandle<()> {
    let every = Duration::from_secs(state.config.realtime.heartbeat_interval_secs.max(1));
    let timeout = Duration::from_secs(state.config.realtime.liveness_timeout_secs);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            "Heartbeat monitor started (every {}s, timeout {}s)",
            every.as_secs(),
            timeout.as_secs()
        );

        loop {
            interval.tick().await;
            let report = sweep(&state.registry, Instant::now(), timeout);
            if report.evicted > 0 {
                tracing::info!(
                    evicted = report.evicted,
                    pinged = report.pinged,
                    "Heartbeat monitor: evicted stale connections"
                );
            }
        }
    })
}

/// One pass over the registry as of `now`.
pub fn sweep(registry: &ConnectionRegistry, now: Instant, timeout: Duration) -> SweepReport {
    let mut report = SweepReport::default();

    for conn in registry.snapshot() {
        let silent_for = now.saturating_duration_since(conn.last_seen());
        if silent_for > timeout {
            if registry.teardown(&conn, CloseReason::HeartbeatTimeout) {
                tracing::info!(
                    connection_id = %conn.id,
                    session_id = %conn.session_id,
                    silent_secs = silent_for.as_secs(),
                    "Evicting silent connection"
                );
                report.evicted += 1;
            }
            continue;
        }

        match conn.send(Message::Ping(Bytes::new())) {
            Ok(()) => report.pinged += 1,
            Err(SendError::Full) => {
                registry.teardown(&conn, CloseReason::SlowConsumer);
            }
            Err(SendError::Closed) => {
                registry.teardown(&conn, CloseReason::TransportError);
            }
        }
    }

    report
}
