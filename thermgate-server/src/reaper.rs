//! Idle session reaper.

use crate::context::GatewayContext;
use crate::session::SessionInfo;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Periodically evicts sessions that have been idle past the timeout.
pub struct Reaper {
    ctx: Arc<GatewayContext>,
    interval: Duration,
    timeout: Duration,
}

impl Reaper {
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        let interval = ctx.config.session.reap_interval();
        let timeout = ctx.config.session.idle_timeout();
        Self {
            ctx,
            interval,
            timeout,
        }
    }

    /// Runs one sweep. The table lock is only held while unlinking.
    pub fn sweep(&self) -> Vec<SessionInfo> {
        let reaped = self.ctx.table.reap_idle(Instant::now(), self.timeout);
        for session in &reaped {
            tracing::info!(
                "[TIMEOUT] Sensor ID {} disconnected due to inactivity",
                session.sensor_id
            );
            tracing::info!(
                "A sensor node with {} has closed the connection",
                session.sensor_id
            );
        }

        if !reaped.is_empty() {
            self.ctx.with_metrics(|m| {
                m.sessions_reaped_total.inc_by(reaped.len() as f64);
                m.sessions_active
                    .set(f64::from(self.ctx.table.active_count()));
            });
        }
        reaped
    }

    /// Sweeps every interval until the stop signal is raised.
    pub async fn run(&self) {
        tracing::info!(
            "Reaper started (interval={:?}, idle_timeout={:?})",
            self.interval,
            self.timeout
        );

        while !self.ctx.stop.is_stopped() {
            self.sweep();
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.ctx.stop.wait() => {}
            }
        }

        tracing::info!("Reaper stopped");
    }
}
