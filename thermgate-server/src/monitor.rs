//! Temperature threshold monitor.
//!
//! Keeps a short history of readings per sensor and warns when the running
//! average leaves the configured band.

use crate::config::MonitorConfig;
use crate::context::GatewayContext;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thermgate_protocol::{Reading, SensorId};

/// A sensor whose running average crossed a threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Alert {
    Overheating { sensor_id: SensorId, average: f32 },
    Overcooling { sensor_id: SensorId, average: f32 },
}

#[derive(Debug, Default)]
struct History {
    samples: VecDeque<f32>,
    /// Timestamp of the newest sample, so a reading is only counted once.
    last_seen: Option<i64>,
}

impl History {
    fn push(&mut self, reading: &Reading, capacity: usize) -> bool {
        if self.last_seen == Some(reading.timestamp) {
            return false;
        }
        if self.samples.len() == capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(reading.temperature);
        self.last_seen = Some(reading.timestamp);
        true
    }

    fn average(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f32>() / self.samples.len() as f32
    }
}

pub struct ThresholdMonitor {
    ctx: Arc<GatewayContext>,
    histories: Mutex<HashMap<SensorId, History>>,
}

impl ThresholdMonitor {
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        Self {
            ctx,
            histories: Mutex::new(HashMap::new()),
        }
    }

    fn config(&self) -> &MonitorConfig {
        &self.ctx.config.monitor
    }

    /// Folds each active sensor's latest valid reading into its history and
    /// returns the sensors outside the band.
    pub fn check(&self) -> Vec<Alert> {
        let sessions = self.ctx.table.snapshot_for_display();
        let config = self.config();
        let mut histories = self.histories.lock();
        histories.retain(|id, _| sessions.iter().any(|s| s.sensor_id == *id));

        let mut alerts = Vec::new();
        for session in sessions.iter().filter(|s| s.active && s.latest.valid) {
            let history = histories.entry(session.sensor_id).or_default();
            history.push(&session.latest, config.history_size);

            let average = history.average();
            if average > config.hot_threshold {
                alerts.push(Alert::Overheating {
                    sensor_id: session.sensor_id,
                    average,
                });
            } else if average < config.cold_threshold {
                alerts.push(Alert::Overcooling {
                    sensor_id: session.sensor_id,
                    average,
                });
            }
        }
        alerts
    }

    pub async fn run(&self) {
        let config = self.config();
        if !config.enabled {
            tracing::info!("Threshold monitor is disabled");
            return;
        }
        tracing::info!(
            "Threshold monitor started (hot={:.1}, cold={:.1})",
            config.hot_threshold,
            config.cold_threshold
        );

        while !self.ctx.stop.is_stopped() {
            for alert in self.check() {
                match alert {
                    Alert::Overheating { sensor_id, average } => tracing::warn!(
                        "Sensor {} reports overheating (avg temp: {:.1})",
                        sensor_id,
                        average
                    ),
                    Alert::Overcooling { sensor_id, average } => tracing::warn!(
                        "Sensor {} reports overcooling (avg temp: {:.1})",
                        sensor_id,
                        average
                    ),
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(config.interval()) => {}
                _ = self.ctx.stop.wait() => {}
            }
        }

        tracing::info!("Threshold monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::plain_context;
    use crate::session::{link, LinkWatch, Session};
    use tempfile::TempDir;

    fn add_sensor(ctx: &GatewayContext, port: u16) -> (SensorId, LinkWatch) {
        let (handle, watch) = link();
        let id = ctx
            .table
            .insert(Session::new("10.0.0.1", "10.0.0.1", port, false, handle))
            .unwrap();
        (id, watch)
    }

    #[tokio::test]
    async fn test_alerts_follow_running_average() {
        let dir = TempDir::new().unwrap();
        let ctx = plain_context(dir.path(), |_| {});
        let monitor = ThresholdMonitor::new(ctx.clone());
        let (hot, _w1) = add_sensor(&ctx, 9000);
        let (cold, _w2) = add_sensor(&ctx, 9001);
        let (mild, _w3) = add_sensor(&ctx, 9002);

        // Sessions without a real reading are skipped.
        assert!(monitor.check().is_empty());

        ctx.table.update_reading(hot, Reading::at(1, hot, 60.0));
        ctx.table.update_reading(cold, Reading::at(1, cold, 5.0));
        ctx.table.update_reading(mild, Reading::at(1, mild, 25.0));

        let alerts = monitor.check();
        assert_eq!(alerts.len(), 2);
        assert!(alerts.contains(&Alert::Overheating {
            sensor_id: hot,
            average: 60.0
        }));
        assert!(alerts.contains(&Alert::Overcooling {
            sensor_id: cold,
            average: 5.0
        }));
    }

    #[tokio::test]
    async fn test_history_is_bounded_and_deduplicated() {
        let dir = TempDir::new().unwrap();
        let ctx = plain_context(dir.path(), |c| c.monitor.history_size = 5);
        let monitor = ThresholdMonitor::new(ctx.clone());
        let (id, _w) = add_sensor(&ctx, 9000);

        // Five hot readings, then cooler ones push them out of the window.
        for ts in 0..5 {
            ctx.table.update_reading(id, Reading::at(ts, id, 70.0));
            monitor.check();
        }
        // Re-checking the same reading does not count it twice.
        assert_eq!(monitor.check().len(), 1);

        for ts in 5..9 {
            ctx.table.update_reading(id, Reading::at(ts, id, 20.0));
            monitor.check();
        }
        // Window is now [70, 20, 20, 20, 20] = 30.0
        assert!(monitor.check().is_empty());
        assert_eq!(monitor.histories.lock()[&id].samples.len(), 5);
    }

    #[tokio::test]
    async fn test_departed_sensor_history_dropped() {
        let dir = TempDir::new().unwrap();
        let ctx = plain_context(dir.path(), |_| {});
        let monitor = ThresholdMonitor::new(ctx.clone());
        let (id, _w) = add_sensor(&ctx, 9000);
        ctx.table.update_reading(id, Reading::at(1, id, 30.0));
        monitor.check();
        assert!(monitor.histories.lock().contains_key(&id));

        ctx.table.remove(id);
        monitor.check();
        assert!(monitor.histories.lock().is_empty());
    }
}
