//! Synthetic reading generator.
//!
//! Every interval, each active session gets a fresh random temperature. The
//! reading becomes the session's latest value and is queued for storage.

use crate::context::GatewayContext;
use rand::Rng;
use std::sync::Arc;
use thermgate_protocol::{Reading, SensorId};

pub struct Sampler {
    ctx: Arc<GatewayContext>,
}

impl Sampler {
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        Self { ctx }
    }

    /// Records `temperature` for `sensor_id` and queues it for storage.
    /// Returns `None` when the sensor has already left the table.
    pub fn record(&self, sensor_id: SensorId, temperature: f32) -> Option<Reading> {
        let reading = Reading::now(sensor_id, temperature);
        if !self.ctx.table.update_reading(sensor_id, reading) {
            return None;
        }
        self.ctx.storage.enqueue(reading);
        self.ctx.with_metrics(|m| m.readings_enqueued_total.inc());
        Some(reading)
    }

    /// Samples every active session once. Returns how many readings were
    /// queued.
    pub fn sample_once<R: Rng>(&self, rng: &mut R) -> usize {
        let range = self.ctx.config.sampler.min_celsius..self.ctx.config.sampler.max_celsius;
        self.ctx
            .table
            .active_sensor_ids()
            .into_iter()
            .filter_map(|id| self.record(id, rng.gen_range(range.clone()) as f32))
            .count()
    }

    pub async fn run(&self) {
        let config = &self.ctx.config.sampler;
        if !config.enabled {
            tracing::info!("Sampler is disabled");
            return;
        }
        tracing::info!("Sampler started (interval={:?})", config.interval());

        while !self.ctx.stop.is_stopped() {
            let sampled = self.sample_once(&mut rand::thread_rng());
            if sampled > 0 {
                tracing::debug!("Sampled {} sensors", sampled);
            }
            tokio::select! {
                _ = tokio::time::sleep(config.interval()) => {}
                _ = self.ctx.stop.wait() => {}
            }
        }

        tracing::info!("Sampler stopped");
    }
}
