use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::services::publisher::TelemetryBatch;

#[derive(Clone, Debug, Default)]
pub struct AppState {
    /// Most recent tick output, replaced wholesale every tick
    pub latest: Arc<RwLock<Option<TelemetryBatch>>>,
    /// Broker session up; maintained by the MQTT event loop
    pub publisher_connected: Arc<AtomicBool>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_latest(&self, batch: &TelemetryBatch) {
        if let Ok(mut latest) = self.latest.write() {
            *latest = Some(batch.clone());
        }
    }

    pub fn latest(&self) -> Option<TelemetryBatch> {
        self.latest.read().ok().and_then(|latest| latest.clone())
    }

    pub fn is_publisher_connected(&self) -> bool {
        self.publisher_connected.load(Ordering::Relaxed)
    }

    pub fn set_publisher_connected(&self, value: bool) {
        self.publisher_connected.store(value, Ordering::Relaxed);
    }
}
