//! Periodic driver: owns the clock, the live snapshot and the hand-off to
//! the publisher and persistence gateways.
//!
//! A tick is applied in full before anything else happens. Publishing and
//! saving run on their own tasks so a slow broker or disk never delays the
//! next tick.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::models::fleet::FleetSnapshot;
use crate::services::fleet::FleetSimulator;
use crate::services::persistence::SnapshotStore;
use crate::services::publisher::{AlertBacklog, StreamPublisher, TelemetryBatch, publish_batch};
use crate::shared_state::AppState;

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub tick_interval: Duration,
    pub flush_every_ticks: u64,
    /// Batches buffered ahead of the publisher before new ones are dropped
    pub channel_capacity: usize,
}

impl DriverSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            tick_interval: Duration::from_millis(cfg.simulation.tick_interval_ms),
            flush_every_ticks: cfg.persistence.flush_every_ticks.max(1),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

pub struct Driver {
    simulator: FleetSimulator,
    publisher: Arc<dyn StreamPublisher>,
    store: Arc<dyn SnapshotStore>,
    state: AppState,
    settings: DriverSettings,
}

impl Driver {
    pub fn new(
        simulator: FleetSimulator,
        publisher: Arc<dyn StreamPublisher>,
        store: Arc<dyn SnapshotStore>,
        state: AppState,
        settings: DriverSettings,
    ) -> Self {
        Self { simulator, publisher, store, state, settings }
    }

    /// Ticks until `shutdown` resolves, then drains the publisher and saves
    /// once more. Returns the final snapshot.
    ///
    /// An invalid snapshot is fatal; publish and save failures are not.
    pub async fn run<R, F>(self, initial: FleetSnapshot, mut rng: R, shutdown: F) -> Result<FleetSnapshot>
    where
        R: Rng,
        F: Future<Output = ()>,
    {
        let (tx, mut rx) = mpsc::channel::<TelemetryBatch>(self.settings.channel_capacity.max(1));
        let publisher = Arc::clone(&self.publisher);
        let publisher_task = tokio::spawn(async move {
            let mut backlog = AlertBacklog::default();
            while let Some(batch) = rx.recv().await {
                let sent = publish_batch(publisher.as_ref(), &batch, &mut backlog).await;
                debug!(tick = batch.tick, sent, "batch published");
            }
            if let Err(e) = backlog.flush(publisher.as_ref()).await {
                warn!(lost = backlog.len(), error = %e, "alert changes not delivered before shutdown");
            }
        });

        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending_save: Option<JoinHandle<()>> = None;
        // Last batch refused by a full channel while it carried alert changes.
        let mut dropped: Option<TelemetryBatch> = None;
        let mut snapshot = initial;
        tokio::pin!(shutdown);

        info!(
            sites = self.simulator.sites().len(),
            tick = snapshot.tick,
            interval_ms = self.settings.tick_interval.as_millis() as u64,
            "driver started"
        );

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }

            let outcome = match self.simulator.tick(&snapshot, &mut rng) {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "tick failed, stopping driver");
                    return Err(e);
                }
            };
            let mut batch = TelemetryBatch::from(&outcome);
            snapshot = outcome.snapshot;
            self.state.set_latest(&batch);
            if let Some(earlier) = dropped.take() {
                let mut changes = earlier.alert_changes;
                changes.append(&mut batch.alert_changes);
                batch.alert_changes = changes;
            }

            match tx.try_send(batch) {
                Ok(()) => {}
                Err(TrySendError::Full(batch)) => {
                    warn!(tick = batch.tick, "publisher lagging, batch dropped");
                    if !batch.alert_changes.is_empty() {
                        dropped = Some(batch);
                    }
                }
                Err(TrySendError::Closed(_)) => {
                    warn!("publisher task gone");
                }
            }

            if snapshot.tick % self.settings.flush_every_ticks == 0 {
                if pending_save.as_ref().is_some_and(|h| !h.is_finished()) {
                    debug!(tick = snapshot.tick, "previous save still running, skipping flush");
                } else {
                    pending_save = Some(self.spawn_save(snapshot.clone()));
                }
            }
        }

        if let Some(batch) = dropped.take() {
            if tx.send(batch).await.is_err() {
                warn!("publisher task gone, held alert changes lost");
            }
        }
        drop(tx);
        if let Err(e) = publisher_task.await {
            warn!(error = %e, "publisher task ended abnormally");
        }
        if let Some(handle) = pending_save {
            if let Err(e) = handle.await {
                warn!(error = %e, "save task ended abnormally");
            }
        }
        match self.store.save(&snapshot).await {
            Ok(()) => info!(tick = snapshot.tick, "final snapshot saved"),
            Err(e) => warn!(error = %e, "final snapshot not saved"),
        }
        self.publisher.close().await;

        Ok(snapshot)
    }

    fn spawn_save(&self, snapshot: FleetSnapshot) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            match store.save(&snapshot).await {
                Ok(()) => debug!(tick = snapshot.tick, "snapshot flushed"),
                Err(e) => warn!(tick = snapshot.tick, error = %e, "snapshot flush failed"),
            }
        })
    }
}
