//! Outbound stream of telemetry, alert changes and fleet summaries.
//!
//! Publishing is fire-and-forget from the simulator's side. A failed sample
//! publish drops the rest of that tick's samples; alert changes are held and
//! retried ahead of the next batch, since each one is sent exactly once.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::alert::AlertChange;
use crate::models::fleet::{FleetAggregates, TelemetrySample};
use crate::services::fleet::TickOutcome;

#[async_trait]
pub trait StreamPublisher: Send + Sync {
    async fn publish_telemetry(&self, sample: &TelemetrySample) -> Result<()>;
    async fn publish_alert(&self, change: &AlertChange) -> Result<()>;
    async fn publish_summary(&self, summary: &FleetSummary) -> Result<()>;

    /// Called once when the driver stops.
    async fn close(&self) {}
}

/// Payload of the fleet-wide summary topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetSummary {
    pub tick: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub aggregates: FleetAggregates,
}

/// One tick's worth of outbound messages, handed from the driver to the
/// publisher task.
#[derive(Debug, Clone)]
pub struct TelemetryBatch {
    pub tick: u64,
    pub timestamp: DateTime<Utc>,
    pub samples: Vec<TelemetrySample>,
    pub aggregates: FleetAggregates,
    pub alert_changes: Vec<AlertChange>,
}

impl From<&TickOutcome> for TelemetryBatch {
    fn from(outcome: &TickOutcome) -> Self {
        Self {
            tick: outcome.snapshot.tick,
            timestamp: outcome.snapshot.timestamp,
            samples: outcome.samples.clone(),
            aggregates: outcome.aggregates.clone(),
            alert_changes: outcome.alert_changes.clone(),
        }
    }
}

impl TelemetryBatch {
    pub fn summary(&self) -> FleetSummary {
        FleetSummary {
            tick: self.tick,
            timestamp: self.timestamp,
            aggregates: self.aggregates.clone(),
        }
    }
}

/// Beyond this many held changes the oldest are discarded.
const MAX_ALERT_BACKLOG: usize = 1024;

/// Alert changes not yet accepted by the publisher, oldest first.
#[derive(Debug, Default)]
pub struct AlertBacklog {
    pending: VecDeque<AlertChange>,
}

impl AlertBacklog {
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn push(&mut self, changes: impl IntoIterator<Item = AlertChange>) {
        self.pending.extend(changes);
        while self.pending.len() > MAX_ALERT_BACKLOG {
            if let Some(lost) = self.pending.pop_front() {
                warn!(id = %lost.alert().id, "alert backlog full, oldest change discarded");
            }
        }
    }

    /// Sends pending changes in order, stopping at the first failure. What
    /// was not sent stays queued.
    pub async fn flush(&mut self, publisher: &dyn StreamPublisher) -> Result<()> {
        while let Some(change) = self.pending.front() {
            publisher.publish_alert(change).await?;
            self.pending.pop_front();
        }
        Ok(())
    }
}

/// Sends a batch in order: alert changes (backlog first), samples, then the
/// summary. Returns how many messages went out.
pub async fn publish_batch(
    publisher: &dyn StreamPublisher,
    batch: &TelemetryBatch,
    backlog: &mut AlertBacklog,
) -> usize {
    backlog.push(batch.alert_changes.iter().cloned());
    let queued = backlog.len();
    let flushed = backlog.flush(publisher).await;
    let mut sent = queued - backlog.len();
    if let Err(e) = flushed {
        warn!(tick = batch.tick, held = backlog.len(), error = %e, "alert changes held for retry, samples dropped");
        return sent;
    }

    for sample in &batch.samples {
        if let Err(e) = publisher.publish_telemetry(sample).await {
            warn!(tick = batch.tick, site_id = %sample.site_id, error = %e, "dropping remainder of batch");
            return sent;
        }
        sent += 1;
    }
    match publisher.publish_summary(&batch.summary()).await {
        Ok(()) => sent + 1,
        Err(e) => {
            warn!(tick = batch.tick, error = %e, "summary not published");
            sent
        }
    }
}

/// Used when no broker is configured: everything goes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

#[async_trait]
impl StreamPublisher for LogPublisher {
    async fn publish_telemetry(&self, s: &TelemetrySample) -> Result<()> {
        if cfg!(feature = "verbose_log") {
            info!(
                site_id = %s.site_id,
                fault = %s.fault,
                "AC {:.2} kW | {:.1} V | {:.2} A | PR {:.1}% | load {:.2} kW",
                s.ac_power_kw, s.ac_voltage_v, s.ac_current_a, s.performance_ratio, s.load_kw
            );
        } else {
            debug!(site_id = %s.site_id, ac_power_kw = s.ac_power_kw, fault = %s.fault, "telemetry");
        }
        Ok(())
    }

    async fn publish_alert(&self, change: &AlertChange) -> Result<()> {
        let alert = change.alert();
        match change {
            AlertChange::Raised(_) => info!(id = %alert.id, site_id = %alert.site_id, "alert raised"),
            AlertChange::Retracted(_) => info!(id = %alert.id, site_id = %alert.site_id, "alert retracted"),
        }
        Ok(())
    }

    async fn publish_summary(&self, summary: &FleetSummary) -> Result<()> {
        let agg = &summary.aggregates;
        debug!(
            tick = summary.tick,
            total_ac_power_kw = agg.total_ac_power_kw,
            sites_online = agg.sites_online,
            sites_faulted = agg.sites_faulted,
            net_grid_flow_kw = agg.community.net_grid_flow_kw,
            "fleet summary"
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::error::SimError;

    /// Captures everything it is given; can be switched offline.
    #[derive(Default)]
    pub struct RecordingPublisher {
        pub samples: Mutex<Vec<TelemetrySample>>,
        pub alerts: Mutex<Vec<AlertChange>>,
        pub summaries: Mutex<Vec<FleetSummary>>,
        pub offline: AtomicBool,
        pub closed: AtomicBool,
    }

    impl RecordingPublisher {
        pub fn offline() -> Self {
            let p = Self::default();
            p.offline.store(true, Ordering::Relaxed);
            p
        }

        fn check(&self) -> Result<()> {
            if self.offline.load(Ordering::Relaxed) {
                return Err(SimError::PublishUnavailable("test broker offline".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl StreamPublisher for RecordingPublisher {
        async fn publish_telemetry(&self, sample: &TelemetrySample) -> Result<()> {
            self.check()?;
            self.samples.lock().unwrap().push(sample.clone());
            Ok(())
        }

        async fn publish_alert(&self, change: &AlertChange) -> Result<()> {
            self.check()?;
            self.alerts.lock().unwrap().push(change.clone());
            Ok(())
        }

        async fn publish_summary(&self, summary: &FleetSummary) -> Result<()> {
            self.check()?;
            self.summaries.lock().unwrap().push(summary.clone());
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::RecordingPublisher;
    use super::*;
    use crate::config::{EconomicsConfig, SimulationConfig};
    use crate::models::fleet::{FaultStatus, Site};
    use crate::services::fleet::FleetSimulator;
    use chrono::TimeZone;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn batch_with_alert() -> TelemetryBatch {
        let fleet = FleetSimulator::new(
            vec![Site::new("A", "Alpha", 10.0), Site::new("B", "Bravo", 6.0)],
            SimulationConfig::deterministic(),
            &EconomicsConfig::default(),
        )
        .unwrap();
        let mut snap = fleet.initialize(Utc.with_ymd_and_hms(2025, 6, 1, 2, 0, 0).unwrap());
        fleet.force_fault(&mut snap, "A", FaultStatus::GroundFault).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        TelemetryBatch::from(&fleet.tick(&snap, &mut rng).unwrap())
    }

    #[tokio::test]
    async fn test_publish_batch_sends_everything() {
        let publisher = RecordingPublisher::default();
        let batch = batch_with_alert();
        let mut backlog = AlertBacklog::default();
        let sent = publish_batch(&publisher, &batch, &mut backlog).await;

        assert_eq!(sent, 1 + 2 + 1);
        assert_eq!(publisher.alerts.lock().unwrap().len(), 1);
        assert_eq!(publisher.samples.lock().unwrap().len(), 2);
        let summaries = publisher.summaries.lock().unwrap();
        assert_eq!(summaries[0].tick, 1);
        assert_eq!(summaries[0].aggregates.sites_faulted, 1);
    }

    #[tokio::test]
    async fn test_offline_publisher_drops_batch() {
        let publisher = RecordingPublisher::offline();
        let mut backlog = AlertBacklog::default();
        assert_eq!(publish_batch(&publisher, &batch_with_alert(), &mut backlog).await, 0);
        assert!(publisher.samples.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_alert_raised_during_outage_is_sent_after_recovery() {
        let publisher = RecordingPublisher::offline();
        let mut backlog = AlertBacklog::default();
        let batch = batch_with_alert();
        publish_batch(&publisher, &batch, &mut backlog).await;
        assert_eq!(backlog.len(), 1);

        publisher.offline.store(false, Ordering::Relaxed);
        let quiet = TelemetryBatch { alert_changes: Vec::new(), ..batch.clone() };
        let sent = publish_batch(&publisher, &quiet, &mut backlog).await;

        assert_eq!(sent, 1 + 2 + 1);
        assert!(backlog.is_empty());
        let alerts = publisher.alerts.lock().unwrap();
        assert!(matches!(alerts.as_slice(), [AlertChange::Raised(a)] if a.site_id == "A"));
    }

    #[test]
    fn test_backlog_is_bounded() {
        let change = batch_with_alert().alert_changes[0].clone();
        let mut backlog = AlertBacklog::default();
        backlog.push(std::iter::repeat_n(change, MAX_ALERT_BACKLOG + 6));
        assert_eq!(backlog.len(), MAX_ALERT_BACKLOG);
    }

    #[test]
    fn test_summary_payload_is_flat() {
        let value = serde_json::to_value(batch_with_alert().summary()).unwrap();
        assert_eq!(value["tick"], 1);
        assert!(value.get("total_ac_power_kw").is_some());
        assert!(value["community"].get("net_grid_flow_kw").is_some());
    }
}
