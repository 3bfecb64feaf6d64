//! Raise/retract incidents from per-tick fault states.
//!
//! At most one open alert exists per (site, fault). Retraction needs both a
//! cleared fault and a recovered performance ratio, so a site hovering at
//! the edge does not flap.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::models::alert::{Alert, AlertChange, AlertSeverity};
use crate::models::fleet::{FaultStatus, Site, TelemetrySample};

/// Live PR (%) a site must reach before its alerts clear.
pub const PR_WARNING_THRESHOLD: f64 = 78.0;
/// Live PR (%) considered a critical shortfall.
pub const PR_CRITICAL_THRESHOLD: f64 = 70.0;

#[derive(Debug, Clone, PartialEq)]
pub struct AlertReconciliation {
    pub active: Vec<Alert>,
    pub changes: Vec<AlertChange>,
}

#[derive(Debug, Clone, Copy)]
pub struct AlertLifecycleManager {
    pr_warning: f64,
}

impl Default for AlertLifecycleManager {
    fn default() -> Self {
        Self { pr_warning: PR_WARNING_THRESHOLD }
    }
}

impl AlertLifecycleManager {
    /// Retracts first, then raises, against the samples of one tick.
    /// Alerts for sites absent from `samples` are kept as they are.
    pub fn reconcile(
        &self,
        previous: &[Alert],
        samples: &[TelemetrySample],
        sites: &[Site],
        now: DateTime<Utc>,
    ) -> AlertReconciliation {
        let latest: HashMap<&str, &TelemetrySample> =
            samples.iter().map(|s| (s.site_id.as_str(), s)).collect();
        let mut changes = Vec::new();

        let mut active = Vec::with_capacity(previous.len());
        for alert in previous {
            match latest.get(alert.site_id.as_str()) {
                Some(sample) if self.has_recovered(sample) => {
                    info!(site_id = %alert.site_id, fault = %alert.fault, "alert retracted");
                    changes.push(AlertChange::Retracted(alert.clone()));
                }
                _ => active.push(alert.clone()),
            }
        }

        for sample in samples {
            let site_name = match sites.iter().find(|s| s.id == sample.site_id) {
                Some(site) => site.name.as_str(),
                None => {
                    warn!(site_id = %sample.site_id, "sample for site outside roster");
                    "Unknown"
                }
            };
            if let Some(alert) = self.raise(&mut active, &sample.site_id, site_name, sample.fault, now) {
                changes.push(AlertChange::Raised(alert));
            }
        }

        AlertReconciliation { active, changes }
    }

    /// Opens an alert unless the fault is nominal or one is already open for
    /// the same (site, fault). Returns the new alert, if any.
    pub fn raise(
        &self,
        alerts: &mut Vec<Alert>,
        site_id: &str,
        site_name: &str,
        fault: FaultStatus,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        if fault.is_nominal() || alerts.iter().any(|a| a.site_id == site_id && a.fault == fault) {
            return None;
        }
        let alert = Alert {
            id: format!("alert-{}-{}-{}", site_id, fault.code(), now.timestamp_millis()),
            site_id: site_id.to_string(),
            site_name: site_name.to_string(),
            fault,
            severity: AlertSeverity::for_fault(fault),
            message: fault.label().to_string(),
            timestamp: now,
        };
        warn!(
            site_id = %site_id,
            fault = %fault,
            severity = ?alert.severity,
            "alert raised: {}", alert.message
        );
        alerts.push(alert.clone());
        Some(alert)
    }

    fn has_recovered(&self, sample: &TelemetrySample) -> bool {
        sample.fault.is_nominal() && sample.performance_ratio >= self.pr_warning
    }
}
