use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fleet::FaultStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn for_fault(fault: FaultStatus) -> Self {
        if fault.is_outage() {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        }
    }
}

/// An open incident. Retraction removes it; alerts are never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub site_id: String,
    pub site_name: String,
    pub fault: FaultStatus,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A single raise or retract, published once per change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", content = "alert", rename_all = "snake_case")]
pub enum AlertChange {
    Raised(Alert),
    Retracted(Alert),
}

impl AlertChange {
    pub fn alert(&self) -> &Alert {
        match self {
            AlertChange::Raised(a) | AlertChange::Retracted(a) => a,
        }
    }
}
