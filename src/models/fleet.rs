use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::alert::Alert;

// ─── Roster ──────────────────────────────────────────────────────────────────

/// One installation in the fleet. Immutable for the lifetime of a simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub name: String,
    /// Installed nameplate capacity (kWp)
    pub capacity_kwp: f64,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub district: String,
    /// Free-form classification, e.g. "Public High School"
    #[serde(default)]
    pub classification: String,
}

impl Site {
    pub fn new(id: impl Into<String>, name: impl Into<String>, capacity_kwp: f64) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capacity_kwp,
            latitude: 0.0,
            longitude: 0.0,
            district: String::new(),
            classification: String::new(),
        }
    }
}

// ─── Enumerations ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Weather {
    Sunny,
    PartlyCloudy,
    Cloudy,
    Rainy,
}

impl Weather {
    pub const ALL: [Weather; 4] = [
        Weather::Sunny,
        Weather::PartlyCloudy,
        Weather::Cloudy,
        Weather::Rainy,
    ];

    /// Fraction of standard irradiance reaching the array under this sky.
    pub fn irradiance_factor(self) -> f64 {
        match self {
            Weather::Sunny => 0.95,
            Weather::PartlyCloudy => 0.75,
            Weather::Cloudy => 0.45,
            Weather::Rainy => 0.15,
        }
    }
}

/// Operational state of a site. The state machine lives in the `fault` field;
/// there is no per-state type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FaultStatus {
    #[serde(rename = "none")]
    Nominal,
    #[serde(rename = "underperf")]
    Underperforming,
    #[serde(rename = "comm_down")]
    CommDown,
    #[serde(rename = "ground_fault")]
    GroundFault,
    #[serde(rename = "arc_fault")]
    ArcFault,
}

impl FaultStatus {
    pub fn is_nominal(self) -> bool {
        self == FaultStatus::Nominal
    }

    /// Faults that trip the inverter off entirely.
    pub fn is_outage(self) -> bool {
        matches!(self, FaultStatus::GroundFault | FaultStatus::ArcFault)
    }

    pub fn code(self) -> &'static str {
        match self {
            FaultStatus::Nominal => "none",
            FaultStatus::Underperforming => "underperf",
            FaultStatus::CommDown => "comm_down",
            FaultStatus::GroundFault => "ground_fault",
            FaultStatus::ArcFault => "arc_fault",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            FaultStatus::Nominal => "System Nominal",
            FaultStatus::Underperforming => "Underperformance (PR < 70%)",
            FaultStatus::CommDown => "Gateway Offline",
            FaultStatus::GroundFault => "Ground Fault Protection",
            FaultStatus::ArcFault => "DC Arc Detected",
        }
    }
}

impl fmt::Display for FaultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

// ─── Telemetry ───────────────────────────────────────────────────────────────

/// What a site reports for one tick. Built once, never edited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub site_id: String,
    pub timestamp: DateTime<Utc>,

    // ── AC output ────────────────────────────────────────────────────────────
    /// AC active power (kW)
    pub ac_power_kw: f64,
    pub ac_voltage_v: f64,
    pub ac_current_a: f64,
    /// Inverter conversion efficiency (%)
    pub efficiency_percent: f64,

    // ── Environment ──────────────────────────────────────────────────────────
    /// Plane-of-array irradiance (W/m²)
    pub irradiance_wm2: f64,
    pub panel_temp_c: f64,
    pub weather: Weather,

    // ── Energy counters ──────────────────────────────────────────────────────
    pub daily_energy_kwh: f64,
    pub lifetime_energy_kwh: f64,

    // ── Site balance ─────────────────────────────────────────────────────────
    pub load_kw: f64,
    pub grid_import_kw: f64,
    pub grid_export_kw: f64,
    pub self_consumption_percent: f64,

    // ── KPIs / status ────────────────────────────────────────────────────────
    /// Live performance ratio (%)
    pub performance_ratio: f64,
    pub fault: FaultStatus,
}

impl TelemetrySample {
    /// Reading published before a site has produced its first tick.
    pub fn idle(site_id: &str, timestamp: DateTime<Utc>, lifetime_energy_kwh: f64, efficiency_percent: f64) -> Self {
        Self {
            site_id: site_id.to_string(),
            timestamp,
            ac_power_kw: 0.0,
            ac_voltage_v: 230.0,
            ac_current_a: 0.0,
            efficiency_percent,
            irradiance_wm2: 0.0,
            panel_temp_c: 25.0,
            weather: Weather::Sunny,
            daily_energy_kwh: 0.0,
            lifetime_energy_kwh,
            load_kw: 0.0,
            grid_import_kw: 0.0,
            grid_export_kw: 0.0,
            self_consumption_percent: 0.0,
            performance_ratio: 0.0,
            fault: FaultStatus::Nominal,
        }
    }
}

// ─── Runtime state ───────────────────────────────────────────────────────────

/// Continuity state carried from one tick to the next for a single site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRuntimeState {
    pub site_id: String,
    pub fault: FaultStatus,
    pub weather: Weather,
    /// Never reset; grows monotonically
    pub daily_energy_kwh: f64,
    pub lifetime_energy_kwh: f64,
    pub last_tick: DateTime<Utc>,
    /// Last reading reported; replayed while the gateway is offline
    pub last_sample: TelemetrySample,
}

/// Arena of site states keyed by site id, plus the open alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub timestamp: DateTime<Utc>,
    pub tick: u64,
    pub sites: BTreeMap<String, SiteRuntimeState>,
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

// ─── Aggregates ──────────────────────────────────────────────────────────────

/// Peer-to-peer sharing potential across the fleet for one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommunityStats {
    pub total_surplus_kw: f64,
    pub total_deficit_kw: f64,
    /// Positive when the fleet exports on balance
    pub net_grid_flow_kw: f64,
    pub active_peers: usize,
    pub sharing_potential: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetAggregates {
    pub community: CommunityStats,
    pub total_ac_power_kw: f64,
    pub total_capacity_kwp: f64,
    pub total_daily_energy_kwh: f64,
    pub total_lifetime_energy_kwh: f64,
    /// Mean live PR across reporting sites (%)
    pub fleet_performance_ratio: f64,
    pub sites_online: usize,
    pub sites_faulted: usize,
    pub sites_total: usize,
}
