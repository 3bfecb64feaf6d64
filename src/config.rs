use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Result, SimError};
use crate::models::fleet::{FaultStatus, Site};

fn default_tick_interval_ms() -> u64 { 2000 }
fn default_fault_probability() -> f64 { 0.0001 }
fn default_weather_drift_probability() -> f64 { 0.05 }
fn default_irradiance_noise() -> f64 { 0.1 }
fn default_voltage_base() -> f64 { 230.0 }
fn default_voltage_variance() -> f64 { 10.0 }
fn default_load_noise_fraction() -> f64 { 0.2 }
fn default_inverter_efficiency() -> f64 { 0.95 }
fn default_noct() -> f64 { 45.0 }
fn default_temp_coeff() -> f64 { 0.004 }
fn default_ambient_temp_base() -> f64 { 28.0 }

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub economics: EconomicsConfig,
    #[serde(default)]
    pub backtest: BacktestConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default = "default_roster")]
    pub sites: Vec<Site>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            simulation: SimulationConfig::default(),
            economics: EconomicsConfig::default(),
            backtest: BacktestConfig::default(),
            mqtt: MqttConfig::default(),
            persistence: PersistenceConfig::default(),
            sites: default_roster(),
        }
    }
}

/// Physics and stochastic knobs for the live tick path.
///
/// Noise amplitudes are peak-to-peak: a value of `0.1` draws from `[-0.05, 0.05]`.
#[derive(Debug, Deserialize, Clone)]
pub struct SimulationConfig {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_fault_probability")]
    pub fault_probability: f64,
    #[serde(default)]
    pub heal_probability: HealProbabilities,
    #[serde(default = "default_weather_drift_probability")]
    pub weather_drift_probability: f64,
    #[serde(default = "default_irradiance_noise")]
    pub irradiance_noise: f64,
    #[serde(default = "default_voltage_base")]
    pub voltage_base: f64,
    #[serde(default = "default_voltage_variance")]
    pub voltage_variance: f64,
    #[serde(default = "default_load_noise_fraction")]
    pub load_noise_fraction: f64,
    #[serde(default = "default_inverter_efficiency")]
    pub inverter_efficiency: f64,
    #[serde(default = "default_noct")]
    pub noct: f64,
    #[serde(default = "default_temp_coeff")]
    pub temp_coeff: f64,
    #[serde(default = "default_ambient_temp_base")]
    pub ambient_temp_base: f64,
    /// Fixed RNG seed; entropy when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            fault_probability: default_fault_probability(),
            heal_probability: HealProbabilities::default(),
            weather_drift_probability: default_weather_drift_probability(),
            irradiance_noise: default_irradiance_noise(),
            voltage_base: default_voltage_base(),
            voltage_variance: default_voltage_variance(),
            load_noise_fraction: default_load_noise_fraction(),
            inverter_efficiency: default_inverter_efficiency(),
            noct: default_noct(),
            temp_coeff: default_temp_coeff(),
            ambient_temp_base: default_ambient_temp_base(),
            seed: None,
        }
    }
}

/// Longest tick the simulated clock accepts: one day.
pub const MAX_TICK_INTERVAL_MS: u64 = 86_400_000;
/// Longest backtest window, in days.
pub const MAX_BACKTEST_DAYS: u32 = 36_500;

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 || self.tick_interval_ms > MAX_TICK_INTERVAL_MS {
            return Err(invalid(format!(
                "tick_interval_ms must lie in [1, {MAX_TICK_INTERVAL_MS}], got {}",
                self.tick_interval_ms
            )));
        }
        let probabilities = [
            ("fault_probability", self.fault_probability),
            ("weather_drift_probability", self.weather_drift_probability),
        ];
        for (name, p) in probabilities.into_iter().chain(self.heal_probability.all()) {
            if !(0.0..=1.0).contains(&p) {
                return Err(invalid(format!("{name} must lie in [0, 1], got {p}")));
            }
        }
        if !(self.inverter_efficiency > 0.0 && self.inverter_efficiency <= 1.0) {
            return Err(invalid(format!(
                "inverter_efficiency must lie in (0, 1], got {}",
                self.inverter_efficiency
            )));
        }
        non_negative(&[
            ("irradiance_noise", self.irradiance_noise),
            ("voltage_base", self.voltage_base),
            ("voltage_variance", self.voltage_variance),
            ("load_noise_fraction", self.load_noise_fraction),
            ("noct", self.noct),
            ("temp_coeff", self.temp_coeff),
        ])?;
        if !self.ambient_temp_base.is_finite() {
            return Err(invalid(format!("ambient_temp_base must be finite, got {}", self.ambient_temp_base)));
        }
        Ok(())
    }

    pub fn tick_interval_secs(&self) -> f64 {
        self.tick_interval_ms as f64 / 1000.0
    }

    /// Reference physics with every stochastic input switched off.
    pub fn deterministic() -> Self {
        Self {
            fault_probability: 0.0,
            heal_probability: HealProbabilities::never(),
            weather_drift_probability: 0.0,
            irradiance_noise: 0.0,
            voltage_variance: 0.0,
            load_noise_fraction: 0.0,
            ..Self::default()
        }
    }
}

/// Per-tick probability that a faulted site returns to nominal.
#[derive(Debug, Deserialize, Clone)]
pub struct HealProbabilities {
    #[serde(default = "HealProbabilities::default_comm_down")]
    pub comm_down: f64,
    #[serde(default = "HealProbabilities::default_other")]
    pub underperf: f64,
    #[serde(default = "HealProbabilities::default_other")]
    pub ground_fault: f64,
    #[serde(default = "HealProbabilities::default_other")]
    pub arc_fault: f64,
}

impl HealProbabilities {
    fn default_comm_down() -> f64 { 0.3 }
    fn default_other() -> f64 { 0.05 }

    pub fn never() -> Self {
        Self { comm_down: 0.0, underperf: 0.0, ground_fault: 0.0, arc_fault: 0.0 }
    }

    pub fn for_fault(&self, fault: FaultStatus) -> f64 {
        match fault {
            FaultStatus::Nominal => 0.0,
            FaultStatus::CommDown => self.comm_down,
            FaultStatus::Underperforming => self.underperf,
            FaultStatus::GroundFault => self.ground_fault,
            FaultStatus::ArcFault => self.arc_fault,
        }
    }

    fn all(&self) -> [(&'static str, f64); 4] {
        [
            ("heal_probability.comm_down", self.comm_down),
            ("heal_probability.underperf", self.underperf),
            ("heal_probability.ground_fault", self.ground_fault),
            ("heal_probability.arc_fault", self.arc_fault),
        ]
    }
}

impl Default for HealProbabilities {
    fn default() -> Self {
        Self {
            comm_down: Self::default_comm_down(),
            underperf: Self::default_other(),
            ground_fault: Self::default_other(),
            arc_fault: Self::default_other(),
        }
    }
}

fn default_electricity_rate() -> f64 { 1444.7 }
fn default_carbon_intensity() -> f64 { 0.85 }
fn default_capex_per_kwp() -> f64 { 15_000_000.0 }
fn default_sharing_rate() -> f64 { 200.0 }
fn default_lifetime_years() -> f64 { 20.0 }
fn default_lifecycle_cost_factor() -> f64 { 1.2 }

/// Tariff and cost assumptions, in local currency units.
#[derive(Debug, Deserialize, Clone)]
pub struct EconomicsConfig {
    #[serde(default = "default_electricity_rate")]
    pub electricity_rate: f64,
    #[serde(default = "default_carbon_intensity")]
    pub carbon_intensity_kg_per_kwh: f64,
    #[serde(default = "default_capex_per_kwp")]
    pub capex_per_kwp: f64,
    #[serde(default = "default_sharing_rate")]
    pub sharing_rate: f64,
    #[serde(default = "default_lifetime_years")]
    pub lifetime_years: f64,
    #[serde(default = "default_lifecycle_cost_factor")]
    pub lifecycle_cost_factor: f64,
}

impl EconomicsConfig {
    pub fn validate(&self) -> Result<()> {
        non_negative(&[
            ("economics.electricity_rate", self.electricity_rate),
            ("economics.carbon_intensity_kg_per_kwh", self.carbon_intensity_kg_per_kwh),
            ("economics.capex_per_kwp", self.capex_per_kwp),
            ("economics.sharing_rate", self.sharing_rate),
            ("economics.lifetime_years", self.lifetime_years),
            ("economics.lifecycle_cost_factor", self.lifecycle_cost_factor),
        ])
    }
}

impl Default for EconomicsConfig {
    fn default() -> Self {
        Self {
            electricity_rate: default_electricity_rate(),
            carbon_intensity_kg_per_kwh: default_carbon_intensity(),
            capex_per_kwp: default_capex_per_kwp(),
            sharing_rate: default_sharing_rate(),
            lifetime_years: default_lifetime_years(),
            lifecycle_cost_factor: default_lifecycle_cost_factor(),
        }
    }
}

fn default_backtest_days() -> u32 { 365 }
fn default_base_sun_hours() -> f64 { 4.5 }

#[derive(Debug, Deserialize, Clone)]
pub struct BacktestConfig {
    #[serde(default = "default_backtest_days")]
    pub days: u32,
    /// Median daily peak-sun-hours for the region
    #[serde(default = "default_base_sun_hours")]
    pub base_sun_hours: f64,
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<()> {
        if self.days > MAX_BACKTEST_DAYS {
            return Err(invalid(format!("backtest.days must be at most {MAX_BACKTEST_DAYS}, got {}", self.days)));
        }
        non_negative(&[("backtest.base_sun_hours", self.base_sun_hours)])
    }
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self { days: default_backtest_days(), base_sun_hours: default_base_sun_hours() }
    }
}

fn default_mqtt_port() -> u16 { 1883 }
fn default_topic_prefix() -> String { "sites".to_string() }

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub broker_host: String,
    #[serde(default = "default_mqtt_port")]
    pub broker_port: u16,
    #[serde(default)]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            broker_host: String::new(),
            broker_port: default_mqtt_port(),
            client_id: String::new(),
            username: None,
            password: None,
            topic_prefix: default_topic_prefix(),
        }
    }
}

fn default_snapshot_path() -> String { "fleet_snapshot.json".to_string() }
fn default_flush_every_ticks() -> u64 { 15 }
fn default_history_path() -> Option<String> { Some("history.json".to_string()) }

#[derive(Debug, Deserialize, Clone)]
pub struct PersistenceConfig {
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
    #[serde(default = "default_flush_every_ticks")]
    pub flush_every_ticks: u64,
    /// Where the generated backtest is written; `null` disables the write.
    #[serde(default = "default_history_path")]
    pub history_path: Option<String>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            flush_every_ticks: default_flush_every_ticks(),
            history_path: default_history_path(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SimError::InvalidConfiguration(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(content)
            .map_err(|e| SimError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_roster(&self.sites)?;
        self.simulation.validate()?;
        self.economics.validate()?;
        self.backtest.validate()?;
        if self.persistence.flush_every_ticks == 0 {
            return Err(invalid("persistence.flush_every_ticks must be positive"));
        }
        Ok(())
    }
}

/// Rejects rosters the engine cannot simulate.
pub fn validate_roster(sites: &[Site]) -> Result<()> {
    if sites.is_empty() {
        return Err(invalid("site roster is empty"));
    }
    let mut seen = HashSet::new();
    for site in sites {
        if !seen.insert(site.id.as_str()) {
            return Err(invalid(format!("duplicate site id {}", site.id)));
        }
        if !site.capacity_kwp.is_finite() || site.capacity_kwp <= 0.0 {
            return Err(invalid(format!(
                "site {} has invalid capacity {} kWp",
                site.id, site.capacity_kwp
            )));
        }
    }
    Ok(())
}

fn non_negative(values: &[(&str, f64)]) -> Result<()> {
    for (name, v) in values {
        if !v.is_finite() || *v < 0.0 {
            return Err(invalid(format!("{name} must be a non-negative number, got {v}")));
        }
    }
    Ok(())
}

fn invalid(msg: impl Into<String>) -> SimError {
    SimError::InvalidConfiguration(msg.into())
}

/// West Java school roster used when no configuration file is present.
pub fn default_roster() -> Vec<Site> {
    let rows: [(&str, &str, f64, &str, &str); 10] = [
        ("SCH_WJ_003", "SMK PGRI 1 Bandung", 5.5, "Vocational High School", "Bandung City"),
        ("SCH_WJ_004", "SMP Negeri 5 Bandung", 8.0, "Junior High School", "Bandung City"),
        ("SCH_WJ_007", "SMP Negeri 2 Bandung", 6.2, "Junior High School", "Sumur Bandung"),
        ("SCH_WJ_002", "SD Negeri 1 Lembang", 4.5, "Primary School", "West Bandung"),
        ("SCH_WJ_011", "Madrasah Ibtidaiyah 3", 9.0, "Islamic Primary School", "Bandung Regency"),
        ("SCH_WJ_002_HS", "SMA Negeri 4 Bandung", 15.0, "Public High School", "Bandung City"),
        ("SCH_WJ_006", "SMA Negeri 8 Bandung", 18.5, "Public High School", "Lengkong"),
        ("SCH_WJ_009", "SMA Taruna Bakti", 12.0, "Private High School", "Bandung Wetan"),
        ("SCH_WJ_001", "SMKN 1 Bandung", 25.0, "Vocational High School", "Bandung City"),
        ("SCH_WJ_010", "SMK Negeri 2 Bandung", 28.0, "Vocational High School", "Cibeunying"),
    ];
    rows.iter()
        .map(|(id, name, capacity, classification, district)| Site {
            id: id.to_string(),
            name: name.to_string(),
            capacity_kwp: *capacity,
            latitude: -6.9175,
            longitude: 107.6191,
            district: district.to_string(),
            classification: classification.to_string(),
        })
        .collect()
}
