/// ============================================================
///  Per-site electrical model for one tick
///
///  Pipeline:
///   1. Irradiance factor – weather base + noise, clamped to the
///                          live-path bounds
///   2. Fault penalty     – outage zeroes the factor, underperf
///                          scales it by 0.6
///   3. Cell temperature  – NOCT model on a fixed ambient base
///   4. Power output      – P_dc = P_nom × factor × derate,
///                          P_ac = P_dc × η_inv
///   5. Grid side         – voltage with noise, current from P_ac
///
///  No state: everything random arrives through `EnvironmentNoise`.
/// ============================================================

use rand::Rng;

use crate::config::SimulationConfig;
use crate::models::fleet::{FaultStatus, Weather};

/// Bounds applied to the noisy irradiance factor on the live tick path.
/// The backtest path uses different bounds, see `services::backtest`.
pub const TICK_IRRADIANCE_MIN: f64 = 0.1;
pub const TICK_IRRADIANCE_MAX: f64 = 1.1;

/// Underperforming arrays deliver this share of their healthy irradiance.
const UNDERPERF_FACTOR: f64 = 0.6;
/// Cell temperature at which the derate is zero (STC).
const STC_TEMP_C: f64 = 25.0;

// ─── Inputs / outputs ────────────────────────────────────────

/// Random offsets for one tick, drawn by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnvironmentNoise {
    /// Added to the weather irradiance factor
    pub irradiance: f64,
    /// Added to the base grid voltage (V)
    pub voltage: f64,
}

impl EnvironmentNoise {
    pub fn draw<R: Rng>(rng: &mut R, cfg: &SimulationConfig) -> Self {
        Self {
            irradiance: symmetric_noise(rng, cfg.irradiance_noise),
            voltage: symmetric_noise(rng, cfg.voltage_variance),
        }
    }
}

/// Uniform draw in `[-span/2, +span/2)`. A zero span yields exactly zero.
pub fn symmetric_noise<R: Rng>(rng: &mut R, span: f64) -> f64 {
    (rng.gen_range(0.0..1.0) - 0.5) * span
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElectricalOutput {
    /// Irradiance factor after clamping and fault penalty
    pub irradiance_factor: f64,
    pub irradiance_wm2: f64,
    pub cell_temp_c: f64,
    pub temp_derate: f64,
    pub dc_power_kw: f64,
    pub ac_power_kw: f64,
    pub voltage_v: f64,
    pub current_a: f64,
    /// AC output against capacity × factor (%)
    pub performance_ratio: f64,
}

// ─── Model ───────────────────────────────────────────────────

/// Instantaneous output of a site.
///
/// `CommDown` is treated as nominal here: the gateway outage freezes what is
/// *reported*, which is the state machine's concern, not the array's.
pub fn compute(
    capacity_kwp: f64,
    weather: Weather,
    fault: FaultStatus,
    noise: EnvironmentNoise,
    cfg: &SimulationConfig,
) -> ElectricalOutput {
    let factor = (weather.irradiance_factor() + noise.irradiance)
        .clamp(TICK_IRRADIANCE_MIN, TICK_IRRADIANCE_MAX);
    let factor = apply_fault_penalty(factor, fault);

    let irradiance_wm2 = (1000.0 * factor).max(0.0);
    let cell_temp_c = cell_temperature(irradiance_wm2, cfg);
    let temp_derate = temperature_derate(cell_temp_c, cfg.temp_coeff);

    let dc_power_kw = capacity_kwp * factor * temp_derate;
    let ac_power_kw = (dc_power_kw * cfg.inverter_efficiency).max(0.0);

    let voltage_v = cfg.voltage_base + noise.voltage;
    let current_a = if voltage_v > 0.0 { ac_power_kw * 1000.0 / voltage_v } else { 0.0 };

    let theoretical_max_kw = capacity_kwp * factor;
    let performance_ratio = if theoretical_max_kw > 0.0 {
        ac_power_kw / theoretical_max_kw * 100.0
    } else {
        0.0
    };

    ElectricalOutput {
        irradiance_factor: factor,
        irradiance_wm2,
        cell_temp_c,
        temp_derate,
        dc_power_kw,
        ac_power_kw,
        voltage_v,
        current_a,
        performance_ratio,
    }
}

pub fn apply_fault_penalty(factor: f64, fault: FaultStatus) -> f64 {
    match fault {
        FaultStatus::GroundFault | FaultStatus::ArcFault => 0.0,
        FaultStatus::Underperforming => factor * UNDERPERF_FACTOR,
        FaultStatus::Nominal | FaultStatus::CommDown => factor,
    }
}

/// T_cell = T_ambient + (G / 800) × (NOCT − 20)
pub fn cell_temperature(irradiance_wm2: f64, cfg: &SimulationConfig) -> f64 {
    cfg.ambient_temp_base + (irradiance_wm2 / 800.0) * (cfg.noct - 20.0)
}

pub fn temperature_derate(cell_temp_c: f64, temp_coeff: f64) -> f64 {
    (1.0 - (cell_temp_c - STC_TEMP_C) * temp_coeff).max(0.0)
}

// ─── Site balance ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridFlow {
    pub import_kw: f64,
    pub export_kw: f64,
    pub self_consumed_kw: f64,
    pub self_consumption_percent: f64,
}

/// Splits generation against on-site load. At most one of import/export is
/// non-zero.
pub fn grid_flow(ac_power_kw: f64, load_kw: f64) -> GridFlow {
    let (import_kw, export_kw, self_consumed_kw) = if ac_power_kw >= load_kw {
        (0.0, ac_power_kw - load_kw, load_kw)
    } else {
        (load_kw - ac_power_kw, 0.0, ac_power_kw)
    };
    let self_consumption_percent = if ac_power_kw > 0.0 {
        self_consumed_kw / ac_power_kw * 100.0
    } else {
        0.0
    };
    GridFlow { import_kw, export_kw, self_consumed_kw, self_consumption_percent }
}
