//! Offline synthetic history and model evaluation.
//!
//! Runs once per fleet lifetime (or on explicit refresh), never per tick.
//! The noise model is deliberately coarser than the live path:
//!
//!  * weather is drawn per day from season weights, not drifted;
//!  * the irradiance factor is the weather base scaled by a ±10% jitter and
//!    is NOT clamped to the live-path bounds `[0.1, 1.1]`;
//!  * a "predicted" series uses a fixed PR of 0.80 while the "actual" series
//!    draws its own PR and injects severe faults.

use chrono::{Datelike, Duration, NaiveDate};
use rand::Rng;
use serde::Serialize;
use tracing::info;

use crate::config::{BacktestConfig, EconomicsConfig};
use crate::models::fleet::{Site, Weather};
use crate::models::history::{
    ConfusionMatrix, FinancialStats, HistoricalRecord, ModelEvaluationMetrics,
};
use crate::services::alerts::PR_CRITICAL_THRESHOLD;

const BASELINE_PR: f64 = 0.80;
const JITTER_MIN: f64 = 0.9;
const JITTER_SPAN: f64 = 0.2;
const FAULT_DAY_PROBABILITY: f64 = 0.02;
const FAULT_PR_FACTOR: f64 = 0.6;
/// A site keeps the fleet's weather for the day unless this roll is exceeded.
const LOCAL_WEATHER_THRESHOLD: f64 = 0.7;
/// Model flags a day when |residual| exceeds this share of the prediction.
const FLAG_RESIDUAL_SHARE: f64 = 0.25;
const RESIDUALS_TREND_LEN: usize = 20;

const DRY_SEASON_WEIGHTS: [f64; 4] = [0.4, 0.4, 0.15, 0.05];
const WET_SEASON_WEIGHTS: [f64; 4] = [0.1, 0.3, 0.4, 0.2];

/// April through August.
pub fn is_dry_season(month: u32) -> bool {
    (4..=8).contains(&month)
}

pub fn seasonal_weather<R: Rng>(month: u32, rng: &mut R) -> Weather {
    let weights = if is_dry_season(month) { DRY_SEASON_WEIGHTS } else { WET_SEASON_WEIGHTS };
    let roll = rng.gen_range(0.0..1.0);
    let mut cumulative = 0.0;
    for (weather, weight) in Weather::ALL.iter().zip(weights) {
        cumulative += weight;
        if roll < cumulative {
            return *weather;
        }
    }
    Weather::PartlyCloudy
}

#[derive(Debug, Clone, Serialize)]
pub struct Backtest {
    pub records: Vec<HistoricalRecord>,
    pub metrics: ModelEvaluationMetrics,
    pub financials: FinancialStats,
}

pub struct HistoricalBacktestGenerator<'a> {
    sites: &'a [Site],
    cfg: &'a BacktestConfig,
    economics: &'a EconomicsConfig,
    inverter_efficiency: f64,
}

impl<'a> HistoricalBacktestGenerator<'a> {
    pub fn new(
        sites: &'a [Site],
        cfg: &'a BacktestConfig,
        economics: &'a EconomicsConfig,
        inverter_efficiency: f64,
    ) -> Self {
        Self { sites, cfg, economics, inverter_efficiency }
    }

    /// History for the `cfg.days` days before `end_date` (exclusive), oldest
    /// first, one record per site per day.
    pub fn generate<R: Rng>(&self, end_date: NaiveDate, rng: &mut R) -> Backtest {
        let mut records = Vec::with_capacity(self.cfg.days as usize * self.sites.len());

        for offset in (1..=i64::from(self.cfg.days)).rev() {
            let date = end_date - Duration::days(offset);
            let month = date.month();
            let fleet_weather = seasonal_weather(month, rng);

            for site in self.sites {
                let weather = if rng.gen_range(0.0..1.0) > LOCAL_WEATHER_THRESHOLD {
                    seasonal_weather(month, rng)
                } else {
                    fleet_weather
                };
                records.push(self.simulate_day(site, date, weather, rng));
            }
        }

        let metrics = evaluate(&records);
        let financials = project_financials(self.sites, &records, self.economics, self.cfg.days);
        info!(
            records = records.len(),
            rmse = metrics.rmse,
            mape = metrics.mape,
            mad = metrics.mad,
            precision = metrics.anomaly_detection.precision,
            recall = metrics.anomaly_detection.recall,
            f1 = metrics.anomaly_detection.f1_score,
            "backtest generated"
        );
        Backtest { records, metrics, financials }
    }

    fn simulate_day<R: Rng>(&self, site: &Site, date: NaiveDate, weather: Weather, rng: &mut R) -> HistoricalRecord {
        let capacity = site.capacity_kwp;
        let base_factor = weather.irradiance_factor();
        let sun_hours = self.cfg.base_sun_hours * base_factor;
        let predicted = capacity * sun_hours * BASELINE_PR;

        let actual_factor = base_factor * (JITTER_MIN + rng.gen_range(0.0..1.0) * JITTER_SPAN);
        let seasonal_temp = if is_dry_season(date.month()) { -0.02 } else { 0.01 };
        let mut actual_pr = 0.75 + seasonal_temp + rng.gen_range(0.0..1.0) * 0.08;

        let faulty = rng.gen_range(0.0..1.0) < FAULT_DAY_PROBABILITY;
        if faulty {
            actual_pr *= FAULT_PR_FACTOR;
        }

        // Weather enters twice: via sun hours and via the jittered factor.
        let actual = capacity * sun_hours * actual_factor * (actual_pr / BASELINE_PR);

        HistoricalRecord {
            record_id: format!("{}_{}", site.id, date.format("%Y-%m-%d")),
            site_id: site.id.clone(),
            date,
            actual_energy_kwh: actual,
            predicted_energy_kwh: predicted,
            peak_power_kw: capacity * actual_factor * self.inverter_efficiency,
            performance_ratio: actual_pr * 100.0,
            capacity_utilization_percent: actual / (capacity * 24.0) * 100.0,
            weather,
            savings: (actual * self.economics.electricity_rate).floor(),
            co2_saved_kg: actual * self.economics.carbon_intensity_kg_per_kwh,
            anomaly: faulty || actual_pr * 100.0 < PR_CRITICAL_THRESHOLD,
        }
    }
}

/// Error statistics and anomaly-detection scores over a set of records.
pub fn evaluate(records: &[HistoricalRecord]) -> ModelEvaluationMetrics {
    let mut confusion = ConfusionMatrix::default();
    let mut abs_residuals = Vec::with_capacity(records.len());
    let mut pct_errors = Vec::with_capacity(records.len());

    for r in records {
        let abs_residual = (r.predicted_energy_kwh - r.actual_energy_kwh).abs();
        abs_residuals.push(abs_residual);
        if r.actual_energy_kwh > 0.0 {
            pct_errors.push(abs_residual / r.actual_energy_kwh);
        }
        let flagged = abs_residual > r.predicted_energy_kwh * FLAG_RESIDUAL_SHARE;
        confusion.record(flagged, r.anomaly);
    }

    let n = abs_residuals.len();
    let (mad, rmse) = if n == 0 {
        (0.0, 0.0)
    } else {
        let mad = abs_residuals.iter().sum::<f64>() / n as f64;
        let mse = abs_residuals.iter().map(|e| e * e).sum::<f64>() / n as f64;
        (mad, mse.sqrt())
    };
    let mape = if pct_errors.is_empty() {
        0.0
    } else {
        pct_errors.iter().sum::<f64>() / pct_errors.len() as f64 * 100.0
    };

    let trend_start = n.saturating_sub(RESIDUALS_TREND_LEN);
    ModelEvaluationMetrics {
        sample_count: n,
        rmse,
        mape,
        mad,
        anomaly_detection: confusion.into(),
        residuals_trend: abs_residuals[trend_start..].to_vec(),
    }
}

/// Payback and simplified LCOE from the savings recorded over `days`.
pub fn project_financials(
    sites: &[Site],
    records: &[HistoricalRecord],
    economics: &EconomicsConfig,
    days: u32,
) -> FinancialStats {
    let total_capacity: f64 = sites.iter().map(|s| s.capacity_kwp).sum();
    let total_capex = total_capacity * economics.capex_per_kwp;
    let total_savings: f64 = records.iter().map(|r| r.savings).sum();

    let annual_savings = if days > 0 { total_savings / f64::from(days) * 365.0 } else { 0.0 };
    let payback_years = if annual_savings > 0.0 { total_capex / annual_savings } else { 0.0 };
    let payback_progress_percent = if total_capex > 0.0 { total_savings / total_capex * 100.0 } else { 0.0 };

    let lifecycle_cost = total_capex * economics.lifecycle_cost_factor;
    let lifetime_generation_kwh = if economics.electricity_rate > 0.0 {
        total_savings / economics.electricity_rate * economics.lifetime_years
    } else {
        0.0
    };
    let lcoe_per_kwh = if lifetime_generation_kwh > 0.0 { lifecycle_cost / lifetime_generation_kwh } else { 0.0 };

    FinancialStats { total_capex, total_savings, payback_progress_percent, payback_years, lcoe_per_kwh }
}
