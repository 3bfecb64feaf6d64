use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::fleet::Weather;

/// One synthetic day of ground truth for one site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalRecord {
    pub record_id: String,
    pub site_id: String,
    pub date: NaiveDate,
    pub actual_energy_kwh: f64,
    pub predicted_energy_kwh: f64,
    pub peak_power_kw: f64,
    /// Actual performance ratio (%)
    pub performance_ratio: f64,
    pub capacity_utilization_percent: f64,
    pub weather: Weather,
    pub savings: f64,
    pub co2_saved_kg: f64,
    /// Ground-truth anomaly: injected fault or PR below 70%
    pub anomaly: bool,
}

/// Counts from comparing model flags against ground truth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub true_positives: u64,
    pub false_positives: u64,
    pub false_negatives: u64,
    pub true_negatives: u64,
}

impl ConfusionMatrix {
    pub fn record(&mut self, flagged: bool, actual: bool) {
        match (flagged, actual) {
            (true, true) => self.true_positives += 1,
            (true, false) => self.false_positives += 1,
            (false, true) => self.false_negatives += 1,
            (false, false) => self.true_negatives += 1,
        }
    }

    pub fn precision(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_positives)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.true_positives, self.true_positives + self.false_negatives)
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r > 0.0 { 2.0 * p * r / (p + r) } else { 0.0 }
    }

    pub fn flagged(&self) -> u64 {
        self.true_positives + self.false_positives
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyDetectionStats {
    pub confusion: ConfusionMatrix,
    pub total_anomalies_detected: u64,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
}

impl From<ConfusionMatrix> for AnomalyDetectionStats {
    fn from(confusion: ConfusionMatrix) -> Self {
        Self {
            confusion,
            total_anomalies_detected: confusion.flagged(),
            precision: confusion.precision(),
            recall: confusion.recall(),
            f1_score: confusion.f1(),
        }
    }
}

/// Error characteristics of the predicted-vs-actual series over the backtest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEvaluationMetrics {
    pub sample_count: usize,
    pub rmse: f64,
    /// Percent, over days with non-zero actual energy
    pub mape: f64,
    pub mad: f64,
    pub anomaly_detection: AnomalyDetectionStats,
    /// Most recent absolute residuals, oldest first
    pub residuals_trend: Vec<f64>,
}

/// Payback projection derived from the backtest savings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialStats {
    pub total_capex: f64,
    pub total_savings: f64,
    pub payback_progress_percent: f64,
    pub payback_years: f64,
    pub lcoe_per_kwh: f64,
}
