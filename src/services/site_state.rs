//! Tick-to-tick continuity for a single site.
//!
//! Transition order per tick: fault, weather drift, physics, energy, load.

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::config::SimulationConfig;
use crate::models::fleet::{FaultStatus, Site, SiteRuntimeState, TelemetrySample, Weather};
use crate::services::physics::{self, EnvironmentNoise};

/// Energy already on the meter at fleet start, in hours at nameplate.
pub const SEED_LIFETIME_HOURS: f64 = 1500.0;
/// Load never drops below this (kW).
const MIN_LOAD_KW: f64 = 0.5;
/// Mean load as a share of capacity.
const BASE_LOAD_FRACTION: f64 = 0.3;

/// Fault types drawn when a nominal site trips, with cumulative weights.
const FAULT_DRAW: [(f64, FaultStatus); 3] = [
    (0.80, FaultStatus::CommDown),
    (0.95, FaultStatus::Underperforming),
    (1.00, FaultStatus::GroundFault),
];

#[derive(Debug, Clone, PartialEq)]
pub struct SiteAdvance {
    pub state: SiteRuntimeState,
    pub sample: TelemetrySample,
}

/// Advances one site. Borrowed views only; the fleet owns all state.
#[derive(Debug, Clone, Copy)]
pub struct SiteStateMachine<'a> {
    site: &'a Site,
    cfg: &'a SimulationConfig,
}

impl<'a> SiteStateMachine<'a> {
    pub fn new(site: &'a Site, cfg: &'a SimulationConfig) -> Self {
        Self { site, cfg }
    }

    /// State before the first tick: nominal, sunny, zero daily energy and
    /// lifetime seeded from nameplate.
    pub fn initial_state(&self, started_at: DateTime<Utc>) -> SiteRuntimeState {
        let lifetime = self.site.capacity_kwp * SEED_LIFETIME_HOURS;
        SiteRuntimeState {
            site_id: self.site.id.clone(),
            fault: FaultStatus::Nominal,
            weather: Weather::Sunny,
            daily_energy_kwh: 0.0,
            lifetime_energy_kwh: lifetime,
            last_tick: started_at,
            last_sample: TelemetrySample::idle(
                &self.site.id,
                started_at,
                lifetime,
                self.cfg.inverter_efficiency * 100.0,
            ),
        }
    }

    pub fn advance<R: Rng>(&self, prev: &SiteRuntimeState, now: DateTime<Utc>, rng: &mut R) -> SiteAdvance {
        let fault = next_fault(prev.fault, self.cfg, rng);
        let weather = drift_weather(prev.weather, self.cfg.weather_drift_probability, rng);
        let noise = EnvironmentNoise::draw(rng, self.cfg);

        if fault == FaultStatus::CommDown {
            return self.frozen(prev, fault, now);
        }

        let out = physics::compute(self.site.capacity_kwp, weather, fault, noise, self.cfg);

        let increment = out.ac_power_kw * self.cfg.tick_interval_secs() / 3600.0;
        let daily_energy_kwh = prev.daily_energy_kwh + increment;
        let lifetime_energy_kwh = prev.lifetime_energy_kwh + increment;

        let load_kw = self.draw_load(rng);
        let flow = physics::grid_flow(out.ac_power_kw, load_kw);

        let sample = TelemetrySample {
            site_id: self.site.id.clone(),
            timestamp: now,
            ac_power_kw: out.ac_power_kw,
            ac_voltage_v: out.voltage_v,
            ac_current_a: out.current_a,
            efficiency_percent: self.cfg.inverter_efficiency * 100.0,
            irradiance_wm2: out.irradiance_wm2,
            panel_temp_c: out.cell_temp_c,
            weather,
            daily_energy_kwh,
            lifetime_energy_kwh,
            load_kw,
            grid_import_kw: flow.import_kw,
            grid_export_kw: flow.export_kw,
            self_consumption_percent: flow.self_consumption_percent,
            performance_ratio: out.performance_ratio,
            fault,
        };

        SiteAdvance {
            state: SiteRuntimeState {
                site_id: self.site.id.clone(),
                fault,
                weather,
                daily_energy_kwh,
                lifetime_energy_kwh,
                last_tick: now,
                last_sample: sample.clone(),
            },
            sample,
        }
    }

    /// Gateway offline: the last reading is replayed with the new fault and
    /// timestamp. Nothing accumulates and the weather drift is discarded.
    fn frozen(&self, prev: &SiteRuntimeState, fault: FaultStatus, now: DateTime<Utc>) -> SiteAdvance {
        let sample = TelemetrySample {
            timestamp: now,
            fault,
            ..prev.last_sample.clone()
        };
        SiteAdvance {
            state: SiteRuntimeState {
                fault,
                last_tick: now,
                last_sample: sample.clone(),
                ..prev.clone()
            },
            sample,
        }
    }

    fn draw_load<R: Rng>(&self, rng: &mut R) -> f64 {
        let capacity = self.site.capacity_kwp;
        let noise = physics::symmetric_noise(rng, capacity * self.cfg.load_noise_fraction);
        (capacity * BASE_LOAD_FRACTION + noise).max(MIN_LOAD_KW)
    }
}

/// Trip or heal. Always consumes exactly one draw, plus one more on a trip.
pub fn next_fault<R: Rng>(current: FaultStatus, cfg: &SimulationConfig, rng: &mut R) -> FaultStatus {
    let roll = rng.gen_range(0.0..1.0);
    if current.is_nominal() {
        if roll < cfg.fault_probability {
            let pick = rng.gen_range(0.0..1.0);
            return FAULT_DRAW
                .iter()
                .find(|(cumulative, _)| pick < *cumulative)
                .map(|(_, fault)| *fault)
                .unwrap_or(FaultStatus::GroundFault);
        }
        current
    } else if roll < cfg.heal_probability.for_fault(current) {
        FaultStatus::Nominal
    } else {
        current
    }
}

/// The live path only ever drifts back to clear skies.
pub fn drift_weather<R: Rng>(current: Weather, probability: f64, rng: &mut R) -> Weather {
    if rng.gen_range(0.0..1.0) < probability {
        Weather::Sunny
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 4, 0, 0).unwrap()
    }

    #[test]
    fn test_initial_state_seeds_lifetime() {
        let site = Site::new("SCH_WJ_001", "SMKN 1 Bandung", 25.0);
        let cfg = SimulationConfig::default();
        let state = SiteStateMachine::new(&site, &cfg).initial_state(t0());
        assert_eq!(state.fault, FaultStatus::Nominal);
        assert_eq!(state.weather, Weather::Sunny);
        assert_eq!(state.daily_energy_kwh, 0.0);
        assert_eq!(state.lifetime_energy_kwh, 37_500.0);
    }

    #[test]
    fn test_deterministic_tick_accumulates_energy() {
        let site = Site::new("A", "Alpha", 10.0);
        let cfg = SimulationConfig::deterministic();
        let machine = SiteStateMachine::new(&site, &cfg);
        let mut rng = StdRng::seed_from_u64(1);
        let start = machine.initial_state(t0());

        let step = machine.advance(&start, t0() + Duration::seconds(2), &mut rng);
        let expected_ac = 7.84498125;
        assert!((step.sample.ac_power_kw - expected_ac).abs() < 1e-9);
        let inc = expected_ac * 2.0 / 3600.0;
        assert!((step.state.daily_energy_kwh - inc).abs() < 1e-12);
        assert!((step.state.lifetime_energy_kwh - (15_000.0 + inc)).abs() < 1e-9);
        // load = 0.3 × 10 with no noise
        assert!((step.sample.load_kw - 3.0).abs() < 1e-12);
        assert!((step.sample.grid_export_kw - (expected_ac - 3.0)).abs() < 1e-9);
        assert_eq!(step.sample.grid_import_kw, 0.0);
    }

    #[test]
    fn test_comm_down_freezes_reading() {
        let site = Site::new("A", "Alpha", 10.0);
        let cfg = SimulationConfig::deterministic();
        let machine = SiteStateMachine::new(&site, &cfg);
        let mut rng = StdRng::seed_from_u64(2);

        let first = machine.advance(&machine.initial_state(t0()), t0() + Duration::seconds(2), &mut rng);
        let mut offline = first.state.clone();
        offline.fault = FaultStatus::CommDown;

        let later = t0() + Duration::seconds(4);
        let frozen = machine.advance(&offline, later, &mut rng);
        assert_eq!(frozen.state.daily_energy_kwh, first.state.daily_energy_kwh);
        assert_eq!(frozen.sample.ac_power_kw, first.sample.ac_power_kw);
        assert_eq!(frozen.sample.fault, FaultStatus::CommDown);
        assert_eq!(frozen.sample.timestamp, later);
    }

    #[test]
    fn test_weather_drift_only_goes_sunny() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let w = drift_weather(Weather::Rainy, 0.5, &mut rng);
            assert!(w == Weather::Rainy || w == Weather::Sunny);
        }
        assert_eq!(drift_weather(Weather::Cloudy, 1.0, &mut rng), Weather::Sunny);
        assert_eq!(drift_weather(Weather::Cloudy, 0.0, &mut rng), Weather::Cloudy);
    }

    #[test]
    fn test_fault_draw_distribution() {
        let cfg = SimulationConfig { fault_probability: 1.0, ..SimulationConfig::default() };
        let mut rng = StdRng::seed_from_u64(4);
        let mut comm = 0;
        let mut under = 0;
        let mut ground = 0;
        for _ in 0..10_000 {
            match next_fault(FaultStatus::Nominal, &cfg, &mut rng) {
                FaultStatus::CommDown => comm += 1,
                FaultStatus::Underperforming => under += 1,
                FaultStatus::GroundFault => ground += 1,
                other => panic!("unexpected draw {other:?}"),
            }
        }
        assert!((7_600..8_400).contains(&comm), "comm_down={comm}");
        assert!((1_200..1_800).contains(&under), "underperf={under}");
        assert!((300..700).contains(&ground), "ground_fault={ground}");
    }

    #[test]
    fn test_heal_uses_fault_specific_probability() {
        let mut cfg = SimulationConfig::default();
        cfg.heal_probability.comm_down = 1.0;
        cfg.heal_probability.arc_fault = 0.0;
        let mut rng = StdRng::seed_from_u64(5);
        assert_eq!(next_fault(FaultStatus::CommDown, &cfg, &mut rng), FaultStatus::Nominal);
        assert_eq!(next_fault(FaultStatus::ArcFault, &cfg, &mut rng), FaultStatus::ArcFault);
    }

    proptest! {
        #[test]
        fn prop_energy_monotonic_and_grid_exclusive(seed in any::<u64>(), capacity in 0.5f64..40.0) {
            let site = Site::new("P", "Prop", capacity);
            let cfg = SimulationConfig { fault_probability: 0.05, ..SimulationConfig::default() };
            let machine = SiteStateMachine::new(&site, &cfg);
            let mut rng = StdRng::seed_from_u64(seed);
            let mut state = machine.initial_state(t0());
            for i in 1..=60 {
                let step = machine.advance(&state, t0() + Duration::seconds(2 * i), &mut rng);
                prop_assert!(step.state.daily_energy_kwh >= state.daily_energy_kwh);
                prop_assert!(step.state.lifetime_energy_kwh >= state.lifetime_energy_kwh);
                prop_assert!(!(step.sample.grid_export_kw > 0.0 && step.sample.grid_import_kw > 0.0));
                if step.sample.fault.is_outage() {
                    prop_assert_eq!(step.sample.ac_power_kw, 0.0);
                }
                state = step.state;
            }
        }
    }
}
