//! Fleet-level driver of the per-site state machines.
//!
//! `tick` is a pure transition `(snapshot, rng) -> outcome`; the caller owns
//! the timing loop. Sites never read each other's state during a tick, and
//! the aggregates are computed only once every site has advanced.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::debug;

use crate::config::{EconomicsConfig, SimulationConfig, validate_roster};
use crate::error::{Result, SimError};
use crate::models::alert::AlertChange;
use crate::models::fleet::{
    CommunityStats, FaultStatus, FleetAggregates, FleetSnapshot, Site, TelemetrySample, Weather,
};
use crate::services::alerts::AlertLifecycleManager;
use crate::services::site_state::SiteStateMachine;

/// Everything produced by one tick.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub snapshot: FleetSnapshot,
    pub samples: Vec<TelemetrySample>,
    pub aggregates: FleetAggregates,
    pub alert_changes: Vec<AlertChange>,
}

#[derive(Debug, Clone)]
pub struct FleetSimulator {
    sites: Vec<Site>,
    cfg: SimulationConfig,
    sharing_rate: f64,
    alerts: AlertLifecycleManager,
}

impl FleetSimulator {
    pub fn new(sites: Vec<Site>, cfg: SimulationConfig, economics: &EconomicsConfig) -> Result<Self> {
        validate_roster(&sites)?;
        cfg.validate()?;
        economics.validate()?;
        Ok(Self {
            sites,
            cfg,
            sharing_rate: economics.sharing_rate,
            alerts: AlertLifecycleManager::default(),
        })
    }

    pub fn sites(&self) -> &[Site] {
        &self.sites
    }

    pub fn site(&self, site_id: &str) -> Result<&Site> {
        self.sites
            .iter()
            .find(|s| s.id == site_id)
            .ok_or_else(|| SimError::InvalidSiteReference(site_id.to_string()))
    }

    /// Fresh fleet: no randomness involved.
    pub fn initialize(&self, started_at: DateTime<Utc>) -> FleetSnapshot {
        let sites = self
            .sites
            .iter()
            .map(|site| {
                let state = SiteStateMachine::new(site, &self.cfg).initial_state(started_at);
                (site.id.clone(), state)
            })
            .collect();
        FleetSnapshot { timestamp: started_at, tick: 0, sites, alerts: Vec::new() }
    }

    /// Checks that a snapshot (e.g. restored from disk) covers exactly this roster.
    pub fn check_snapshot(&self, snapshot: &FleetSnapshot) -> Result<()> {
        for site in &self.sites {
            if !snapshot.sites.contains_key(&site.id) {
                return Err(SimError::InvalidSiteReference(site.id.clone()));
            }
        }
        if let Some(stray) = snapshot.sites.keys().find(|id| self.site(id).is_err()) {
            return Err(SimError::InvalidSiteReference(stray.clone()));
        }
        Ok(())
    }

    pub fn tick<R: Rng>(&self, prev: &FleetSnapshot, rng: &mut R) -> Result<TickOutcome> {
        self.check_snapshot(prev)?;
        let now = self.next_timestamp(prev)?;

        let mut sites = BTreeMap::new();
        let mut samples = Vec::with_capacity(self.sites.len());
        for site in &self.sites {
            let state = prev
                .sites
                .get(&site.id)
                .ok_or_else(|| SimError::InvalidSiteReference(site.id.clone()))?;
            let step = SiteStateMachine::new(site, &self.cfg).advance(state, now, rng);
            sites.insert(site.id.clone(), step.state);
            samples.push(step.sample);
        }

        // All site writes for this tick are in `samples` from here on.
        let reconciled = self.alerts.reconcile(&prev.alerts, &samples, &self.sites, now);
        let aggregates = aggregate(&samples, &self.sites, self.sharing_rate);
        debug!(
            tick = prev.tick + 1,
            total_ac_kw = aggregates.total_ac_power_kw,
            open_alerts = reconciled.active.len(),
            "fleet tick"
        );

        Ok(TickOutcome {
            snapshot: FleetSnapshot {
                timestamp: now,
                tick: prev.tick + 1,
                sites,
                alerts: reconciled.active,
            },
            samples,
            aggregates,
            alert_changes: reconciled.changes,
        })
    }

    fn next_timestamp(&self, prev: &FleetSnapshot) -> Result<DateTime<Utc>> {
        i64::try_from(self.cfg.tick_interval_ms)
            .ok()
            .and_then(Duration::try_milliseconds)
            .and_then(|step| prev.timestamp.checked_add_signed(step))
            .ok_or_else(|| {
                SimError::InvalidConfiguration(format!(
                    "simulated clock overflows after tick {} ({})",
                    prev.tick, prev.timestamp
                ))
            })
    }

    /// Operator override of a site's fault; takes effect on the next tick.
    pub fn force_fault(&self, snapshot: &mut FleetSnapshot, site_id: &str, fault: FaultStatus) -> Result<()> {
        self.site(site_id)?;
        let state = snapshot
            .sites
            .get_mut(site_id)
            .ok_or_else(|| SimError::InvalidSiteReference(site_id.to_string()))?;
        state.fault = fault;
        Ok(())
    }

    pub fn set_weather(&self, snapshot: &mut FleetSnapshot, site_id: &str, weather: Weather) -> Result<()> {
        self.site(site_id)?;
        let state = snapshot
            .sites
            .get_mut(site_id)
            .ok_or_else(|| SimError::InvalidSiteReference(site_id.to_string()))?;
        state.weather = weather;
        Ok(())
    }
}

/// Fleet totals and community sharing potential for one set of samples.
///
/// Live power and PR count reporting sites only; a `comm_down` site's frozen
/// reading is left out. Energy counters and community flows cover every
/// sample, since a frozen counter is still energy the site produced.
pub fn aggregate(samples: &[TelemetrySample], sites: &[Site], sharing_rate: f64) -> FleetAggregates {
    let community = community_stats(samples, sharing_rate);

    let online: Vec<&TelemetrySample> =
        samples.iter().filter(|s| s.fault != FaultStatus::CommDown).collect();
    let fleet_performance_ratio = if online.is_empty() {
        0.0
    } else {
        online.iter().map(|s| s.performance_ratio).sum::<f64>() / online.len() as f64
    };

    FleetAggregates {
        community,
        total_ac_power_kw: online.iter().map(|s| s.ac_power_kw).sum(),
        total_capacity_kwp: sites.iter().map(|s| s.capacity_kwp).sum(),
        total_daily_energy_kwh: samples.iter().map(|s| s.daily_energy_kwh).sum(),
        total_lifetime_energy_kwh: samples.iter().map(|s| s.lifetime_energy_kwh).sum(),
        fleet_performance_ratio,
        sites_online: online.len(),
        sites_faulted: samples.iter().filter(|s| !s.fault.is_nominal()).count(),
        sites_total: sites.len(),
    }
}

pub fn community_stats(samples: &[TelemetrySample], sharing_rate: f64) -> CommunityStats {
    let surplus: f64 = samples.iter().map(|s| s.grid_export_kw).filter(|kw| *kw > 0.0).sum();
    let deficit: f64 = samples.iter().map(|s| s.grid_import_kw).filter(|kw| *kw > 0.0).sum();
    CommunityStats {
        total_surplus_kw: surplus,
        total_deficit_kw: deficit,
        net_grid_flow_kw: surplus - deficit,
        active_peers: samples.len(),
        sharing_potential: surplus.min(deficit) * sharing_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::alert::AlertSeverity;
    use chrono::TimeZone;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 4, 0, 0).unwrap()
    }

    fn single_site_fleet() -> FleetSimulator {
        FleetSimulator::new(
            vec![Site::new("SCH_01", "Test School", 10.0)],
            SimulationConfig::deterministic(),
            &EconomicsConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_initialize_is_deterministic() {
        let fleet = FleetSimulator::new(crate::config::default_roster(), SimulationConfig::default(), &EconomicsConfig::default())
            .unwrap();
        let a = fleet.initialize(t0());
        let b = fleet.initialize(t0());
        assert_eq!(a, b);
        assert_eq!(a.sites.len(), 10);
        assert_eq!(a.sites["SCH_WJ_010"].lifetime_energy_kwh, 28.0 * 1500.0);
    }

    #[test]
    fn test_rejects_invalid_capacity() {
        let err = FleetSimulator::new(
            vec![Site::new("X", "Bad", f64::NAN)],
            SimulationConfig::default(),
            &EconomicsConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SimError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_rejects_invalid_simulation_knobs() {
        let zero_tick = SimulationConfig { tick_interval_ms: 0, ..SimulationConfig::deterministic() };
        let err = FleetSimulator::new(vec![Site::new("A", "Alpha", 5.0)], zero_tick, &EconomicsConfig::default())
            .unwrap_err();
        assert!(matches!(err, SimError::InvalidConfiguration(_)));

        let bad_fault = SimulationConfig { fault_probability: 7.0, ..SimulationConfig::default() };
        assert!(FleetSimulator::new(vec![Site::new("A", "Alpha", 5.0)], bad_fault, &EconomicsConfig::default()).is_err());

        let economics = EconomicsConfig { sharing_rate: -1.0, ..EconomicsConfig::default() };
        assert!(FleetSimulator::new(vec![Site::new("A", "Alpha", 5.0)], SimulationConfig::default(), &economics).is_err());
    }

    #[test]
    fn test_clock_overflow_is_an_error() {
        let fleet = single_site_fleet();
        let mut rng = StdRng::seed_from_u64(0);
        let snap = fleet.initialize(DateTime::<Utc>::MAX_UTC - Duration::milliseconds(1000));
        let err = fleet.tick(&snap, &mut rng).unwrap_err();
        assert!(matches!(err, SimError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_set_weather_takes_effect_next_tick() {
        let fleet = single_site_fleet();
        let mut rng = StdRng::seed_from_u64(4);
        let sunny = fleet.tick(&fleet.initialize(t0()), &mut rng).unwrap();

        let mut snap = sunny.snapshot.clone();
        fleet.set_weather(&mut snap, "SCH_01", Weather::Rainy).unwrap();
        let rainy = fleet.tick(&snap, &mut rng).unwrap();
        assert_eq!(rainy.samples[0].weather, Weather::Rainy);
        assert!(rainy.samples[0].ac_power_kw < sunny.samples[0].ac_power_kw * 0.25);

        let err = fleet.set_weather(&mut snap, "NOPE", Weather::Cloudy).unwrap_err();
        assert!(matches!(err, SimError::InvalidSiteReference(id) if id == "NOPE"));
    }

    #[test]
    fn test_offline_sites_excluded_from_live_power() {
        let sites = vec![Site::new("A", "Alpha", 10.0), Site::new("B", "Bravo", 10.0)];
        let live = TelemetrySample { ac_power_kw: 6.0, daily_energy_kwh: 2.0, ..TelemetrySample::idle("A", t0(), 0.0, 95.0) };
        let frozen = TelemetrySample {
            ac_power_kw: 7.0,
            daily_energy_kwh: 3.0,
            fault: FaultStatus::CommDown,
            ..TelemetrySample::idle("B", t0(), 0.0, 95.0)
        };
        let agg = aggregate(&[live, frozen], &sites, 200.0);
        assert_eq!(agg.total_ac_power_kw, 6.0);
        assert_eq!(agg.total_daily_energy_kwh, 5.0);
        assert_eq!(agg.sites_online, 1);
        assert_eq!(agg.sites_faulted, 1);
    }

    #[test]
    fn test_single_tick_reference_output() {
        let fleet = single_site_fleet();
        let mut rng = StdRng::seed_from_u64(0);
        let out = fleet.tick(&fleet.initialize(t0()), &mut rng).unwrap();

        let irr = 0.95_f64;
        let cell = 28.0 + (1000.0 * irr / 800.0) * 25.0;
        let derate = 1.0 - (cell - 25.0) * 0.004;
        let expected = 10.0 * irr * derate * 0.95;

        let s = &out.samples[0];
        assert!((s.ac_power_kw - expected).abs() < 1e-9, "ac={}", s.ac_power_kw);
        assert_eq!(out.snapshot.tick, 1);
        assert_eq!(out.snapshot.timestamp, t0() + Duration::milliseconds(2000));
        assert!((out.aggregates.total_ac_power_kw - expected).abs() < 1e-9);
        assert!(out.alert_changes.is_empty());
    }

    #[test]
    fn test_comm_down_scenario() {
        let fleet = single_site_fleet();
        let mut rng = StdRng::seed_from_u64(9);
        let mut snap = fleet.tick(&fleet.initialize(t0()), &mut rng).unwrap().snapshot;
        fleet.force_fault(&mut snap, "SCH_01", FaultStatus::CommDown).unwrap();

        let daily_before = snap.sites["SCH_01"].daily_energy_kwh;
        for _ in 0..5 {
            let out = fleet.tick(&snap, &mut rng).unwrap();
            snap = out.snapshot;
            assert_eq!(snap.sites["SCH_01"].daily_energy_kwh, daily_before);
            assert_eq!(snap.alerts.len(), 1);
            assert_eq!(snap.alerts[0].fault, FaultStatus::CommDown);
            assert_eq!(snap.alerts[0].severity, AlertSeverity::Warning);
            assert_eq!(out.aggregates.sites_online, 0);
        }

        fleet.force_fault(&mut snap, "SCH_01", FaultStatus::Nominal).unwrap();
        let out = fleet.tick(&snap, &mut rng).unwrap();
        assert!(out.samples[0].performance_ratio >= 78.0);
        assert!(out.snapshot.alerts.is_empty());
        assert!(matches!(out.alert_changes.as_slice(), [AlertChange::Retracted(a)] if a.fault == FaultStatus::CommDown));
        assert!(out.snapshot.sites["SCH_01"].daily_energy_kwh > daily_before);
    }

    #[test]
    fn test_ground_fault_zeroes_output() {
        let fleet = single_site_fleet();
        let mut rng = StdRng::seed_from_u64(11);
        let mut snap = fleet.initialize(t0());
        fleet.force_fault(&mut snap, "SCH_01", FaultStatus::GroundFault).unwrap();
        let out = fleet.tick(&snap, &mut rng).unwrap();
        assert_eq!(out.samples[0].ac_power_kw, 0.0);
        assert_eq!(out.snapshot.alerts[0].severity, AlertSeverity::Critical);
        // load is still drawn, so the site imports everything
        assert!(out.samples[0].grid_import_kw > 0.0);
    }

    #[test]
    fn test_unknown_site_is_rejected() {
        let fleet = single_site_fleet();
        let mut snap = fleet.initialize(t0());
        let err = fleet.force_fault(&mut snap, "NOPE", FaultStatus::ArcFault).unwrap_err();
        assert!(matches!(err, SimError::InvalidSiteReference(id) if id == "NOPE"));

        let mut stray = snap.clone();
        let extra = stray.sites["SCH_01"].clone();
        stray.sites.insert("GHOST".to_string(), extra);
        let mut rng = StdRng::seed_from_u64(0);
        assert!(matches!(fleet.tick(&stray, &mut rng), Err(SimError::InvalidSiteReference(_))));
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let fleet = FleetSimulator::new(crate::config::default_roster(), SimulationConfig::default(), &EconomicsConfig::default())
            .unwrap();
        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut snap = fleet.initialize(t0());
            for _ in 0..50 {
                snap = fleet.tick(&snap, &mut rng).unwrap().snapshot;
            }
            snap
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn test_community_stats() {
        let mk = |id: &str, export: f64, import: f64| TelemetrySample {
            grid_export_kw: export,
            grid_import_kw: import,
            ..TelemetrySample::idle(id, t0(), 0.0, 95.0)
        };
        let stats = community_stats(&[mk("A", 4.0, 0.0), mk("B", 0.0, 1.5), mk("C", 0.0, 1.0)], 200.0);
        assert_eq!(stats.total_surplus_kw, 4.0);
        assert_eq!(stats.total_deficit_kw, 2.5);
        assert_eq!(stats.net_grid_flow_kw, 1.5);
        assert_eq!(stats.active_peers, 3);
        assert_eq!(stats.sharing_potential, 500.0);
    }
}
