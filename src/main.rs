use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{info, warn};

use solar_fleet_sim::config::Config;
use solar_fleet_sim::logging;
use solar_fleet_sim::models::fleet::FleetSnapshot;
use solar_fleet_sim::services::backtest::HistoricalBacktestGenerator;
use solar_fleet_sim::services::driver::{Driver, DriverSettings};
use solar_fleet_sim::services::fleet::FleetSimulator;
use solar_fleet_sim::services::mqtt_service::MqttPublisher;
use solar_fleet_sim::services::persistence::{self, JsonFileStore, SnapshotStore};
use solar_fleet_sim::services::publisher::{LogPublisher, StreamPublisher};
use solar_fleet_sim::shared_state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    // 1. Load configuration
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_string());
    let config = if Path::new(&config_path).exists() {
        Config::load(&config_path).with_context(|| format!("loading {config_path}"))?
    } else {
        warn!("{} not found, using built-in roster", config_path);
        Config::default()
    };
    info!("Configuration loaded: {} sites", config.sites.len());

    let simulator = FleetSimulator::new(
        config.sites.clone(),
        config.simulation.clone(),
        &config.economics,
    )?;
    let mut rng = match config.simulation.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    // 2. Synthetic history, once per start
    let backtest = HistoricalBacktestGenerator::new(
        simulator.sites(),
        &config.backtest,
        &config.economics,
        config.simulation.inverter_efficiency,
    )
    .generate(Utc::now().date_naive(), &mut rng);
    info!(
        payback_years = backtest.financials.payback_years,
        lcoe_per_kwh = backtest.financials.lcoe_per_kwh,
        payback_progress_percent = backtest.financials.payback_progress_percent,
        "financial projection"
    );
    if let Some(path) = &config.persistence.history_path {
        if let Err(e) = persistence::write_history(path, &backtest).await {
            warn!(error = %e, "history not written");
        }
    }

    // 3. Resume or start the live fleet
    let store = Arc::new(JsonFileStore::new(&config.persistence.snapshot_path));
    let snapshot = restore_or_initialize(&simulator, store.as_ref()).await;

    // 4. Outbound stream
    let state = AppState::new();
    let publisher: Arc<dyn StreamPublisher> = if config.mqtt.enabled && !config.mqtt.broker_host.is_empty() {
        Arc::new(MqttPublisher::connect(&config.mqtt, state.clone()))
    } else {
        info!("[MQTT] Disabled or no broker configured, telemetry goes to the log");
        Arc::new(LogPublisher)
    };

    // 5. Drive until ctrl-c / SIGTERM
    let settings = DriverSettings::from_config(&config);
    let driver = Driver::new(simulator, publisher, store, state, settings);
    let last = driver.run(snapshot, rng, logging::shutdown_signal()).await?;
    info!(tick = last.tick, open_alerts = last.alerts.len(), "simulator stopped");

    Ok(())
}

async fn restore_or_initialize(simulator: &FleetSimulator, store: &dyn SnapshotStore) -> FleetSnapshot {
    match store.load().await {
        Ok(Some(snapshot)) => match simulator.check_snapshot(&snapshot) {
            Ok(()) => {
                info!(tick = snapshot.tick, timestamp = %snapshot.timestamp, "resuming from saved snapshot");
                return snapshot;
            }
            Err(e) => warn!(error = %e, "saved snapshot does not match roster, starting fresh"),
        },
        Ok(None) => info!("no saved snapshot, starting fresh"),
        Err(e) => warn!(error = %e, "saved snapshot unreadable, starting fresh"),
    }
    simulator.initialize(Utc::now())
}
