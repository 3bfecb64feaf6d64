pub mod alerts;
pub mod backtest;
pub mod driver;
pub mod fleet;
pub mod mqtt_service;
pub mod persistence;
pub mod physics;
pub mod publisher;
pub mod site_state;
