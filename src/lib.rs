//! Solarman Accessory Bridge Library
//!
//! Polls a Solarman inverter for its current readings and republishes them as
//! characteristics of a local accessory, served read-only over Modbus TCP.

pub mod accessory_server;
pub mod accessory_store;
pub mod config;
pub mod error;
pub mod inverter_accessory;
pub mod lifecycle;
pub mod solarman_client;
pub mod sync_engine;
pub mod value_mapper;

// Re-export commonly used types for easier access
pub use accessory_store::{AccessoryInfo, AccessoryStore};
pub use config::{Config, FetchFailurePolicy};
pub use error::{FetchError, PublishError};
pub use inverter_accessory::{AccessoryHandle, AccessoryPublisher, InverterAccessory};
pub use lifecycle::Bridge;
pub use solarman_client::{SolarmanClient, TelemetryClient};
pub use sync_engine::SyncEngine;
pub use value_mapper::{ChargingState, DerivedMetrics, ReadingSnapshot};
