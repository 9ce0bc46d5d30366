//! # systemcalc - System aggregator service for Victron Venus OS
//!
//! A Rust implementation of the central aggregator of a Venus OS
//! installation. It mirrors the device services published on the D-Bus
//! (battery monitors, solar chargers, inverter/chargers, PV inverters,
//! grid meters, gensets), continuously derives the system-wide view
//! (battery state, DC power flow, per-phase AC power by role, consumption,
//! hub mode, active AC input) and republishes it as
//! `com.victronenergy.system`.
//!
//! ## Architecture
//!
//! - `config`: local process configuration (YAML)
//! - `logging`: structured logging and tracing
//! - `monitor`: mirror of the remote services plus the bus glue feeding it
//! - `settings`: typed view of the settings-service keys
//! - `dbus`: the published service and its BusItem objects
//! - `engine`: the aggregation engine — recomputation pipeline, battery
//!   selection, SoC mirror, liveness supervision, LG fault detection and
//!   relay reflection on a single cooperative event loop

pub mod config;
pub mod dbus;
pub mod engine;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod settings;

// Re-export commonly used types
pub use config::Config;
pub use engine::SystemCalc;
pub use error::{Result, SystemCalcError};
