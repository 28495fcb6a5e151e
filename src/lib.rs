//! Concurrent supply engine for a drone-delivery sushi restaurant.
//!
//! Staff threads keep dishes stocked, drone threads fetch ingredients from
//! suppliers and deliver orders, and a background writer keeps a JSON
//! snapshot of the whole model. [`engine::Engine`] is the entry point.

pub mod catalog;
pub mod config;
pub mod drone;
pub mod engine;
pub mod error;
pub mod events;
pub mod gate;
pub mod health_monitor;
pub mod ledger;
pub mod location;
pub mod logging;
pub mod model;
pub mod order;
pub mod persistence;
pub mod sim;
pub mod staff;
pub mod types;
pub mod worker;

pub use config::SimConfig;
pub use engine::Engine;
pub use error::{Result, SupplyError};
