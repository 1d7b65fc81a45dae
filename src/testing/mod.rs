//! Testing utilities and mock implementations
//!
//! Mocks for exercising the server and sensor logic without an MQTT
//! broker or a database.

pub mod mocks;

pub use mocks::*;
