//! Testing utilities and mock implementations
//!
//! Lets the connection manager and the live service run without an MQTT broker.

pub mod mocks;

pub use mocks::*;
