//! Testing utilities and mock implementations
//!
//! Test doubles for exercising the event bus without an MQTT broker.

pub mod mocks;

pub use mocks::*;
