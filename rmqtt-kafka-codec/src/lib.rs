#![deny(unsafe_code)]

//! Stream primitive frames and the typed extensions the MQTT to Kafka proxy
//! exchanges on them
//!
//! - [`frame`]: Begin/Data/End/Abort/Flush/Window/Reset with flow-control counters
//! - [`mqtt`]: extensions seen on MQTT-facing streams (publish, subscribe, session)
//! - [`kafka`]: extensions sent on Kafka-facing streams (merged fetch/produce, group, ...)
//! - [`signal`]: binary records stored in the sessions topic (will, expiry, migrate)
//!

#[macro_use]
mod utils;

/// Error types for record encoding/decoding
pub mod error;

pub mod frame;
pub mod kafka;
pub mod mqtt;
pub mod signal;

pub use utils::{Decode, Encode};
