#![deny(unsafe_code)] // Enforce memory safety across the entire crate

//! # MQTT to Kafka proxy
//!
//! Translates MQTT publish, subscribe and session streams into Kafka merged
//! fetch/produce and group streams. Sessions live in a compacted sessions
//! topic; wills and session expiry are driven by signal records on that
//! same topic.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use rmqtt_kafka::{shard, InstanceId, Result, Stats};
//! use rmqtt_kafka_conf::Settings;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let settings = Settings::init(None)?;
//!     let logger = rmqtt_kafka::logger::from_settings(&settings.log);
//!     rmqtt_kafka::logger::logger_init(logger, settings.log.max_level())?;
//!
//!     let (handle, mut outbound, task) = shard::spawn(0, &settings.pool, InstanceId::new(), Arc::new(Stats::new()));
//!     for binding in settings.bindings.iter() {
//!         handle.attach(binding.clone())?;
//!     }
//!     tokio::spawn(async move { while let Some(_frame) = outbound.recv().await {} });
//!     task.await?;
//!     Ok(())
//! }
//! ```

pub mod context; // Engine seam, ids, stream routing
pub mod error; // Proxy error kinds
pub mod factory; // Binding and proxy ownership
pub mod logger; // slog based logging setup
pub mod reconnect; // Backoff and error classification
pub mod shard; // tokio driver for one factory
pub mod stats; // Runtime counters

mod bootstrap; // Cache warm-up streams
mod keys; // Sessions topic record keys
mod message; // MQTT properties as Kafka headers
mod pool; // Will payload slots
mod publish; // Publish proxy
mod session; // Session proxy and its phases
mod signal; // Will and expiry signal fanout
mod stream; // Flow-controlled stream halves
mod subscribe; // Subscribe proxy
mod timer; // Signal timers
mod topic; // Topic filters and routes

#[cfg(test)]
mod testing;

pub use self::context::{EngineContext, InstanceId, TimerId};
pub use self::error::ProxyError;
pub use self::factory::MqttKafkaFactory;
pub use self::stats::Stats;

pub type Result<T> = anyhow::Result<T>;
