#![deny(unsafe_code)]

use std::ops::Deref;
use std::sync::Arc;

use anyhow::anyhow;
use config::{Config, File, FileFormat};
use once_cell::sync::OnceCell;
use serde::Deserialize;

use self::logging::Log;

pub use self::options::{BindingConfig, Capabilities, Options, PoolConfig, RouteConfig, Topics};

pub mod logging;
pub mod options;

pub type Result<T> = anyhow::Result<T>;

static SETTINGS: OnceCell<Settings> = OnceCell::new();

#[derive(Clone)]
pub struct Settings(Arc<Inner>);

#[derive(Debug, Clone, Deserialize)]
pub struct Inner {
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(rename = "binding")]
    #[serde(default)]
    pub bindings: Vec<BindingConfig>,
}

impl Deref for Settings {
    type Target = Inner;
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl Settings {
    pub fn new(cfg_name: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name("/etc/rmqtt-kafka/rmqtt-kafka").required(false))
            .add_source(File::with_name("rmqtt-kafka").required(false));

        if let Some(cfg) = cfg_name {
            builder = builder.add_source(File::with_name(cfg).required(false));
        }

        builder = builder
            .add_source(config::Environment::with_prefix("rmqtt_kafka").separator("__").try_parsing(true));

        Self::build(builder.build()?)
    }

    /// Settings from an inline TOML document, without file or environment sources.
    pub fn from_toml(toml: &str) -> Result<Self> {
        Self::build(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)).build()?)
    }

    fn build(cfg: Config) -> Result<Self> {
        let inner: Inner = cfg.try_deserialize()?;
        for b in inner.bindings.iter() {
            if b.options.session_expiry_interval_min > b.options.session_expiry_interval_max {
                return Err(anyhow!(
                    "binding {}: session_expiry_interval_min is greater than session_expiry_interval_max",
                    b.id
                ));
            }
            if b.routes.is_empty() {
                return Err(anyhow!("binding {}: at least one route is required", b.id));
            }
        }
        Ok(Self(Arc::new(inner)))
    }

    #[inline]
    pub fn instance() -> &'static Self {
        match SETTINGS.get() {
            Some(c) => c,
            None => {
                unreachable!("Settings not initialized");
            }
        }
    }

    #[inline]
    pub fn init(cfg_name: Option<&str>) -> Result<&'static Self> {
        SETTINGS.set(Settings::new(cfg_name)?).map_err(|_| anyhow!("Settings init failed"))?;
        SETTINGS.get().ok_or_else(|| anyhow!("Settings init failed"))
    }

    #[inline]
    pub fn binding(&self, id: u64) -> Option<&BindingConfig> {
        self.bindings.iter().find(|b| b.id == id)
    }

    #[inline]
    pub fn logs(&self) {
        log::debug!("Config info is {:?}", self.0);
        log::info!("log to {:?}, level {:?}", self.log.to, self.log.level.inner());
        log::info!("pool slots {} x {:?}", self.pool.slot_count, self.pool.slot_capacity);
        for b in self.bindings.iter() {
            log::info!(
                "binding {} topics {:?}, session expiry [{:?}, {:?}], routes {}",
                b.id,
                b.options.topics,
                b.options.session_expiry_interval_min,
                b.options.session_expiry_interval_max,
                b.routes.len()
            );
        }
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Settings {:?}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::logging::To;
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::from_toml(
            r#"
            [[binding]]
            id = 7
            [[binding.routes]]
            id = 9
            "#,
        )
        .unwrap();

        let b = s.binding(7).unwrap();
        assert_eq!(b.options.topics.sessions, "mqtt-sessions");
        assert_eq!(b.options.topics.messages, "mqtt-messages");
        assert_eq!(b.options.topics.retained, "mqtt-retained");
        assert_eq!(b.options.reconnect_delay, Duration::from_secs(30));
        assert_eq!(b.options.transient_error_codes, vec![6]);
        assert_eq!(b.options.reply_window, 65536);
        assert_eq!(b.options.signal_group, "mqtt-clients");
        assert!(b.options.capabilities.retain_available);
        assert_eq!(b.default_route().map(|r| r.id), Some(9));
        assert_eq!(s.pool.slot_count, 64);
        assert_eq!(s.pool.slot_capacity.as_usize(), 65536);
        assert_eq!(s.log.to, To::Console);
    }

    #[test]
    fn test_overrides() {
        let s = Settings::from_toml(
            r#"
            [log]
            to = "off"
            level = "debug"

            [pool]
            slot_count = 2
            slot_capacity = "1K"

            [[binding]]
            id = 1
            [binding.options]
            session_expiry_interval_min = "10s"
            session_expiry_interval_max = "1h"
            reconnect_delay = "500ms"
            transient_error_codes = [6, 7]
            signal_group = "edge-clients"
            [binding.options.topics]
            sessions = "s"
            [[binding.routes]]
            id = 2
            when = ["sensors/#"]
            with = "sensor-messages"
            [[binding.routes]]
            id = 3
            "#,
        )
        .unwrap();

        assert!(s.log.to.off());
        assert_eq!(s.log.level.inner(), slog::Level::Debug);
        assert_eq!(s.pool.slot_capacity.as_usize(), 1024);

        let b = s.binding(1).unwrap();
        assert_eq!(b.options.topics.sessions, "s");
        assert_eq!(b.options.topics.messages, "mqtt-messages");
        assert_eq!(b.options.reconnect_delay, Duration::from_millis(500));
        assert_eq!(b.options.transient_error_codes, vec![6, 7]);
        assert_eq!(b.options.signal_group, "edge-clients");
        assert_eq!(b.options.clamp_session_expiry(1), 10);
        assert_eq!(b.options.clamp_session_expiry(30), 30);
        assert_eq!(b.options.clamp_session_expiry(7200), 3600);
        assert_eq!(b.default_route().map(|r| r.id), Some(3));
        assert_eq!(b.routes[0].with.as_deref(), Some("sensor-messages"));
    }

    #[test]
    fn test_invalid() {
        assert!(Settings::from_toml("[[binding]]\nid = 1\n").is_err());
        assert!(Settings::from_toml(
            r#"
            [[binding]]
            id = 1
            [binding.options]
            session_expiry_interval_min = "2h"
            session_expiry_interval_max = "1h"
            [[binding.routes]]
            id = 2
            "#
        )
        .is_err());
    }
}
