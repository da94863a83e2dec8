use std::time::Duration;

use serde::Deserialize;

use rmqtt_kafka_utils::{deserialize_duration, Bytesize};

/// Per-binding proxy options.
#[derive(Debug, Clone, Deserialize)]
pub struct Options {
    #[serde(default)]
    pub topics: Topics,
    #[serde(default = "Options::session_expiry_interval_min_default", deserialize_with = "deserialize_duration")]
    pub session_expiry_interval_min: Duration,
    #[serde(default = "Options::session_expiry_interval_max_default", deserialize_with = "deserialize_duration")]
    pub session_expiry_interval_max: Duration,
    /// Upper bound of the exponential reconnect backoff
    #[serde(default = "Options::reconnect_delay_default", deserialize_with = "deserialize_duration")]
    pub reconnect_delay: Duration,
    /// Credit granted on internal reply streams
    #[serde(default = "Options::reply_window_default")]
    pub reply_window: i32,
    /// Kafka error codes after which fanout and bootstrap streams reconnect
    #[serde(default = "Options::transient_error_codes_default")]
    pub transient_error_codes: Vec<i32>,
    /// Consumer group sharing the sessions topic partitions between the
    /// instances that fan out wills and expiries
    #[serde(default = "Options::signal_group_default")]
    pub signal_group: String,
    #[serde(default)]
    pub bootstrap: bool,
    #[serde(default)]
    pub capabilities: Capabilities,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            topics: Topics::default(),
            session_expiry_interval_min: Self::session_expiry_interval_min_default(),
            session_expiry_interval_max: Self::session_expiry_interval_max_default(),
            reconnect_delay: Self::reconnect_delay_default(),
            reply_window: Self::reply_window_default(),
            transient_error_codes: Self::transient_error_codes_default(),
            signal_group: Self::signal_group_default(),
            bootstrap: false,
            capabilities: Capabilities::default(),
        }
    }
}

impl Options {
    fn session_expiry_interval_min_default() -> Duration {
        Duration::ZERO
    }
    fn session_expiry_interval_max_default() -> Duration {
        Duration::from_secs(30 * 86400)
    }
    fn reconnect_delay_default() -> Duration {
        Duration::from_secs(30)
    }
    fn reply_window_default() -> i32 {
        65536
    }
    fn transient_error_codes_default() -> Vec<i32> {
        // NOT_LEADER_FOR_PARTITION
        vec![6]
    }
    fn signal_group_default() -> String {
        "mqtt-clients".into()
    }

    /// Clamp a requested session expiry (seconds) into the configured bounds.
    #[inline]
    pub fn clamp_session_expiry(&self, expiry: i32) -> i32 {
        let min = self.session_expiry_interval_min.as_secs().min(i32::MAX as u64) as i32;
        let max = self.session_expiry_interval_max.as_secs().min(i32::MAX as u64) as i32;
        expiry.clamp(min, max.max(min))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Topics {
    #[serde(default = "Topics::sessions_default")]
    pub sessions: String,
    #[serde(default = "Topics::messages_default")]
    pub messages: String,
    #[serde(default = "Topics::retained_default")]
    pub retained: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            sessions: Self::sessions_default(),
            messages: Self::messages_default(),
            retained: Self::retained_default(),
        }
    }
}

impl Topics {
    fn sessions_default() -> String {
        "mqtt-sessions".into()
    }
    fn messages_default() -> String {
        "mqtt-messages".into()
    }
    fn retained_default() -> String {
        "mqtt-retained".into()
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Capabilities {
    #[serde(default = "Capabilities::enabled")]
    pub retain_available: bool,
    #[serde(default = "Capabilities::enabled")]
    pub wildcard_available: bool,
    #[serde(default = "Capabilities::enabled")]
    pub subscription_ids_available: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self { retain_available: true, wildcard_available: true, subscription_ids_available: true }
    }
}

impl Capabilities {
    fn enabled() -> bool {
        true
    }
}

/// Slots used to stage will payloads before delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "PoolConfig::slot_count_default")]
    pub slot_count: usize,
    #[serde(default = "PoolConfig::slot_capacity_default")]
    pub slot_capacity: Bytesize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { slot_count: Self::slot_count_default(), slot_capacity: Self::slot_capacity_default() }
    }
}

impl PoolConfig {
    fn slot_count_default() -> usize {
        64
    }
    fn slot_capacity_default() -> Bytesize {
        Bytesize::from(65536)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    /// Routed id of the Kafka cache binding
    pub id: u64,
    /// MQTT topic filters selecting this route, empty matches everything
    #[serde(default)]
    pub when: Vec<String>,
    /// Kafka topic overriding `topics.messages`
    #[serde(default)]
    pub with: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BindingConfig {
    pub id: u64,
    #[serde(default)]
    pub options: Options,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

impl BindingConfig {
    /// Route used by internal streams that are not tied to an MQTT topic.
    #[inline]
    pub fn default_route(&self) -> Option<&RouteConfig> {
        self.routes.iter().find(|r| r.when.is_empty()).or_else(|| self.routes.first())
    }
}
