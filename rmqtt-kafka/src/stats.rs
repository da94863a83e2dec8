//! Proxy counters.
//!
//! `sessions`, `publishes` and `subscribes` are gauges of live proxies, the
//! other counters only ever grow.

use serde::Serialize;
use serde_json::json;

use rmqtt_kafka_utils::Counter;

#[derive(Serialize, Debug, Default)]
pub struct Stats {
    pub sessions: Counter,
    pub publishes: Counter,
    pub subscribes: Counter,
    pub wills_registered: Counter,
    pub wills_delivered: Counter,
    pub sessions_expired: Counter,
    pub takeovers: Counter,
    pub flow_violations: Counter,
    pub signal_reconnects: Counter,
    pub pool_exhausted: Counter,
}

impl Stats {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "sessions.count": self.sessions.count(),
            "sessions.max": self.sessions.max(),
            "sessions.total": self.sessions.total(),
            "publishes.count": self.publishes.count(),
            "publishes.max": self.publishes.max(),
            "publishes.total": self.publishes.total(),
            "subscribes.count": self.subscribes.count(),
            "subscribes.max": self.subscribes.max(),
            "subscribes.total": self.subscribes.total(),
            "wills.registered": self.wills_registered.count(),
            "wills.delivered": self.wills_delivered.count(),
            "sessions.expired": self.sessions_expired.count(),
            "sessions.takeovers": self.takeovers.count(),
            "flow.violations": self.flow_violations.count(),
            "signal.reconnects": self.signal_reconnects.count(),
            "pool.exhausted": self.pool_exhausted.count(),
        })
    }
}
