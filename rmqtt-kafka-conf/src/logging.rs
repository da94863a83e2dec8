//! `[log]` settings: destination, level and per-module overrides.
//!
//! ```toml
//! [log]
//! to = "both"
//! level = "info"
//! dir = "/var/log/rmqtt-kafka"
//! file = "rmqtt-kafka.log"
//! [log.modules]
//! "rmqtt_kafka::signal" = "debug"
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    #[serde(default = "Log::to_default")]
    pub to: To,
    #[serde(default)]
    pub level: Level,
    #[serde(default = "Log::dir_default")]
    pub dir: String,
    #[serde(default = "Log::file_default")]
    pub file: String,
    /// module path prefix -> level, the longest matching prefix wins
    #[serde(default)]
    pub modules: BTreeMap<String, Level>,
}

impl Default for Log {
    fn default() -> Self {
        Self {
            to: Self::to_default(),
            level: Level::default(),
            dir: Self::dir_default(),
            file: Self::file_default(),
            modules: BTreeMap::new(),
        }
    }
}

impl Log {
    fn to_default() -> To {
        To::Console
    }

    fn dir_default() -> String {
        "/var/log/rmqtt-kafka".into()
    }

    fn file_default() -> String {
        "rmqtt-kafka.log".into()
    }

    /// Log file, None when `file` is empty.
    pub fn path(&self) -> Option<PathBuf> {
        if self.file.is_empty() {
            return None;
        }
        let mut path = PathBuf::from(&self.dir);
        path.push(&self.file);
        Some(path)
    }

    /// Level for records of `module`.
    pub fn level_for(&self, module: &str) -> slog::Level {
        self.modules
            .iter()
            .filter(|(prefix, _)| module.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, level)| level.inner())
            .unwrap_or(self.level.inner())
    }

    /// Most verbose level of the base level and every override.
    pub fn max_level(&self) -> slog::Level {
        self.modules
            .values()
            .map(Level::inner)
            .fold(self.level.inner(), |max, l| if l.is_at_least(max) { max } else { l })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum To {
    Off,
    File,
    Console,
    Both,
}

impl To {
    #[inline]
    pub fn file(&self) -> bool {
        matches!(self, To::Both | To::File)
    }

    #[inline]
    pub fn console(&self) -> bool {
        matches!(self, To::Both | To::Console)
    }

    #[inline]
    pub fn off(&self) -> bool {
        matches!(self, To::Off)
    }
}

/// `slog::Level` parsed from names such as "debug" or "warn".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Level(slog::Level);

impl Level {
    #[inline]
    pub fn inner(&self) -> slog::Level {
        self.0
    }
}

impl Default for Level {
    fn default() -> Self {
        Level(slog::Level::Info)
    }
}

impl From<slog::Level> for Level {
    #[inline]
    fn from(level: slog::Level) -> Self {
        Level(level)
    }
}

impl TryFrom<String> for Level {
    type Error = String;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        slog::Level::from_str(&name.to_ascii_lowercase())
            .map(Level)
            .map_err(|_| format!("unknown log level {name:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_for() {
        let mut log = Log::default();
        log.modules.insert("rmqtt_kafka".into(), Level(slog::Level::Warning));
        log.modules.insert("rmqtt_kafka::signal".into(), Level(slog::Level::Debug));
        assert_eq!(log.level_for("rmqtt_kafka::signal::will"), slog::Level::Debug);
        assert_eq!(log.level_for("rmqtt_kafka::session"), slog::Level::Warning);
        assert_eq!(log.level_for("config"), slog::Level::Info);
        assert_eq!(log.max_level(), slog::Level::Debug);
    }

    #[test]
    fn test_path() {
        let mut log = Log::default();
        assert_eq!(log.path(), Some(PathBuf::from("/var/log/rmqtt-kafka/rmqtt-kafka.log")));
        log.file.clear();
        assert_eq!(log.path(), None);
    }

    #[test]
    fn test_level_names() {
        assert_eq!(Level::try_from("DEBUG".to_string()), Ok(Level(slog::Level::Debug)));
        assert!(Level::try_from("loud".to_string()).is_err());
    }
}
