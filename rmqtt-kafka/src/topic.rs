//! MQTT topic names and filters, and their translation to Kafka fetch conditions.

use std::fmt::{self, Write};
use std::str::FromStr;

use bytes::Bytes;

use rmqtt_kafka_codec::kafka::{KafkaCondition, KafkaFilter, KafkaValueMatch};
use rmqtt_kafka_codec::mqtt::{SubscribeOptions, TopicFilter};
use rmqtt_kafka_conf::{BindingConfig, RouteConfig};

use crate::message::{HEADER_FILTER, HEADER_LOCAL};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    #[error("InvalidTopic({0})")]
    InvalidTopic(String),
    #[error("InvalidLevel({0})")]
    InvalidLevel(String),
}

#[derive(Debug, Eq, PartialEq, Clone, Hash)]
pub enum Level {
    Normal(String),
    Metadata(String), // $SYS
    Blank,
    SingleWildcard, // +
    MultiWildcard,  // #
}

impl Level {
    #[inline]
    pub fn is_wildcard(&self) -> bool {
        matches!(*self, Level::SingleWildcard | Level::MultiWildcard)
    }

    /// Segment match used when filtering the `mqtt:filter` headers.
    #[inline]
    fn to_value_match(&self) -> KafkaValueMatch {
        match self {
            Level::Normal(s) | Level::Metadata(s) => KafkaValueMatch::Value(Bytes::copy_from_slice(s.as_bytes())),
            Level::Blank => KafkaValueMatch::Value(Bytes::new()),
            Level::SingleWildcard => KafkaValueMatch::Skip,
            Level::MultiWildcard => KafkaValueMatch::SkipMany,
        }
    }

    fn match_str(&self, s: &str) -> bool {
        match self {
            Level::Normal(lhs) => !s.starts_with('$') && lhs == s,
            Level::Metadata(lhs) => lhs == s,
            Level::Blank => s.is_empty(),
            Level::SingleWildcard | Level::MultiWildcard => !s.starts_with('$'),
        }
    }
}

impl FromStr for Level {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        match s {
            "+" => Ok(Level::SingleWildcard),
            "#" => Ok(Level::MultiWildcard),
            "" => Ok(Level::Blank),
            _ => {
                if s.contains(['+', '#']) {
                    Err(TopicError::InvalidLevel(format!("invalid level `{}` contains +|#", s)))
                } else if s.starts_with('$') {
                    Ok(Level::Metadata(String::from(s)))
                } else {
                    Ok(Level::Normal(String::from(s)))
                }
            }
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Level::Normal(ref s) | Level::Metadata(ref s) => f.write_str(s.as_str()),
            Level::Blank => Ok(()),
            Level::SingleWildcard => f.write_char('+'),
            Level::MultiWildcard => f.write_char('#'),
        }
    }
}

#[derive(Debug, Eq, PartialEq, Clone, Hash)]
pub struct Topic(Vec<Level>);

impl Topic {
    #[inline]
    pub fn levels(&self) -> &[Level] {
        &self.0
    }

    #[inline]
    pub fn has_wildcard(&self) -> bool {
        self.0.iter().any(Level::is_wildcard)
    }

    fn is_valid(&self) -> bool {
        self.0.iter().enumerate().all(|(pos, level)| match *level {
            Level::MultiWildcard => pos == self.0.len() - 1,
            Level::Metadata(_) => pos == 0,
            _ => true,
        })
    }

    /// Whether this filter matches the topic name `topic`.
    pub fn matches_str(&self, topic: &str) -> bool {
        let mut lhs = self.0.iter();
        for rhs in topic.split('/') {
            match lhs.next() {
                Some(Level::MultiWildcard) => return !rhs.starts_with('$') || !topic.starts_with(rhs),
                Some(level) if level.match_str(rhs) => continue,
                _ => return false,
            }
        }
        matches!(lhs.next(), Some(Level::MultiWildcard) | None)
    }
}

impl FromStr for Topic {
    type Err = TopicError;

    #[inline]
    fn from_str(s: &str) -> Result<Self, TopicError> {
        s.split('/').map(Level::from_str).collect::<Result<Vec<_>, TopicError>>().map(Topic).and_then(|topic| {
            if topic.is_valid() {
                Ok(topic)
            } else {
                Err(TopicError::InvalidTopic(format!("invalid topic `{}`", s)))
            }
        })
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, level) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_char('/')?;
            }
            level.fmt(f)?;
        }
        Ok(())
    }
}

/// Compile an MQTT subscription into the conditions a Kafka fetch applies to
/// each record: the topic segments against the repeated `mqtt:filter`
/// header, and for no-local subscriptions a negated `mqtt:local` match.
pub fn compile_filter(filter: &TopicFilter, client_id: &str) -> Result<KafkaFilter, TopicError> {
    let topic = Topic::from_str(&filter.pattern)?;
    let mut conditions = vec![KafkaCondition::Headers {
        name: Bytes::from_static(HEADER_FILTER.as_bytes()),
        values: topic.levels().iter().map(Level::to_value_match).collect(),
    }];
    if filter.options.contains(SubscribeOptions::NO_LOCAL) {
        conditions.push(KafkaCondition::Not(Box::new(KafkaCondition::Header {
            name: Bytes::from_static(HEADER_LOCAL.as_bytes()),
            value: Bytes::copy_from_slice(client_id.as_bytes()),
        })));
    }
    Ok(KafkaFilter::new(conditions))
}

/// First route whose `when` filters accept `topic`, routes without filters accept anything.
pub fn resolve<'a>(binding: &'a BindingConfig, topic: &str) -> Option<&'a RouteConfig> {
    binding.routes.iter().find(|r| {
        r.when.is_empty()
            || r.when.iter().any(|w| w == topic || Topic::from_str(w).map(|f| f.matches_str(topic)).unwrap_or(false))
    })
}
