use std::fmt;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde_json::json;

/// Live value of a gauge, its peak and how many increments it has seen.
///
/// Counters that only grow read the same through `count` and `total`.
#[derive(Default)]
pub struct Counter {
    current: AtomicIsize,
    peak: AtomicIsize,
    total: AtomicUsize,
}

impl fmt::Debug for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter")
            .field("count", &self.count())
            .field("max", &self.max())
            .field("total", &self.total())
            .finish()
    }
}

impl Counter {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc(&self) {
        let now = self.current.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak.fetch_max(now, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Never drops below zero, a stray decrement is ignored.
    #[inline]
    pub fn dec(&self) {
        let _ = self.current.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| (c > 0).then(|| c - 1));
    }

    #[inline]
    pub fn count(&self) -> isize {
        self.current.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn max(&self) -> isize {
        self.peak.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn to_json(&self) -> serde_json::Value {
        json!({ "count": self.count(), "max": self.max(), "total": self.total() })
    }
}

impl Serialize for Counter {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut s = serializer.serialize_struct("Counter", 3)?;
        s.serialize_field("count", &self.count())?;
        s.serialize_field("max", &self.max())?;
        s.serialize_field("total", &self.total())?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let c = Counter::new();
        c.inc();
        c.inc();
        c.dec();
        c.inc();
        assert_eq!(c.count(), 2);
        assert_eq!(c.max(), 2);
        assert_eq!(c.total(), 3);
        assert_eq!(c.to_json(), json!({"count": 2, "max": 2, "total": 3}));
    }

    #[test]
    fn test_counter_floor() {
        let c = Counter::new();
        c.dec();
        assert_eq!(c.count(), 0);
        c.inc();
        assert_eq!(c.count(), 1);
    }
}
