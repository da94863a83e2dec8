//! Seams between the proxy and the engine hosting it.

use std::sync::Arc;

use ahash::HashMap;
use bytestring::ByteString;
use parking_lot::RwLock;

use rmqtt_kafka_codec::frame::{Frame, FrameHeader};
use rmqtt_kafka_utils::TimestampMillis;

use crate::pool::BufferPool;
use crate::stats::Stats;

pub type TimerId = u64;

/// Services the hosting engine provides to one shard.
///
/// Every call happens on the shard's own thread. `accept` hands the frame to
/// its receiver synchronously.
pub trait EngineContext {
    fn supply_initial_id(&mut self, routed_id: u64) -> u64;

    fn supply_reply_id(&self, initial_id: u64) -> u64;

    fn supply_trace_id(&mut self) -> i64;

    /// Milliseconds since Unix epoch
    fn supply_time(&self) -> TimestampMillis;

    fn accept(&mut self, frame: Frame);

    /// Schedule `signal_id` for `binding_id` at `at`, fired once.
    fn signal_at(&mut self, at: TimestampMillis, binding_id: u64, signal_id: i32, context: u32) -> TimerId;

    fn cancel(&mut self, timer_id: TimerId) -> bool;

    fn core_index(&self) -> usize;
}

/// Identity of this process towards other owners of the sessions topic.
///
/// Shared by every shard. Regenerated when the signal partitions move.
#[derive(Clone)]
pub struct InstanceId(Arc<RwLock<ByteString>>);

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InstanceId({})", self.get())
    }
}

impl InstanceId {
    #[inline]
    pub fn new() -> Self {
        Self::with(generate_id())
    }

    #[inline]
    pub fn with(id: impl Into<ByteString>) -> Self {
        InstanceId(Arc::new(RwLock::new(id.into())))
    }

    #[inline]
    pub fn get(&self) -> ByteString {
        self.0.read().clone()
    }

    #[inline]
    pub fn regenerate(&self) -> ByteString {
        let id = generate_id();
        *self.0.write() = id.clone();
        id
    }
}

#[inline]
pub(crate) fn generate_id() -> ByteString {
    ByteString::from(uuid::Uuid::new_v4().to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Owner {
    Publish(u64),
    Subscribe(u64),
    Session(u64),
    Signal(u64),
    Bootstrap(u64),
}

/// Stream id to owning proxy.
#[derive(Debug, Default)]
pub(crate) struct Routes {
    owners: HashMap<u64, Owner>,
}

impl Routes {
    #[inline]
    pub fn route(&mut self, initial_id: u64, reply_id: u64, owner: Owner) {
        self.owners.insert(initial_id, owner);
        self.owners.insert(reply_id, owner);
    }

    #[inline]
    pub fn unroute(&mut self, initial_id: u64, reply_id: u64) {
        self.owners.remove(&initial_id);
        self.owners.remove(&reply_id);
    }

    #[inline]
    pub fn owner(&self, stream_id: u64) -> Option<Owner> {
        self.owners.get(&stream_id).copied()
    }

    /// Drop every stream id held by `owner`.
    #[inline]
    pub fn release(&mut self, owner: Owner) -> usize {
        let before = self.owners.len();
        self.owners.retain(|_, o| *o != owner);
        before - self.owners.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.owners.len()
    }
}

/// Trace and authorization stamped on outgoing frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Trace {
    pub trace_id: i64,
    pub authorization: i64,
}

impl Trace {
    #[inline]
    pub fn of(frame: &Frame) -> Self {
        Self::from(frame.header())
    }
}

impl From<&FrameHeader> for Trace {
    #[inline]
    fn from(h: &FrameHeader) -> Self {
        Trace { trace_id: h.trace_id, authorization: h.authorization }
    }
}

/// Shard state a proxy callback may touch besides its own fields.
pub(crate) struct Cx<'a> {
    pub engine: &'a mut dyn EngineContext,
    pub routes: &'a mut Routes,
    pub pool: &'a mut BufferPool,
    pub stats: &'a Stats,
    pub instance: &'a InstanceId,
}

impl Cx<'_> {
    #[inline]
    pub fn now(&self) -> TimestampMillis {
        self.engine.supply_time()
    }

    /// A fresh trace for frames not caused by an inbound frame.
    #[inline]
    pub fn trace(&mut self) -> Trace {
        Trace { trace_id: self.engine.supply_trace_id(), authorization: 0 }
    }
}
