//! Kafka-facing stream extensions.

use bytes::Bytes;
use bytestring::ByteString;

/// Partition placeholder meaning "all partitions"
pub const PARTITION_ANY: i32 = -1;
/// Offset placeholder for the latest position
pub const OFFSET_LIVE: i64 = -1;
/// Offset placeholder for the earliest retained position
pub const OFFSET_HISTORICAL: i64 = -2;

byte_enum! {
    pub enum KafkaCapabilities {
        ProduceOnly = 1,
        FetchOnly = 2,
        ProduceAndFetch = 3
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaHeader {
    pub name: Bytes,
    pub value: Option<Bytes>,
}

impl KafkaHeader {
    #[inline]
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self { name: name.into(), value: Some(value.into()) }
    }

    #[inline]
    pub fn is(&self, name: &[u8]) -> bool {
        self.name.as_ref() == name
    }
}

/// Match on one position of a repeated header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KafkaValueMatch {
    Value(Bytes),
    /// exactly one value
    Skip,
    /// zero or more values
    SkipMany,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KafkaCondition {
    Key(Option<Bytes>),
    Header { name: Bytes, value: Bytes },
    Headers { name: Bytes, values: Vec<KafkaValueMatch> },
    Not(Box<KafkaCondition>),
}

/// All conditions must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KafkaFilter {
    pub conditions: Vec<KafkaCondition>,
}

impl KafkaFilter {
    #[inline]
    pub fn new(conditions: Vec<KafkaCondition>) -> Self {
        Self { conditions }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KafkaOffset {
    pub partition_id: i32,
    pub partition_offset: i64,
}

impl KafkaOffset {
    #[inline]
    pub fn new(partition_id: i32, partition_offset: i64) -> Self {
        Self { partition_id, partition_offset }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedBeginEx {
    pub capabilities: KafkaCapabilities,
    pub topic: ByteString,
    pub group_id: Option<ByteString>,
    pub partitions: Vec<KafkaOffset>,
    pub filters: Vec<KafkaFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupBeginEx {
    pub group_id: ByteString,
    pub protocol: ByteString,
    /// membership timeout in milliseconds
    pub timeout: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KafkaBeginEx {
    Meta { topic: ByteString },
    Describe { topic: ByteString, configs: Vec<ByteString> },
    Fetch { topic: ByteString, partition: KafkaOffset, filters: Vec<KafkaFilter> },
    Produce { topic: ByteString, partition: KafkaOffset },
    Merged(MergedBeginEx),
    Bootstrap { topic: ByteString, group_id: Option<ByteString> },
    Group(GroupBeginEx),
}

impl KafkaBeginEx {
    #[inline]
    pub fn merged(&self) -> Option<&MergedBeginEx> {
        match self {
            KafkaBeginEx::Merged(m) => Some(m),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedFetchDataEx {
    pub deferred: i32,
    pub timestamp: i64,
    /// bit `n` set when the record matched filter `n`
    pub filters: u64,
    pub partition: KafkaOffset,
    pub progress: Vec<KafkaOffset>,
    pub key: Option<Bytes>,
    pub headers: Vec<KafkaHeader>,
}

impl MergedFetchDataEx {
    #[inline]
    pub fn header(&self, name: &[u8]) -> Option<&Bytes> {
        self.headers.iter().find(|h| h.is(name)).and_then(|h| h.value.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedProduceDataEx {
    pub deferred: i32,
    pub timestamp: i64,
    pub partition: KafkaOffset,
    pub key: Option<Bytes>,
    pub hash_key: Option<Bytes>,
    pub headers: Vec<KafkaHeader>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMembership {
    pub leader_id: ByteString,
    pub member_id: ByteString,
    pub members: i32,
}

impl GroupMembership {
    #[inline]
    pub fn is_leader(&self) -> bool {
        self.leader_id == self.member_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KafkaDataEx {
    MergedFetch(MergedFetchDataEx),
    MergedProduce(MergedProduceDataEx),
    Group(GroupMembership),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KafkaFlushEx {
    Merged { progress: Vec<KafkaOffset>, filters: Vec<KafkaFilter> },
    Group(GroupMembership),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KafkaResetEx {
    pub error: i32,
}
