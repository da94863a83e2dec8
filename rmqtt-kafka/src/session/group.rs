//! Consumer group of one member per connection of a client ("highlander").

use bytestring::ByteString;

use rmqtt_kafka_codec::frame::{DataEx, Frame, FlushEx};
use rmqtt_kafka_codec::kafka::{GroupBeginEx, GroupMembership, KafkaBeginEx, KafkaDataEx, KafkaFlushEx};

use crate::context::{Cx, Owner, Trace};
use crate::stream::KafkaStream;

pub const HIGHLANDER: &str = "highlander";

/// What the session has to react to after a group frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GroupEvent {
    Membership(GroupMembership),
    Closed,
    None,
}

#[derive(Debug)]
pub(crate) struct GroupStream {
    pub stream: KafkaStream,
}

impl GroupStream {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        cx: &mut Cx<'_>,
        trace: Trace,
        origin_id: u64,
        routed_id: u64,
        affinity: i64,
        owner: Owner,
        group_id: ByteString,
        timeout: i32,
    ) -> Self {
        let mut stream = KafkaStream::new(cx, origin_id, routed_id, owner);
        stream.do_begin(
            cx.engine,
            trace,
            affinity,
            KafkaBeginEx::Group(GroupBeginEx { group_id, protocol: HIGHLANDER.into(), timeout }),
        );
        Self { stream }
    }

    pub fn on_frame(&mut self, cx: &mut Cx<'_>, window: i32, frame: Frame) -> GroupEvent {
        let trace = Trace::of(&frame);
        match frame {
            Frame::Begin(begin) => {
                self.stream.on_begin(&begin);
                self.stream.do_grant(cx.engine, trace, window);
                GroupEvent::None
            }
            Frame::Data(data) => {
                if !self.stream.on_data(&data) {
                    log::warn!("group reply window exceeded");
                    self.stream.do_cleanup(cx.engine, trace);
                    return GroupEvent::Closed;
                }
                self.stream.do_grant(cx.engine, trace, window);
                match data.extension {
                    Some(DataEx::Kafka(KafkaDataEx::Group(m))) => self.membership(m),
                    _ => GroupEvent::None,
                }
            }
            Frame::Flush(flush) => {
                if !self.stream.on_flush(&flush) {
                    self.stream.do_cleanup(cx.engine, trace);
                    return GroupEvent::Closed;
                }
                self.stream.do_grant(cx.engine, trace, window);
                match flush.extension {
                    Some(FlushEx::Kafka(KafkaFlushEx::Group(m))) => self.membership(m),
                    _ => GroupEvent::None,
                }
            }
            Frame::Window(window) => {
                self.stream.on_window(&window);
                GroupEvent::None
            }
            Frame::End(_) | Frame::Abort(_) => {
                self.stream.on_end();
                self.stream.do_end(cx.engine, trace);
                GroupEvent::Closed
            }
            Frame::Reset(_) => {
                self.stream.on_reset();
                self.stream.do_reset(cx.engine, trace);
                GroupEvent::Closed
            }
        }
    }

    fn membership(&self, m: GroupMembership) -> GroupEvent {
        log::debug!("group leader {} member {} members {}", m.leader_id, m.member_id, m.members);
        GroupEvent::Membership(m)
    }

    #[inline]
    pub fn do_end(&mut self, cx: &mut Cx<'_>, trace: Trace) {
        self.stream.do_end(cx.engine, trace);
    }
}
