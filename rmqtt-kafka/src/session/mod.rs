//! Session proxy.
//!
//! One MQTT session stream drives a chain of Kafka streams on the sessions
//! topic. The active stream is replaced, never reconfigured, as the session
//! moves through its phases:
//!
//! 1. fetch the will-signal left by an earlier owner (only with a will and
//!    without clean start) to recover its lifetime id,
//! 2. announce the connection on `<clientId>#migrate` and join the client's
//!    group, waiting to be its only member,
//! 3. steady state: relay session state, register wills, watch for takeover.
//!
//! The session leaves the group as soon as it is the only member, later
//! connections are noticed through their migrate record instead.

mod group;

use std::collections::VecDeque;

use bytes::Bytes;
use bytestring::ByteString;

use rmqtt_kafka_codec::frame::{Begin, Data, DataEx, Frame};
use rmqtt_kafka_codec::kafka::{
    KafkaBeginEx, KafkaCapabilities, KafkaDataEx, KafkaFilter, KafkaFlushEx, KafkaHeader, KafkaOffset,
    MergedProduceDataEx,
    OFFSET_HISTORICAL, OFFSET_LIVE, PARTITION_ANY,
};
use rmqtt_kafka_codec::mqtt::{
    MqttBeginEx, MqttDataEx, MqttResetEx, SessionBeginEx, SessionDataEx, SessionDataKind, SessionFlags,
    REASON_SESSION_TAKEN_OVER,
};
use rmqtt_kafka_codec::signal::{ExpirySignal, MigrateSignal, WillMessage, WillSignal, UNKNOWN};
use rmqtt_kafka_codec::{Decode, Encode};
use rmqtt_kafka_conf::BindingConfig;
use rmqtt_kafka_utils::TimestampMillis;

use crate::context::{generate_id, Cx, Owner, Trace};
use crate::error::ProxyError;
use crate::keys::{
    foreign_key_filter, key_filter, sender_header, type_filter, type_header, ClientId, TYPE_EXPIRY_SIGNAL,
    TYPE_WILL_SIGNAL,
};
use crate::stream::{merged_begin, KafkaStream, MqttStream};

pub(crate) use self::group::{GroupEvent, GroupStream, HIGHLANDER};

/// Extra per-frame padding asked from the client, covering the will-signal
/// and ids added to every will it registers.
pub const WILL_PADDING: i32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PhaseKind {
    FetchWillSignal,
    SessionSignal,
    SessionState,
}

#[derive(Debug)]
enum Phase {
    FetchWillSignal(KafkaStream),
    SessionSignal(KafkaStream),
    SessionState(KafkaStream),
}

impl Phase {
    fn new(kind: PhaseKind, stream: KafkaStream) -> Self {
        match kind {
            PhaseKind::FetchWillSignal => Phase::FetchWillSignal(stream),
            PhaseKind::SessionSignal => Phase::SessionSignal(stream),
            PhaseKind::SessionState => Phase::SessionState(stream),
        }
    }

    #[inline]
    fn kind(&self) -> PhaseKind {
        match self {
            Phase::FetchWillSignal(_) => PhaseKind::FetchWillSignal,
            Phase::SessionSignal(_) => PhaseKind::SessionSignal,
            Phase::SessionState(_) => PhaseKind::SessionState,
        }
    }

    #[inline]
    fn stream(&self) -> &KafkaStream {
        match self {
            Phase::FetchWillSignal(s) | Phase::SessionSignal(s) | Phase::SessionState(s) => s,
        }
    }

    #[inline]
    fn stream_mut(&mut self) -> &mut KafkaStream {
        match self {
            Phase::FetchWillSignal(s) | Phase::SessionSignal(s) | Phase::SessionState(s) => s,
        }
    }

    /// The active stream, when it can write to the sessions topic.
    #[inline]
    fn producer(&mut self) -> Option<&mut KafkaStream> {
        match self {
            Phase::FetchWillSignal(_) => None,
            Phase::SessionSignal(s) | Phase::SessionState(s) => Some(s),
        }
    }
}

#[derive(Debug, Clone)]
struct WillRegistration {
    lifetime_id: ByteString,
    will_id: ByteString,
    /// milliseconds
    delay: i32,
}

/// Control record waiting for the active stream to open its window.
#[derive(Debug)]
struct Pending {
    key: Bytes,
    payload: Option<Bytes>,
    headers: Vec<KafkaHeader>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Closing {
    End,
    Abort,
}

pub(crate) struct SessionProxy {
    mqtt: MqttStream,
    client_id: ClientId,
    session_id: ByteString,
    begin: SessionBeginEx,
    /// clamped session expiry, seconds
    expiry: i32,
    created_at: TimestampMillis,
    route_id: u64,
    topic: String,
    reply_window: i32,
    phase: Phase,
    group: Option<GroupStream>,
    lifetime_id: Option<ByteString>,
    recovered: Option<WillSignal>,
    will: Option<WillRegistration>,
    pending: VecDeque<Pending>,
    // fragments of a state record in flight, to the client and to kafka
    relaying: bool,
    storing: bool,
    closing: Option<Closing>,
    ceded: bool,
}

impl SessionProxy {
    pub fn new(
        cx: &mut Cx<'_>,
        binding: &BindingConfig,
        session_id: &ByteString,
        begin: &Begin,
        ex: SessionBeginEx,
    ) -> Result<Self, ProxyError> {
        let route = binding.default_route().ok_or_else(|| ProxyError::NoRoute(ex.client_id.to_string()))?;
        let options = &binding.options;
        let trace = Trace::from(&begin.header);
        let client_id = ClientId::new(ex.client_id.clone());
        let expiry = options.clamp_session_expiry(ex.expiry);

        let kind = if ex.flags.contains(SessionFlags::WILL) && !ex.flags.contains(SessionFlags::CLEAN_START) {
            PhaseKind::FetchWillSignal
        } else {
            PhaseKind::SessionSignal
        };

        let owner = Owner::Session(begin.header.stream_id);
        let mqtt = MqttStream::new(cx, begin, owner);
        let topic = options.topics.sessions.clone();
        let mut stream = KafkaStream::new(cx, mqtt.routed_id, route.id, owner);
        stream.do_begin(cx.engine, trace, mqtt.affinity, phase_begin(kind, &topic, &client_id, session_id));

        log::debug!(
            "{} session {:?} expiry {}s (requested {}s) starting in {:?}",
            client_id,
            ex.flags,
            expiry,
            ex.expiry,
            kind
        );
        cx.stats.sessions.inc();
        Ok(Self {
            mqtt,
            client_id,
            session_id: session_id.clone(),
            begin: ex,
            expiry,
            created_at: cx.now(),
            route_id: route.id,
            topic,
            reply_window: options.reply_window,
            phase: Phase::new(kind, stream),
            group: None,
            lifetime_id: None,
            recovered: None,
            will: None,
            pending: VecDeque::new(),
            relaying: false,
            storing: false,
            closing: None,
            ceded: false,
        })
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.mqtt.is_closed()
    }

    #[cfg(test)]
    #[inline]
    pub fn phase(&self) -> PhaseKind {
        self.phase.kind()
    }

    pub fn cleanup(&mut self, cx: &mut Cx<'_>) {
        let trace = cx.trace();
        self.phase.stream_mut().do_cleanup(cx.engine, trace);
        if let Some(group) = self.group.as_mut() {
            group.stream.do_cleanup(cx.engine, trace);
        }
        cx.stats.sessions.dec();
    }

    #[inline]
    fn flags(&self) -> SessionFlags {
        self.begin.flags
    }

    #[inline]
    fn expiry_millis(&self) -> i32 {
        (self.expiry as i64 * 1000).clamp(0, i32::MAX as i64) as i32
    }

    #[inline]
    fn owner(&self) -> Owner {
        Owner::Session(self.mqtt.initial_id)
    }

    pub fn on_frame(&mut self, cx: &mut Cx<'_>, frame: Frame) {
        let trace = Trace::of(&frame);
        let id = frame.stream_id();
        if self.mqtt.owns(id) {
            self.on_mqtt(cx, trace, frame);
        } else if self.phase.stream().owns(id) {
            self.on_phase(cx, trace, frame);
        } else if self.group.as_ref().map(|g| g.stream.owns(id)).unwrap_or(false) {
            self.on_group(cx, frame);
        } else {
            log::debug!("{} session dropping {} for stale stream {}", self.client_id, frame.name(), id);
        }
    }

    fn on_mqtt(&mut self, cx: &mut Cx<'_>, trace: Trace, frame: Frame) {
        match frame {
            Frame::Data(data) => self.on_mqtt_data(cx, trace, data),
            Frame::End(_) => {
                self.mqtt.on_end();
                self.on_mqtt_close(cx, trace, Closing::End);
            }
            Frame::Abort(_) => {
                self.mqtt.on_abort();
                self.on_mqtt_close(cx, trace, Closing::Abort);
            }
            Frame::Window(window) => {
                self.mqtt.on_window(&window);
                self.mirror_reply(cx, trace);
            }
            Frame::Reset(_) => {
                self.mqtt.on_reset();
                self.phase.stream_mut().do_reset(cx.engine, trace);
            }
            other => log::debug!("{} session ignoring mqtt {}", self.client_id, other.name()),
        }
    }

    fn on_mqtt_data(&mut self, cx: &mut Cx<'_>, trace: Trace, data: Data) {
        if !self.mqtt.on_data(&data) {
            log::warn!("{} session window exceeded", self.client_id);
            return self.violation(cx, trace);
        }
        if self.phase.kind() != PhaseKind::SessionState {
            log::error!("{} session data before the session was established", self.client_id);
            return self.violation(cx, trace);
        }

        match data.extension {
            Some(DataEx::Mqtt(MqttDataEx::Session(SessionDataEx { kind: SessionDataKind::Will, .. }))) => {
                if !data.is_init() || !data.is_fin() {
                    log::error!("{} session fragmented will", self.client_id);
                    return self.violation(cx, trace);
                }
                self.on_will(cx, trace, data.payload);
            }
            Some(DataEx::Mqtt(MqttDataEx::Session(SessionDataEx { kind: SessionDataKind::State, deferred }))) => {
                let ex = KafkaDataEx::MergedProduce(MergedProduceDataEx {
                    deferred,
                    timestamp: cx.now(),
                    partition: KafkaOffset::new(PARTITION_ANY, OFFSET_LIVE),
                    key: Some(self.client_id.state_key()),
                    hash_key: None,
                    headers: vec![],
                });
                self.storing = !data.is_fin();
                self.store(cx, trace, &data, Some(ex));
            }
            None if !data.is_init() && self.storing => {
                self.storing = !data.is_fin();
                self.store(cx, trace, &data, None);
            }
            _ => {
                log::error!("{} session {}", self.client_id, ProxyError::UnexpectedExtension("session data"));
                return self.violation(cx, trace);
            }
        }
        self.mirror_initial(cx, trace);
    }

    fn store(&mut self, cx: &mut Cx<'_>, trace: Trace, data: &Data, ex: Option<KafkaDataEx>) {
        let stream = self.phase.stream_mut();
        if !stream.can_send(data.reserved) {
            log::warn!("{} session {}", self.client_id, ProxyError::FlowControl(stream.initial_id));
            return self.violation(cx, trace);
        }
        stream.do_data(cx.engine, trace, data.flags, data.reserved, data.payload.clone(), ex);
    }

    /// Register the will: payload record, will-signal, then refilter so the
    /// writes are visible before the client sees them acknowledged.
    fn on_will(&mut self, cx: &mut Cx<'_>, trace: Trace, payload: Option<Bytes>) {
        let mut will = match payload.map(WillMessage::decode_from) {
            Some(Ok(will)) => will,
            Some(Err(e)) => {
                log::error!("{} session invalid will, {}", self.client_id, e);
                return self.violation(cx, trace);
            }
            None => {
                log::error!("{} session will without payload", self.client_id);
                return self.violation(cx, trace);
            }
        };

        let lifetime_id = self.lifetime_id.get_or_insert_with(generate_id).clone();
        let will_id = generate_id();
        will.lifetime_id = Some(lifetime_id.clone());
        will.will_id = Some(will_id.clone());
        let delay = (will.delay as i64 * 1000).clamp(0, self.expiry_millis() as i64) as i32;

        let signal = WillSignal {
            client_id: self.client_id.as_bytestring().clone(),
            delay,
            deliver_at: UNKNOWN,
            lifetime_id: lifetime_id.clone(),
            will_id: will_id.clone(),
            instance_id: cx.instance.get(),
        };
        let (record, signal) = match (will.encode_to_bytes(), signal.encode_to_bytes()) {
            (Ok(record), Ok(signal)) => (record, signal),
            (Err(e), _) | (_, Err(e)) => {
                log::error!("{} session will encode failed, {}", self.client_id, e);
                return self.violation(cx, trace);
            }
        };

        let now = cx.now();
        let filters = state_filters(&self.client_id, &self.session_id);
        let stream = self.phase.stream_mut();
        let needed = stream.initial.reserved(record.len()) as i64 + stream.initial.reserved(signal.len()) as i64;
        if !stream.can_send(0) || stream.initial.credit() < needed {
            log::warn!("{} session will {}", self.client_id, ProxyError::FlowControl(stream.initial_id));
            return self.violation(cx, trace);
        }
        stream.do_produce(cx.engine, trace, now, self.client_id.will_key(&lifetime_id), Some(record), vec![]);
        stream.do_produce(
            cx.engine,
            trace,
            now,
            self.client_id.will_signal_key(),
            Some(signal),
            vec![type_header(TYPE_WILL_SIGNAL)],
        );
        stream.do_flush(cx.engine, trace, 0, KafkaFlushEx::Merged { progress: vec![], filters });

        log::info!(
            "{} session will registered, lifetime {} will {} delay {}ms",
            self.client_id,
            lifetime_id,
            will_id,
            delay
        );
        cx.stats.wills_registered.inc();
        self.will = Some(WillRegistration { lifetime_id, will_id, delay });
    }

    fn on_mqtt_close(&mut self, cx: &mut Cx<'_>, trace: Trace, closing: Closing) {
        if self.ceded || self.closing.is_some() {
            return self.finish(cx, trace);
        }
        self.closing = Some(closing);
        let now = cx.now();
        if self.phase.kind() == PhaseKind::FetchWillSignal {
            // the fetch cannot write, the close signals go out on a session-signal stream
            self.replace_phase(cx, trace, PhaseKind::SessionSignal);
        }

        match closing {
            Closing::End => {
                let lifetime_id = match (&self.will, &self.recovered) {
                    (Some(w), _) => Some(w.lifetime_id.clone()),
                    (None, Some(r)) => Some(r.lifetime_id.clone()),
                    (None, None) => None,
                };
                if let Some(lifetime_id) = lifetime_id {
                    self.produce(cx, trace, self.client_id.will_key(&lifetime_id), None, vec![]);
                    self.produce(
                        cx,
                        trace,
                        self.client_id.will_signal_key(),
                        None,
                        vec![type_header(TYPE_WILL_SIGNAL)],
                    );
                }
            }
            Closing::Abort => {
                if self.flags().contains(SessionFlags::WILL) {
                    self.send_will_signal(cx, trace, now);
                }
            }
        }

        let expiry = self.expiry_millis();
        self.send_expiry_signal(cx, trace, expiry, now + expiry as i64);

        if self.pending.is_empty() {
            self.close_streams(cx, trace);
        }
        log::debug!("{} session closing on {:?}, {} records pending", self.client_id, closing, self.pending.len());
    }

    /// End the backend legs, and the client's once nothing more comes back.
    fn close_streams(&mut self, cx: &mut Cx<'_>, trace: Trace) {
        self.phase.stream_mut().do_end(cx.engine, trace);
        if let Some(group) = self.group.as_mut() {
            group.do_end(cx, trace);
        }
        let stream = self.phase.stream();
        if !stream.state.reply_opening() || stream.state.reply_closed() {
            self.finish(cx, trace);
        }
    }

    /// Close the client's reply leg once the backend drained.
    fn finish(&mut self, cx: &mut Cx<'_>, trace: Trace) {
        match self.closing {
            Some(Closing::End) => self.mqtt.do_end(cx.engine, trace),
            Some(Closing::Abort) => self.mqtt.do_abort(cx.engine, trace),
            None => {}
        }
    }

    fn on_phase(&mut self, cx: &mut Cx<'_>, trace: Trace, frame: Frame) {
        let kind = self.phase.kind();
        match frame {
            Frame::Begin(begin) => {
                self.phase.stream_mut().on_begin(&begin);
                self.grant_reply(cx, trace);
            }
            Frame::Data(data) => {
                if !self.phase.stream_mut().on_data(&data) {
                    log::warn!("{} session kafka reply window exceeded", self.client_id);
                    return self.violation(cx, trace);
                }
                match kind {
                    PhaseKind::FetchWillSignal => self.on_recovered(&data),
                    PhaseKind::SessionSignal => {
                        log::debug!("{} session migrate record while joining", self.client_id);
                    }
                    PhaseKind::SessionState => return self.on_state_data(cx, trace, data),
                }
                self.grant_reply(cx, trace);
            }
            Frame::Flush(flush) => {
                if !self.phase.stream_mut().on_flush(&flush) {
                    return self.violation(cx, trace);
                }
                if kind == PhaseKind::FetchWillSignal {
                    self.transition(cx, trace, PhaseKind::SessionSignal);
                } else {
                    self.grant_reply(cx, trace);
                }
            }
            Frame::Window(window) => {
                let first = self.phase.stream_mut().on_window(&window);
                if !self.pending.is_empty() {
                    self.drain_pending(cx, trace);
                }
                if self.closing.is_some() {
                    if self.pending.is_empty() && !self.phase.stream().state.initial_closed() {
                        self.close_streams(cx, trace);
                    }
                    return;
                }
                match kind {
                    PhaseKind::SessionSignal if first => self.on_signal_opened(cx, trace),
                    PhaseKind::SessionState if first => self.on_state_opened(cx, trace),
                    PhaseKind::SessionState => self.mirror_initial(cx, trace),
                    _ => {}
                }
            }
            Frame::End(_) | Frame::Abort(_) => {
                self.phase.stream_mut().on_end();
                if self.closing.is_some() {
                    self.finish(cx, trace);
                } else if kind == PhaseKind::FetchWillSignal {
                    self.transition(cx, trace, PhaseKind::SessionSignal);
                } else if !self.ceded {
                    log::warn!("{} session stream closed by kafka in {:?}", self.client_id, kind);
                    self.fail(cx, trace);
                }
            }
            Frame::Reset(_) => {
                self.phase.stream_mut().on_reset();
                if self.closing.is_some() {
                    self.finish(cx, trace);
                } else if !self.ceded {
                    log::warn!("{} session stream reset by kafka in {:?}", self.client_id, kind);
                    self.fail(cx, trace);
                }
            }
        }
    }

    /// A will-signal left by an earlier connection of this client.
    fn on_recovered(&mut self, data: &Data) {
        match data.payload.clone().map(WillSignal::decode_from) {
            Some(Ok(signal)) => {
                log::debug!("{} session recovered lifetime {}", self.client_id, signal.lifetime_id);
                self.lifetime_id = Some(signal.lifetime_id.clone());
                self.recovered = Some(signal);
            }
            Some(Err(e)) => log::warn!("{} session skipping invalid will-signal, {}", self.client_id, e),
            None => {
                self.lifetime_id = None;
                self.recovered = None;
            }
        }
    }

    fn on_signal_opened(&mut self, cx: &mut Cx<'_>, trace: Trace) {
        self.send_migrate(cx, trace);
        if self.group.is_none() {
            let group = GroupStream::open(
                cx,
                trace,
                self.mqtt.routed_id,
                self.route_id,
                self.mqtt.affinity,
                self.owner(),
                self.client_id.as_bytestring().clone(),
                self.expiry_millis(),
            );
            self.group = Some(group);
        }
    }

    fn on_state_opened(&mut self, cx: &mut Cx<'_>, trace: Trace) {
        if !self.flags().contains(SessionFlags::CLEAN_START) {
            self.produce(cx, trace, self.client_id.will_signal_key(), None, vec![type_header(TYPE_WILL_SIGNAL)]);
        }
        let expiry = self.expiry_millis();
        self.send_expiry_signal(cx, trace, expiry, UNKNOWN);

        let corrective = if self.expiry != self.begin.expiry {
            Some(MqttBeginEx::Session(SessionBeginEx { expiry: self.expiry, ..self.begin.clone() }))
        } else {
            None
        };
        self.mqtt.do_begin(cx.engine, trace, corrective);
        self.mirror_initial(cx, trace);
        log::info!("{} session established", self.client_id);
    }

    fn on_state_data(&mut self, cx: &mut Cx<'_>, trace: Trace, mut data: Data) {
        match data.extension.take() {
            Some(DataEx::Kafka(KafkaDataEx::MergedFetch(f))) => {
                let key = f.key.clone().unwrap_or_default();
                if key == self.client_id.migrate_key() {
                    if f.timestamp >= self.created_at {
                        log::info!("{} session taken over by another connection", self.client_id);
                        return self.cede(cx, trace, false);
                    }
                    log::debug!("{} session skipping migrate record older than the session", self.client_id);
                } else if key == self.client_id.state_key() {
                    let ex = MqttDataEx::Session(SessionDataEx { deferred: f.deferred, kind: SessionDataKind::State });
                    self.relaying = !data.is_fin();
                    return self.relay(cx, trace, data, Some(ex));
                }
            }
            None if !data.is_init() && self.relaying => {
                self.relaying = !data.is_fin();
                return self.relay(cx, trace, data, None);
            }
            _ => log::debug!("{} session skipping unexpected record", self.client_id),
        }
        self.mirror_reply(cx, trace);
    }

    fn relay(&mut self, cx: &mut Cx<'_>, trace: Trace, data: Data, ex: Option<MqttDataEx>) {
        if !self.mqtt.can_send(data.reserved) {
            log::warn!("{} session {}", self.client_id, ProxyError::FlowControl(self.mqtt.reply_id));
            return self.violation(cx, trace);
        }
        self.mqtt.do_data(cx.engine, trace, data.flags, data.reserved, data.payload, ex);
    }

    fn on_group(&mut self, cx: &mut Cx<'_>, frame: Frame) {
        let trace = Trace::of(&frame);
        let event = match self.group.as_mut() {
            Some(group) => group.on_frame(cx, self.reply_window, frame),
            None => return,
        };
        match event {
            GroupEvent::Membership(m) if m.is_leader() => {
                if m.members > 1 {
                    log::info!("{} session contended by {} members, ceding", self.client_id, m.members);
                    self.cede(cx, trace, true);
                } else if m.members == 1 && self.phase.kind() == PhaseKind::SessionSignal {
                    self.leave_group(cx, trace);
                    self.transition(cx, trace, PhaseKind::SessionState);
                }
            }
            GroupEvent::Membership(_) | GroupEvent::None => {}
            GroupEvent::Closed => {
                if self.closing.is_none() && !self.ceded {
                    log::warn!("{} session group closed by kafka", self.client_id);
                    self.fail(cx, trace);
                }
            }
        }
    }

    fn leave_group(&mut self, cx: &mut Cx<'_>, trace: Trace) {
        if let Some(mut group) = self.group.take() {
            group.stream.do_end(cx.engine, trace);
            group.stream.do_reset(cx.engine, trace);
            cx.routes.unroute(group.stream.initial_id, group.stream.reply_id);
        }
    }

    /// Replace the active stream.
    fn transition(&mut self, cx: &mut Cx<'_>, trace: Trace, next: PhaseKind) {
        if self.closing.is_some() || self.ceded || self.phase.kind() == next {
            return;
        }
        self.replace_phase(cx, trace, next);
    }

    fn replace_phase(&mut self, cx: &mut Cx<'_>, trace: Trace, next: PhaseKind) {
        let old = self.phase.stream_mut();
        old.do_end(cx.engine, trace);
        old.do_reset(cx.engine, trace);
        cx.routes.unroute(old.initial_id, old.reply_id);

        let mut stream = KafkaStream::new(cx, self.mqtt.routed_id, self.route_id, self.owner());
        stream.do_begin(
            cx.engine,
            trace,
            self.mqtt.affinity,
            phase_begin(next, &self.topic, &self.client_id, &self.session_id),
        );
        log::debug!("{} session {:?} -> {:?}", self.client_id, self.phase.kind(), next);
        self.phase = Phase::new(next, stream);
    }

    /// Another connection owns the client now.
    fn cede(&mut self, cx: &mut Cx<'_>, trace: Trace, migrate: bool) {
        if self.ceded {
            return;
        }
        self.ceded = true;
        let now = cx.now();
        if self.flags().contains(SessionFlags::WILL) {
            self.send_will_signal(cx, trace, now);
        }
        if migrate {
            self.send_migrate(cx, trace);
        }
        self.phase.stream_mut().do_end(cx.engine, trace);
        if let Some(group) = self.group.as_mut() {
            group.do_end(cx, trace);
        }
        let reset = MqttResetEx { server_ref: self.begin.server_ref.clone(), reason_code: REASON_SESSION_TAKEN_OVER };
        self.mqtt.do_reset(cx.engine, trace, Some(reset));
        self.mqtt.do_end(cx.engine, trace);
        cx.stats.takeovers.inc();
    }

    /// Will-signal with a concrete deadline, so whoever fetches it delivers.
    fn send_will_signal(&mut self, cx: &mut Cx<'_>, trace: Trace, now: TimestampMillis) {
        let (lifetime_id, will_id, delay) = match (&self.will, &self.recovered) {
            (Some(w), _) => (w.lifetime_id.clone(), w.will_id.clone(), w.delay),
            (None, Some(r)) => (r.lifetime_id.clone(), r.will_id.clone(), r.delay),
            (None, None) => {
                log::debug!("{} session has no will to signal", self.client_id);
                return;
            }
        };
        let signal = WillSignal {
            client_id: self.client_id.as_bytestring().clone(),
            delay,
            deliver_at: now + delay as i64,
            lifetime_id,
            will_id,
            instance_id: cx.instance.get(),
        };
        match signal.encode_to_bytes() {
            Ok(payload) => self.produce(
                cx,
                trace,
                self.client_id.will_signal_key(),
                Some(payload),
                vec![type_header(TYPE_WILL_SIGNAL)],
            ),
            Err(e) => log::error!("{} session will-signal encode failed, {}", self.client_id, e),
        }
    }

    fn send_expiry_signal(&mut self, cx: &mut Cx<'_>, trace: Trace, delay: i32, expire_at: TimestampMillis) {
        let signal = ExpirySignal {
            client_id: self.client_id.as_bytestring().clone(),
            delay,
            expire_at,
            instance_id: cx.instance.get(),
        };
        match signal.encode_to_bytes() {
            Ok(payload) => self.produce(
                cx,
                trace,
                self.client_id.expiry_signal_key(),
                Some(payload),
                vec![type_header(TYPE_EXPIRY_SIGNAL)],
            ),
            Err(e) => log::error!("{} session expiry-signal encode failed, {}", self.client_id, e),
        }
    }

    fn send_migrate(&mut self, cx: &mut Cx<'_>, trace: Trace) {
        let signal =
            MigrateSignal { client_id: self.client_id.as_bytestring().clone(), session_id: self.session_id.clone() };
        match signal.encode_to_bytes() {
            Ok(payload) => self.produce(
                cx,
                trace,
                self.client_id.migrate_key(),
                Some(payload),
                vec![sender_header(&self.session_id)],
            ),
            Err(e) => log::error!("{} session migrate encode failed, {}", self.client_id, e),
        }
    }

    /// Control record on the active stream, queued in order until it fits.
    fn produce(
        &mut self,
        cx: &mut Cx<'_>,
        trace: Trace,
        key: Bytes,
        payload: Option<Bytes>,
        headers: Vec<KafkaHeader>,
    ) {
        self.pending.push_back(Pending { key, payload, headers });
        self.drain_pending(cx, trace);
        if let Some(p) = self.pending.back() {
            log::debug!(
                "{} session deferred control record {:?} in {:?}",
                self.client_id,
                String::from_utf8_lossy(&p.key),
                self.phase.kind()
            );
        }
    }

    fn drain_pending(&mut self, cx: &mut Cx<'_>, trace: Trace) {
        let now = cx.now();
        let Some(stream) = self.phase.producer() else {
            return;
        };
        while let Some(p) = self.pending.front() {
            let len = p.payload.as_ref().map(|b| b.len()).unwrap_or(0);
            if !stream.can_send(stream.initial.reserved(len)) {
                break;
            }
            if let Some(p) = self.pending.pop_front() {
                stream.do_produce(cx.engine, trace, now, p.key, p.payload, p.headers);
            }
        }
    }

    /// Grant the client what the active stream can take.
    fn mirror_initial(&mut self, cx: &mut Cx<'_>, trace: Trace) {
        let stream = self.phase.stream();
        if self.phase.kind() == PhaseKind::SessionState && stream.state.initial_opened() {
            let flow = stream.initial;
            self.mqtt.do_mirror(cx.engine, trace, &flow, WILL_PADDING);
        }
    }

    /// Grant the active stream what the client can take.
    fn mirror_reply(&mut self, cx: &mut Cx<'_>, trace: Trace) {
        if self.phase.kind() == PhaseKind::SessionState {
            self.phase.stream_mut().do_mirror(cx.engine, trace, &self.mqtt.reply);
        }
    }

    fn grant_reply(&mut self, cx: &mut Cx<'_>, trace: Trace) {
        if self.phase.kind() == PhaseKind::SessionState {
            self.mirror_reply(cx, trace);
        } else {
            self.phase.stream_mut().do_grant(cx.engine, trace, self.reply_window);
        }
    }

    fn violation(&mut self, cx: &mut Cx<'_>, trace: Trace) {
        cx.stats.flow_violations.inc();
        self.fail(cx, trace);
    }

    fn fail(&mut self, cx: &mut Cx<'_>, trace: Trace) {
        self.mqtt.do_reset(cx.engine, trace, None);
        self.mqtt.do_abort(cx.engine, trace);
        self.phase.stream_mut().do_cleanup(cx.engine, trace);
        if let Some(group) = self.group.as_mut() {
            group.stream.do_cleanup(cx.engine, trace);
        }
    }
}

fn state_filters(client_id: &ClientId, session_id: &ByteString) -> Vec<KafkaFilter> {
    vec![key_filter(client_id.state_key()), foreign_key_filter(client_id.migrate_key(), session_id)]
}

fn phase_begin(
    kind: PhaseKind,
    topic: &str,
    client_id: &ClientId,
    session_id: &ByteString,
) -> KafkaBeginEx {
    match kind {
        PhaseKind::FetchWillSignal => {
            let mut filter = key_filter(client_id.will_signal_key());
            filter.conditions.extend(type_filter(TYPE_WILL_SIGNAL).conditions);
            merged_begin(KafkaCapabilities::FetchOnly, topic, OFFSET_HISTORICAL, vec![filter])
        }
        PhaseKind::SessionSignal => merged_begin(
            KafkaCapabilities::ProduceAndFetch,
            topic,
            OFFSET_LIVE,
            vec![foreign_key_filter(client_id.migrate_key(), session_id)],
        ),
        PhaseKind::SessionState => merged_begin(
            KafkaCapabilities::ProduceAndFetch,
            topic,
            OFFSET_HISTORICAL,
            state_filters(client_id, session_id),
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rmqtt_kafka_codec::frame::{Reset, ResetEx, DATA_FLAG_COMPLETE};
    use rmqtt_kafka_codec::mqtt::{Capabilities, PayloadFormat, PublishFlags, QoS};

    use super::*;
    use crate::keys::HEADER_SENDER_ID;
    use crate::testing::{binding, find, kafka_begins, produced, Harness, START};

    const MQTT: u64 = 1001;
    const MQTT_REPLY: u64 = 1000;

    fn session(client_id: &str, flags: SessionFlags, expiry: i32) -> MqttBeginEx {
        MqttBeginEx::Session(SessionBeginEx {
            flags,
            expiry,
            client_id: client_id.into(),
            server_ref: Some("mqtt-2".into()),
            qos_max: QoS::AtLeastOnce,
            packet_size_max: 65536,
            capabilities: Capabilities::RETAIN,
        })
    }

    fn will_message() -> WillMessage {
        WillMessage {
            topic: "lwt/dev0".into(),
            delay: 5,
            qos: QoS::AtLeastOnce,
            flags: PublishFlags::empty(),
            expiry_interval: -1,
            content_type: None,
            format: PayloadFormat::Text,
            response_topic: None,
            lifetime_id: None,
            will_id: None,
            correlation: None,
            properties: vec![],
            payload: Bytes::from_static(b"offline"),
        }
    }

    fn session_data(kind: SessionDataKind) -> Option<DataEx> {
        Some(DataEx::Mqtt(MqttDataEx::Session(SessionDataEx { deferred: 0, kind })))
    }

    fn merged(ex: &KafkaBeginEx) -> &rmqtt_kafka_codec::kafka::MergedBeginEx {
        ex.merged().unwrap()
    }

    fn previous_signal(client_id: &str, lifetime_id: &str, will_id: &str) -> WillSignal {
        WillSignal {
            client_id: client_id.into(),
            delay: 5000,
            deliver_at: UNKNOWN,
            lifetime_id: lifetime_id.into(),
            will_id: will_id.into(),
            instance_id: "instance-b".into(),
        }
    }

    fn recover(h: &mut Harness, fetch_reply: u64, previous: &WillSignal) {
        let key = Bytes::from(format!("{}#will-signal", previous.client_id));
        let payload = previous.encode_to_bytes().unwrap();
        h.fetched(fetch_reply, START - 10, key, Some(payload), vec![type_header(TYPE_WILL_SIGNAL)]);
    }

    /// Drive a session to its steady state, returning the state stream id.
    fn establish(h: &mut Harness, client_id: &str, flags: SessionFlags) -> u64 {
        establish_with(h, client_id, flags, None)
    }

    fn establish_with(h: &mut Harness, client_id: &str, flags: SessionFlags, previous: Option<&WillSignal>) -> u64 {
        h.open(MQTT, session(client_id, flags, 60));
        let mut begins = kafka_begins(&h.take());
        if flags.contains(SessionFlags::WILL) && !flags.contains(SessionFlags::CLEAN_START) {
            let fetch = begins[0].0;
            h.begin(fetch - 1);
            if let Some(previous) = previous {
                recover(h, fetch - 1, previous);
            }
            h.flush(fetch - 1, None);
            begins = kafka_begins(&h.take());
        }
        let signal = begins[0].0;
        h.begin(signal - 1);
        h.window(signal, 0, 65536, 0);
        let group = kafka_begins(&h.take())
            .into_iter()
            .find(|(_, ex)| matches!(ex, KafkaBeginEx::Group(_)))
            .unwrap()
            .0;
        h.begin(group - 1);
        h.membership(group - 1, "m1", "m1", 1);
        let state = kafka_begins(&h.take())[0].0;
        h.begin(state - 1);
        h.window(state, 0, 65536, 0);
        state
    }

    fn register_will(h: &mut Harness) {
        let payload = will_message().encode_to_bytes().unwrap();
        h.data(MQTT, DATA_FLAG_COMPLETE, Some(payload), session_data(SessionDataKind::Will));
    }

    #[test]
    fn test_session_with_recovered_will() {
        let mut h = Harness::new(1);
        h.attach(binding());
        h.open(MQTT, session("dev0", SessionFlags::WILL, 60));

        let begins = kafka_begins(&h.take());
        assert_eq!(begins.len(), 1);
        let (fetch, ex) = &begins[0];
        assert_eq!(merged(ex).capabilities, KafkaCapabilities::FetchOnly);
        assert_eq!(merged(ex).topic, "mqtt-sessions");
        assert_eq!(merged(ex).partitions[0].partition_offset, OFFSET_HISTORICAL);
        assert_eq!(h.factory.session_phase(MQTT), Some(PhaseKind::FetchWillSignal));

        // will-signal of the previous connection
        let previous = WillSignal {
            client_id: "dev0".into(),
            delay: 5000,
            deliver_at: UNKNOWN,
            lifetime_id: "L0".into(),
            will_id: "W0".into(),
            instance_id: "instance-b".into(),
        };
        h.begin(fetch - 1);
        h.fetched(
            fetch - 1,
            START - 10,
            Bytes::from_static(b"dev0#will-signal"),
            Some(previous.encode_to_bytes().unwrap()),
            vec![type_header(TYPE_WILL_SIGNAL)],
        );
        h.flush(fetch - 1, None);

        let frames = h.take();
        assert!(find(&frames, "END", *fetch).is_some());
        let begins = kafka_begins(&frames);
        let (signal, ex) = &begins[0];
        assert_eq!(merged(ex).capabilities, KafkaCapabilities::ProduceAndFetch);
        assert_eq!(merged(ex).partitions[0].partition_offset, OFFSET_LIVE);
        assert_eq!(h.factory.session_phase(MQTT), Some(PhaseKind::SessionSignal));

        h.begin(signal - 1);
        h.window(*signal, 0, 65536, 0);
        let frames = h.take();
        let records = produced(&frames);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key_str(), "dev0#migrate");
        assert!(records[0].header(HEADER_SENDER_ID).is_some());
        let begins = kafka_begins(&frames);
        let (group, ex) = &begins[0];
        match ex {
            KafkaBeginEx::Group(g) => {
                assert_eq!(g.group_id, "dev0");
                assert_eq!(g.protocol, HIGHLANDER);
                assert_eq!(g.timeout, 60_000);
            }
            other => panic!("unexpected {:?}", other),
        }

        h.begin(group - 1);
        h.membership(group - 1, "m1", "m1", 1);
        let frames = h.take();
        assert!(find(&frames, "END", *signal).is_some());
        assert!(find(&frames, "END", *group).is_some());
        assert!(find(&frames, "RESET", group - 1).is_some());
        assert!(!h.factory.is_routed(*group));
        let begins = kafka_begins(&frames);
        let (state, ex) = &begins[0];
        assert_eq!(merged(ex).partitions[0].partition_offset, OFFSET_HISTORICAL);
        assert_eq!(merged(ex).filters.len(), 2);
        assert_eq!(h.factory.session_phase(MQTT), Some(PhaseKind::SessionState));

        h.begin(state - 1);
        h.window(*state, 0, 65536, 0);
        let frames = h.take();
        let records = produced(&frames);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key_str(), "dev0#will-signal");
        assert!(records[0].payload.is_none());
        assert_eq!(records[1].key_str(), "dev0#expiry-signal");
        let expiry = ExpirySignal::decode_from(records[1].payload.clone().unwrap()).unwrap();
        assert_eq!(expiry.expire_at, UNKNOWN);
        assert_eq!(expiry.delay, 60_000);
        assert_eq!(expiry.instance_id, "instance-a");
        match find(&frames, "BEGIN", MQTT_REPLY) {
            Some(Frame::Begin(b)) => assert!(b.extension.is_none()),
            other => panic!("unexpected {:?}", other),
        }
        match find(&frames, "WINDOW", MQTT) {
            Some(Frame::Window(w)) => {
                assert_eq!(w.header.maximum, 65536);
                assert_eq!(w.padding, WILL_PADDING);
            }
            other => panic!("unexpected {:?}", other),
        }

        // the will reuses the recovered lifetime
        register_will(&mut h);
        let frames = h.take();
        let records = produced(&frames);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key_str(), "dev0#will-L0");
        let will = WillMessage::decode_from(records[0].payload.clone().unwrap()).unwrap();
        assert_eq!(will.lifetime_id.as_deref(), Some("L0"));
        let signal = WillSignal::decode_from(records[1].payload.clone().unwrap()).unwrap();
        assert_eq!(signal.deliver_at, UNKNOWN);
        assert_eq!(signal.delay, 5000);
        assert_eq!(Some(signal.will_id), will.will_id);
        assert!(find(&frames, "FLUSH", *state).is_some());
        assert_eq!(h.stats().wills_registered.count(), 1);

        // clean disconnect removes the will
        h.end(MQTT);
        let frames = h.take();
        let records = produced(&frames);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].key_str(), "dev0#will-L0");
        assert!(records[0].payload.is_none());
        assert_eq!(records[1].key_str(), "dev0#will-signal");
        assert!(records[1].payload.is_none());
        let expiry = ExpirySignal::decode_from(records[2].payload.clone().unwrap()).unwrap();
        assert_eq!(expiry.expire_at, START + 60_000);
        assert!(find(&frames, "END", *state).is_some());
        assert!(find(&frames, "END", MQTT_REPLY).is_none());

        h.end(state - 1);
        assert!(find(&h.take(), "END", MQTT_REPLY).is_some());
        assert_eq!(h.factory.proxies(), 0);
        assert_eq!(h.factory.routed(), 0);
        assert_eq!(h.stats().sessions.count(), 0);
    }

    #[test]
    fn test_session_abort_signals_will() {
        let mut h = Harness::new(1);
        h.attach(binding());
        let state = establish(&mut h, "dev0", SessionFlags::WILL | SessionFlags::CLEAN_START);
        let records = produced(&h.take());
        // clean start keeps the previous will-signal
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key_str(), "dev0#expiry-signal");

        register_will(&mut h);
        h.take();
        h.engine.now += 10;
        h.abort(MQTT);
        let frames = h.take();
        let records = produced(&frames);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key_str(), "dev0#will-signal");
        let signal = WillSignal::decode_from(records[0].payload.clone().unwrap()).unwrap();
        assert_eq!(signal.deliver_at, START + 10 + 5000);
        assert_eq!(signal.instance_id, "instance-a");
        let expiry = ExpirySignal::decode_from(records[1].payload.clone().unwrap()).unwrap();
        assert_eq!(expiry.expire_at, START + 10 + 60_000);

        h.abort(state - 1);
        assert!(find(&h.take(), "ABORT", MQTT_REPLY).is_some());
        assert_eq!(h.factory.proxies(), 0);
    }

    #[test]
    fn test_session_abort_without_will() {
        let mut h = Harness::new(1);
        h.attach(binding());
        establish(&mut h, "dev0", SessionFlags::empty());
        let records = produced(&h.take());
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key_str(), "dev0#will-signal");

        h.abort(MQTT);
        let records = produced(&h.take());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key_str(), "dev0#expiry-signal");
    }

    #[test]
    fn test_session_membership_repeated() {
        let mut h = Harness::new(1);
        h.attach(binding());
        h.open(MQTT, session("dev0", SessionFlags::CLEAN_START, 60));
        let signal = kafka_begins(&h.take())[0].0;
        h.begin(signal - 1);
        h.window(signal, 0, 65536, 0);
        let group = kafka_begins(&h.take())[0].0;
        h.begin(group - 1);
        h.membership(group - 1, "m1", "m1", 1);
        h.membership(group - 1, "m1", "m1", 1);
        let frames = h.take();
        assert_eq!(kafka_begins(&frames).len(), 1);
        assert_eq!(frames.iter().filter(|f| f.name() == "END" && f.stream_id() == group).count(), 1);
        assert_eq!(h.factory.session_phase(MQTT), Some(PhaseKind::SessionState));

        // a later contender no longer reaches the established session
        h.membership(group - 1, "m1", "m1", 2);
        assert!(h.take().is_empty());
        assert_eq!(h.stats().takeovers.count(), 0);
        assert_eq!(h.factory.session_phase(MQTT), Some(PhaseKind::SessionState));
    }

    #[test]
    fn test_session_ceded_while_joining() {
        let mut h = Harness::new(1);
        h.attach(binding());
        h.open(MQTT, session("dev1", SessionFlags::WILL | SessionFlags::CLEAN_START, 60));
        let signal = kafka_begins(&h.take())[0].0;
        h.begin(signal - 1);
        h.window(signal, 0, 65536, 0);
        let group = kafka_begins(&h.take())[0].0;
        h.begin(group - 1);
        h.membership(group - 1, "m1", "m1", 2);

        let frames = h.take();
        assert!(kafka_begins(&frames).is_empty());
        let records = produced(&frames);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key_str(), "dev1#migrate");
        assert!(find(&frames, "END", signal).is_some());
        assert!(find(&frames, "END", group).is_some());
        match find(&frames, "RESET", MQTT) {
            Some(Frame::Reset(Reset { extension: Some(ResetEx::Mqtt(ex)), .. })) => {
                assert_eq!(ex.reason_code, REASON_SESSION_TAKEN_OVER);
                assert_eq!(ex.server_ref.as_deref(), Some("mqtt-2"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.stats().takeovers.count(), 1);
        assert_eq!(h.factory.proxies(), 0);
    }

    #[test]
    fn test_session_taken_over_by_migrate() {
        let mut h = Harness::new(1);
        h.attach(binding());
        let state = establish(&mut h, "dev0", SessionFlags::CLEAN_START);
        h.window(MQTT_REPLY, 0, 8192, 0);
        h.take();

        // older than this session, replayed history
        h.fetched(state - 1, START - 1, Bytes::from_static(b"dev0#migrate"), Some(Bytes::from_static(b"x")), vec![]);
        assert_eq!(h.stats().takeovers.count(), 0);

        h.fetched(state - 1, START + 1, Bytes::from_static(b"dev0#migrate"), Some(Bytes::from_static(b"x")), vec![]);
        let frames = h.take();
        assert!(produced(&frames).is_empty());
        assert!(find(&frames, "RESET", MQTT).is_some());
        assert_eq!(h.stats().takeovers.count(), 1);
    }

    #[test]
    fn test_session_state_relay() {
        let mut h = Harness::new(1);
        h.attach(binding());
        let state = establish(&mut h, "dev0", SessionFlags::CLEAN_START);
        h.take();

        h.window(MQTT_REPLY, 0, 8192, 0);
        match find(&h.take(), "WINDOW", state - 1) {
            Some(Frame::Window(w)) => assert_eq!(w.header.maximum, 8192),
            other => panic!("unexpected {:?}", other),
        }

        h.fetched(state - 1, START, Bytes::from_static(b"dev0"), Some(Bytes::from_static(b"state-1")), vec![]);
        match find(&h.take(), "DATA", MQTT_REPLY) {
            Some(Frame::Data(d)) => {
                assert_eq!(d.payload.as_deref(), Some(&b"state-1"[..]));
                assert_eq!(d.extension, session_data(SessionDataKind::State));
            }
            other => panic!("unexpected {:?}", other),
        }

        h.data(MQTT, DATA_FLAG_COMPLETE, Some(Bytes::from_static(b"state-2")), session_data(SessionDataKind::State));
        let records = produced(&h.take());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stream_id, state);
        assert_eq!(records[0].key_str(), "dev0");
    }

    #[test]
    fn test_session_data_before_established() {
        let mut h = Harness::new(1);
        h.attach(binding());
        h.open(MQTT, session("dev0", SessionFlags::CLEAN_START, 60));
        h.take();
        h.data(MQTT, DATA_FLAG_COMPLETE, Some(Bytes::from_static(b"s")), session_data(SessionDataKind::State));
        let frames = h.take();
        assert!(find(&frames, "RESET", MQTT).is_some());
        assert_eq!(h.stats().flow_violations.count(), 1);
        assert_eq!(h.factory.proxies(), 0);
    }

    #[test]
    fn test_session_expiry_clamped() {
        let mut h = Harness::new(1);
        let mut b = binding();
        b.options.session_expiry_interval_max = Duration::from_secs(10);
        h.attach(b);
        establish(&mut h, "dev0", SessionFlags::CLEAN_START);
        let frames = h.take();
        match find(&frames, "BEGIN", MQTT_REPLY) {
            Some(Frame::Begin(b)) => match &b.extension {
                Some(rmqtt_kafka_codec::frame::BeginEx::Mqtt(MqttBeginEx::Session(ex))) => assert_eq!(ex.expiry, 10),
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
        let records = produced(&frames);
        let expiry = ExpirySignal::decode_from(records[0].payload.clone().unwrap()).unwrap();
        assert_eq!(expiry.delay, 10_000);
    }

    #[test]
    fn test_session_ceded_with_recovered_will() {
        let mut h = Harness::new(1);
        h.attach(binding());
        h.open(MQTT, session("dev1", SessionFlags::WILL, 60));
        let fetch = kafka_begins(&h.take())[0].0;
        h.begin(fetch - 1);
        recover(&mut h, fetch - 1, &previous_signal("dev1", "L1", "W1"));
        h.flush(fetch - 1, None);
        let signal = kafka_begins(&h.take())[0].0;
        h.begin(signal - 1);
        h.window(signal, 0, 65536, 0);
        let group = kafka_begins(&h.take())[0].0;
        h.begin(group - 1);
        h.membership(group - 1, "m1", "m1", 2);

        let frames = h.take();
        assert!(kafka_begins(&frames).is_empty());
        let records = produced(&frames);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key_str(), "dev1#will-signal");
        let will = WillSignal::decode_from(records[0].payload.clone().unwrap()).unwrap();
        assert_eq!(will.deliver_at, START + 5000);
        assert_eq!(will.lifetime_id, "L1");
        assert_eq!(will.will_id, "W1");
        assert_eq!(records[1].key_str(), "dev1#migrate");
        assert!(find(&frames, "END", signal).is_some());
        assert!(find(&frames, "END", group).is_some());
        assert!(find(&frames, "RESET", MQTT).is_some());
        assert_eq!(h.stats().takeovers.count(), 1);
    }

    #[test]
    fn test_session_taken_over_with_will() {
        let mut h = Harness::new(1);
        h.attach(binding());
        let state = establish(&mut h, "dev0", SessionFlags::WILL | SessionFlags::CLEAN_START);
        h.window(MQTT_REPLY, 0, 8192, 0);
        register_will(&mut h);
        let registered = produced(&h.take());
        let will_id = WillSignal::decode_from(registered[1].payload.clone().unwrap()).unwrap().will_id;

        h.engine.now += 20;
        h.fetched(state - 1, START + 20, Bytes::from_static(b"dev0#migrate"), Some(Bytes::from_static(b"x")), vec![]);
        let frames = h.take();
        let records = produced(&frames);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key_str(), "dev0#will-signal");
        let signal = WillSignal::decode_from(records[0].payload.clone().unwrap()).unwrap();
        assert_eq!(signal.deliver_at, START + 20 + 5000);
        assert_eq!(signal.will_id, will_id);
        assert!(find(&frames, "END", state).is_some());
        assert!(find(&frames, "RESET", MQTT).is_some());
    }

    #[test]
    fn test_session_abort_delivers_will() {
        const SIGNAL: u64 = 11;
        let mut h = Harness::new(0);
        h.attach(binding());
        h.begin(SIGNAL - 1);
        h.window(SIGNAL, 0, 65536, 0);
        h.take();

        establish(&mut h, "dev0", SessionFlags::WILL | SessionFlags::CLEAN_START);
        h.take();
        register_will(&mut h);
        let will = produced(&h.take()).remove(0);
        h.abort(MQTT);
        let signal = produced(&h.take()).remove(0);
        assert_eq!(signal.key_str(), "dev0#will-signal");

        // the fanout reads back what the session wrote
        h.fetched(SIGNAL - 1, START, signal.key.clone(), signal.payload.clone(), signal.headers.clone());
        let begins = kafka_begins(&h.take());
        assert_eq!(begins.len(), 1);
        let fetch = begins[0].0;
        h.begin(fetch - 1);
        h.fetched(fetch - 1, START, will.key.clone(), will.payload.clone(), vec![]);
        assert!(kafka_begins(&h.take()).is_empty());

        h.advance(4999);
        assert!(kafka_begins(&h.take()).is_empty());
        h.advance(1);
        let begins = kafka_begins(&h.take());
        assert_eq!(begins.len(), 1);
        let (produce, ex) = &begins[0];
        assert_eq!(merged(ex).topic, "mqtt-messages");
        h.begin(produce - 1);
        h.window(*produce, 0, 65536, 0);
        let records = produced(&h.take());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key_str(), "lwt/dev0");
        assert_eq!(records[0].payload.as_deref(), Some(&b"offline"[..]));
    }

    #[test]
    fn test_session_closed_while_fetching_will_signal() {
        let mut h = Harness::new(1);
        h.attach(binding());
        h.open(MQTT, session("dev0", SessionFlags::WILL, 60));
        let fetch = kafka_begins(&h.take())[0].0;

        h.end(MQTT);
        let frames = h.take();
        assert!(find(&frames, "END", fetch).is_some());
        assert!(produced(&frames).is_empty());
        let begins = kafka_begins(&frames);
        assert_eq!(begins.len(), 1);
        let (signal, ex) = &begins[0];
        assert_eq!(merged(ex).capabilities, KafkaCapabilities::ProduceAndFetch);
        assert_eq!(h.factory.proxies(), 1);

        h.begin(signal - 1);
        h.window(*signal, 0, 65536, 0);
        let frames = h.take();
        let records = produced(&frames);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key_str(), "dev0#expiry-signal");
        let expiry = ExpirySignal::decode_from(records[0].payload.clone().unwrap()).unwrap();
        assert_eq!(expiry.expire_at, START + 60_000);
        assert!(find(&frames, "END", *signal).is_some());
        // closing sessions never join the group
        assert!(kafka_begins(&frames).is_empty());

        h.end(signal - 1);
        assert_eq!(h.factory.proxies(), 0);
        assert_eq!(h.stats().sessions.count(), 0);
    }

    #[test]
    fn test_session_end_removes_recovered_will() {
        let mut h = Harness::new(1);
        h.attach(binding());
        let previous = previous_signal("dev0", "L0", "W0");
        establish_with(&mut h, "dev0", SessionFlags::WILL, Some(&previous));
        h.take();

        h.end(MQTT);
        let records = produced(&h.take());
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].key_str(), "dev0#will-L0");
        assert!(records[0].payload.is_none());
        assert_eq!(records[1].key_str(), "dev0#will-signal");
        assert!(records[1].payload.is_none());
        assert_eq!(records[2].key_str(), "dev0#expiry-signal");
    }
}
