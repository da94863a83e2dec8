//! Delivery of one will: fetch the payload into a pool slot, wait for the
//! deadline, produce it to the messages (and retained) topic.

use bytes::Bytes;

use rmqtt_kafka_codec::frame::{DataEx, Frame};
use rmqtt_kafka_codec::kafka::{KafkaCapabilities, KafkaDataEx, OFFSET_HISTORICAL};
use rmqtt_kafka_codec::mqtt::PublishFlags;
use rmqtt_kafka_codec::signal::{WillMessage, WillSignal};
use rmqtt_kafka_codec::Decode;
use rmqtt_kafka_conf::BindingConfig;

use crate::context::{Cx, Owner, TimerId, Trace};
use crate::error::ProxyError;
use crate::keys::{key_filter, ClientId};
use crate::message::will_headers;
use crate::pool::SlotId;
use crate::stream::{merged_begin, KafkaStream};
use crate::topic::resolve;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WillEvent {
    None,
    /// the payload matching the signal is buffered
    Fetched,
    /// every produce stream acknowledged the will
    Delivered,
    Failed,
}

#[derive(Debug)]
struct WillProduce {
    stream: KafkaStream,
    /// sequence that acknowledges the record
    sent: Option<i64>,
}

impl WillProduce {
    #[inline]
    fn acked(&self) -> bool {
        self.sent.map(|s| self.stream.initial.acknowledge >= s).unwrap_or(false)
    }
}

#[derive(Debug)]
pub(crate) struct WillDelivery {
    pub client_id: ClientId,
    pub signal: WillSignal,
    pub correlation: u32,
    pub timer: Option<TimerId>,
    pub due: bool,
    fetch: KafkaStream,
    slot: Option<SlotId>,
    fetched: bool,
    message: Option<WillMessage>,
    produces: Vec<WillProduce>,
}

impl WillDelivery {
    /// Start fetching `<clientId>#will-<lifetimeId>` from the sessions topic.
    pub fn open(
        cx: &mut Cx<'_>,
        binding: &BindingConfig,
        routed_id: u64,
        client_id: ClientId,
        signal: WillSignal,
        correlation: u32,
    ) -> Self {
        let trace = cx.trace();
        let owner = Owner::Signal(binding.id);
        let mut fetch = KafkaStream::new(cx, binding.id, routed_id, owner);
        let key = client_id.will_key(&signal.lifetime_id);
        fetch.do_begin(
            cx.engine,
            trace,
            0,
            merged_begin(
                KafkaCapabilities::FetchOnly,
                &binding.options.topics.sessions,
                OFFSET_HISTORICAL,
                vec![key_filter(key)],
            ),
        );
        Self {
            client_id,
            signal,
            correlation,
            timer: None,
            due: false,
            fetch,
            slot: None,
            fetched: false,
            message: None,
            produces: Vec::new(),
        }
    }

    /// Stream ids this delivery owns.
    pub fn stream_ids(&self) -> Vec<(u64, u64)> {
        std::iter::once(&self.fetch)
            .chain(self.produces.iter().map(|p| &p.stream))
            .map(|s| (s.initial_id, s.reply_id))
            .collect()
    }

    #[inline]
    pub fn is_fetched(&self) -> bool {
        self.fetched
    }

    pub fn on_frame(&mut self, cx: &mut Cx<'_>, window: i32, frame: Frame) -> WillEvent {
        let id = frame.stream_id();
        if self.fetch.owns(id) {
            self.on_fetch(cx, window, frame)
        } else {
            self.on_produce(cx, frame)
        }
    }

    fn on_fetch(&mut self, cx: &mut Cx<'_>, window: i32, frame: Frame) -> WillEvent {
        let trace = Trace::of(&frame);
        match frame {
            Frame::Begin(begin) => {
                self.fetch.on_begin(&begin);
                self.fetch.do_grant(cx.engine, trace, window);
            }
            Frame::Data(data) => {
                if !self.fetch.on_data(&data) {
                    log::warn!("{} will fetch window exceeded", self.client_id);
                    return WillEvent::Failed;
                }
                self.fetch.do_grant(cx.engine, trace, window);
                if self.fetched {
                    return WillEvent::None;
                }
                let is_record = matches!(data.extension, Some(DataEx::Kafka(KafkaDataEx::MergedFetch(_))));
                if data.is_init() && is_record && data.payload.is_some() {
                    if let Some(slot) = self.slot.take() {
                        cx.pool.release(slot);
                    }
                    match cx.pool.acquire() {
                        Some(slot) => self.slot = Some(slot),
                        None => {
                            log::warn!("{} will {}", self.client_id, ProxyError::PoolExhausted);
                            cx.stats.pool_exhausted.inc();
                            self.fetch.do_abort(cx.engine, trace);
                            return WillEvent::Failed;
                        }
                    }
                }
                let slot = match self.slot {
                    Some(slot) => slot,
                    None => return WillEvent::None,
                };
                if let Some(payload) = data.payload.as_ref() {
                    if let Err(e) = cx.pool.buffer(slot, payload) {
                        log::warn!("{} will {}", self.client_id, e);
                        self.fetch.do_abort(cx.engine, trace);
                        return WillEvent::Failed;
                    }
                }
                if data.is_fin() {
                    return self.verify(cx);
                }
            }
            Frame::Flush(flush) => {
                if !self.fetch.on_flush(&flush) {
                    return WillEvent::Failed;
                }
                self.fetch.do_grant(cx.engine, trace, window);
            }
            Frame::Window(window) => {
                self.fetch.on_window(&window);
            }
            Frame::End(_) | Frame::Abort(_) | Frame::Reset(_) => {
                self.fetch.on_end();
                self.fetch.on_reset();
                if !self.fetched {
                    log::warn!("{} will fetch closed before the will was found", self.client_id);
                    return WillEvent::Failed;
                }
            }
        }
        WillEvent::None
    }

    /// Keep the buffered record only if it is the will the signal announced.
    fn verify(&mut self, cx: &mut Cx<'_>) -> WillEvent {
        let slot = match self.slot {
            Some(slot) => slot,
            None => return WillEvent::None,
        };
        match WillMessage::decode_from(Bytes::copy_from_slice(cx.pool.get(slot))) {
            Ok(will) if will.will_id.as_ref() == Some(&self.signal.will_id) => {
                log::debug!("{} will {} buffered in slot {}", self.client_id, self.signal.will_id, slot);
                self.fetched = true;
                WillEvent::Fetched
            }
            Ok(will) => {
                log::debug!("{} skipping will {:?}, waiting for {}", self.client_id, will.will_id, self.signal.will_id);
                cx.pool.release(slot);
                self.slot = None;
                WillEvent::None
            }
            Err(e) => {
                log::warn!("{} skipping invalid will record, {}", self.client_id, e);
                cx.pool.release(slot);
                self.slot = None;
                WillEvent::None
            }
        }
    }

    /// Open the produce streams for the buffered will.
    pub fn start(&mut self, cx: &mut Cx<'_>, binding: &BindingConfig) -> Result<(), ProxyError> {
        let slot = self.slot.ok_or(ProxyError::PoolExhausted)?;
        let will = WillMessage::decode_from(Bytes::copy_from_slice(cx.pool.get(slot)))?;
        let route = resolve(binding, &will.topic).ok_or_else(|| ProxyError::NoRoute(will.topic.to_string()))?;
        let options = &binding.options;
        let trace = cx.trace();

        let mut topics = vec![route.with.clone().unwrap_or_else(|| options.topics.messages.clone())];
        if will.flags.contains(PublishFlags::RETAIN) && options.capabilities.retain_available {
            topics.push(options.topics.retained.clone());
        }
        for topic in topics {
            let mut stream = KafkaStream::new(cx, binding.id, route.id, Owner::Signal(binding.id));
            stream.do_begin(
                cx.engine,
                trace,
                0,
                merged_begin(KafkaCapabilities::ProduceOnly, &topic, OFFSET_HISTORICAL, vec![]),
            );
            self.produces.push(WillProduce { stream, sent: None });
        }
        log::info!("{} delivering will to {} on {} streams", self.client_id, will.topic, self.produces.len());
        self.message = Some(will);
        Ok(())
    }

    fn on_produce(&mut self, cx: &mut Cx<'_>, frame: Frame) -> WillEvent {
        let trace = Trace::of(&frame);
        let id = frame.stream_id();
        let Some(index) = self.produces.iter().position(|p| p.stream.owns(id)) else {
            return WillEvent::None;
        };
        let produce = &mut self.produces[index];
        match frame {
            Frame::Begin(begin) => produce.stream.on_begin(&begin),
            Frame::Window(window) => {
                produce.stream.on_window(&window);
                if produce.sent.is_none() {
                    if let Some(will) = self.message.as_ref() {
                        let headers = will_headers(will, self.client_id.as_str());
                        let key = Bytes::copy_from_slice(will.topic.as_bytes());
                        let now = cx.now();
                        if produce.stream.do_produce(cx.engine, trace, now, key, Some(will.payload.clone()), headers) {
                            produce.sent = Some(produce.stream.initial.sequence);
                        }
                    }
                }
                if self.produces.iter().all(WillProduce::acked) {
                    return WillEvent::Delivered;
                }
            }
            Frame::Data(data) => {
                produce.stream.on_data(&data);
            }
            Frame::End(_) | Frame::Abort(_) | Frame::Reset(_) => {
                produce.stream.on_end();
                produce.stream.on_reset();
                if !produce.acked() {
                    log::warn!("{} will produce closed before acknowledging", self.client_id);
                    return WillEvent::Failed;
                }
            }
            Frame::Flush(_) => {}
        }
        WillEvent::None
    }

    /// End every stream and give the slot back.
    pub fn close(&mut self, cx: &mut Cx<'_>, abort: bool) {
        let trace = cx.trace();
        for s in std::iter::once(&mut self.fetch).chain(self.produces.iter_mut().map(|p| &mut p.stream)) {
            if abort {
                s.do_abort(cx.engine, trace);
            } else {
                s.do_end(cx.engine, trace);
            }
            s.do_reset(cx.engine, trace);
            cx.routes.unroute(s.initial_id, s.reply_id);
        }
        if let Some(slot) = self.slot.take() {
            cx.pool.release(slot);
        }
        if let Some(timer) = self.timer.take() {
            cx.engine.cancel(timer);
        }
    }
}
