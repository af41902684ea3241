// src/stream/provider.rs - Live broadcast scopes and recorded sources
//
// Core features:
// - BroadcastScope fans a publisher's messages out to live consumers
// - Late joiners read cached metadata and codec state from the scope
// - MemoryVodSource pulls recorded messages and snaps seeks to keyframes
// - ProviderService resolves a play request to live, recorded or wait

use crate::codec::{CodecFactory, StreamCodecInfo};
use crate::stream::message::StreamMessage;
use dashmap::DashMap;
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

// ============================================================================
// Live
// ============================================================================

/// Receives messages from a live broadcast.
pub trait LiveConsumer: Send + Sync {
    fn push_live(&self, message: &StreamMessage);

    /// A publisher started on the scope.
    fn on_publish(&self);

    /// The publisher went away.
    fn on_unpublish(&self);
}

/// Named live stream: the publisher pushes in, subscribers consume.
pub struct BroadcastScope {
    name: String,
    consumers: Mutex<Vec<(u64, Weak<dyn LiveConsumer>)>>,
    next_consumer: AtomicU64,
    codec_info: Arc<StreamCodecInfo>,
    metadata: RwLock<Option<StreamMessage>>,
    publishing: AtomicBool,
}

impl BroadcastScope {
    pub fn new(name: impl Into<String>, factory: CodecFactory) -> Self {
        Self {
            name: name.into(),
            consumers: Mutex::new(Vec::new()),
            next_consumer: AtomicU64::new(1),
            codec_info: Arc::new(StreamCodecInfo::new(factory)),
            metadata: RwLock::new(None),
            publishing: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a consumer and returns its subscription token.
    pub fn subscribe(&self, consumer: Weak<dyn LiveConsumer>) -> u64 {
        let token = self.next_consumer.fetch_add(1, Ordering::Relaxed);
        self.consumers.lock().push((token, consumer));
        token
    }

    pub fn unsubscribe(&self, token: u64) -> bool {
        let mut consumers = self.consumers.lock();
        let before = consumers.len();
        consumers.retain(|(id, _)| *id != token);
        consumers.len() != before
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    /// Live consumers in subscription order, dropping dead ones.
    fn live_consumers(&self) -> Vec<Arc<dyn LiveConsumer>> {
        let mut consumers = self.consumers.lock();
        consumers.retain(|(_, consumer)| consumer.strong_count() > 0);
        consumers
            .iter()
            .filter_map(|(_, consumer)| consumer.upgrade())
            .collect()
    }

    /// Delivers a message to every consumer, outside the consumer lock.
    pub fn push(&self, message: &StreamMessage) {
        for consumer in self.live_consumers() {
            consumer.push_live(message);
        }
    }

    pub fn codec_info(&self) -> Arc<StreamCodecInfo> {
        self.codec_info.clone()
    }

    pub fn set_metadata(&self, metadata: Option<StreamMessage>) {
        *self.metadata.write() = metadata;
    }

    pub fn metadata(&self) -> Option<StreamMessage> {
        self.metadata.read().clone()
    }

    pub fn is_publishing(&self) -> bool {
        self.publishing.load(Ordering::Acquire)
    }

    /// Marks the scope published and tells waiting consumers.
    ///
    /// Returns `false` when another publisher already holds the scope.
    pub fn start_publishing(&self) -> bool {
        if self
            .publishing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        debug!("Broadcast {} started", self.name);
        for consumer in self.live_consumers() {
            consumer.on_publish();
        }
        true
    }

    pub fn stop_publishing(&self) {
        if !self.publishing.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!("Broadcast {} stopped", self.name);
        self.set_metadata(None);
        self.codec_info.reset();
        for consumer in self.live_consumers() {
            consumer.on_unpublish();
        }
    }
}

// ============================================================================
// Recorded
// ============================================================================

/// A finite source pulled at the subscriber's pace.
pub trait PullSource: Send {
    /// Next message, `None` once the source ran dry.
    fn pull(&mut self) -> Option<StreamMessage>;

    /// Repositions the source and returns the position actually reached,
    /// which may be earlier when snapped to a keyframe.
    fn seek(&mut self, position: u32) -> u32;

    /// Total length in milliseconds.
    fn duration(&self) -> u32;
}

/// Recorded stream held in memory.
pub struct MemoryVodSource {
    messages: Arc<[StreamMessage]>,
    position: usize,
}

impl MemoryVodSource {
    pub fn new(messages: Arc<[StreamMessage]>) -> Self {
        Self {
            messages,
            position: 0,
        }
    }
}

impl PullSource for MemoryVodSource {
    fn pull(&mut self) -> Option<StreamMessage> {
        let message = self.messages.get(self.position)?.clone();
        self.position += 1;
        Some(message)
    }

    fn seek(&mut self, position: u32) -> u32 {
        // last keyframe at or before the position
        let keyframe = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.timestamp <= position && m.event.is_keyframe())
            .last();
        match keyframe {
            Some((index, message)) => {
                self.position = index;
                message.timestamp
            }
            None => {
                self.position = self
                    .messages
                    .iter()
                    .position(|m| m.timestamp >= position)
                    .unwrap_or(self.messages.len());
                position
            }
        }
    }

    fn duration(&self) -> u32 {
        self.messages.last().map_or(0, |m| m.timestamp)
    }
}

// ============================================================================
// Provider Lookup
// ============================================================================

/// Outcome of resolving a play request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderLookup {
    Live,
    Vod,
    LiveWait,
    NotFound,
}

pub trait ProviderService: Send + Sync {
    /// Decides how a play request is served.
    ///
    /// # Arguments
    /// * `play_type` - `-2` live then recorded then wait, `-1` live only,
    ///   `>= 0` recorded
    fn lookup(&self, scope: &str, name: &str, play_type: i64) -> ProviderLookup;

    fn live_scope(&self, scope: &str, name: &str) -> Option<Arc<BroadcastScope>>;

    fn get_or_create_live_scope(&self, scope: &str, name: &str) -> Arc<BroadcastScope>;

    fn vod_source(&self, scope: &str, name: &str) -> Option<Box<dyn PullSource>>;

    /// Drops a live scope nobody publishes to or consumes.
    fn remove_idle_scope(&self, scope: &str, name: &str);
}

/// Registry of live scopes and an in-memory catalog of recordings.
pub struct DefaultProviderService {
    live: DashMap<String, Arc<BroadcastScope>>,
    vod: DashMap<String, Arc<[StreamMessage]>>,
    factory: CodecFactory,
}

fn stream_key(scope: &str, name: &str) -> String {
    format!("{scope}/{name}")
}

impl DefaultProviderService {
    pub fn new(factory: CodecFactory) -> Self {
        Self {
            live: DashMap::new(),
            vod: DashMap::new(),
            factory,
        }
    }

    /// Adds a recording to the catalog.
    pub fn register_vod(&self, scope: &str, name: &str, messages: Vec<StreamMessage>) {
        self.vod
            .insert(stream_key(scope, name), Arc::from(messages.into_boxed_slice()));
    }

    pub fn live_names(&self) -> Vec<String> {
        self.live
            .iter()
            .filter(|entry| entry.value().is_publishing())
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl Default for DefaultProviderService {
    fn default() -> Self {
        Self::new(CodecFactory::default())
    }
}

impl ProviderService for DefaultProviderService {
    fn lookup(&self, scope: &str, name: &str, play_type: i64) -> ProviderLookup {
        let key = stream_key(scope, name);
        let live = self
            .live
            .get(&key)
            .is_some_and(|broadcast| broadcast.is_publishing());
        let vod = self.vod.contains_key(&key);
        match play_type {
            -2 if live => ProviderLookup::Live,
            -2 if vod => ProviderLookup::Vod,
            -2 => ProviderLookup::LiveWait,
            -1 if live => ProviderLookup::Live,
            t if t >= 0 && vod => ProviderLookup::Vod,
            _ => ProviderLookup::NotFound,
        }
    }

    fn live_scope(&self, scope: &str, name: &str) -> Option<Arc<BroadcastScope>> {
        self.live
            .get(&stream_key(scope, name))
            .map(|entry| entry.value().clone())
    }

    fn get_or_create_live_scope(&self, scope: &str, name: &str) -> Arc<BroadcastScope> {
        self.live
            .entry(stream_key(scope, name))
            .or_insert_with(|| Arc::new(BroadcastScope::new(name, self.factory)))
            .value()
            .clone()
    }

    fn vod_source(&self, scope: &str, name: &str) -> Option<Box<dyn PullSource>> {
        self.vod
            .get(&stream_key(scope, name))
            .map(|entry| Box::new(MemoryVodSource::new(entry.value().clone())) as Box<dyn PullSource>)
    }
    fn remove_idle_scope(&self, scope: &str, name: &str) {
        self.live.remove_if(&stream_key(scope, name), |_, broadcast| {
            !broadcast.is_publishing() && broadcast.consumer_count() == 0
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtmp::event::{AudioData, RtmpEvent, VideoData};
    use bytes::Bytes;

    fn video(ts: u32, first: u8) -> StreamMessage {
        StreamMessage::new(ts, RtmpEvent::Video(VideoData::new(Bytes::from(vec![first, 1, 0]))))
    }

    fn audio(ts: u32) -> StreamMessage {
        StreamMessage::new(ts, RtmpEvent::Audio(AudioData::new(Bytes::from_static(&[0xaf, 1]))))
    }

    struct Counting {
        pushed: Mutex<Vec<u32>>,
        published: AtomicU64,
    }

    impl LiveConsumer for Counting {
        fn push_live(&self, message: &StreamMessage) {
            self.pushed.lock().push(message.timestamp);
        }

        fn on_publish(&self) {
            self.published.fetch_add(1, Ordering::Relaxed);
        }

        fn on_unpublish(&self) {}
    }

    #[test]
    fn test_lookup_rules() {
        let providers = DefaultProviderService::default();
        assert_eq!(providers.lookup("live", "cam1", -2), ProviderLookup::LiveWait);
        assert_eq!(providers.lookup("live", "cam1", -1), ProviderLookup::NotFound);
        assert_eq!(providers.lookup("live", "cam1", 0), ProviderLookup::NotFound);

        providers.register_vod("live", "cam1", vec![video(0, 0x17)]);
        assert_eq!(providers.lookup("live", "cam1", -2), ProviderLookup::Vod);
        assert_eq!(providers.lookup("live", "cam1", 3), ProviderLookup::Vod);

        let broadcast = providers.get_or_create_live_scope("live", "cam1");
        // a scope without publisher is not live yet
        assert_eq!(providers.lookup("live", "cam1", -1), ProviderLookup::NotFound);
        broadcast.start_publishing();
        assert_eq!(providers.lookup("live", "cam1", -2), ProviderLookup::Live);
        assert_eq!(providers.lookup("live", "cam1", -1), ProviderLookup::Live);
        assert_eq!(providers.live_names(), vec!["live/cam1".to_string()]);
    }

    #[test]
    fn test_broadcast_fan_out_and_cleanup() {
        let broadcast = BroadcastScope::new("cam1", CodecFactory::default());
        let consumer = Arc::new(Counting {
            pushed: Mutex::new(Vec::new()),
            published: AtomicU64::new(0),
        });
        let weak: Weak<dyn LiveConsumer> = Arc::downgrade(&consumer) as Weak<dyn LiveConsumer>;
        let token = broadcast.subscribe(weak);
        assert!(broadcast.start_publishing());
        assert!(!broadcast.start_publishing());
        assert_eq!(consumer.published.load(Ordering::Relaxed), 1);

        broadcast.push(&audio(10));
        broadcast.push(&audio(20));
        assert_eq!(*consumer.pushed.lock(), vec![10, 20]);

        assert!(broadcast.unsubscribe(token));
        broadcast.push(&audio(30));
        assert_eq!(consumer.pushed.lock().len(), 2);

        let dropped = Arc::new(Counting {
            pushed: Mutex::new(Vec::new()),
            published: AtomicU64::new(0),
        });
        broadcast.subscribe(Arc::downgrade(&dropped) as Weak<dyn LiveConsumer>);
        drop(dropped);
        broadcast.push(&audio(40));
        assert_eq!(broadcast.consumer_count(), 0);
    }

    #[test]
    fn test_vod_seek_snaps_to_keyframe() {
        let messages: Vec<StreamMessage> = vec![
            video(0, 0x17),
            audio(10),
            video(40, 0x27),
            video(80, 0x17),
            video(120, 0x27),
            audio(130),
        ];
        let mut source = MemoryVodSource::new(Arc::from(messages.into_boxed_slice()));
        assert_eq!(source.duration(), 130);
        assert_eq!(source.seek(100), 80);
        assert_eq!(source.pull().unwrap().timestamp, 80);
        assert_eq!(source.seek(30), 0);
        assert_eq!(source.pull().unwrap().timestamp, 0);
        assert_eq!(source.seek(1000), 80);
    }

    #[test]
    fn test_vod_seek_without_keyframes() {
        let messages: Vec<StreamMessage> = vec![audio(0), audio(50), audio(100)];
        let mut source = MemoryVodSource::new(Arc::from(messages.into_boxed_slice()));
        assert_eq!(source.seek(40), 40);
        assert_eq!(source.pull().unwrap().timestamp, 50);
        source.seek(500);
        assert!(source.pull().is_none());
    }
}
