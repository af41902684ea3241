// src/stream/engine.rs - Subscriber play engine
//
// Core features:
// - Live, recorded and wait-for-publisher play decisions
// - Pull/push tick for recorded playback, single-flight, 10ms nominal
// - Client buffer gating and insufficient bandwidth notifications
// - Dependency aware live frame dropping with keyframe catch-up
// - Seek with keyframe snapshot while paused and prebuffering while playing
// - Deferred stop once the client drained what it was sent
//
// Locking: all bookkeeping sits behind one mutex. The playlist host is only
// called after that mutex was released, state listeners run while it is held.

use crate::config::PlaybackConfig;
use crate::error::{Error, Result};
use crate::rtmp::event::{AudioData, Ping, PingType, RtmpEvent, SourceType, VideoData};
use crate::rtmp::status::{self, Status};
use crate::stream::frame_dropper::{DropperState, VideoFrameDropper};
use crate::stream::message::{MessageSink, StreamMessage};
use crate::stream::play_item::PlayItem;
use crate::stream::provider::{
    BroadcastScope, LiveConsumer, ProviderLookup, ProviderService, PullSource,
};
use crate::stream::state::{StateListener, StreamState, StreamStateHolder};
use crate::util::{Clock, JobHandle, Scheduler};
use crossbeam::queue::SegQueue;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// The playlist a play engine advances through when an item ends.
pub trait PlaylistHost: Send + Sync {
    fn has_more_items(&self) -> bool;

    /// Plays the next item; called without any engine lock held.
    fn advance(&self);
}

/// Static settings of one play engine.
#[derive(Debug, Clone)]
pub struct PlayEngineConfig {
    pub stream_id: u32,
    /// Application scope the stream names resolve in.
    pub scope: String,
    pub playback: PlaybackConfig,
}

/// Runtime collaborators a play engine is built with.
#[derive(Clone)]
pub struct PlayEngineContext {
    pub providers: Arc<dyn ProviderService>,
    pub scheduler: Arc<dyn Scheduler>,
    pub clock: Arc<dyn Clock>,
}

/// Work queued for the next pull/push tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingOp {
    Seek(u32),
}

struct LiveSubscription {
    scope: Arc<BroadcastScope>,
    token: u64,
}

struct Inner {
    current_item: Option<PlayItem>,
    pull_source: Option<Box<dyn PullSource>>,
    live: Option<LiveSubscription>,
    pull_mode: bool,
    /// First non-zero live timestamp, live messages are rebased against it.
    stream_start_ts: Option<u32>,
    /// Accumulated across playlist items so timestamps keep increasing.
    timestamp_offset: u32,
    /// Where recorded playback of the current item started, after snapping.
    stream_offset: u32,
    last_message_ts: Option<u32>,
    playback_start: u64,
    bytes_sent: u64,
    pending_message: Option<StreamMessage>,
    single_frame: bool,
    receive_video: bool,
    receive_audio: bool,
    send_blank_audio: bool,
    dropper: VideoFrameDropper,
    sequential_pending_video: u32,
    next_check_buffer_underrun: u64,
    /// Index of the next buffered interframe to substitute while catching up.
    buffered_interframe: Option<usize>,
    pull_job: Option<JobHandle>,
    deferred_stop_job: Option<JobHandle>,
    wait_job: Option<JobHandle>,
    /// Whether the play that is waiting for a publisher asked for a reset.
    wait_reset: bool,
}

impl Inner {
    fn new() -> Self {
        Self {
            current_item: None,
            pull_source: None,
            live: None,
            pull_mode: false,
            stream_start_ts: None,
            timestamp_offset: 0,
            stream_offset: 0,
            last_message_ts: None,
            playback_start: 0,
            bytes_sent: 0,
            pending_message: None,
            single_frame: false,
            receive_video: true,
            receive_audio: true,
            send_blank_audio: false,
            dropper: VideoFrameDropper::new(),
            sequential_pending_video: 0,
            next_check_buffer_underrun: 0,
            buffered_interframe: None,
            pull_job: None,
            deferred_stop_job: None,
            wait_job: None,
            wait_reset: true,
        }
    }

    fn item_name(&self) -> String {
        self.current_item
            .as_ref()
            .map(|item| item.name.clone())
            .unwrap_or_default()
    }

    /// Last sent timestamp relative to the current item.
    fn item_timestamp(&self) -> Option<u32> {
        self.last_message_ts
            .map(|ts| ts.wrapping_sub(self.timestamp_offset))
    }

    /// Whether recorded playback may forward this message at all.
    fn send_enabled(&self, message: &StreamMessage) -> bool {
        match message.event {
            RtmpEvent::Audio(_) => self.receive_audio || self.send_blank_audio,
            RtmpEvent::Video(_) => self.receive_video,
            _ => true,
        }
    }
}

/// Drives one subscriber: decides what to play and paces it out to a sink.
pub struct PlayEngine {
    config: PlayEngineConfig,
    sink: Arc<dyn MessageSink>,
    providers: Arc<dyn ProviderService>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    state: Arc<StreamStateHolder>,
    host: Mutex<Option<Weak<dyn PlaylistHost>>>,
    /// Client requested buffer in milliseconds.
    buffer_duration: AtomicU32,
    inner: Mutex<Inner>,
    pending_ops: SegQueue<PendingOp>,
    push_pull_running: AtomicBool,
    self_ref: Weak<PlayEngine>,
}

impl PlayEngine {
    /// Creates an engine in the `Uninit` state.
    ///
    /// # Arguments
    /// * `config` - stream id, scope and playback tuning
    /// * `sink` - where messages, statuses and pings are written
    /// * `context` - provider lookup, timers and time source
    /// * `state` - state holder shared with the owning stream
    pub fn new(
        config: PlayEngineConfig,
        sink: Arc<dyn MessageSink>,
        context: PlayEngineContext,
        state: Arc<StreamStateHolder>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            sink,
            providers: context.providers,
            scheduler: context.scheduler,
            clock: context.clock,
            state,
            host: Mutex::new(None),
            buffer_duration: AtomicU32::new(0),
            inner: Mutex::new(Inner::new()),
            pending_ops: SegQueue::new(),
            push_pull_running: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    pub fn set_host(&self, host: Weak<dyn PlaylistHost>) {
        *self.host.lock() = Some(host);
    }

    fn host(&self) -> Option<Arc<dyn PlaylistHost>> {
        self.host.lock().as_ref().and_then(|host| host.upgrade())
    }

    pub fn stream_id(&self) -> u32 {
        self.config.stream_id
    }

    pub fn state(&self) -> StreamState {
        self.state.get()
    }

    pub fn add_state_listener(&self, listener: StateListener) {
        self.state.add_listener(listener);
    }

    pub fn current_item(&self) -> Option<PlayItem> {
        self.inner.lock().current_item.clone()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.inner.lock().bytes_sent
    }

    pub fn last_message_timestamp(&self) -> Option<u32> {
        self.inner.lock().last_message_ts
    }

    pub fn is_pull_mode(&self) -> bool {
        self.inner.lock().pull_mode
    }

    pub fn has_pending_message(&self) -> bool {
        self.inner.lock().pending_message.is_some()
    }

    pub fn dropper_state(&self) -> DropperState {
        self.inner.lock().dropper.state()
    }

    pub fn buffer_duration(&self) -> u32 {
        self.buffer_duration.load(Ordering::Relaxed)
    }

    /// Client buffer length in milliseconds, from the client buffer ping.
    pub fn set_buffer_duration(&self, duration: u32) {
        self.buffer_duration.store(duration, Ordering::Relaxed);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub fn start(&self) -> Result<()> {
        let _inner = self.inner.lock();
        match self.state.get() {
            StreamState::Uninit => {
                self.state.set(StreamState::Stopped);
                Ok(())
            }
            state => Err(Error::IllegalState {
                operation: "start",
                state,
            }),
        }
    }

    /// Starts playing `item`.
    ///
    /// # Arguments
    /// * `item` - what to play; its start picks the live, recorded or wait branch
    /// * `with_reset` - `false` when switching within a playlist
    ///
    /// # Returns
    /// `Err(StreamNotFound)` when nothing can serve the item, after the
    /// client was told with a `StreamNotFound` status.
    pub fn play(&self, item: PlayItem, with_reset: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.wait_job.is_some()
            && inner.current_item.as_ref().map(|current| &current.name) == Some(&item.name)
        {
            debug!("Stream {} already waiting for {}", self.config.stream_id, item.name);
            return Ok(());
        }
        let state = self.state.get();
        if state != StreamState::Stopped {
            return Err(Error::IllegalState {
                operation: "play",
                state,
            });
        }

        self.unsubscribe_live(&mut inner);
        self.clear_wait_jobs(&mut inner);
        self.cancel_deferred_stop(&mut inner);
        inner.pull_source = None;
        inner.current_item = Some(item.clone());
        inner.stream_start_ts = None;
        inner.stream_offset = 0;
        inner.single_frame = false;
        inner.buffered_interframe = None;
        inner.sequential_pending_video = 0;

        let scope = &self.config.scope;
        match self.providers.lookup(scope, &item.name, item.play_type()) {
            ProviderLookup::Live => match self.providers.live_scope(scope, &item.name) {
                Some(broadcast) => {
                    inner.pull_mode = false;
                    self.prepare_live(&mut inner, &broadcast);
                    self.send_play_statuses(&inner, &item, with_reset);
                    self.subscribe_live(&mut inner, broadcast.clone());
                    self.play_live(&mut inner, &broadcast);
                    Ok(())
                }
                None => self.not_found(&mut inner, &item),
            },
            ProviderLookup::LiveWait => {
                inner.pull_mode = false;
                let broadcast = self.providers.get_or_create_live_scope(scope, &item.name);
                self.subscribe_live(&mut inner, broadcast);
                let weak = self.self_ref.clone();
                let handle = self.scheduler.schedule_once(
                    self.config.playback.live_wait_timeout,
                    Box::new(move || {
                        if let Some(engine) = weak.upgrade() {
                            engine.on_live_wait_expired();
                        }
                    }),
                );
                inner.wait_job = Some(handle);
                inner.wait_reset = with_reset;
                info!(
                    "Stream {} waiting up to {}ms for {} to be published",
                    self.config.stream_id, self.config.playback.live_wait_timeout, item.name
                );
                Ok(())
            }
            ProviderLookup::Vod => match self.providers.vod_source(scope, &item.name) {
                Some(source) => {
                    inner.pull_mode = true;
                    inner.pull_source = Some(source);
                    self.send_play_statuses(&inner, &item, with_reset);
                    self.play_vod(&mut inner, &item);
                    Ok(())
                }
                None => self.not_found(&mut inner, &item),
            },
            ProviderLookup::NotFound => self.not_found(&mut inner, &item),
        }
    }

    fn not_found(&self, inner: &mut Inner, item: &PlayItem) -> Result<()> {
        warn!("Stream {} could not find {}", self.config.stream_id, item.name);
        inner.current_item = None;
        self.sink.push_status(
            self.status(status::NS_PLAY_STREAMNOTFOUND, &item.name)
                .set_description(format!("No such stream: {}", item.name)),
        );
        Err(Error::StreamNotFound(item.name.clone()))
    }

    /// Pauses playback at `position` milliseconds.
    pub fn pause(&self, position: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = self.state.get();
        if state != StreamState::Playing {
            return Err(Error::IllegalState {
                operation: "pause",
                state,
            });
        }
        self.state.set(StreamState::Paused);
        self.clear_wait_jobs(&mut inner);
        self.sink
            .push_ping(Ping::new(PingType::StreamPlayBufferClear, self.config.stream_id));
        let name = inner.item_name();
        self.sink.push_status(
            self.status(status::NS_PAUSE_NOTIFY, &name)
                .set_description(format!("Paused {name} at {position}.")),
        );
        debug!("Stream {} paused at {}", self.config.stream_id, position);
        Ok(())
    }

    /// Resumes playback from `position` milliseconds.
    pub fn resume(&self, position: u32) -> Result<()> {
        let stop_now = {
            let mut inner = self.inner.lock();
            let state = self.state.get();
            if state != StreamState::Paused {
                return Err(Error::IllegalState {
                    operation: "resume",
                    state,
                });
            }
            self.state.set(StreamState::Playing);
            self.send_reset(&inner);
            let name = inner.item_name();
            self.sink.push_status(
                self.status(status::NS_UNPAUSE_NOTIFY, &name)
                    .set_description(format!("Unpaused {name}.")),
            );
            if inner.pull_mode {
                let position = inner
                    .pull_source
                    .as_mut()
                    .map_or(position, |source| source.seek(position));
                self.state.signal(StreamState::Resumed);
                inner.playback_start = self.clock.now_millis().saturating_sub(position as u64);
                let length = inner.current_item.as_ref().map_or(-1, |item| item.length);
                if length >= 0 && position.saturating_sub(inner.stream_offset) as i64 >= length {
                    true
                } else {
                    self.ensure_pull_running(&mut inner);
                    false
                }
            } else {
                inner.dropper.reset(DropperState::SendKeyframesCheck);
                false
            }
        };
        if stop_now {
            self.stop()?;
        }
        Ok(())
    }

    /// Queues a seek to `position` milliseconds for the next tick.
    pub fn seek(&self, position: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = self.state.get();
        if !matches!(
            state,
            StreamState::Playing | StreamState::Paused | StreamState::Stopped
        ) {
            return Err(Error::IllegalState {
                operation: "seek",
                state,
            });
        }
        if !inner.pull_mode {
            return Err(Error::SeekUnsupported);
        }
        self.pending_ops.push(PendingOp::Seek(position));
        self.cancel_deferred_stop(&mut inner);
        self.ensure_pull_running(&mut inner);
        Ok(())
    }

    /// Stops the current item and either completes or moves to the next one.
    pub fn stop(&self) -> Result<()> {
        let has_more = self.host().is_some_and(|host| host.has_more_items());
        let advance = {
            let mut inner = self.inner.lock();
            match self.state.get() {
                StreamState::Playing | StreamState::Paused => {
                    self.state.set(StreamState::Stopped);
                    if inner.pull_mode {
                        inner.pull_source = None;
                    } else {
                        self.unsubscribe_live(&mut inner);
                    }
                    self.clear_wait_jobs(&mut inner);
                    self.cancel_deferred_stop(&mut inner);
                    if has_more {
                        if let Some(last) = inner.last_message_ts.filter(|ts| *ts > 0) {
                            inner.timestamp_offset = last;
                        }
                        true
                    } else {
                        let name = inner.item_name();
                        self.sink.push_status(
                            self.status(status::NS_PLAY_COMPLETE, &name)
                                .set_description(format!("Completed {name}.")),
                        );
                        inner.bytes_sent = 0;
                        self.sink.push_status(
                            self.status(status::NS_PLAY_STOP, &name)
                                .set_description(format!("Stopped playing {name}.")),
                        );
                        self.sink.push_ping(Ping::new(
                            PingType::StreamPlayBufferClear,
                            self.config.stream_id,
                        ));
                        info!("Stream {} stopped {}", self.config.stream_id, name);
                        false
                    }
                }
                StreamState::Closed => {
                    self.clear_wait_jobs(&mut inner);
                    self.cancel_deferred_stop(&mut inner);
                    false
                }
                StreamState::Stopped => false,
                state => {
                    return Err(Error::IllegalState {
                        operation: "stop",
                        state,
                    })
                }
            }
        };
        if advance {
            if let Some(host) = self.host() {
                host.advance();
            }
        }
        Ok(())
    }

    /// Releases everything. Safe to call more than once.
    pub fn close(&self) {
        {
            let mut inner = self.inner.lock();
            if self.state.get() == StreamState::Closed {
                return;
            }
            self.unsubscribe_live(&mut inner);
            inner.pull_source = None;
            self.state.set(StreamState::Closed);
            self.clear_wait_jobs(&mut inner);
            self.cancel_deferred_stop(&mut inner);
            inner.last_message_ts = None;
            while self.pending_ops.pop().is_some() {}
        }
        self.sink.close();
        debug!("Stream {} closed", self.config.stream_id);
    }

    /// Enables or disables video. Returns the previous setting.
    pub fn receive_video(&self, receive: bool) -> bool {
        let mut inner = self.inner.lock();
        let previous = std::mem::replace(&mut inner.receive_video, receive);
        if receive && !previous {
            // the client needs a keyframe before anything decodes again
            inner.dropper.reset(DropperState::SendKeyframesCheck);
        }
        previous
    }

    /// Enables or disables audio. Returns the previous setting.
    pub fn receive_audio(&self, receive: bool) -> bool {
        let mut inner = self.inner.lock();
        let previous = std::mem::replace(&mut inner.receive_audio, receive);
        if previous && !receive {
            inner.send_blank_audio = true;
        } else if receive {
            inner.send_blank_audio = false;
        }
        previous
    }

    // ========================================================================
    // Live
    // ========================================================================

    fn prepare_live(&self, inner: &mut Inner, broadcast: &BroadcastScope) {
        inner.dropper.reset(DropperState::SendKeyframesCheck);
        let codec = broadcast.codec_info();
        if codec.has_keyframe() || codec.num_interframes() > 0 {
            inner.buffered_interframe = Some(0);
            inner.dropper.reset(DropperState::SendAll);
        }
    }

    fn subscribe_live(&self, inner: &mut Inner, broadcast: Arc<BroadcastScope>) {
        let consumer: Weak<dyn LiveConsumer> = self.self_ref.clone();
        let token = broadcast.subscribe(consumer);
        inner.live = Some(LiveSubscription {
            scope: broadcast,
            token,
        });
    }

    fn unsubscribe_live(&self, inner: &mut Inner) {
        if let Some(live) = inner.live.take() {
            live.scope.unsubscribe(live.token);
        }
    }

    /// Sends what a late joiner needs to decode straight away.
    fn play_live(&self, inner: &mut Inner, broadcast: &BroadcastScope) {
        self.state.set(StreamState::Playing);
        inner.playback_start = self.clock.now_millis();
        let metadata = broadcast.metadata();
        let timestamp = metadata.as_ref().map_or(0, |m| m.timestamp);
        if let Some(metadata) = metadata {
            self.send_message(inner, metadata);
        }
        let codec = broadcast.codec_info();
        if let Some(config) = codec.video_configuration() {
            self.send_message(inner, live_video(timestamp, config));
        }
        for frame in codec.video_keyframes().frames().iter() {
            self.send_message(inner, live_video(timestamp, frame.data.clone()));
        }
        if let Some(config) = codec.audio_configuration() {
            let mut audio = AudioData::new(config);
            audio.source_type = SourceType::Live;
            self.send_message(inner, StreamMessage::new(timestamp, RtmpEvent::Audio(audio)));
        }
        info!(
            "Stream {} playing live {}",
            self.config.stream_id,
            inner.item_name()
        );
    }

    fn on_live_wait_expired(&self) {
        let mut inner = self.inner.lock();
        if inner.wait_job.take().is_none() {
            return;
        }
        if inner
            .live
            .as_ref()
            .is_some_and(|live| live.scope.is_publishing())
        {
            return;
        }
        self.unsubscribe_live(&mut inner);
        let name = inner.item_name();
        warn!(
            "Stream {} gave up waiting for {}",
            self.config.stream_id, name
        );
        self.sink.push_status(
            self.status(status::NS_PLAY_STREAMNOTFOUND, &name)
                .set_description(format!("No such stream: {name}")),
        );
        self.state.signal(StreamState::End);
    }

    fn on_live_publish(&self) {
        let mut inner = self.inner.lock();
        let state = self.state.get();
        if state == StreamState::Closed {
            return;
        }
        let broadcast = match inner.live.as_ref() {
            Some(live) => live.scope.clone(),
            None => return,
        };
        let waited = match inner.wait_job.take() {
            Some(job) => {
                self.scheduler.cancel(job);
                true
            }
            None => false,
        };
        let name = inner.item_name();
        self.sink.push_status(
            self.status(status::NS_PLAY_PUBLISHNOTIFY, &name)
                .set_description(format!("{name} is now published.")),
        );
        inner.stream_start_ts = None;
        inner.dropper.reset(DropperState::SendKeyframesCheck);
        // only a play still waiting for this publisher starts on its own
        if waited && state == StreamState::Stopped {
            if let Some(item) = inner.current_item.clone() {
                self.send_play_statuses(&inner, &item, inner.wait_reset);
            }
            self.play_live(&mut inner, &broadcast);
        }
    }

    fn on_live_unpublish(&self) {
        let inner = self.inner.lock();
        if matches!(self.state.get(), StreamState::Playing | StreamState::Paused) {
            let name = inner.item_name();
            self.sink.push_status(
                self.status(status::NS_PLAY_UNPUBLISHNOTIFY, &name)
                    .set_description(format!("{name} is now unpublished.")),
            );
        }
    }

    /// Handles one message pushed by a live broadcast.
    fn push_live_message(&self, message: &StreamMessage) {
        let mut inner = self.inner.lock();
        let state = self.state.get();
        if inner.pull_mode || !matches!(state, StreamState::Playing | StreamState::Paused) {
            return;
        }
        if state == StreamState::Paused {
            inner.dropper.drop_packet(&message.event);
            return;
        }
        let mut outgoing = message.clone();
        match &message.event {
            RtmpEvent::Video(video) => {
                if !inner.receive_video {
                    inner.dropper.drop_packet(&message.event);
                    return;
                }
                if video.source_type == SourceType::Live {
                    let codec = inner.live.as_ref().map(|live| live.scope.codec_info());
                    // without a detected codec frames are treated as droppable
                    let can_drop = codec.as_ref().map_or(true, |codec| {
                        codec.video_codec_name().is_none() || codec.video_can_drop_frames()
                    });
                    if can_drop {
                        let pending = self.sink.pending_video_messages();
                        if !inner.dropper.can_send_packet(&message.event, pending) {
                            return;
                        }
                        if pending > 1 {
                            inner.sequential_pending_video += 1;
                        } else {
                            inner.sequential_pending_video = 0;
                        }
                        let playback = &self.config.playback;
                        if pending > playback.max_pending_video_frames
                            || inner.sequential_pending_video
                                > playback.max_sequential_pending_video_frames
                        {
                            self.throttled_insufficient_bandwidth(&mut inner);
                            inner.dropper.drop_packet(&message.event);
                            return;
                        }
                    }
                    if let Some(index) = inner.buffered_interframe {
                        let substitute = codec.as_ref().and_then(|codec| {
                            if message.event.is_keyframe() || index >= codec.num_interframes() {
                                None
                            } else {
                                codec.interframe(index)
                            }
                        });
                        match substitute {
                            Some(frame) => {
                                inner.buffered_interframe = Some(index + 1);
                                outgoing = live_video(message.timestamp, frame.data);
                            }
                            None => inner.buffered_interframe = None,
                        }
                    }
                }
            }
            RtmpEvent::Audio(_) => {
                if !inner.receive_audio {
                    if !inner.send_blank_audio {
                        return;
                    }
                    inner.send_blank_audio = false;
                    outgoing = StreamMessage::new(
                        message.timestamp,
                        RtmpEvent::Audio(AudioData::blank()),
                    );
                }
            }
            _ => {}
        }
        self.send_message(&mut inner, outgoing);
    }

    // ========================================================================
    // Pull / Push
    // ========================================================================

    fn play_vod(&self, inner: &mut Inner, item: &PlayItem) {
        self.state.set(StreamState::Playing);
        inner.pending_message = None;
        let start = item.start_position();
        if start > 0 {
            if let Some(source) = inner.pull_source.as_mut() {
                inner.stream_offset = source.seek(start);
            }
        }
        inner.playback_start = self
            .clock
            .now_millis()
            .saturating_sub(inner.stream_offset as u64);

        let mut message = inner.pull_source.as_mut().and_then(|source| source.pull());
        if item.length == 0 {
            // a single frame: the first video message is the one to show
            while let Some(candidate) = &message {
                if candidate.is_video() {
                    break;
                }
                message = inner.pull_source.as_mut().and_then(|source| source.pull());
            }
            inner.single_frame = true;
        }
        if let Some(mut message) = message {
            message.timestamp = message.timestamp.wrapping_add(inner.timestamp_offset);
            inner.pending_message = Some(message);
        }
        info!(
            "Stream {} playing recorded {} from {}",
            self.config.stream_id, item.name, inner.stream_offset
        );
        self.ensure_pull_running(inner);
    }

    fn ensure_pull_running(&self, inner: &mut Inner) {
        if !inner.pull_mode || inner.pull_job.is_some() || self.state.get() == StreamState::Closed
        {
            return;
        }
        let weak = self.self_ref.clone();
        let interval = self.config.playback.pull_interval;
        let handle = self.scheduler.schedule_repeating(
            interval,
            interval,
            Arc::new(move || {
                if let Some(engine) = weak.upgrade() {
                    engine.pull_and_push();
                }
            }),
        );
        inner.pull_job = Some(handle);
    }

    /// One tick of recorded playback. A tick finding another still running
    /// returns immediately.
    pub fn pull_and_push(&self) {
        if self
            .push_pull_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let stop_now = {
            let mut inner = self.inner.lock();
            let stop_after_seek = self.run_pending_ops(&mut inner);
            if !stop_after_seek {
                self.pull_tick(&mut inner);
            }
            stop_after_seek
        };
        self.push_pull_running.store(false, Ordering::Release);
        if stop_now {
            if let Err(e) = self.stop() {
                warn!("Stream {} stop after seek failed: {e}", self.config.stream_id);
            }
        }
    }

    /// Runs queued operations, only the last of consecutive seeks.
    /// Returns `true` when a seek went past the end.
    fn run_pending_ops(&self, inner: &mut Inner) -> bool {
        let mut last_seek = None;
        while let Some(op) = self.pending_ops.pop() {
            match op {
                PendingOp::Seek(position) => last_seek = Some(position),
            }
        }
        match last_seek {
            Some(position) => self.do_seek(inner, position),
            None => false,
        }
    }

    fn pull_tick(&self, inner: &mut Inner) {
        if self.state.get() != StreamState::Playing || !inner.pull_mode {
            return;
        }
        if let Some(pending) = inner.pending_message.take() {
            if self.okay_to_send(inner, &pending) {
                self.send_message(inner, pending);
                if inner.single_frame {
                    self.run_deferred_stop(inner);
                }
            } else {
                inner.pending_message = Some(pending);
            }
            return;
        }
        if inner.single_frame {
            self.run_deferred_stop(inner);
            return;
        }
        loop {
            let message = inner.pull_source.as_mut().and_then(|source| source.pull());
            let mut message = match message {
                Some(message) => message,
                None => {
                    self.run_deferred_stop(inner);
                    return;
                }
            };
            let length = inner.current_item.as_ref().map_or(-1, |item| item.length);
            if length > 0
                && message.timestamp.saturating_sub(inner.stream_offset) as i64 >= length
            {
                self.run_deferred_stop(inner);
                return;
            }
            if !inner.send_enabled(&message) {
                continue;
            }
            if message.is_audio() && !inner.receive_audio {
                inner.send_blank_audio = false;
                message = StreamMessage::new(message.timestamp, RtmpEvent::Audio(AudioData::blank()));
            }
            message.timestamp = message.timestamp.wrapping_add(inner.timestamp_offset);
            if self.okay_to_send(inner, &message) {
                self.send_message(inner, message);
            } else {
                inner.pending_message = Some(message);
            }
            return;
        }
    }

    /// Whether the client can take `message` now. Only stream data is gated.
    fn okay_to_send(&self, inner: &mut Inner, message: &StreamMessage) -> bool {
        if !message.is_stream_data() {
            return true;
        }
        let now = self.clock.now_millis();
        if self.is_client_buffer_full(inner, now) {
            return false;
        }
        let pending = self.sink.pending_messages();
        let playback = &self.config.playback;
        if playback.buffer_check_interval > 0 && now >= inner.next_check_buffer_underrun {
            if pending > playback.underrun_trigger {
                self.send_insufficient_bandwidth(inner);
            }
            inner.next_check_buffer_underrun = now + playback.buffer_check_interval;
        }
        pending <= playback.underrun_trigger
    }

    /// The client holds more than twice its requested buffer.
    fn is_client_buffer_full(&self, inner: &Inner, now: u64) -> bool {
        let last = match inner.item_timestamp() {
            Some(last) if last > 0 => last as i64,
            _ => return false,
        };
        let buffer = self.buffer_duration() as i64;
        let elapsed = now.saturating_sub(inner.playback_start) as i64;
        // the doubled buffer keeps the pacing existing players were tuned to
        buffer > 0 && last - elapsed > buffer * 2
    }

    fn send_insufficient_bandwidth(&self, inner: &Inner) {
        let name = inner.item_name();
        self.sink.push_status(
            self.status(status::NS_PLAY_INSUFFICIENT_BW, &name)
                .set_description("Data is playing behind the normal speed."),
        );
    }

    fn throttled_insufficient_bandwidth(&self, inner: &mut Inner) {
        let interval = self.config.playback.buffer_check_interval;
        let now = self.clock.now_millis();
        if interval > 0 && now >= inner.next_check_buffer_underrun {
            self.send_insufficient_bandwidth(inner);
            inner.next_check_buffer_underrun = now + interval;
        }
    }

    /// Executes a seek on the tick. Returns `true` when playback has to stop.
    fn do_seek(&self, inner: &mut Inner, position: u32) -> bool {
        let state = self.state.get();
        if !matches!(
            state,
            StreamState::Playing | StreamState::Paused | StreamState::Stopped
        ) || !inner.pull_mode
        {
            debug!("Stream {} dropped seek while {}", self.config.stream_id, state);
            return false;
        }
        inner.pending_message = None;
        if let Some(job) = inner.wait_job.take() {
            self.scheduler.cancel(job);
        }
        let name = inner.item_name();
        self.sink
            .push_ping(Ping::new(PingType::StreamPlayBufferClear, self.config.stream_id));
        self.send_reset(inner);
        self.sink.push_status(
            self.status(status::NS_SEEK_NOTIFY, &name).set_description(format!(
                "Seeking {} (stream ID: {}).",
                position, self.config.stream_id
            )),
        );
        self.sink.push_status(
            self.status(status::NS_PLAY_START, &name)
                .set_description(format!("Started playing {name}.")),
        );

        let (seek_position, duration) = match inner.pull_source.as_mut() {
            Some(source) => (source.seek(position), source.duration()),
            None => (position, 0),
        };
        inner.playback_start = self
            .clock
            .now_millis()
            .saturating_sub(seek_position as u64);
        self.state.signal(StreamState::Seek);

        let mut sent = false;
        if matches!(state, StreamState::Paused | StreamState::Stopped) {
            // snapshot: the first keyframe at the new position
            while let Some(mut message) = inner.pull_source.as_mut().and_then(|s| s.pull()) {
                if message.event.is_keyframe() {
                    message.timestamp = message.timestamp.wrapping_add(inner.timestamp_offset);
                    inner.last_message_ts = Some(message.timestamp);
                    self.sink.push_message(message);
                    sent = true;
                    break;
                }
            }
        }

        let length = inner.current_item.as_ref().map_or(-1, |item| item.length);
        let past_end = position > duration
            || (length >= 0 && position.saturating_sub(inner.stream_offset) as i64 >= length);
        if past_end {
            if !sent {
                self.send_seek_anchor(inner, seek_position);
            }
            return state != StreamState::Stopped;
        }

        if !sent && state == StreamState::Playing {
            // source timestamps, before the playlist offset is applied
            let boundary = seek_position as u64 + self.buffer_duration() as u64 * 2;
            while let Some(mut message) = inner.pull_source.as_mut().and_then(|s| s.pull()) {
                if !inner.send_enabled(&message) {
                    continue;
                }
                let beyond = message.timestamp as u64 >= boundary;
                message.timestamp = message.timestamp.wrapping_add(inner.timestamp_offset);
                if beyond {
                    inner.pending_message = Some(message);
                    break;
                }
                self.send_message(inner, message);
                sent = true;
            }
            if let Some(last) = inner.item_timestamp() {
                inner.playback_start = self.clock.now_millis().saturating_sub(last as u64);
            }
        }
        if !sent {
            self.send_seek_anchor(inner, seek_position);
        }
        false
    }

    /// Empty audio at the seek position so the client has a timestamp.
    fn send_seek_anchor(&self, inner: &mut Inner, position: u32) {
        let timestamp = position.wrapping_add(inner.timestamp_offset);
        inner.last_message_ts = Some(timestamp);
        self.sink.push_message(StreamMessage::new(
            timestamp,
            RtmpEvent::Audio(AudioData::blank()),
        ));
    }

    /// Source ran dry: stop once the client played out what it has.
    fn run_deferred_stop(&self, inner: &mut Inner) {
        self.clear_wait_jobs(inner);
        if inner.deferred_stop_job.is_some() {
            return;
        }
        let weak = self.self_ref.clone();
        let interval = self.config.playback.deferred_stop_interval;
        let handle = self.scheduler.schedule_repeating(
            interval,
            interval,
            Arc::new(move || {
                if let Some(engine) = weak.upgrade() {
                    engine.deferred_stop_check();
                }
            }),
        );
        inner.deferred_stop_job = Some(handle);
    }

    fn deferred_stop_check(&self) {
        let drained = {
            let inner = self.inner.lock();
            if inner.deferred_stop_job.is_none() {
                return;
            }
            match inner.item_timestamp() {
                Some(last) => {
                    let elapsed = self
                        .clock
                        .now_millis()
                        .saturating_sub(inner.playback_start) as i64;
                    (last as i64) - elapsed < 0
                }
                None => true,
            }
        };
        if drained {
            debug!("Stream {} drained, stopping", self.config.stream_id);
            if let Err(e) = self.stop() {
                warn!("Stream {} deferred stop failed: {e}", self.config.stream_id);
            }
        }
    }

    fn cancel_deferred_stop(&self, inner: &mut Inner) {
        if let Some(job) = inner.deferred_stop_job.take() {
            self.scheduler.cancel(job);
        }
    }

    /// Cancels the tick and the live wait, dropping any held message.
    fn clear_wait_jobs(&self, inner: &mut Inner) {
        if let Some(job) = inner.pull_job.take() {
            self.scheduler.cancel(job);
        }
        inner.pending_message = None;
        if let Some(job) = inner.wait_job.take() {
            self.scheduler.cancel(job);
        }
    }

    // ========================================================================
    // Output
    // ========================================================================

    fn send_message(&self, inner: &mut Inner, mut message: StreamMessage) {
        if !inner.pull_mode {
            let timestamp = message.timestamp;
            let start = match inner.stream_start_ts {
                Some(start) => start,
                None if timestamp > 0 => {
                    inner.stream_start_ts = Some(timestamp);
                    timestamp
                }
                None => 0,
            };
            message.timestamp = timestamp.saturating_sub(start);
        }
        inner.last_message_ts = Some(message.timestamp);
        inner.bytes_sent += message.event.payload_len() as u64;
        self.sink.push_message(message);
    }

    fn send_reset(&self, inner: &Inner) {
        if inner.pull_mode {
            self.sink
                .push_ping(Ping::new(PingType::RecordedStream, self.config.stream_id));
        }
        self.sink
            .push_ping(Ping::new(PingType::StreamBegin, self.config.stream_id));
    }

    fn send_play_statuses(&self, inner: &Inner, item: &PlayItem, with_reset: bool) {
        if with_reset {
            self.send_reset(inner);
            self.sink.push_status(
                self.status(status::NS_PLAY_RESET, &item.name)
                    .set_description(format!("Playing and resetting {}.", item.name)),
            );
        }
        self.sink.push_status(
            self.status(status::NS_PLAY_START, &item.name)
                .set_description(format!("Started playing {}.", item.name)),
        );
        if !with_reset {
            self.sink.push_status(
                self.status(status::NS_PLAY_SWITCH, &item.name)
                    .set_description(format!("Switched to {}.", item.name)),
            );
        }
    }

    fn status(&self, code: &str, name: &str) -> Status {
        Status::new(code)
            .set_details(name)
            .set_client_id(self.config.stream_id)
    }
}

fn live_video(timestamp: u32, data: bytes::Bytes) -> StreamMessage {
    let mut video = VideoData::new(data);
    video.source_type = SourceType::Live;
    StreamMessage::new(timestamp, RtmpEvent::Video(video))
}

impl LiveConsumer for PlayEngine {
    fn push_live(&self, message: &StreamMessage) {
        self.push_live_message(message);
    }

    fn on_publish(&self) {
        self.on_live_publish();
    }

    fn on_unpublish(&self) {
        self.on_live_unpublish();
    }
}
