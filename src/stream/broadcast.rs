// src/stream/broadcast.rs - Publisher side of a live stream
//
// Core features:
// - Claims a live name, refusing names already published
// - Detects codecs and caches metadata for late joiners
// - Fans audio, video and stream data out to subscribers
// - Splits aggregate messages into their FLV tags

use crate::error::{Error, Result};
use crate::rtmp::event::{AudioData, DataType, RtmpEvent, SourceType, VideoData};
use crate::rtmp::status::{self, Status};
use crate::stream::message::{MessageSink, StreamMessage};
use crate::stream::provider::{BroadcastScope, ProviderService};
use crate::stream::state::{StreamState, StreamStateHolder};
use crate::codec::StreamCodecInfo;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;

/// How the client asked to publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    Live,
    Record,
    Append,
}

impl PublishMode {
    /// Parses the `publish` type argument, anything unknown is live.
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some("record") => PublishMode::Record,
            Some("append") => PublishMode::Append,
            _ => PublishMode::Live,
        }
    }
}

struct Publication {
    name: String,
    broadcast: Arc<BroadcastScope>,
    mode: PublishMode,
}

pub struct ClientBroadcastStream {
    stream_id: u32,
    scope: String,
    /// Statuses back to the publishing client.
    sink: Arc<dyn MessageSink>,
    providers: Arc<dyn ProviderService>,
    state: StreamStateHolder,
    publication: Mutex<Option<Publication>>,
    bytes_received: Mutex<u64>,
}

impl ClientBroadcastStream {
    pub fn new(
        stream_id: u32,
        scope: impl Into<String>,
        sink: Arc<dyn MessageSink>,
        providers: Arc<dyn ProviderService>,
    ) -> Self {
        Self {
            stream_id,
            scope: scope.into(),
            sink,
            providers,
            state: StreamStateHolder::new(),
            publication: Mutex::new(None),
            bytes_received: Mutex::new(0),
        }
    }

    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    pub fn state(&self) -> StreamState {
        self.state.get()
    }

    pub fn published_name(&self) -> Option<String> {
        self.publication.lock().as_ref().map(|p| p.name.clone())
    }

    pub fn publish_mode(&self) -> Option<PublishMode> {
        self.publication.lock().as_ref().map(|p| p.mode)
    }

    pub fn codec_info(&self) -> Option<Arc<StreamCodecInfo>> {
        self.publication
            .lock()
            .as_ref()
            .map(|p| p.broadcast.codec_info())
    }

    pub fn bytes_received(&self) -> u64 {
        *self.bytes_received.lock()
    }

    fn status(&self, code: &str, name: &str) -> Status {
        Status::new(code)
            .set_details(name)
            .set_client_id(self.stream_id)
    }

    /// Starts publishing under `name`.
    ///
    /// Recording is not available; `record` and `append` are answered with
    /// `NetStream.Record.Failed` and the stream is published live.
    pub fn publish(&self, name: &str, mode: PublishMode) -> Result<()> {
        let mut publication = self.publication.lock();
        if let Some(current) = publication.as_ref() {
            if current.name == name {
                debug!("Stream {} already publishes {}", self.stream_id, name);
                return Ok(());
            }
        }
        let state = self.state.get();
        if state == StreamState::Closed {
            return Err(Error::IllegalState {
                operation: "publish",
                state,
            });
        }

        let broadcast = self.providers.get_or_create_live_scope(&self.scope, name);
        if !broadcast.start_publishing() {
            warn!("Stream {} cannot publish {}: name in use", self.stream_id, name);
            self.sink.push_status(
                self.status(status::NS_PUBLISH_BADNAME, name)
                    .set_description(format!("{name} is already published.")),
            );
            return Err(Error::StreamAlreadyPublished(name.to_string()));
        }
        if let Some(previous) = publication.take() {
            previous.broadcast.stop_publishing();
        }
        if mode != PublishMode::Live {
            self.sink.push_status(
                self.status(status::NS_RECORD_FAILED, name)
                    .set_description("Recording is not available, publishing live."),
            );
        }
        *publication = Some(Publication {
            name: name.to_string(),
            broadcast,
            mode,
        });
        self.state.set(StreamState::Playing);
        self.state.signal(StreamState::Started);
        self.sink.push_status(
            self.status(status::NS_PUBLISH_START, name)
                .set_description(format!("{name} is now published.")),
        );
        info!("Stream {} publishing {} ({:?})", self.stream_id, name, mode);
        Ok(())
    }

    /// Takes one event from the stream's ordered dispatcher.
    pub fn dispatch_event(&self, timestamp: u32, event: RtmpEvent) {
        if let RtmpEvent::Invoke(invoke) | RtmpEvent::FlexMessage(invoke) = &event {
            // the command handler already ran it; this copy only marks where
            // the publish falls between media messages
            debug!(
                "Stream {} saw {} in media order at {}",
                self.stream_id, invoke.call.method, timestamp
            );
            return;
        }
        let broadcast = match self.publication.lock().as_ref() {
            Some(publication) => publication.broadcast.clone(),
            None => {
                debug!("Stream {} dropped data while not publishing", self.stream_id);
                return;
            }
        };
        *self.bytes_received.lock() += event.payload_len() as u64;
        match event {
            RtmpEvent::Aggregate(aggregate) => {
                for part in aggregate.parts(timestamp) {
                    let event = match part.data_type {
                        DataType::Audio => RtmpEvent::Audio(AudioData::new(part.data)),
                        DataType::Video => RtmpEvent::Video(VideoData::new(part.data)),
                        other => {
                            debug!("Stream {} skipped aggregate part {:?}", self.stream_id, other);
                            continue;
                        }
                    };
                    self.forward(&broadcast, part.timestamp, event);
                }
            }
            event => self.forward(&broadcast, timestamp, event),
        }
    }

    fn forward(&self, broadcast: &BroadcastScope, timestamp: u32, mut event: RtmpEvent) {
        event.set_source_type(SourceType::Live);
        match &event {
            RtmpEvent::Audio(audio) => broadcast.codec_info().add_audio(&audio.data),
            RtmpEvent::Video(video) => broadcast.codec_info().add_video(&video.data, timestamp),
            RtmpEvent::Notify(notify) | RtmpEvent::FlexStreamSend(notify) => {
                if !notify.is_stream_data() {
                    return;
                }
                if let Some(metadata) = notify.as_metadata_notify() {
                    let message = StreamMessage::new(timestamp, RtmpEvent::Notify(metadata));
                    broadcast.set_metadata(Some(message.clone()));
                    broadcast.push(&message);
                    return;
                }
            }
            _ => return,
        }
        broadcast.push(&StreamMessage::new(timestamp, event));
    }

    /// Stops publishing; subscribers are told the stream went away.
    pub fn unpublish(&self) {
        let publication = self.publication.lock().take();
        if let Some(publication) = publication {
            publication.broadcast.stop_publishing();
            self.providers
                .remove_idle_scope(&self.scope, &publication.name);
            self.sink.push_status(
                self.status(status::NS_UNPUBLISHED_SUCCESS, &publication.name)
                    .set_description(format!("{} is now unpublished.", publication.name)),
            );
            info!("Stream {} unpublished {}", self.stream_id, publication.name);
            if self.state.get() != StreamState::Closed {
                self.state.set(StreamState::Stopped);
            }
        }
    }

    pub fn close(&self) {
        if self.state.get() == StreamState::Closed {
            return;
        }
        self.unpublish();
        self.state.set(StreamState::Closed);
        self.sink.close();
    }
}
